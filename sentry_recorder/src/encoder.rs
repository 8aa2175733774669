use garden_sentry::frame::CHANNELS;
use garden_sentry::{Codec, EncoderBackend, Frame, Result, SentryError, StreamGeometry};
use opencv::{
    core::{self, Mat, Scalar, Size},
    prelude::*,
    videoio::VideoWriter,
};
use std::path::Path;
use tokio::task::block_in_place;

/// Writes episodes through OpenCV's `VideoWriter`.
#[derive(Default)]
pub struct OpenCvEncoder;

fn write_err(e: opencv::Error) -> SentryError {
    SentryError::Write(e.to_string())
}

/// Copies a packed BGR24 frame into a `Mat` the writer accepts.
fn to_mat(frame: &Frame) -> Result<Mat> {
    let expected = frame.width as usize * frame.height as usize * CHANNELS;
    if frame.data.len() != expected {
        return Err(SentryError::Write(format!(
            "frame {} holds {} bytes, expected {expected}",
            frame.index,
            frame.data.len()
        )));
    }
    let mut mat = Mat::new_rows_cols_with_default(
        frame.height as i32,
        frame.width as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )
    .map_err(write_err)?;
    mat.data_bytes_mut().map_err(write_err)?.copy_from_slice(&frame.data);
    Ok(mat)
}

impl EncoderBackend for OpenCvEncoder {
    type Sink = VideoWriter;

    fn open(&mut self, path: &Path, codec: &Codec, geometry: &StreamGeometry) -> Result<VideoWriter> {
        let path = path
            .to_str()
            .ok_or_else(|| SentryError::Write(format!("{} is not valid UTF-8", path.display())))?;
        let [c1, c2, c3, c4] = codec.fourcc();
        let fourcc = VideoWriter::fourcc(c1, c2, c3, c4).map_err(write_err)?;
        let size = Size::new(geometry.width as i32, geometry.height as i32);

        let writer = block_in_place(|| VideoWriter::new(path, fourcc, geometry.fps, size, true)).map_err(write_err)?;
        if !writer.is_opened().map_err(write_err)? {
            return Err(SentryError::Write(format!("{codec} encoder did not open {path}")));
        }
        Ok(writer)
    }

    fn write(&mut self, sink: &mut VideoWriter, frame: &Frame) -> Result<()> {
        let mat = to_mat(frame)?;
        block_in_place(|| sink.write(&mat)).map_err(write_err)
    }

    fn release(&mut self, mut sink: VideoWriter) -> Result<()> {
        block_in_place(|| sink.release()).map_err(write_err)
    }
}
