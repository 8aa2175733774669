// THEORY:
// OpenCV's FFmpeg backend is the stream connector the recorder ships with. Every
// OpenCV call blocks, so each one runs under `block_in_place`: the worker thread is
// handed over to the blocking call and the rest of the runtime keeps going.
//
// OpenCV reports geometry through capture properties and hands frames back as
// `Mat`s. Both are converted here, at the edge, into the engine's own
// `StreamGeometry` and packed BGR24 `Frame`s.

use garden_sentry::{ConnectOptions, FrameRead, Result, SentryError, StreamConnector, StreamGeometry, StreamHandle};
use opencv::{
    core::{self, Mat, Vector},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::time::Duration;
use tokio::task::block_in_place;

#[derive(Default)]
pub struct OpenCvConnector {
    capture: Option<VideoCapture>,
    frame: Mat,
}

impl OpenCvConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Capture timeouts are `i32` milliseconds; longer ones saturate instead of wrapping.
fn timeout_param(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

fn open_capture(address: &str, options: &ConnectOptions) -> opencv::Result<VideoCapture> {
    let params = Vector::<i32>::from_slice(&[
        videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
        timeout_param(options.connect_timeout),
        videoio::CAP_PROP_READ_TIMEOUT_MSEC,
        timeout_param(options.read_timeout),
    ]);
    VideoCapture::from_file_with_params(address, videoio::CAP_FFMPEG, &params)
}

fn geometry(capture: &VideoCapture) -> opencv::Result<StreamGeometry> {
    Ok(StreamGeometry {
        width: capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
        height: capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
        fps: capture.get(videoio::CAP_PROP_FPS)?,
    })
}

/// Copies a decoded `Mat` out as packed BGR24.
fn bgr_bytes(mat: &Mat) -> opencv::Result<Vec<u8>> {
    if mat.depth() != core::CV_8U {
        return Err(opencv::Error::new(
            core::StsUnsupportedFormat,
            format!("unsupported pixel depth {}", mat.depth()),
        ));
    }

    let mut converted = Mat::default();
    let bgr = match mat.channels() {
        3 => mat,
        1 => {
            imgproc::cvt_color(mat, &mut converted, imgproc::COLOR_GRAY2BGR, 0)?;
            &converted
        }
        4 => {
            imgproc::cvt_color(mat, &mut converted, imgproc::COLOR_BGRA2BGR, 0)?;
            &converted
        }
        n => {
            return Err(opencv::Error::new(
                core::StsUnsupportedFormat,
                format!("unsupported channel count {n}"),
            ));
        }
    };

    if bgr.is_continuous() {
        Ok(bgr.data_bytes()?.to_vec())
    } else {
        Ok(bgr.try_clone()?.data_bytes()?.to_vec())
    }
}

impl StreamConnector for OpenCvConnector {
    async fn open(&mut self, address: &str, options: &ConnectOptions) -> Result<StreamHandle> {
        let capture = block_in_place(|| open_capture(address, options))
            .map_err(|e| SentryError::ConnectFailure(e.to_string()))?;

        let opened = capture
            .is_opened()
            .map_err(|e| SentryError::ConnectFailure(e.to_string()))?;
        if !opened {
            return Err(SentryError::ConnectFailure(format!("could not open {address}")));
        }

        let geometry = geometry(&capture).map_err(|e| SentryError::ConnectFailure(e.to_string()))?;
        self.capture = Some(capture);
        Ok(StreamHandle::new(address, geometry))
    }

    async fn next_frame(&mut self, handle: &mut StreamHandle) -> Result<FrameRead> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(SentryError::ReadFailure("capture is not open".into()));
        };
        let mat = &mut self.frame;

        let grabbed = block_in_place(|| capture.read(mat)).map_err(|e| SentryError::ReadFailure(e.to_string()))?;
        if !grabbed || self.frame.empty() {
            // A live source never ends; a failed grab means the connection dropped.
            return Err(SentryError::ReadFailure("no frame returned by capture".into()));
        }

        let width = self.frame.cols() as u32;
        let height = self.frame.rows() as u32;
        let data = bgr_bytes(&self.frame).map_err(|e| SentryError::ReadFailure(e.to_string()))?;
        Ok(FrameRead::Frame(handle.stamp(width, height, data)))
    }

    async fn close(&mut self, handle: &mut StreamHandle) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = block_in_place(|| capture.release()) {
                tracing::warn!(address = handle.address(), error = %e, "capture release failed");
            }
        }
    }
}
