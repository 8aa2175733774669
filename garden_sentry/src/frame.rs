// THEORY:
// A `Frame` is the unit that flows through the whole pipeline: pulled from the
// stream connector, shown to the classifier, and handed to the recorder. It is a
// plain owned pixel buffer so the engine never depends on a particular capture
// library's image type.
//
// The frame's `stream_time` is the recorder's only clock. It is measured from the
// moment the stream was opened, which keeps every timing decision (most importantly
// the absence timeout) in stream order and makes it trivially reproducible in tests.

use serde::Serialize;
use std::time::Duration;

/// Bytes per pixel of a packed BGR24 buffer.
pub const CHANNELS: usize = 3;

/// Geometry of a live stream, captured once when the connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl StreamGeometry {
    /// Replaces a missing or nonsensical frame rate reported by the source.
    pub fn with_fallback_fps(mut self, fallback_fps: f64) -> Self {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            self.fps = fallback_fps;
        }
        self
    }

    /// The number of bytes a full BGR24 frame of this geometry occupies.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }
}

/// A single decoded frame, in stream order.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Zero-based position of the frame within its stream session.
    pub index: u64,
    /// Monotonic time since the stream session was opened.
    pub stream_time: Duration,
    pub width: u32,
    pub height: u32,
    /// Packed BGR24 pixel data, row-major.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, stream_time: Duration, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            stream_time,
            width,
            height,
            data,
        }
    }

    /// A frame with no pixels is what a dropped live stream hands back instead of an error.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// Converts the BGR24 buffer into RGB24, the layout image encoders expect.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(CHANNELS) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        rgb
    }
}
