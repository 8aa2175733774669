// THEORY:
// The stream connector owns the live network connection. The engine only ever
// talks to it through the `StreamConnector` port, so the capture library (OpenCV in
// the recorder binary, scripted fakes in tests) stays outside the library crate.
//
// Live streams fail in quiet ways: a dropped RTSP session often hands back an
// empty frame instead of an error, and a stalled one simply blocks. Those rules are
// not left to each implementation. `connect`, `read_next` and `disconnect` wrap any
// connector and enforce them centrally:
//
// - connect and read are bounded by the configured timeouts,
// - an empty frame without an explicit end-of-stream is a `ReadFailure`,
// - reading from a closed handle is a `ReadFailure`,
// - every error that escapes is classified as a stream fault, so the supervisor
//   only has to handle two kinds of failure.

use crate::error::{Result, SentryError};
use crate::frame::{Frame, StreamGeometry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{Instant, timeout};

/// RTSP lower transport. TCP trades latency for not losing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl FromStr for Transport {
    type Err = SentryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(SentryError::Configuration(format!(
                "unknown transport '{other}' (expected tcp or udp)"
            ))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection options passed to every `open`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub transport: Transport,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Used when the source reports no usable frame rate.
    pub fallback_fps: f64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            fallback_fps: 15.0,
        }
    }
}

/// One live connection.
#[derive(Debug)]
pub struct StreamHandle {
    address: String,
    geometry: StreamGeometry,
    open: bool,
    frames_read: u64,
    opened_at: Instant,
}

impl StreamHandle {
    pub fn new(address: impl Into<String>, geometry: StreamGeometry) -> Self {
        Self {
            address: address.into(),
            geometry,
            open: true,
            frames_read: 0,
            opened_at: Instant::now(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Time since the connection opened. This is the stream clock frames are stamped with.
    pub fn stream_time(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Wraps freshly decoded pixels as the next frame of this stream.
    pub fn stamp(&self, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new(self.frames_read, self.stream_time(), width, height, data)
    }
}

/// The outcome of a successful read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// The source ended the stream explicitly.
    EndOfStream,
}

/// The stream connector port.
#[allow(async_fn_in_trait)]
pub trait StreamConnector {
    async fn open(&mut self, address: &str, options: &ConnectOptions) -> Result<StreamHandle>;

    /// Returns exactly one frame. Must not buffer ahead.
    async fn next_frame(&mut self, handle: &mut StreamHandle) -> Result<FrameRead>;

    /// Releases the connection. Must tolerate being called on a handle that already faulted.
    async fn close(&mut self, handle: &mut StreamHandle);
}

/// Opens a stream with the connect timeout applied. Every failure is a `ConnectFailure`.
pub async fn connect<C: StreamConnector>(
    connector: &mut C,
    address: &str,
    options: &ConnectOptions,
) -> Result<StreamHandle> {
    let opened = timeout(options.connect_timeout, connector.open(address, options))
        .await
        .map_err(|_| {
            SentryError::ConnectFailure(format!(
                "no answer from {address} within {} ms",
                options.connect_timeout.as_millis()
            ))
        })?;

    let mut handle = match opened {
        Ok(handle) => handle,
        Err(e @ SentryError::ConnectFailure(_)) => return Err(e),
        Err(e) => return Err(SentryError::ConnectFailure(e.to_string())),
    };
    handle.geometry = handle.geometry.with_fallback_fps(options.fallback_fps);
    handle.open = true;
    Ok(handle)
}

/// Reads the next frame with the read timeout applied. Every failure is a `ReadFailure`.
pub async fn read_next<C: StreamConnector>(
    connector: &mut C,
    handle: &mut StreamHandle,
    options: &ConnectOptions,
) -> Result<FrameRead> {
    if !handle.open {
        return Err(SentryError::ReadFailure(format!("{} is closed", handle.address)));
    }

    let read = timeout(options.read_timeout, connector.next_frame(handle))
        .await
        .map_err(|_| {
            SentryError::ReadFailure(format!(
                "no frame within {} ms",
                options.read_timeout.as_millis()
            ))
        })?;

    match read {
        Ok(FrameRead::Frame(frame)) if frame.is_empty() => Err(SentryError::ReadFailure(format!(
            "empty frame after {} frames",
            handle.frames_read
        ))),
        Ok(FrameRead::Frame(frame)) => {
            handle.frames_read += 1;
            Ok(FrameRead::Frame(frame))
        }
        Ok(FrameRead::EndOfStream) => Ok(FrameRead::EndOfStream),
        Err(e @ SentryError::ReadFailure(_)) => Err(e),
        Err(e) => Err(SentryError::ReadFailure(e.to_string())),
    }
}

/// Closes the handle once. Later calls do nothing.
pub async fn disconnect<C: StreamConnector>(connector: &mut C, handle: &mut StreamHandle) {
    if handle.open {
        connector.close(handle).await;
        handle.open = false;
    }
}
