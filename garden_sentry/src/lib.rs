// THEORY:
// This file is the main entry point for the `garden_sentry` library crate.
// It defines the public API used by the recorder binary (and by anyone embedding the
// engine elsewhere): the `Supervisor` that runs a stream session, the `SentryConfig`
// it is built from, and the three ports it is generic over (`StreamConnector`,
// `Classifier`, `EncoderBackend`).
//
// The library never touches a camera, a model or a video container directly. Those
// live behind the ports, so the whole engine can be exercised with in-memory fakes.

pub mod classifier;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod events;
pub mod frame;
pub mod supervisor;

pub use crate::classifier::{Classifier, Detection, HttpClassifier};
pub use crate::config::SentryConfig;
pub use crate::core_modules::connector::{ConnectOptions, FrameRead, StreamConnector, StreamHandle, Transport};
pub use crate::core_modules::segment_writer::{ArtifactFile, Codec, EncoderBackend};
pub use crate::error::{Result, SentryError};
pub use crate::events::SessionEvent;
pub use crate::frame::{Frame, StreamGeometry};
pub use crate::supervisor::{SessionReport, SessionState, Supervisor};
