// THEORY:
// `SentryConfig` is the single immutable value the whole engine is built from. It is
// assembled once at startup (by the CLI in the recorder binary, by hand in tests),
// validated once, and then shared read-only. Validation is the only place a
// `Configuration` error can come from, which keeps every runtime fault recoverable.
//
// The defaults reproduce the deployment this engine was first built for: a single
// garden camera, cats as the subject and birds as the usual false positive.

use crate::core_modules::connector::{ConnectOptions, Transport};
use crate::core_modules::presence::{PresencePolicy, SuppressionMode};
use crate::core_modules::recorder::RecorderSettings;
use crate::core_modules::segment_writer::Codec;
use crate::error::{Result, SentryError};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.5;
pub const DEFAULT_ABSENCE_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_FALLBACK_FPS: f64 = 15.0;

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub stream_address: String,
    pub classifier_url: String,
    pub classifier_timeout: Duration,

    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub file_extension: String,
    pub codecs: Vec<Codec>,
    pub tag_confidence: bool,
    pub write_sidecar: bool,

    pub confidence_floor: f32,
    pub target_labels: Vec<String>,
    pub suppressing_labels: Vec<String>,
    pub suppression: SuppressionMode,

    pub absence_timeout: Duration,
    pub record_through_absence: bool,

    pub reconnect_delay: Duration,
    pub transport: Transport,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub fallback_fps: f64,

    /// How many session events a slow observer may fall behind by.
    pub event_capacity: usize,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            stream_address: String::new(),
            classifier_url: String::new(),
            classifier_timeout: Duration::from_secs(2),
            output_dir: PathBuf::from("recordings"),
            file_prefix: "cat".to_string(),
            file_extension: "mp4".to_string(),
            codecs: vec![Codec::from_static("avc1"), Codec::universal_fallback()],
            tag_confidence: true,
            write_sidecar: true,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            target_labels: vec!["cat".to_string()],
            suppressing_labels: vec!["bird".to_string()],
            suppression: SuppressionMode::AboveFloor,
            absence_timeout: DEFAULT_ABSENCE_TIMEOUT,
            record_through_absence: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            transport: Transport::Tcp,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            fallback_fps: DEFAULT_FALLBACK_FPS,
            event_capacity: 64,
        }
    }
}

impl SentryConfig {
    /// Checks and normalizes the configuration. The returned value is what the engine runs on.
    pub fn validate(mut self) -> Result<Self> {
        self.stream_address = self.stream_address.trim().to_string();
        if self.stream_address.is_empty() {
            return Err(SentryError::Configuration("stream address is required".into()));
        }
        self.classifier_url = self.classifier_url.trim().to_string();
        if self.classifier_url.is_empty() {
            return Err(SentryError::Configuration("classifier URL is required".into()));
        }

        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(SentryError::Configuration(format!(
                "confidence floor {} is outside [0, 1]",
                self.confidence_floor
            )));
        }

        self.target_labels = normalize_labels(self.target_labels);
        if self.target_labels.is_empty() {
            return Err(SentryError::Configuration("at least one target label is required".into()));
        }
        self.suppressing_labels = normalize_labels(self.suppressing_labels);
        if let Some(both) = self
            .target_labels
            .iter()
            .find(|t| self.suppressing_labels.iter().any(|s| s.eq_ignore_ascii_case(t)))
        {
            return Err(SentryError::Configuration(format!(
                "label '{both}' cannot be both a target and a suppressing label"
            )));
        }

        if self.file_prefix.trim().is_empty() || self.file_prefix.contains(['/', '\\']) {
            return Err(SentryError::Configuration(format!(
                "file prefix '{}' is not usable in a file name",
                self.file_prefix
            )));
        }

        let mut codecs: Vec<Codec> = Vec::with_capacity(self.codecs.len() + 1);
        for codec in self.codecs.drain(..) {
            if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }
        let fallback = Codec::universal_fallback();
        if !codecs.contains(&fallback) {
            codecs.push(fallback);
        }
        self.codecs = codecs;

        if !self.fallback_fps.is_finite() || self.fallback_fps <= 0.0 {
            return Err(SentryError::Configuration(format!(
                "fallback fps {} must be positive",
                self.fallback_fps
            )));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(SentryError::Configuration("stream timeouts must be non-zero".into()));
        }

        Ok(self)
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        PresencePolicy {
            confidence_floor: self.confidence_floor,
            target_labels: self.target_labels.clone(),
            suppressing_labels: self.suppressing_labels.clone(),
            suppression: self.suppression,
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            absence_timeout: self.absence_timeout,
            record_through_absence: self.record_through_absence,
            tag_confidence: self.tag_confidence,
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            transport: self.transport,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            fallback_fps: self.fallback_fps,
        }
    }
}

fn normalize_labels(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !out.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            out.push(label.to_string());
        }
    }
    out
}
