use clap::Parser;
use garden_sentry::SentryConfig;
use garden_sentry::core_modules::presence::SuppressionMode;
use garden_sentry::{Codec, Transport};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sentry_recorder")]
#[command(about = "Records a live camera stream whenever the subject is in view", long_about = None)]
#[command(version)]
pub struct Cli {
    /// RTSP address of the camera
    #[arg(long, env = "RTSP_URL")]
    pub stream_address: String,

    /// Detection endpoint of the inference server
    #[arg(long, env = "CLASSIFIER_URL")]
    pub classifier_url: String,

    /// Classifier request timeout in milliseconds
    #[arg(long, env = "CLASSIFIER_TIMEOUT_MS", default_value_t = 2000)]
    pub classifier_timeout_ms: u64,

    /// Where recordings are written
    #[arg(long, env = "SENTRY_OUTPUT_DIR", default_value = "recordings")]
    pub output_dir: PathBuf,

    #[arg(long, env = "SENTRY_FILE_PREFIX", default_value = "cat")]
    pub file_prefix: String,

    /// Detections below this confidence are ignored
    #[arg(long, env = "SENTRY_CONFIDENCE_FLOOR", default_value_t = 0.5)]
    pub confidence_floor: f32,

    /// Labels that start a recording
    #[arg(long = "target-label", env = "SENTRY_TARGET_LABELS", value_delimiter = ',', default_value = "cat")]
    pub target_labels: Vec<String>,

    /// Labels that veto the whole frame
    #[arg(long = "suppressing-label", env = "SENTRY_SUPPRESSING_LABELS", value_delimiter = ',', default_value = "bird")]
    pub suppressing_labels: Vec<String>,

    /// Let a suppressing label veto the frame even below the confidence floor
    #[arg(long, env = "SENTRY_SUPPRESS_ANY_CONFIDENCE")]
    pub suppress_any_confidence: bool,

    /// Seconds without the subject before a recording is closed
    #[arg(long, env = "SENTRY_ABSENCE_TIMEOUT", default_value_t = 4.0)]
    pub absence_timeout: f64,

    /// Stop writing frames while waiting out an absence
    #[arg(long)]
    pub no_record_through_absence: bool,

    /// Seconds to wait before reconnecting a lost stream
    #[arg(long, env = "SENTRY_RECONNECT_DELAY", default_value_t = 5)]
    pub reconnect_delay: u64,

    /// Codecs to try, in order
    #[arg(long = "codec", env = "SENTRY_CODECS", value_delimiter = ',', default_value = "avc1,mp4v")]
    pub codecs: Vec<String>,

    #[arg(long, env = "SENTRY_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "SENTRY_READ_TIMEOUT_MS", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// RTSP transport (tcp or udp)
    #[arg(long, env = "SENTRY_RTSP_TRANSPORT", default_value = "tcp")]
    pub transport: String,

    /// Frame rate used when the camera does not report one
    #[arg(long, env = "SENTRY_FALLBACK_FPS", default_value_t = 15.0)]
    pub fallback_fps: f64,

    /// Leave the confidence tag out of file names
    #[arg(long)]
    pub no_confidence_tag: bool,

    /// Do not write a JSON sidecar next to each recording
    #[arg(long)]
    pub no_sidecar: bool,
}

impl Cli {
    pub fn into_config(self) -> garden_sentry::Result<SentryConfig> {
        let absence_timeout = Duration::try_from_secs_f64(self.absence_timeout).map_err(|_| {
            garden_sentry::SentryError::Configuration(format!(
                "absence timeout {} is not a valid number of seconds",
                self.absence_timeout
            ))
        })?;
        let codecs = self
            .codecs
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.parse::<Codec>())
            .collect::<garden_sentry::Result<Vec<_>>>()?;
        let transport: Transport = self.transport.parse()?;

        let config = SentryConfig {
            stream_address: self.stream_address,
            classifier_url: self.classifier_url,
            classifier_timeout: Duration::from_millis(self.classifier_timeout_ms),
            output_dir: self.output_dir,
            file_prefix: self.file_prefix,
            codecs,
            tag_confidence: !self.no_confidence_tag,
            write_sidecar: !self.no_sidecar,
            confidence_floor: self.confidence_floor,
            target_labels: self.target_labels,
            suppressing_labels: self.suppressing_labels,
            suppression: if self.suppress_any_confidence {
                SuppressionMode::AnyConfidence
            } else {
                SuppressionMode::AboveFloor
            },
            absence_timeout,
            record_through_absence: !self.no_record_through_absence,
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            transport,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            fallback_fps: self.fallback_fps,
            ..SentryConfig::default()
        };
        config.validate()
    }
}
