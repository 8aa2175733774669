// THEORY:
// The session supervisor is the top-level API of the engine. It wires the stream
// connector, the classifier, the presence evaluator and the hysteresis recorder into
// one sequential pipeline and keeps that pipeline alive for as long as the process
// runs.
//
// Key architectural principles:
// 1.  **Explicit State Machine**: The session is always in exactly one of
//     `Connecting`, `Streaming`, `Backoff` or `ShuttingDown`. `step()` performs one
//     transition (one frame while streaming), so every edge can be driven and
//     asserted from a test with fake ports.
// 2.  **Fault Containment**: Connect and read faults never escape. A lost stream
//     finalizes whatever episode was open, closes the connection, waits a fixed
//     backoff and reconnects, forever. A classifier error only costs its frame.
// 3.  **Backpressure By Not Pulling**: Frames are pulled, classified and recorded
//     one at a time. There is no queue between the stages to grow.
// 4.  **Cooperative Shutdown**: A `watch` channel carries the shutdown request. It
//     is checked between steps and raced against the backoff sleep; teardown always
//     finalizes the episode, closes the connector and releases the classifier, in
//     that order.

use crate::classifier::Classifier;
use crate::config::SentryConfig;
use crate::core_modules::connector::{self, ConnectOptions, FrameRead, StreamConnector, StreamHandle};
use crate::core_modules::naming::ArtifactNamer;
use crate::core_modules::presence::{self, PresencePolicy};
use crate::core_modules::recorder::{Recorder, RecorderEvent};
use crate::core_modules::segment_writer::{ArtifactFile, EncoderBackend, SegmentWriter};
use crate::events::{EventBus, SessionEvent};
use crate::frame::Frame;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Streaming,
    Backoff,
    ShuttingDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Backoff => "backoff",
            SessionState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Counters for one supervisor run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub connect_attempts: u64,
    pub sessions: u64,
    pub frames: u64,
    pub read_faults: u64,
    pub classifier_errors: u64,
    pub episodes_started: u64,
    pub episodes_finalized: u64,
    pub episodes_aborted: u64,
}

pub struct Supervisor<C, K, B>
where
    C: StreamConnector,
    K: Classifier,
    B: EncoderBackend,
{
    config: Arc<SentryConfig>,
    connector: C,
    classifier: K,
    recorder: Recorder<B>,
    policy: PresencePolicy,
    options: ConnectOptions,
    state: SessionState,
    stream: Option<StreamHandle>,
    bus: EventBus,
    report: SessionReport,
    finished: bool,
}

impl<C, K, B> Supervisor<C, K, B>
where
    C: StreamConnector,
    K: Classifier,
    B: EncoderBackend,
{
    /// Builds a supervisor from a validated configuration and its three ports.
    pub fn new(config: Arc<SentryConfig>, connector: C, classifier: K, backend: B) -> Self {
        let namer = ArtifactNamer::new(&config.output_dir, &config.file_prefix, &config.file_extension);
        let writer = SegmentWriter::new(backend, namer, config.codecs.clone(), config.write_sidecar);
        let recorder = Recorder::new(writer, config.recorder_settings());

        Self {
            policy: config.presence_policy(),
            options: config.connect_options(),
            bus: EventBus::new(config.event_capacity),
            config,
            connector,
            classifier,
            recorder,
            state: SessionState::Connecting,
            stream: None,
            report: SessionReport::default(),
            finished: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// True once shutdown teardown has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn recorder(&self) -> &Recorder<B> {
        &self.recorder
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn classifier(&self) -> &K {
        &self.classifier
    }

    /// Runs the session until shutdown is requested, then tears it down.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SessionReport {
        tracing::info!(address = %self.config.stream_address, "session supervisor started");
        while !self.finished {
            self.step(&mut shutdown).await;
        }
        self.report.clone()
    }

    /// Performs exactly one transition and returns the new state.
    pub async fn step(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionState {
        if self.state != SessionState::ShuttingDown && shutdown_requested(shutdown) {
            self.transition(SessionState::ShuttingDown);
            return self.state;
        }

        match self.state {
            SessionState::Connecting => self.connect().await,
            SessionState::Streaming => self.stream_one().await,
            SessionState::Backoff => self.backoff(shutdown).await,
            SessionState::ShuttingDown => self.shut_down().await,
        }
        self.state
    }

    async fn connect(&mut self) {
        self.report.connect_attempts += 1;
        tracing::info!(
            address = %self.config.stream_address,
            attempt = self.report.connect_attempts,
            transport = %self.options.transport,
            "connecting to stream"
        );

        match connector::connect(&mut self.connector, &self.config.stream_address, &self.options).await {
            Ok(handle) => {
                let geometry = handle.geometry();
                tracing::info!(
                    width = geometry.width,
                    height = geometry.height,
                    fps = geometry.fps,
                    "stream opened"
                );
                self.report.sessions += 1;
                if let Some(leftover) = self.recorder.attach(geometry) {
                    self.finalized(leftover);
                }
                self.bus.publish(SessionEvent::StreamOpened {
                    address: handle.address().to_string(),
                    geometry,
                });
                self.stream = Some(handle);
                self.transition(SessionState::Streaming);
            }
            Err(e) => {
                let retry_in_secs = self.config.reconnect_delay.as_secs();
                tracing::warn!(error = %e, retry_in_secs, "stream connect failed, retrying in {retry_in_secs}s");
                self.bus.publish(SessionEvent::ConnectFailed {
                    reason: e.to_string(),
                    retry_in_secs,
                });
                self.transition(SessionState::Backoff);
            }
        }
    }

    async fn stream_one(&mut self) {
        let Some(handle) = self.stream.as_mut() else {
            self.transition(SessionState::Connecting);
            return;
        };

        match connector::read_next(&mut self.connector, handle, &self.options).await {
            Ok(FrameRead::Frame(frame)) => self.process(frame).await,
            Ok(FrameRead::EndOfStream) => self.end_stream("end of stream".to_string()).await,
            Err(e) => {
                self.report.read_faults += 1;
                self.end_stream(e.to_string()).await;
            }
        }
    }

    async fn process(&mut self, frame: Frame) {
        self.report.frames += 1;

        let detections = match self.classifier.detect(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.report.classifier_errors += 1;
                tracing::warn!(frame = frame.index, error = %e, "classification failed, frame treated as empty");
                Vec::new()
            }
        };
        let signal = presence::evaluate(&detections, &self.policy);
        tracing::trace!(frame = frame.index, present = signal.present, "frame evaluated");

        match self.recorder.on_frame(&frame, &signal) {
            RecorderEvent::Idle | RecorderEvent::Recorded | RecorderEvent::Holding => {}
            RecorderEvent::EpisodeStarted {
                path,
                codec,
                used_fallback,
            } => {
                self.report.episodes_started += 1;
                self.bus.publish(SessionEvent::EpisodeStarted {
                    path,
                    codec,
                    used_fallback,
                });
            }
            RecorderEvent::EpisodeFinalized(artifact) => self.finalized(artifact),
            RecorderEvent::EpisodeAborted { reason, artifact } => {
                self.report.episodes_aborted += 1;
                self.bus.publish(SessionEvent::EpisodeAborted { reason, artifact });
            }
        }
    }

    /// Finalizes the episode, closes the stream and schedules a reconnect.
    async fn end_stream(&mut self, reason: String) {
        if let Some(artifact) = self.recorder.detach() {
            self.finalized(artifact);
        }
        if let Some(mut handle) = self.stream.take() {
            connector::disconnect(&mut self.connector, &mut handle).await;
        }

        let retry_in_secs = self.config.reconnect_delay.as_secs();
        tracing::warn!(reason = %reason, retry_in_secs, "stream lost, reconnecting in {retry_in_secs}s");
        self.bus.publish(SessionEvent::ReadFault { reason, retry_in_secs });
        self.transition(SessionState::Backoff);
    }

    async fn backoff(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let delay = self.config.reconnect_delay;
        tracing::info!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.transition(SessionState::Connecting),
            _ = shutdown.wait_for(|stop| *stop) => self.transition(SessionState::ShuttingDown),
        }
    }

    async fn shut_down(&mut self) {
        if self.finished {
            return;
        }
        if let Some(artifact) = self.recorder.detach() {
            self.finalized(artifact);
        }
        if let Some(mut handle) = self.stream.take() {
            connector::disconnect(&mut self.connector, &mut handle).await;
        }
        self.classifier.release().await;
        self.finished = true;

        let r = &self.report;
        tracing::info!(
            connect_attempts = r.connect_attempts,
            sessions = r.sessions,
            frames = r.frames,
            read_faults = r.read_faults,
            classifier_errors = r.classifier_errors,
            episodes = r.episodes_finalized,
            "session ended"
        );
    }

    fn finalized(&mut self, artifact: ArtifactFile) {
        self.report.episodes_finalized += 1;
        self.bus.publish(SessionEvent::EpisodeFinalized(artifact));
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        tracing::debug!(%from, %to, "session state changed");
        self.state = to;
        self.bus.publish(SessionEvent::StateChanged { from, to });
    }
}

/// Shutdown is requested when the flag is set or the controlling sender is gone.
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Detection;
    use crate::core_modules::segment_writer::Codec;
    use crate::error::{Result, SentryError};
    use crate::frame::StreamGeometry;
    use std::path::Path;
    use std::time::Duration;

    struct RefusingConnector {
        attempts: u32,
    }

    impl StreamConnector for RefusingConnector {
        async fn open(&mut self, _address: &str, _options: &ConnectOptions) -> Result<StreamHandle> {
            self.attempts += 1;
            Err(SentryError::ConnectFailure("connection refused".into()))
        }

        async fn next_frame(&mut self, _handle: &mut StreamHandle) -> Result<FrameRead> {
            Ok(FrameRead::EndOfStream)
        }

        async fn close(&mut self, _handle: &mut StreamHandle) {}
    }

    /// Streams forever; each frame has the index as its stream time in seconds.
    struct EndlessConnector;

    impl StreamConnector for EndlessConnector {
        async fn open(&mut self, address: &str, _options: &ConnectOptions) -> Result<StreamHandle> {
            Ok(StreamHandle::new(address, StreamGeometry { width: 1, height: 1, fps: 1.0 }))
        }

        async fn next_frame(&mut self, handle: &mut StreamHandle) -> Result<FrameRead> {
            let index = handle.frames_read();
            Ok(FrameRead::Frame(Frame::new(index, Duration::from_secs(index), 1, 1, vec![0; 3])))
        }

        async fn close(&mut self, _handle: &mut StreamHandle) {}
    }

    #[derive(Default)]
    struct AlwaysCat {
        released: bool,
    }

    impl Classifier for AlwaysCat {
        async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(vec![Detection::new("cat", 0.9)])
        }

        async fn release(&mut self) {
            self.released = true;
        }
    }

    struct NullBackend;

    impl EncoderBackend for NullBackend {
        type Sink = ();

        fn open(&mut self, _path: &Path, _codec: &Codec, _geometry: &StreamGeometry) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, _sink: &mut (), _frame: &Frame) -> Result<()> {
            Ok(())
        }

        fn release(&mut self, _sink: ()) -> Result<()> {
            Ok(())
        }
    }

    fn config(dir: &Path) -> Arc<SentryConfig> {
        let config = SentryConfig {
            stream_address: "rtsp://cam/stream".into(),
            classifier_url: "http://localhost/detect".into(),
            output_dir: dir.to_path_buf(),
            write_sidecar: false,
            ..Default::default()
        };
        Arc::new(config.validate().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_backs_off_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            config(dir.path()),
            RefusingConnector { attempts: 0 },
            AlwaysCat::default(),
            NullBackend,
        );
        let (_tx, mut rx) = watch::channel(false);
        let mut events = supervisor.subscribe();

        assert_eq!(supervisor.step(&mut rx).await, SessionState::Backoff);
        assert_eq!(supervisor.step(&mut rx).await, SessionState::Connecting);
        assert_eq!(supervisor.step(&mut rx).await, SessionState::Backoff);
        assert_eq!(supervisor.connector().attempts, 2);
        assert_eq!(supervisor.report().connect_attempts, 2);
        assert_eq!(supervisor.report().sessions, 0);

        let mut failures = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ConnectFailed { reason, retry_in_secs } = event {
                failures.push((reason, retry_in_secs));
            }
        }
        let retry = supervisor.config.reconnect_delay.as_secs();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|(reason, secs)| reason.contains("connection refused") && *secs == retry));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(
            config(dir.path()),
            RefusingConnector { attempts: 0 },
            AlwaysCat::default(),
            NullBackend,
        );
        let (tx, mut rx) = watch::channel(false);
        supervisor.step(&mut rx).await;

        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
            tx
        });
        let started = tokio::time::Instant::now();
        assert_eq!(supervisor.step(&mut rx).await, SessionState::ShuttingDown);
        assert!(started.elapsed() < supervisor.config.reconnect_delay);
        let _tx = stop.await.unwrap();

        supervisor.step(&mut rx).await;
        assert!(supervisor.is_finished());
        assert!(supervisor.classifier().released);
    }

    #[tokio::test]
    async fn shutdown_while_streaming_finalizes_the_episode() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(config(dir.path()), EndlessConnector, AlwaysCat::default(), NullBackend);
        let mut events = supervisor.subscribe();
        let (tx, mut rx) = watch::channel(false);

        assert_eq!(supervisor.step(&mut rx).await, SessionState::Streaming);
        for _ in 0..3 {
            assert_eq!(supervisor.step(&mut rx).await, SessionState::Streaming);
        }
        assert_eq!(supervisor.recorder().open_episodes(), 1);

        tx.send(true).unwrap();
        let report = supervisor.run(rx).await;

        assert_eq!(report.frames, 3);
        assert_eq!(report.episodes_started, 1);
        assert_eq!(report.episodes_finalized, 1);
        assert_eq!(supervisor.recorder().open_episodes(), 0);

        let mut finalized = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::EpisodeFinalized(artifact) = event {
                finalized = Some(artifact);
            }
        }
        assert_eq!(finalized.unwrap().frames, 3);
    }

    #[tokio::test]
    async fn dropped_controller_means_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(config(dir.path()), EndlessConnector, AlwaysCat::default(), NullBackend);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let report = supervisor.run(rx).await;
        assert_eq!(report.connect_attempts, 0);
        assert!(supervisor.is_finished());
    }
}
