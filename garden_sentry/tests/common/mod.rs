#![allow(dead_code)]

use garden_sentry::core_modules::naming::ArtifactNamer;
use garden_sentry::core_modules::recorder::{Recorder, RecorderSettings};
use garden_sentry::core_modules::segment_writer::SegmentWriter;
use garden_sentry::{
    Classifier, Codec, ConnectOptions, Detection, EncoderBackend, Frame, FrameRead, Result, SentryConfig,
    SentryError, StreamConnector, StreamGeometry, StreamHandle,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const WIDTH: u32 = 2;
pub const HEIGHT: u32 = 2;

/// Teardown calls, in the order the fakes saw them, shared across fakes.
pub type Journal = Arc<Mutex<Vec<&'static str>>>;

fn note(journal: &Journal, entry: &'static str) {
    journal.lock().unwrap().push(entry);
}

/// One step of a scripted stream session.
#[derive(Debug, Clone, Copy)]
pub enum Item {
    Frame,
    Empty,
    Fault,
}

/// Replays a list of sessions. Frame `i` of a session has stream time `i` seconds.
/// Once the script runs out, every connect fails and shutdown is requested.
pub struct ScriptedConnector {
    sessions: VecDeque<Vec<Item>>,
    current: VecDeque<Item>,
    stop: watch::Sender<bool>,
    journal: Journal,
    pub opens: u32,
    pub closes: u32,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Vec<Item>>, stop: watch::Sender<bool>) -> Self {
        Self {
            sessions: sessions.into(),
            current: VecDeque::new(),
            stop,
            journal: Journal::default(),
            opens: 0,
            closes: 0,
        }
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    /// Flips the shutdown flag the supervisor is watching.
    pub fn request_shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

impl StreamConnector for ScriptedConnector {
    async fn open(&mut self, address: &str, _options: &ConnectOptions) -> Result<StreamHandle> {
        let Some(session) = self.sessions.pop_front() else {
            let _ = self.stop.send(true);
            return Err(SentryError::ConnectFailure("script exhausted".into()));
        };
        self.current = session.into();
        self.opens += 1;
        Ok(StreamHandle::new(
            address,
            StreamGeometry {
                width: WIDTH,
                height: HEIGHT,
                fps: 1.0,
            },
        ))
    }

    async fn next_frame(&mut self, handle: &mut StreamHandle) -> Result<FrameRead> {
        let index = handle.frames_read();
        let at = Duration::from_secs(index);
        match self.current.pop_front() {
            Some(Item::Frame) => Ok(FrameRead::Frame(Frame::new(
                index,
                at,
                WIDTH,
                HEIGHT,
                vec![0; (WIDTH * HEIGHT * 3) as usize],
            ))),
            Some(Item::Empty) => Ok(FrameRead::Frame(Frame::new(index, at, 0, 0, Vec::new()))),
            Some(Item::Fault) => Err(SentryError::ReadFailure("connection reset by peer".into())),
            None => Ok(FrameRead::EndOfStream),
        }
    }

    async fn close(&mut self, _handle: &mut StreamHandle) {
        self.closes += 1;
        note(&self.journal, "close");
    }
}

pub fn frames(n: usize) -> Vec<Item> {
    vec![Item::Frame; n]
}

/// Answers each `detect` call with the next scripted entry; `None` is a classifier error.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: VecDeque<Option<Vec<Detection>>>,
    journal: Journal,
    pub calls: usize,
    pub released: bool,
}

impl ScriptedClassifier {
    pub fn new(script: Vec<Option<Vec<Detection>>>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }
}

impl Classifier for ScriptedClassifier {
    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Some(detections)) => Ok(detections),
            Some(None) => Err(SentryError::Classifier("inference server returned 503".into())),
            None => Ok(Vec::new()),
        }
    }

    async fn release(&mut self) {
        self.released = true;
        note(&self.journal, "release");
    }
}

pub fn cat(confidence: f32) -> Option<Vec<Detection>> {
    Some(vec![Detection::new("cat", confidence)])
}

pub fn nothing() -> Option<Vec<Detection>> {
    Some(Vec::new())
}

pub fn repeat(entry: Option<Vec<Detection>>, n: usize) -> Vec<Option<Vec<Detection>>> {
    vec![entry; n]
}

#[derive(Debug)]
pub struct EncodedFile {
    pub path: PathBuf,
    pub codec: String,
    pub frames: Vec<u64>,
    pub released: bool,
}

/// Keeps every "file" in memory. Codecs listed in `broken` refuse to open.
#[derive(Default)]
pub struct MemoryEncoder {
    pub broken: Vec<String>,
    pub files: Vec<EncodedFile>,
    journal: Journal,
}

impl MemoryEncoder {
    pub fn with_broken(codecs: &[&str]) -> Self {
        Self {
            broken: codecs.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn open_files(&self) -> usize {
        self.files.iter().filter(|f| !f.released).count()
    }
}

impl EncoderBackend for MemoryEncoder {
    type Sink = usize;

    fn open(&mut self, path: &Path, codec: &Codec, _geometry: &StreamGeometry) -> Result<usize> {
        if self.broken.iter().any(|b| b == codec.as_str()) {
            return Err(SentryError::Write(format!("encoder for {codec} not built in")));
        }
        self.files.push(EncodedFile {
            path: path.to_path_buf(),
            codec: codec.to_string(),
            frames: Vec::new(),
            released: false,
        });
        Ok(self.files.len() - 1)
    }

    fn write(&mut self, sink: &mut usize, frame: &Frame) -> Result<()> {
        let file = &mut self.files[*sink];
        assert!(!file.released, "write after release");
        file.frames.push(frame.index);
        Ok(())
    }

    fn release(&mut self, sink: usize) -> Result<()> {
        let file = &mut self.files[sink];
        assert!(!file.released, "double release");
        file.released = true;
        note(&self.journal, "finalize");
        Ok(())
    }
}

pub fn config(dir: &Path) -> Arc<SentryConfig> {
    let config = SentryConfig {
        stream_address: "rtsp://garden-cam:554/stream1".into(),
        classifier_url: "http://localhost:8000/detect".into(),
        output_dir: dir.to_path_buf(),
        absence_timeout: Duration::from_secs(4),
        reconnect_delay: Duration::from_secs(5),
        event_capacity: 1024,
        ..Default::default()
    };
    Arc::new(config.validate().expect("test config is valid"))
}

/// A recorder over a `MemoryEncoder`, attached to a 2x2 stream at 1 fps.
pub fn recorder(dir: &Path, absence_timeout: Duration) -> Recorder<MemoryEncoder> {
    let writer = SegmentWriter::new(
        MemoryEncoder::default(),
        ArtifactNamer::new(dir, "cat", "mp4"),
        vec![Codec::from_static("avc1"), Codec::universal_fallback()],
        false,
    );
    let mut recorder = Recorder::new(
        writer,
        RecorderSettings {
            absence_timeout,
            record_through_absence: true,
            tag_confidence: false,
        },
    );
    recorder.attach(StreamGeometry {
        width: WIDTH,
        height: HEIGHT,
        fps: 1.0,
    });
    recorder
}

pub fn frame_at(index: u64) -> Frame {
    Frame::new(
        index,
        Duration::from_secs(index),
        WIDTH,
        HEIGHT,
        vec![0; (WIDTH * HEIGHT * 3) as usize],
    )
}
