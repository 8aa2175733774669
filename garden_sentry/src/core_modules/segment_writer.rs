// THEORY:
// The segmented writer turns one recording episode into one well-formed media file.
// It knows nothing about presence or timing; it is told when to open, what to write,
// and when to finalize.
//
// Key architectural principles:
// 1.  **Codec Fallback**: Encoders are tried in the configured order. The first one
//     that opens wins, and a fallback is reported loudly so a silently degraded
//     deployment is noticed. If nothing opens, only this episode is lost.
// 2.  **Pluggable Backend**: The actual container/codec work is delegated to an
//     `EncoderBackend` (OpenCV in the recorder binary, an in-memory fake in tests).
// 3.  **Idempotent Finalize**: A `WriterHandle` can be finalized any number of times.
//     Only the first call releases the encoder and produces an `ArtifactFile`; later
//     calls are silent no-ops, which makes cleanup on fault paths safe.
// 4.  **Write-Once Artifacts**: Every episode gets a fresh, collision-free path from
//     the `ArtifactNamer`. Nothing is ever reopened or rewritten.

use crate::core_modules::naming::ArtifactNamer;
use crate::error::{Result, SentryError};
use crate::frame::{Frame, StreamGeometry};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The codec every OpenCV build can write, used as the last resort.
pub const UNIVERSAL_FALLBACK_CODEC: &str = "mp4v";

/// A four-character codec code, e.g. `avc1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Codec(String);

impl Codec {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fourcc(&self) -> [char; 4] {
        let mut code = [' '; 4];
        for (slot, c) in code.iter_mut().zip(self.0.chars()) {
            *slot = c;
        }
        code
    }

    pub fn universal_fallback() -> Self {
        Self::from_static(UNIVERSAL_FALLBACK_CODEC)
    }

    /// For codes known to be well-formed at compile time.
    pub fn from_static(code: &'static str) -> Self {
        debug_assert_eq!(code.len(), 4);
        Codec(code.to_string())
    }
}

impl FromStr for Codec {
    type Err = SentryError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 4 || !s.chars().all(|c| c.is_ascii_graphic()) {
            return Err(SentryError::Configuration(format!(
                "codec '{s}' is not a four-character code"
            )));
        }
        Ok(Codec(s.to_string()))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The encoder behind the writer. `Sink` is one open output file.
pub trait EncoderBackend {
    type Sink;

    /// Opens `path` for writing with `codec`. An error means this codec is unusable.
    fn open(&mut self, path: &Path, codec: &Codec, geometry: &StreamGeometry) -> Result<Self::Sink>;

    fn write(&mut self, sink: &mut Self::Sink, frame: &Frame) -> Result<()>;

    /// Flushes and closes the file.
    fn release(&mut self, sink: Self::Sink) -> Result<()>;
}

/// What the writer needs to name a new artifact.
#[derive(Debug, Clone)]
pub struct NamingContext {
    pub started_at: DateTime<Local>,
    pub tag: Option<String>,
}

/// Triage notes carried alongside an open file and persisted in its sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpisodeNotes {
    pub best_label: Option<String>,
    pub best_confidence: Option<f32>,
    pub confidence_range: Option<(f32, f32)>,
}

/// One open (or already finalized) output file.
pub struct WriterHandle<S> {
    sink: Option<S>,
    path: PathBuf,
    codec: Codec,
    used_fallback: bool,
    geometry: StreamGeometry,
    started_at: DateTime<Local>,
    frames_written: u64,
    notes: EpisodeNotes,
}

impl<S> WriterHandle<S> {
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn notes_mut(&mut self) -> &mut EpisodeNotes {
        &mut self.notes
    }
}

/// The persisted result of one episode. Also written as the JSON sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub codec: Codec,
    pub used_fallback: bool,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub started_at: DateTime<Local>,
    pub finalized_at: DateTime<Local>,
    #[serde(flatten)]
    pub notes: EpisodeNotes,
}

impl ArtifactFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

/// Allocates, feeds and finalizes one artifact per episode.
pub struct SegmentWriter<B: EncoderBackend> {
    backend: B,
    namer: ArtifactNamer,
    codecs: Vec<Codec>,
    write_sidecar: bool,
    failed_opens: u64,
}

impl<B: EncoderBackend> SegmentWriter<B> {
    pub fn new(backend: B, namer: ArtifactNamer, codecs: Vec<Codec>, write_sidecar: bool) -> Self {
        Self {
            backend,
            namer,
            codecs,
            write_sidecar,
            failed_opens: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consecutive `open` calls that failed since the last successful one.
    pub fn failed_opens(&self) -> u64 {
        self.failed_opens
    }

    /// Opens a new artifact, trying each codec in order.
    ///
    /// While opens keep failing, only the first failure in a row is logged at `warn`.
    pub fn open(&mut self, geometry: &StreamGeometry, naming: &NamingContext) -> Result<WriterHandle<B::Sink>> {
        match self.try_open(geometry, naming) {
            Ok(handle) => {
                if self.failed_opens > 0 {
                    tracing::info!(failed_attempts = self.failed_opens, codec = %handle.codec, "encoder available again");
                }
                self.failed_opens = 0;
                Ok(handle)
            }
            Err(e) => {
                self.failed_opens += 1;
                Err(e)
            }
        }
    }

    fn try_open(&mut self, geometry: &StreamGeometry, naming: &NamingContext) -> Result<WriterHandle<B::Sink>> {
        fs::create_dir_all(self.namer.dir())?;
        let path = self.namer.next_path(&naming.started_at, naming.tag.as_deref());
        let first_failure = self.failed_opens == 0;

        for (attempt, codec) in self.codecs.iter().enumerate() {
            match self.backend.open(&path, codec, geometry) {
                Ok(sink) => {
                    let used_fallback = attempt > 0;
                    if used_fallback {
                        tracing::warn!(
                            codec = %codec,
                            primary = %self.codecs[0],
                            file = %path.display(),
                            "codec fallback used"
                        );
                    }
                    return Ok(WriterHandle {
                        sink: Some(sink),
                        path,
                        codec: codec.clone(),
                        used_fallback,
                        geometry: *geometry,
                        started_at: naming.started_at,
                        frames_written: 0,
                        notes: EpisodeNotes::default(),
                    });
                }
                Err(e) => {
                    if first_failure {
                        tracing::warn!(codec = %codec, error = %e, "codec failed to open");
                    } else {
                        tracing::debug!(codec = %codec, error = %e, "codec failed to open");
                    }
                    remove_empty_leftover(&path);
                }
            }
        }

        // Nothing was written, so the name can go to the next attempt.
        self.namer.rollback();
        let tried = self
            .codecs
            .iter()
            .map(Codec::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Err(SentryError::NoCodecAvailable { tried })
    }

    /// Appends one frame. Writing to a finalized handle is an error and writes nothing.
    pub fn write(&mut self, handle: &mut WriterHandle<B::Sink>, frame: &Frame) -> Result<()> {
        if frame.width != handle.geometry.width || frame.height != handle.geometry.height {
            return Err(SentryError::Write(format!(
                "frame {}x{} does not match artifact {}x{}",
                frame.width, frame.height, handle.geometry.width, handle.geometry.height
            )));
        }
        if frame.data.len() != handle.geometry.frame_len() {
            return Err(SentryError::Write(format!(
                "frame {} holds {} bytes, expected {}",
                frame.index,
                frame.data.len(),
                handle.geometry.frame_len()
            )));
        }
        let sink = handle
            .sink
            .as_mut()
            .ok_or_else(|| SentryError::Write(format!("{} is already finalized", handle.path.display())))?;
        self.backend.write(sink, frame)?;
        handle.frames_written += 1;
        Ok(())
    }

    /// Closes the artifact. Returns `None` if the handle was already finalized.
    pub fn finalize(&mut self, handle: &mut WriterHandle<B::Sink>) -> Result<Option<ArtifactFile>> {
        let Some(sink) = handle.sink.take() else {
            return Ok(None);
        };
        self.backend.release(sink)?;

        let artifact = ArtifactFile {
            path: handle.path.clone(),
            codec: handle.codec.clone(),
            used_fallback: handle.used_fallback,
            frames: handle.frames_written,
            width: handle.geometry.width,
            height: handle.geometry.height,
            fps: handle.geometry.fps,
            started_at: handle.started_at,
            finalized_at: Local::now(),
            notes: handle.notes.clone(),
        };

        if self.write_sidecar {
            if let Err(e) = write_sidecar(&artifact) {
                tracing::warn!(file = %artifact.sidecar_path().display(), error = %e, "sidecar not written");
            }
        }
        Ok(Some(artifact))
    }
}

fn write_sidecar(artifact: &ArtifactFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(artifact)?;
    fs::write(artifact.sidecar_path(), json)?;
    Ok(())
}

/// Some encoders create the output file before discovering the codec is unusable.
fn remove_empty_leftover(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.is_file() && meta.len() == 0 {
            let _ = fs::remove_file(path);
        }
    }
}
