// THEORY:
// The hysteresis recorder converts a noisy, per-frame "subject present" signal into
// clean recording episodes. It is a two-state machine (`Idle`, `Recording`) with an
// asymmetric trigger:
//
// - **Instant start**: the first positive frame opens an episode immediately.
//   Missing the first moments of an event is worse than one spurious short clip.
// - **Delayed stop**: an episode only closes once the subject has been absent for
//   `absence_timeout` of stream time. Every positive frame re-arms the timer, so a
//   subject flickering in and out of detector confidence stays in one file.
// - **Record through absence**: frames seen while waiting for the timeout are still
//   written, so the clip has no holes.
//
// The recorder owns at most one open episode (an `Option`, not a list), which makes
// "two files open at once" and "a frame written after finalize" unrepresentable.
// It is bound to one live stream at a time through `attach`/`detach`; detaching
// force-finalizes, so an episode can never outlive its stream.

use crate::core_modules::presence::PresenceSignal;
use crate::core_modules::segment_writer::{
    ArtifactFile, Codec, EncoderBackend, EpisodeNotes, NamingContext, SegmentWriter, WriterHandle,
};
use crate::frame::{Frame, StreamGeometry};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The two knobs that trade fragmentation against storage, plus naming.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub absence_timeout: Duration,
    pub record_through_absence: bool,
    pub tag_confidence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// What a single frame did to the recorder.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    /// No episode open and nothing to start.
    Idle,
    /// A new episode was opened and the frame written to it.
    EpisodeStarted {
        path: PathBuf,
        codec: Codec,
        used_fallback: bool,
    },
    /// The frame was appended to the open episode.
    Recorded,
    /// The episode is waiting out an absence and the frame was not written.
    Holding,
    /// The absence timeout elapsed and the episode was closed.
    EpisodeFinalized(ArtifactFile),
    /// The episode could not be started or continued. Whatever was written is finalized.
    EpisodeAborted {
        reason: String,
        artifact: Option<ArtifactFile>,
    },
}

/// The single open recording.
struct RecordingEpisode<S> {
    last_seen_at: Duration,
    writer: WriterHandle<S>,
}

impl<S> RecordingEpisode<S> {
    fn note(&mut self, signal: &PresenceSignal) {
        let notes: &mut EpisodeNotes = self.writer.notes_mut();
        if let Some((lo, hi)) = signal.confidence_range {
            notes.confidence_range = Some(match notes.confidence_range {
                Some((min, max)) => (min.min(lo), max.max(hi)),
                None => (lo, hi),
            });
            if notes.best_confidence.is_none_or(|best| hi > best) {
                notes.best_confidence = Some(hi);
                notes.best_label = signal.best_label.clone();
            }
        }
    }
}

pub struct Recorder<B: EncoderBackend> {
    writer: SegmentWriter<B>,
    settings: RecorderSettings,
    geometry: Option<StreamGeometry>,
    episode: Option<RecordingEpisode<B::Sink>>,
}

impl<B: EncoderBackend> Recorder<B> {
    pub fn new(writer: SegmentWriter<B>, settings: RecorderSettings) -> Self {
        Self {
            writer,
            settings,
            geometry: None,
            episode: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        if self.episode.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    /// Number of unfinalized episodes. Always 0 or 1.
    pub fn open_episodes(&self) -> usize {
        usize::from(self.episode.is_some())
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.episode.as_ref().map(|e| e.writer.path())
    }

    pub fn writer(&self) -> &SegmentWriter<B> {
        &self.writer
    }

    /// Binds the recorder to a freshly opened stream.
    pub fn attach(&mut self, geometry: StreamGeometry) -> Option<ArtifactFile> {
        let leftover = self.force_finalize();
        self.geometry = Some(geometry);
        leftover
    }

    /// Unbinds from the stream, finalizing any open episode first.
    pub fn detach(&mut self) -> Option<ArtifactFile> {
        let artifact = self.force_finalize();
        self.geometry = None;
        artifact
    }

    /// Feeds one frame and its presence verdict through the state machine.
    pub fn on_frame(&mut self, frame: &Frame, signal: &PresenceSignal) -> RecorderEvent {
        let now = frame.stream_time;

        let Some(episode) = self.episode.as_mut() else {
            if signal.present {
                return self.start_episode(frame, signal);
            }
            return RecorderEvent::Idle;
        };

        if signal.present {
            episode.last_seen_at = now;
            episode.note(signal);
            return match self.writer.write(&mut episode.writer, frame) {
                Ok(()) => RecorderEvent::Recorded,
                Err(e) => self.abort_episode(e.to_string()),
            };
        }

        let mut event = RecorderEvent::Holding;
        if self.settings.record_through_absence {
            if let Err(e) = self.writer.write(&mut episode.writer, frame) {
                return self.abort_episode(e.to_string());
            }
            event = RecorderEvent::Recorded;
        }

        let absent_for = now.saturating_sub(episode.last_seen_at);
        if absent_for >= self.settings.absence_timeout {
            tracing::info!(
                absent_secs = absent_for.as_secs_f64(),
                "subject absent, closing episode"
            );
            return match self.close_episode() {
                Ok(Some(artifact)) => RecorderEvent::EpisodeFinalized(artifact),
                Ok(None) => RecorderEvent::Idle,
                Err(reason) => RecorderEvent::EpisodeAborted { reason, artifact: None },
            };
        }
        event
    }

    /// Finalizes the open episode, if any. Used on stream faults and shutdown.
    pub fn force_finalize(&mut self) -> Option<ArtifactFile> {
        match self.close_episode() {
            Ok(artifact) => artifact,
            Err(reason) => {
                tracing::error!(error = %reason, "episode could not be finalized cleanly");
                None
            }
        }
    }

    fn start_episode(&mut self, frame: &Frame, signal: &PresenceSignal) -> RecorderEvent {
        let Some(attached) = self.geometry else {
            return RecorderEvent::EpisodeAborted {
                reason: "no stream attached".to_string(),
                artifact: None,
            };
        };
        let geometry = StreamGeometry {
            width: frame.width,
            height: frame.height,
            fps: attached.fps,
        };
        let naming = NamingContext {
            started_at: Local::now(),
            tag: if self.settings.tag_confidence {
                signal.confidence_tag()
            } else {
                None
            },
        };

        let handle = match self.writer.open(&geometry, &naming) {
            Ok(handle) => handle,
            Err(e) => {
                // A missing encoder fails every start; say so once per outage.
                if self.writer.failed_opens() <= 1 {
                    tracing::warn!(error = %e, frame = frame.index, "episode not started");
                } else {
                    tracing::debug!(error = %e, frame = frame.index, "episode not started");
                }
                return RecorderEvent::EpisodeAborted {
                    reason: e.to_string(),
                    artifact: None,
                };
            }
        };

        let mut episode = RecordingEpisode {
            last_seen_at: frame.stream_time,
            writer: handle,
        };
        episode.note(signal);

        let started = RecorderEvent::EpisodeStarted {
            path: episode.writer.path().to_path_buf(),
            codec: episode.writer.codec().clone(),
            used_fallback: episode.writer.used_fallback(),
        };
        tracing::info!(
            file = %episode.writer.path().display(),
            codec = %episode.writer.codec(),
            label = signal.best_label.as_deref().unwrap_or("-"),
            "episode started"
        );

        let write = self.writer.write(&mut episode.writer, frame);
        self.episode = Some(episode);
        match write {
            Ok(()) => started,
            Err(e) => self.abort_episode(e.to_string()),
        }
    }

    fn abort_episode(&mut self, reason: String) -> RecorderEvent {
        tracing::warn!(error = %reason, "episode aborted");
        let artifact = self.force_finalize();
        RecorderEvent::EpisodeAborted { reason, artifact }
    }

    fn close_episode(&mut self) -> Result<Option<ArtifactFile>, String> {
        let Some(mut episode) = self.episode.take() else {
            return Ok(None);
        };
        match self.writer.finalize(&mut episode.writer) {
            Ok(Some(artifact)) => {
                tracing::info!(
                    file = %artifact.file_name(),
                    frames = artifact.frames,
                    codec = %artifact.codec,
                    "episode finalized"
                );
                Ok(Some(artifact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(format!("{}: {e}", episode.writer.path().display())),
        }
    }
}
