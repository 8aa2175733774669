// THEORY:
// The presence evaluator collapses everything the classifier saw in one frame into a
// single yes/no answer: "is the subject in this frame?". It is deliberately a pure
// function. All temporal reasoning (debounce, absence timeouts) lives in the
// recorder, so the evaluator can be tested one frame at a time.
//
// Policy, in order:
// 1.  **Confidence floor**: detections below the floor are discarded outright.
// 2.  **Suppression**: a confounding class (e.g. a bird that the detector likes to
//     mistake for a cat) invalidates the whole frame. Whether the confounder must
//     itself clear the floor is a configurable `SuppressionMode`.
// 3.  **Target match**: the frame is positive iff a surviving detection carries a
//     target label. The best label and the confidence range of the target
//     detections ride along for naming and triage.

use crate::classifier::Detection;
use serde::{Deserialize, Serialize};

/// How a suppressing label is allowed to veto a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuppressionMode {
    /// The confounding detection must clear the confidence floor to suppress.
    #[default]
    AboveFloor,
    /// A confounding detection at any confidence suppresses the frame.
    AnyConfidence,
}

/// The tunable policy applied to each frame's detections.
#[derive(Debug, Clone, PartialEq)]
pub struct PresencePolicy {
    pub confidence_floor: f32,
    pub target_labels: Vec<String>,
    pub suppressing_labels: Vec<String>,
    pub suppression: SuppressionMode,
}

impl PresencePolicy {
    fn is_target(&self, label: &str) -> bool {
        self.target_labels.iter().any(|t| t.eq_ignore_ascii_case(label))
    }

    fn is_suppressing(&self, label: &str) -> bool {
        self.suppressing_labels.iter().any(|s| s.eq_ignore_ascii_case(label))
    }

    fn clears_floor(&self, detection: &Detection) -> bool {
        // NaN never clears the floor.
        detection.confidence >= self.confidence_floor
    }
}

/// The per-frame verdict handed to the recorder.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceSignal {
    pub present: bool,
    /// The highest-confidence target label. Only set when `present`.
    pub best_label: Option<String>,
    /// `(min, max)` confidence among target detections. Only set when `present`.
    pub confidence_range: Option<(f32, f32)>,
}

impl PresenceSignal {
    pub fn absent() -> Self {
        Self::default()
    }

    /// A short confidence summary for file names: `p90`, or `p72-95` for a range.
    pub fn confidence_tag(&self) -> Option<String> {
        let (min, max) = self.confidence_range?;
        let min = percent(min);
        let max = percent(max);
        if min == max {
            Some(format!("p{max}"))
        } else {
            Some(format!("p{min}-{max}"))
        }
    }
}

fn percent(confidence: f32) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u32
}

/// Evaluates one frame's detections under `policy`.
pub fn evaluate(detections: &[Detection], policy: &PresencePolicy) -> PresenceSignal {
    let suppressed = detections.iter().any(|d| {
        policy.is_suppressing(&d.label)
            && match policy.suppression {
                SuppressionMode::AboveFloor => policy.clears_floor(d),
                SuppressionMode::AnyConfidence => true,
            }
    });
    if suppressed {
        return PresenceSignal::absent();
    }

    let mut best: Option<&Detection> = None;
    let mut range: Option<(f32, f32)> = None;

    for detection in detections
        .iter()
        .filter(|d| policy.clears_floor(d) && policy.is_target(&d.label))
    {
        let c = detection.confidence;
        range = Some(match range {
            Some((lo, hi)) => (lo.min(c), hi.max(c)),
            None => (c, c),
        });
        if best.is_none_or(|b| c > b.confidence) {
            best = Some(detection);
        }
    }

    match best {
        Some(best) => PresenceSignal {
            present: true,
            best_label: Some(best.label.clone()),
            confidence_range: range,
        },
        None => PresenceSignal::absent(),
    }
}
