//! Patch validation verdicts and their aggregation into the retry loop.
//!
//! The coordinator consumes verdicts, it does not produce them: a
//! [`PatchValidator`] is a pure function from patch text to a verdict. When
//! the implement stage emits discrete patches, every patch is validated and
//! the verdicts are folded into one [`ValidationSummary`] that adjusts the
//! attempt's confidence score.

use serde::{Deserialize, Serialize};

pub const CONFIDENCE_MIN: i32 = 0;
pub const CONFIDENCE_MAX: i32 = 100;

/// Verdict for a single candidate patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    /// Rejection reason codes; empty for valid patches.
    pub reasons: Vec<String>,
    /// Signed confidence adjustment: boost for valid, penalty for invalid.
    pub confidence_delta: i32,
}

/// Pure per-patch validation capability.
pub trait PatchValidator: Send + Sync {
    fn validate(&self, patch: &str) -> ValidationVerdict;
}

/// Aggregated result of validating a whole patch set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// True only if every patch in the set is valid.
    pub patch_valid: bool,
    /// Base confidence plus the sum of all deltas, clamped to [0, 100].
    pub confidence_score: i32,
    pub accepted: usize,
    pub rejected: usize,
    /// First rejection reason encountered, in patch order. When several
    /// patches fail for different reasons, the first one wins the aggregate
    /// slot; the full list is still in `reasons`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// All reasons from all verdicts, in patch order.
    pub reasons: Vec<String>,
}

/// Fold per-patch verdicts into one summary.
pub fn aggregate(base_confidence: i32, verdicts: &[ValidationVerdict]) -> ValidationSummary {
    let mut confidence = base_confidence;
    let mut accepted = 0;
    let mut rejected = 0;
    let mut reasons = Vec::new();
    let mut rejection_reason = None;

    for verdict in verdicts {
        confidence += verdict.confidence_delta;
        if verdict.valid {
            accepted += 1;
        } else {
            rejected += 1;
            if rejection_reason.is_none() {
                rejection_reason = verdict
                    .reasons
                    .first()
                    .cloned()
                    .or_else(|| Some("patch rejected".to_string()));
            }
        }
        reasons.extend(verdict.reasons.iter().cloned());
    }

    ValidationSummary {
        patch_valid: rejected == 0,
        confidence_score: confidence.clamp(CONFIDENCE_MIN, CONFIDENCE_MAX),
        accepted,
        rejected,
        rejection_reason,
        reasons,
    }
}

/// Cheap structural checks that catch the common garbage patches: empty
/// output and placeholder text left in by the implement stage.
#[derive(Debug, Default)]
pub struct HeuristicValidator;

const PLACEHOLDER_MARKERS: &[&str] = &[
    "keep existing code",
    "rest of the file unchanged",
    "TODO: implement",
];

impl PatchValidator for HeuristicValidator {
    fn validate(&self, patch: &str) -> ValidationVerdict {
        if patch.trim().is_empty() {
            return ValidationVerdict {
                valid: false,
                reasons: vec!["patch is empty".to_string()],
                confidence_delta: -25,
            };
        }

        let reasons: Vec<String> = PLACEHOLDER_MARKERS
            .iter()
            .filter(|marker| patch.contains(**marker))
            .map(|marker| format!("patch contains placeholder text: \"{marker}\""))
            .collect();

        if reasons.is_empty() {
            ValidationVerdict {
                valid: true,
                reasons,
                confidence_delta: 10,
            }
        } else {
            let penalty = -15 * reasons.len() as i32;
            ValidationVerdict {
                valid: false,
                reasons,
                confidence_delta: penalty,
            }
        }
    }
}
