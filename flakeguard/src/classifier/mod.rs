//! Flaky Classifier: explainable statistics over bounded run windows
//!
//! Turns the run outcomes of one test identity into a classification:
//! flaky or not, a confidence score, the dominant failure pattern and a
//! list of recommendations. No machine learning is involved; every factor
//! in the score can be read back from [`analysis::ConfidenceSignals`].
//!
//! # Confidence
//!
//! ```text
//! start        min(totalRuns / 20, 1)
//! x0.3         failureRate < 0.05 or > 0.95   (looks deterministic)
//! x1.2         0.10 <= failureRate <= 0.60    (canonical flaky band)
//! x1.1         failures within 24h of each other
//! x1.15        per-branch failure rates spread > 0.2
//! clamp        [0, 1]
//! ```
//!
//! # Pattern (first match wins)
//!
//! ```text
//! environment-dependent   branch spread > 0.1
//! timing-sensitive        >= 3 consecutive failures, or timeout|race|wait|async in errors
//! intermittent            otherwise
//! ```

pub mod analysis;
pub mod detector;
pub mod stats;

pub use analysis::{ConfidenceSignals, FlakyAnalysis, FlakyClassifier};
pub use detector::{group_by_identity, ClassificationReport, FlakyDetector};
