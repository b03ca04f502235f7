use roi_inspect_common::config::{DetectorConfig, NormalizerConfig};
use roi_inspect_common::frame::{ComparisonResult, Frame, IntensityImage};
use tracing::{debug, info, warn};

use crate::align::align;
use crate::detect::ChangeDetector;
use crate::normalize::ContrastNormalizer;
use crate::reference::ReferenceError;

/// Ordered collection of normalized reference patches.
///
/// Implementations hand out patches one index at a time so a test cycle only
/// loads the references it actually examines.
pub trait ReferenceSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalized reference patch at `index`.
    fn reference(&self, index: usize) -> Result<IntensityImage, ReferenceError>;
}

/// Runs the normalize -> align -> detect pipeline against a reference set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Inspector {
    normalizer: ContrastNormalizer,
    detector: ChangeDetector,
}

impl Inspector {
    pub fn new(normalizer: ContrastNormalizer, detector: ChangeDetector) -> Self {
        Self {
            normalizer,
            detector,
        }
    }

    pub fn from_config(normalizer: &NormalizerConfig, detector: &DetectorConfig) -> Self {
        Self::new(
            ContrastNormalizer::from_config(normalizer),
            ChangeDetector::from_config(detector),
        )
    }

    pub fn normalizer(&self) -> &ContrastNormalizer {
        &self.normalizer
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Compare a live ROI crop against every reference, in order.
    ///
    /// The first reference that shows a change ends the cycle and its result
    /// is returned as is. When none does, the result is unchanged with the
    /// largest severity seen. References that fail to load are skipped and
    /// count toward neither outcome.
    pub fn evaluate<S>(&self, live_roi: Frame, references: &S) -> ComparisonResult
    where
        S: ReferenceSource + ?Sized,
    {
        let live = self.normalizer.normalize(live_roi);
        let mut max_severity = 0.0f64;
        let mut compared = 0usize;

        for index in 0..references.len() {
            let reference = match references.reference(index) {
                Ok(r) => r,
                Err(e) => {
                    warn!(index, error = %e, "reference unavailable, skipping");
                    continue;
                }
            };

            let aligned = align(&reference, &live);
            let result = self.detector.detect(&reference, &aligned);
            compared += 1;
            debug!(
                index,
                severity = format!("{:.4}", result.severity),
                changed = result.changed,
                "compared against reference"
            );

            if result.changed {
                info!(
                    index,
                    severity = format!("{:.4}", result.severity),
                    "change detected, stopping early"
                );
                return result;
            }
            max_severity = max_severity.max(result.severity);
        }

        info!(
            compared,
            total = references.len(),
            max_severity = format!("{:.4}", max_severity),
            "no significant change"
        );
        ComparisonResult {
            changed: false,
            severity: max_severity,
        }
    }
}
