//! Frame-comparison core: contrast normalization, local alignment and
//! change detection, plus the evaluation policy that runs them against a
//! calibrated reference set.
//!
//! Everything here is synchronous and free of shared state. Callers that
//! need a responsive UI should run [`evaluate::Inspector::evaluate`] on a
//! blocking worker.

pub mod align;
pub mod detect;
pub mod evaluate;
pub mod normalize;
pub mod reference;

#[cfg(test)]
pub(crate) mod test_utils;

pub use align::{align, locate, MatchLocation};
pub use detect::ChangeDetector;
pub use evaluate::{Inspector, ReferenceSource};
pub use normalize::ContrastNormalizer;
pub use reference::{ReferenceError, ReferenceSet, ReferenceStore};
