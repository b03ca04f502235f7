use image::ImageFormat;
use roi_inspect_common::config::ReferenceConfig;
use roi_inspect_common::frame::{Frame, IntensityImage};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::evaluate::ReferenceSource;
use crate::normalize::ContrastNormalizer;

/// File name of the reference at `index`, e.g. `ref_0.png`.
pub fn reference_file_name(index: usize) -> String {
    format!("ref_{index}.png")
}

/// In-memory set of normalized reference patches sharing one size.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    patches: Vec<IntensityImage>,
}

impl ReferenceSet {
    pub fn new(patches: Vec<IntensityImage>) -> Result<Self, ReferenceError> {
        let first = patches.first().ok_or(ReferenceError::Empty)?;
        let expected = first.dimensions();
        for (index, patch) in patches.iter().enumerate().skip(1) {
            if patch.dimensions() != expected {
                return Err(ReferenceError::DimensionMismatch {
                    index,
                    expected,
                    found: patch.dimensions(),
                });
            }
        }
        Ok(Self { patches })
    }

    /// Normalize raw ROI captures into a reference set.
    pub fn from_frames<I>(normalizer: &ContrastNormalizer, frames: I) -> Result<Self, ReferenceError>
    where
        I: IntoIterator<Item = Frame>,
    {
        Self::new(frames.into_iter().map(|f| normalizer.normalize(f)).collect())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.patches[0].dimensions()
    }
}

impl ReferenceSource for ReferenceSet {
    fn len(&self) -> usize {
        self.patches.len()
    }

    fn reference(&self, index: usize) -> Result<IntensityImage, ReferenceError> {
        self.patches
            .get(index)
            .cloned()
            .ok_or(ReferenceError::IndexOutOfRange {
                index,
                count: self.patches.len(),
            })
    }
}

/// Reference images kept on disk as `ref_{i}.png`, one per index.
///
/// Files hold the raw ROI crop as captured; patches are normalized on load.
pub struct ReferenceStore {
    dir: PathBuf,
    count: usize,
    normalizer: ContrastNormalizer,
}

impl ReferenceStore {
    pub fn new(dir: impl Into<PathBuf>, count: usize, normalizer: ContrastNormalizer) -> Self {
        Self {
            dir: dir.into(),
            count,
            normalizer,
        }
    }

    pub fn from_config(config: &ReferenceConfig, normalizer: ContrastNormalizer) -> Self {
        Self::new(config.dir.clone(), config.count, normalizer)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(reference_file_name(index))
    }

    /// Write the raw ROI crop for slot `index`, replacing any previous file.
    pub fn save(&self, index: usize, frame: &Frame) -> Result<PathBuf, ReferenceError> {
        self.check_index(index)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ReferenceError::CreateDir(self.dir.display().to_string(), e))?;

        let path = self.path_for(index);
        frame
            .clone()
            .into_dynamic()
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| ReferenceError::Write {
                path: path.display().to_string(),
                source,
            })?;

        debug!(index, path = %path.display(), "reference saved");
        Ok(path)
    }

    /// Delete every slot file so the next calibration starts from an empty
    /// set. Slots that are already absent are fine.
    pub fn clear(&self) -> Result<(), ReferenceError> {
        for index in 0..self.count {
            let path = self.path_for(index);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(index, path = %path.display(), "reference removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ReferenceError::Remove {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Load the raw crop stored for slot `index`.
    pub fn load_raw(&self, index: usize) -> Result<Frame, ReferenceError> {
        self.check_index(index)?;
        let path = self.path_for(index);
        let img = image::open(&path).map_err(|source| ReferenceError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Frame::from(img))
    }

    /// Indices whose file is absent.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.count)
            .filter(|&i| !self.path_for(i).is_file())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn ensure_complete(&self) -> Result<(), ReferenceError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ReferenceError::Incomplete { missing })
        }
    }

    /// Load and normalize every slot. Any absent or unreadable file fails the
    /// whole set: a reference set is never partially valid.
    pub fn to_reference_set(&self) -> Result<ReferenceSet, ReferenceError> {
        self.ensure_complete()?;
        let patches = (0..self.count)
            .map(|i| self.reference(i))
            .collect::<Result<Vec<_>, _>>()?;
        let set = ReferenceSet::new(patches)?;
        info!(
            dir = %self.dir.display(),
            count = self.count,
            width = set.dimensions().0,
            height = set.dimensions().1,
            "reference set loaded"
        );
        Ok(set)
    }

    fn check_index(&self, index: usize) -> Result<(), ReferenceError> {
        if index < self.count {
            Ok(())
        } else {
            Err(ReferenceError::IndexOutOfRange {
                index,
                count: self.count,
            })
        }
    }
}

impl ReferenceSource for ReferenceStore {
    fn len(&self) -> usize {
        self.count
    }

    fn reference(&self, index: usize) -> Result<IntensityImage, ReferenceError> {
        self.load_raw(index).map(|frame| self.normalizer.normalize(frame))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference index {index} out of range for a set of {count}")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("reference set is empty")]
    Empty,
    #[error("reference set is incomplete, missing {missing:?}")]
    Incomplete { missing: Vec<usize> },
    #[error("reference {index} is {found:?}, expected {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        found: (u32, u32),
    },
    #[error("failed to create reference directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to read reference {path}: {source}")]
    Read {
        path: String,
        source: image::ImageError,
    },
    #[error("failed to write reference {path}: {source}")]
    Write {
        path: String,
        source: image::ImageError,
    },
    #[error("failed to remove reference {path}: {source}")]
    Remove {
        path: String,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::Inspector;
    use crate::test_utils::{gradient_color, noise_image};
    use roi_inspect_common::frame::ComparisonResult;
    use tempfile::tempdir;

    fn store_in(dir: &Path, count: usize) -> ReferenceStore {
        ReferenceStore::new(dir, count, ContrastNormalizer::default())
    }

    #[test]
    fn file_names_are_zero_indexed() {
        assert_eq!(reference_file_name(0), "ref_0.png");
        assert_eq!(reference_file_name(12), "ref_12.png");
    }

    #[test]
    fn save_then_load_preserves_raw_pixels() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir.path().join("refs"), 2);
        let frame = Frame::Color(gradient_color(21, 13));

        let path = store.save(1, &frame).unwrap();
        assert!(path.ends_with("ref_1.png"));
        assert_eq!(store.load_raw(1).unwrap(), frame);
    }

    #[test]
    fn completeness_tracks_missing_slots() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 3);
        assert_eq!(store.missing(), vec![0, 1, 2]);

        let frame = Frame::Intensity(noise_image(8, 8, 3));
        store.save(0, &frame).unwrap();
        store.save(2, &frame).unwrap();
        assert_eq!(store.missing(), vec![1]);
        assert!(!store.is_complete());
        assert!(matches!(
            store.ensure_complete(),
            Err(ReferenceError::Incomplete { missing }) if missing == vec![1]
        ));
        assert!(store.to_reference_set().is_err());

        store.save(1, &frame).unwrap();
        assert!(store.is_complete());
        let set = store.to_reference_set().unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.dimensions(), (8, 8));
    }

    #[test]
    fn clear_removes_every_slot() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 3);
        store.clear().unwrap();

        let frame = Frame::Intensity(noise_image(6, 6, 5));
        for i in 0..3 {
            store.save(i, &frame).unwrap();
        }
        assert!(store.is_complete());

        store.clear().unwrap();
        assert_eq!(store.missing(), vec![0, 1, 2]);
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 2);
        let err = store
            .save(2, &Frame::Intensity(noise_image(4, 4, 1)))
            .unwrap_err();
        assert!(matches!(err, ReferenceError::IndexOutOfRange { index: 2, count: 2 }));
    }

    #[test]
    fn corrupt_file_is_skipped_during_evaluation() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 3);
        let live = Frame::Color(gradient_color(24, 24));
        for i in 0..3 {
            store.save(i, &live).unwrap();
        }
        std::fs::write(store.path_for(1), b"not a png").unwrap();

        assert!(store.is_complete());
        assert!(matches!(store.reference(1), Err(ReferenceError::Read { .. })));

        let result = Inspector::default().evaluate(live, &store);
        assert_eq!(result, ComparisonResult::unchanged());
    }

    #[test]
    fn set_rejects_mixed_sizes_and_empty_input() {
        let err = ReferenceSet::new(vec![noise_image(4, 4, 1), noise_image(5, 4, 2)]).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::DimensionMismatch { index: 1, expected: (4, 4), found: (5, 4) }
        ));
        assert!(matches!(ReferenceSet::new(Vec::new()), Err(ReferenceError::Empty)));
    }
}
