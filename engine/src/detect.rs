use image::{GrayImage, Luma};
use roi_inspect_common::config::DetectorConfig;
use roi_inspect_common::frame::ComparisonResult;

const MASK_ON: u8 = 255;

/// Per-pixel difference detector.
///
/// A pixel counts as changed when its absolute intensity difference is
/// strictly greater than `pixel_threshold`. The pair counts as changed when
/// the fraction of changed pixels is strictly greater than `ratio_threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeDetector {
    pixel_threshold: u8,
    ratio_threshold: f64,
}

impl ChangeDetector {
    pub fn new(pixel_threshold: u8, ratio_threshold: f64) -> Self {
        Self {
            pixel_threshold,
            ratio_threshold,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.pixel_threshold, config.ratio_threshold)
    }

    /// Binary change mask over the common top-left crop of both images
    /// (255 = changed, 0 = unchanged).
    pub fn change_mask(&self, reference: &GrayImage, live: &GrayImage) -> GrayImage {
        let (width, height) = common_extent(reference, live);
        GrayImage::from_fn(width, height, |x, y| {
            let changed = self.pixel_changed(reference.get_pixel(x, y)[0], live.get_pixel(x, y)[0]);
            Luma([if changed { MASK_ON } else { 0 }])
        })
    }

    /// Compare `live` against `reference`.
    ///
    /// Differently sized inputs are both cropped from the top-left to their
    /// common extent first. If that extent is empty the result is
    /// "unchanged, severity 0".
    pub fn detect(&self, reference: &GrayImage, live: &GrayImage) -> ComparisonResult {
        let (width, height) = common_extent(reference, live);
        if width == 0 || height == 0 {
            return ComparisonResult::unchanged();
        }

        let mut changed_pixels = 0u64;
        for y in 0..height {
            for x in 0..width {
                if self.pixel_changed(reference.get_pixel(x, y)[0], live.get_pixel(x, y)[0]) {
                    changed_pixels += 1;
                }
            }
        }

        let total = width as u64 * height as u64;
        let severity = changed_pixels as f64 / total as f64;
        ComparisonResult {
            changed: severity > self.ratio_threshold,
            severity,
        }
    }

    fn pixel_changed(&self, a: u8, b: u8) -> bool {
        a.abs_diff(b) > self.pixel_threshold
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

fn common_extent(a: &GrayImage, b: &GrayImage) -> (u32, u32) {
    (a.width().min(b.width()), a.height().min(b.height()))
}
