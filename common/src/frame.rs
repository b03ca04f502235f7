use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Single-channel 8-bit intensity image, the currency of the comparison engine.
pub type IntensityImage = GrayImage;

/// A captured picture, tagged with its channel layout.
///
/// Color frames hold R,G,B samples in that order. Every transformation in the
/// engine yields a new `Frame`; nothing mutates one in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Color(RgbImage),
    Intensity(GrayImage),
}

impl Frame {
    pub fn width(&self) -> u32 {
        match self {
            Frame::Color(img) => img.width(),
            Frame::Intensity(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Frame::Color(img) => img.height(),
            Frame::Intensity(img) => img.height(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn is_color(&self) -> bool {
        matches!(self, Frame::Color(_))
    }

    /// Cut `region` out of the frame as a new, owned frame.
    ///
    /// The region must be non-empty and lie entirely inside the frame.
    pub fn crop(&self, region: &Region) -> Result<Frame, FrameError> {
        region.validate(self.width(), self.height())?;
        let Region {
            x,
            y,
            width,
            height,
        } = *region;
        Ok(match self {
            Frame::Color(img) => {
                Frame::Color(image::imageops::crop_imm(img, x, y, width, height).to_image())
            }
            Frame::Intensity(img) => {
                Frame::Intensity(image::imageops::crop_imm(img, x, y, width, height).to_image())
            }
        })
    }

    pub fn into_dynamic(self) -> DynamicImage {
        match self {
            Frame::Color(img) => DynamicImage::ImageRgb8(img),
            Frame::Intensity(img) => DynamicImage::ImageLuma8(img),
        }
    }
}

impl From<DynamicImage> for Frame {
    /// Grayscale sources stay single-channel; everything else becomes 8-bit RGB.
    fn from(img: DynamicImage) -> Self {
        match img {
            DynamicImage::ImageLuma8(gray) => Frame::Intensity(gray),
            DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA8(_) => {
                Frame::Intensity(img.to_luma8())
            }
            other => Frame::Color(other.to_rgb8()),
        }
    }
}

/// A rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a region from the two corners of a drag gesture, in any order.
    pub fn from_corners(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            x: start.0.min(end.0),
            y: start.1.min(end.1),
            width: start.0.abs_diff(end.0),
            height: start.1.abs_diff(end.1),
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Check the region is non-empty and fits inside a `frame_width` x `frame_height` frame.
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyRegion {
                width: self.width,
                height: self.height,
            });
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        if right > frame_width as u64 || bottom > frame_height as u64 {
            return Err(FrameError::RegionOutOfBounds {
                region: *self,
                frame_width,
                frame_height,
            });
        }
        Ok(())
    }
}

/// Outcome of comparing a live patch against one or more references.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub changed: bool,
    /// Fraction of compared pixels whose difference exceeded the pixel threshold, in [0, 1].
    pub severity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl ComparisonResult {
    pub fn unchanged() -> Self {
        Self {
            changed: false,
            severity: 0.0,
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.changed {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }

    /// Operator-facing one-liner, e.g. `FAIL (Diff=4.00%)`.
    pub fn summary(&self) -> String {
        let label = match self.verdict() {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        };
        format!("{label} (Diff={:.2}%)", self.severity * 100.0)
    }
}

impl Default for ComparisonResult {
    fn default() -> Self {
        Self::unchanged()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("region has zero area: {width}x{height}")]
    EmptyRegion { width: u32, height: u32 },
    #[error("region {region:?} exceeds frame bounds {frame_width}x{frame_height}")]
    RegionOutOfBounds {
        region: Region,
        frame_width: u32,
        frame_height: u32,
    },
}
