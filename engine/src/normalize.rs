use image::{GrayImage, Luma, RgbImage};
use roi_inspect_common::config::NormalizerConfig;
use roi_inspect_common::frame::{Frame, IntensityImage};

const NUM_BINS: usize = 256;

/// Contrast-limited adaptive histogram equalization over a fixed tile grid.
///
/// Maps any [`Frame`] to a single-channel image whose local contrast has been
/// equalized, so that slow lighting drift between calibration and test does
/// not register as change.
///
/// - The image is split into `tiles_x` x `tiles_y` tiles (padded by
///   reflect-101 when the size is not a multiple of the grid).
/// - Each tile gets its own 256-bin histogram, clipped at
///   `clip_limit * tile_area / 256` counts with the excess spread evenly.
/// - Output pixels are blended bilinearly from the four nearest tile LUTs.
///
/// A tile whose pixels all share one value maps through the identity, so flat
/// input comes back unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContrastNormalizer {
    tiles_x: u32,
    tiles_y: u32,
    clip_limit: f64,
}

impl ContrastNormalizer {
    pub fn new(tiles_x: u32, tiles_y: u32, clip_limit: f64) -> Self {
        Self {
            tiles_x: tiles_x.max(1),
            tiles_y: tiles_y.max(1),
            clip_limit,
        }
    }

    pub fn from_config(config: &NormalizerConfig) -> Self {
        Self::new(config.tiles_x, config.tiles_y, config.clip_limit)
    }

    pub fn normalize(&self, frame: Frame) -> IntensityImage {
        let gray = match frame {
            Frame::Color(rgb) => to_intensity(&rgb),
            Frame::Intensity(gray) => gray,
        };
        self.equalize(&gray)
    }

    /// Run the tile equalization on an image that is already single-channel.
    pub fn equalize(&self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return gray.clone();
        }

        let tile_w = width.div_ceil(self.tiles_x);
        let tile_h = height.div_ceil(self.tiles_y);
        let luts = self.tile_luts(gray, tile_w, tile_h);

        let tiles_x = self.tiles_x as usize;
        let tiles_y = self.tiles_y as usize;
        let lut_at = |tx: usize, ty: usize| &luts[ty * tiles_x + tx];
        let inv_tw = 1.0 / tile_w as f32;
        let inv_th = 1.0 / tile_h as f32;

        let mut out = GrayImage::new(width, height);
        for y in 0..height {
            let tyf = y as f32 * inv_th - 0.5;
            let ty_floor = tyf.floor();
            let ya = tyf - ty_floor;
            let ty1 = (ty_floor as i64).max(0) as usize;
            let ty2 = ((ty_floor as i64 + 1).max(0) as usize).min(tiles_y - 1);

            for x in 0..width {
                let txf = x as f32 * inv_tw - 0.5;
                let tx_floor = txf.floor();
                let xa = txf - tx_floor;
                let tx1 = (tx_floor as i64).max(0) as usize;
                let tx2 = ((tx_floor as i64 + 1).max(0) as usize).min(tiles_x - 1);

                let v = gray.get_pixel(x, y)[0] as usize;
                let top = lut_at(tx1, ty1)[v] as f32 * (1.0 - xa) + lut_at(tx2, ty1)[v] as f32 * xa;
                let bottom =
                    lut_at(tx1, ty2)[v] as f32 * (1.0 - xa) + lut_at(tx2, ty2)[v] as f32 * xa;
                let blended = top * (1.0 - ya) + bottom * ya;
                out.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }

    fn tile_luts(&self, gray: &GrayImage, tile_w: u32, tile_h: u32) -> Vec<[u8; NUM_BINS]> {
        let (width, height) = gray.dimensions();
        let tile_area = tile_w * tile_h;
        let clip = if self.clip_limit > 0.0 {
            Some(((self.clip_limit * tile_area as f64 / NUM_BINS as f64) as u32).max(1))
        } else {
            None
        };

        let mut luts = Vec::with_capacity((self.tiles_x * self.tiles_y) as usize);
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let mut hist = [0u32; NUM_BINS];
                for dy in 0..tile_h {
                    let y = reflect_101(ty * tile_h + dy, height);
                    for dx in 0..tile_w {
                        let x = reflect_101(tx * tile_w + dx, width);
                        hist[gray.get_pixel(x, y)[0] as usize] += 1;
                    }
                }
                luts.push(tile_lut(hist, clip, tile_area));
            }
        }
        luts
    }
}

impl Default for ContrastNormalizer {
    fn default() -> Self {
        Self::from_config(&NormalizerConfig::default())
    }
}

/// Rec. 601 luma in 14-bit fixed point.
pub fn to_intensity(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Luma([luma(r, g, b)])
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14) as u8
}

fn tile_lut(mut hist: [u32; NUM_BINS], clip: Option<u32>, tile_area: u32) -> [u8; NUM_BINS] {
    let mut lut = [0u8; NUM_BINS];

    if hist.iter().filter(|&&count| count > 0).count() <= 1 {
        for (i, entry) in lut.iter_mut().enumerate() {
            *entry = i as u8;
        }
        return lut;
    }

    if let Some(clip) = clip {
        let mut excess = 0u32;
        for count in hist.iter_mut() {
            if *count > clip {
                excess += *count - clip;
                *count = clip;
            }
        }

        let batch = excess / NUM_BINS as u32;
        let mut residual = excess - batch * NUM_BINS as u32;
        for count in hist.iter_mut() {
            *count += batch;
        }
        if residual > 0 {
            let step = (NUM_BINS / residual as usize).max(1);
            let mut i = 0;
            while i < NUM_BINS && residual > 0 {
                hist[i] += 1;
                i += step;
                residual -= 1;
            }
        }
    }

    let scale = 255.0 / tile_area as f32;
    let mut cumulative = 0u32;
    for (entry, &count) in lut.iter_mut().zip(hist.iter()) {
        cumulative += count;
        *entry = (cumulative as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Mirror an out-of-range coordinate back into `[0, n)` without repeating the edge pixel.
fn reflect_101(i: u32, n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i % period;
    if m < n {
        m
    } else {
        period - m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{gradient_color, noise_image, solid_gray};
    use image::Rgb;

    fn range(img: &GrayImage) -> (u8, u8) {
        let min = img.pixels().map(|p| p[0]).min().unwrap();
        let max = img.pixels().map(|p| p[0]).max().unwrap();
        (min, max)
    }

    #[test]
    fn luma_matches_rec601_weights() {
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 29);
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
    }

    #[test]
    fn color_frame_becomes_single_channel() {
        let normalizer = ContrastNormalizer::default();
        let out = normalizer.normalize(Frame::Color(gradient_color(64, 48)));
        assert_eq!(out.dimensions(), (64, 48));
    }

    #[test]
    fn repeated_normalization_keeps_dimensions() {
        let normalizer = ContrastNormalizer::default();
        let once = normalizer.normalize(Frame::Intensity(noise_image(37, 23, 5)));
        let twice = normalizer.normalize(Frame::Intensity(once.clone()));
        assert_eq!(once.dimensions(), (37, 23));
        assert_eq!(twice.dimensions(), (37, 23));
    }

    #[test]
    fn deterministic_for_identical_input() {
        let normalizer = ContrastNormalizer::default();
        let a = normalizer.normalize(Frame::Color(gradient_color(40, 40)));
        let b = normalizer.normalize(Frame::Color(gradient_color(40, 40)));
        assert_eq!(a, b);
    }

    #[test]
    fn flat_input_is_left_unchanged() {
        let normalizer = ContrastNormalizer::default();
        let flat = solid_gray(50, 50, 128);
        let out = normalizer.normalize(Frame::Intensity(flat.clone()));
        assert_eq!(out, flat);

        let black = solid_gray(17, 9, 0);
        assert_eq!(normalizer.equalize(&black), black);
    }

    #[test]
    fn low_contrast_input_is_stretched() {
        // Values confined to [100, 131]: equalization must widen the spread.
        let narrow = GrayImage::from_fn(64, 64, |x, y| Luma([100 + ((x + y) % 32) as u8]));
        let out = ContrastNormalizer::default().equalize(&narrow);
        let (in_min, in_max) = range(&narrow);
        let (out_min, out_max) = range(&out);
        assert!(
            out_max - out_min > in_max - in_min,
            "expected wider range, got {out_min}..{out_max}"
        );
    }

    #[test]
    fn tiny_and_empty_images_do_not_panic() {
        let normalizer = ContrastNormalizer::default();
        let tiny = Frame::Color(RgbImage::from_pixel(3, 2, Rgb([10, 200, 30])));
        assert_eq!(normalizer.normalize(tiny).dimensions(), (3, 2));
        let empty = Frame::Intensity(GrayImage::new(0, 0));
        assert_eq!(normalizer.normalize(empty).dimensions(), (0, 0));
    }

    #[test]
    fn disabled_clip_still_produces_valid_output() {
        let normalizer = ContrastNormalizer::new(4, 4, 0.0);
        let out = normalizer.equalize(&noise_image(32, 32, 9));
        assert_eq!(out.dimensions(), (32, 32));
    }

    #[test]
    fn reflect_101_mirrors_without_edge_repeat() {
        assert_eq!(reflect_101(0, 5), 0);
        assert_eq!(reflect_101(4, 5), 4);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(7, 5), 1);
        assert_eq!(reflect_101(8, 5), 0);
        assert_eq!(reflect_101(3, 1), 0);
    }
}
