use image::{GrayImage, Luma, Rgb, RgbImage};

/// Deterministic xorshift noise so test images are reproducible across runs.
pub fn noise_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut state = seed.max(1);
    GrayImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        Luma([(state >> 24) as u8])
    })
}

pub fn solid_gray(width: u32, height: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([value]))
}

/// Paint a filled square of `value` into `img` with its top-left corner at (x, y).
pub fn paint_square(img: &mut GrayImage, x: u32, y: u32, size: u32, value: u8) {
    for dy in 0..size {
        for dx in 0..size {
            img.put_pixel(x + dx, y + dy, Luma([value]));
        }
    }
}

/// Smooth color gradient; handy as a live ROI with real structure.
pub fn gradient_color(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) * 127 / (width + height).max(1)) as u8,
        ])
    })
}
