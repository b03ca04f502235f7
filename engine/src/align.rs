use image::imageops::crop_imm;
use image::GrayImage;
use tracing::debug;

/// Best placement of a template inside a search area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchLocation {
    pub x: u32,
    pub y: u32,
    /// Zero-mean normalized correlation coefficient in [-1, 1].
    pub score: f64,
}

/// Slide `template` over every valid offset of `search` and return the offset
/// with the highest normalized correlation coefficient.
///
/// Ties go to the first offset in row-major order. A template with no variance
/// matches everywhere equally (score 1.0), so it lands on (0, 0); a window with
/// no variance scores 0.0.
///
/// Returns `None` when either image is empty or the search area is smaller
/// than the template on either axis.
pub fn locate(template: &GrayImage, search: &GrayImage) -> Option<MatchLocation> {
    let (tw, th) = template.dimensions();
    let (sw, sh) = search.dimensions();
    if tw == 0 || th == 0 || sw < tw || sh < th {
        return None;
    }

    let n = (tw as u64 * th as u64) as f64;
    let t_mean = template.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n;
    let t_dev: Vec<f64> = template.as_raw().iter().map(|&p| p as f64 - t_mean).collect();
    let t_norm = t_dev.iter().map(|d| d * d).sum::<f64>().sqrt();
    if t_norm < f64::EPSILON {
        return Some(MatchLocation {
            x: 0,
            y: 0,
            score: 1.0,
        });
    }

    let tables = IntegralTables::new(search);
    let pixels = search.as_raw();
    let (tw, th, sw) = (tw as usize, th as usize, sw as usize);

    let mut best: Option<MatchLocation> = None;
    for y in 0..=(sh as usize - th) {
        for x in 0..=(sw - tw) {
            let (sum, sum_sq) = tables.window(x, y, tw, th);
            let variance = sum_sq as f64 - (sum as f64 * sum as f64) / n;

            let score = if variance <= 1e-9 {
                0.0
            } else {
                // The template deviations sum to zero, so the window mean drops out.
                let mut numerator = 0.0;
                for ty in 0..th {
                    let row = &pixels[(y + ty) * sw + x..(y + ty) * sw + x + tw];
                    let t_row = &t_dev[ty * tw..(ty + 1) * tw];
                    for (&p, &t) in row.iter().zip(t_row) {
                        numerator += t * p as f64;
                    }
                }
                (numerator / (variance.sqrt() * t_norm)).clamp(-1.0, 1.0)
            };

            if best.map_or(true, |b| score > b.score) {
                best = Some(MatchLocation {
                    x: x as u32,
                    y: y as u32,
                    score,
                });
            }
        }
    }
    best
}

/// Crop the region of `search` that best matches `template`.
///
/// Never fails. When no match can be computed (empty inputs, or a search area
/// smaller than the template) the result degrades to the top-left crop of
/// `search` at the template's size, clamped to the search area. Callers must
/// expect an unaligned, possibly smaller, patch in that case.
pub fn align(template: &GrayImage, search: &GrayImage) -> GrayImage {
    let (tw, th) = template.dimensions();

    if let Some(location) = locate(template, search) {
        let aligned = crop_imm(search, location.x, location.y, tw, th).to_image();
        if aligned.dimensions() == (tw, th) {
            debug!(
                x = location.x,
                y = location.y,
                score = format!("{:.4}", location.score),
                "template aligned"
            );
            return aligned;
        }
    }

    debug!(
        template_w = tw,
        template_h = th,
        search_w = search.width(),
        search_h = search.height(),
        "alignment unavailable, using top-left crop"
    );
    crop_imm(search, 0, 0, tw.min(search.width()), th.min(search.height())).to_image()
}

/// Summed-area tables of pixel values and squared values.
struct IntegralTables {
    stride: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl IntegralTables {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        let pixels = img.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = pixels[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (u64, u64) {
        let s = self.stride;
        let at = |table: &[u64], xx: usize, yy: usize| table[yy * s + xx];
        let total = |table: &[u64]| {
            at(table, x + w, y + h) + at(table, x, y) - at(table, x, y + h) - at(table, x + w, y)
        };
        (total(&self.sum), total(&self.sum_sq))
    }
}
