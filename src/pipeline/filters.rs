//! In-process corrective filters, used when the native executable is
//! unavailable or fails.
//!
//! Parameters are fixed so fallback output is reproducible run to run.
//! Every filter consumes its input buffer and returns one of identical
//! dimensions.

use image::{Rgb, RgbImage};

use super::raster::{
    gaussian_kernel, kernel_size_for_sigma, merge_channels, reflect101, saturate_u8,
    split_channels, Plane,
};
use super::types::FilterKind;

/// `blur` (and anything unrecognized): 5x5 Gaussian.
pub const BLUR_KERNEL_SIZE: usize = 5;
pub const BLUR_SIGMA: f32 = 1.0;

/// `sharpen`: unsharp mask `1.5 * original - 0.5 * blurred`.
pub const UNSHARP_SIGMA: f32 = 1.0;
pub const UNSHARP_ORIGINAL_WEIGHT: f32 = 1.5;
pub const UNSHARP_BLURRED_WEIGHT: f32 = -0.5;

/// `denoise`: bilateral filter.
pub const BILATERAL_DIAMETER: usize = 9;
pub const BILATERAL_SIGMA_COLOR: f32 = 75.0;
pub const BILATERAL_SIGMA_SPACE: f32 = 75.0;

/// `clahe`: applied to L* only.
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;
pub const CLAHE_TILE_GRID: usize = 8;

/// Run the fallback implementation of `kind`.
///
/// `Auto` sharpens; `Edge` has no in-process counterpart and blurs.
pub fn apply_filter(image: RgbImage, kind: FilterKind) -> RgbImage {
    match kind {
        FilterKind::Sharpen | FilterKind::Auto => unsharp_mask(&image, UNSHARP_SIGMA),
        FilterKind::Denoise => bilateral_filter(
            &image,
            BILATERAL_DIAMETER,
            BILATERAL_SIGMA_COLOR,
            BILATERAL_SIGMA_SPACE,
        ),
        FilterKind::Clahe => clahe_luminance(&image, CLAHE_CLIP_LIMIT, CLAHE_TILE_GRID),
        FilterKind::Blur | FilterKind::Edge => gaussian_blur(&image, BLUR_KERNEL_SIZE, BLUR_SIGMA),
    }
}

// ── Gaussian / unsharp ────────────────────────────────────

pub fn gaussian_blur(image: &RgbImage, size: usize, sigma: f32) -> RgbImage {
    let [r, g, b] = split_channels(image);
    merge_channels(&[r.gaussian(size, sigma), g.gaussian(size, sigma), b.gaussian(size, sigma)])
}

/// Sharpen by subtracting a Gaussian-blurred copy from a scaled original.
/// Kernel size is derived from `sigma`. Results saturate to 0-255.
pub fn unsharp_mask(image: &RgbImage, sigma: f32) -> RgbImage {
    let size = kernel_size_for_sigma(sigma);
    let planes = split_channels(image);
    let sharpened = planes.map(|p| {
        let blurred = p.gaussian(size, sigma);
        Plane::from_fn(p.width(), p.height(), |x, y| {
            UNSHARP_ORIGINAL_WEIGHT * p.get(x, y) + UNSHARP_BLURRED_WEIGHT * blurred.get(x, y)
        })
    });
    merge_channels(&sharpened)
}

// ── Bilateral ─────────────────────────────────────────────

/// Edge-preserving smoothing. Neighbours inside a disc of `diameter` are
/// weighted by spatial distance and by the L1 colour distance to the centre.
pub fn bilateral_filter(
    image: &RgbImage,
    diameter: usize,
    sigma_color: f32,
    sigma_space: f32,
) -> RgbImage {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }
    let radius = (diameter / 2).max(1) as isize;
    let space_coeff = -0.5 / (sigma_space as f64 * sigma_space as f64);
    let color_coeff = -0.5 / (sigma_color as f64 * sigma_color as f64);

    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f64;
            if r2 <= (radius * radius) as f64 {
                offsets.push((dx, dy, (r2 * space_coeff).exp() as f32));
            }
        }
    }

    // Indexed by |dr| + |dg| + |db|.
    let color_weights: Vec<f32> = (0..=255 * 3)
        .map(|d| ((d * d) as f64 * color_coeff).exp() as f32)
        .collect();

    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let center = image.get_pixel(x, y).0;
        let mut sum = [0.0f32; 3];
        let mut weight_sum = 0.0f32;

        for &(dx, dy, space_w) in &offsets {
            let nx = reflect101(x as isize + dx, w) as u32;
            let ny = reflect101(y as isize + dy, h) as u32;
            let n = image.get_pixel(nx, ny).0;
            let dist = (0..3)
                .map(|c| (n[c] as i32 - center[c] as i32).unsigned_abs() as usize)
                .sum::<usize>();
            let weight = space_w * color_weights[dist];
            for c in 0..3 {
                sum[c] += n[c] as f32 * weight;
            }
            weight_sum += weight;
        }

        if weight_sum > 0.0 {
            Rgb([
                saturate_u8(sum[0] / weight_sum),
                saturate_u8(sum[1] / weight_sum),
                saturate_u8(sum[2] / weight_sum),
            ])
        } else {
            Rgb(center)
        }
    })
}

// ── CLAHE ─────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalization on the L* channel of
/// CIE L*a*b*. Chrominance is carried through unquantized.
pub fn clahe_luminance(image: &RgbImage, clip_limit: f32, grid: usize) -> RgbImage {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }

    let mut lightness = Plane::new(w, h);
    let mut chroma = Vec::with_capacity(w * h);
    for (x, y, p) in image.enumerate_pixels() {
        let [l, a, b] = rgb_to_lab8(p.0);
        lightness.set(x as usize, y as usize, l);
        chroma.push((a, b));
    }

    let equalized = clahe(&lightness, clip_limit, grid);

    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let (a, b) = chroma[y * w + x];
        Rgb(lab8_to_rgb([equalized.get(x, y), a, b]))
    })
}

/// CLAHE over an 8-bit-valued plane with a `grid` x `grid` tile layout.
///
/// Tiles that run past the image edge read reflect-101 padding. Output is
/// bilinearly interpolated between the four nearest tile LUTs.
pub fn clahe(plane: &Plane, clip_limit: f32, grid: usize) -> Plane {
    let (w, h) = (plane.width(), plane.height());
    let grid = grid.max(1);
    let tile_w = w.div_ceil(grid);
    let tile_h = h.div_ceil(grid);
    let tile_area = (tile_w * tile_h) as f32;
    let clip = ((clip_limit * tile_area / 256.0) as usize).max(1);
    let lut_scale = 255.0 / tile_area;

    let mut luts = vec![[0u8; 256]; grid * grid];
    for ty in 0..grid {
        for tx in 0..grid {
            let mut hist = [0usize; 256];
            for yy in 0..tile_h {
                for xx in 0..tile_w {
                    let v = plane.get_reflect((tx * tile_w + xx) as isize, (ty * tile_h + yy) as isize);
                    hist[saturate_u8(v) as usize] += 1;
                }
            }
            clip_histogram(&mut hist, clip);

            let lut = &mut luts[ty * grid + tx];
            let mut cumulative = 0usize;
            for (bin, count) in hist.iter().enumerate() {
                cumulative += count;
                lut[bin] = saturate_u8(cumulative as f32 * lut_scale);
            }
        }
    }

    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;
    let last = grid as isize - 1;

    Plane::from_fn(w, h, |x, y| {
        let v = saturate_u8(plane.get(x, y)) as usize;

        let txf = x as f32 * inv_tw - 0.5;
        let tx1 = txf.floor() as isize;
        let xa = txf - tx1 as f32;
        let (tx1, tx2) = (tx1.clamp(0, last) as usize, (tx1 + 1).clamp(0, last) as usize);

        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor() as isize;
        let ya = tyf - ty1 as f32;
        let (ty1, ty2) = (ty1.clamp(0, last) as usize, (ty1 + 1).clamp(0, last) as usize);

        let at = |ty: usize, tx: usize| luts[ty * grid + tx][v] as f32;
        let top = at(ty1, tx1) * (1.0 - xa) + at(ty1, tx2) * xa;
        let bottom = at(ty2, tx1) * (1.0 - xa) + at(ty2, tx2) * xa;
        saturate_u8(top * (1.0 - ya) + bottom * ya) as f32
    })
}

/// Clip every bin at `limit` and spread the excess evenly across all bins.
fn clip_histogram(hist: &mut [usize; 256], limit: usize) {
    let mut excess = 0usize;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }
    if excess == 0 {
        return;
    }

    let per_bin = excess / 256;
    let residual = excess - per_bin * 256;
    for count in hist.iter_mut() {
        *count += per_bin;
    }
    if residual > 0 {
        let step = (256 / residual).max(1);
        for count in hist.iter_mut().step_by(step).take(residual) {
            *count += 1;
        }
    }
}

// ── sRGB <-> CIE L*a*b* (8-bit scaling: L*255/100, a+128, b+128) ──

const XN: f64 = 0.950456;
const ZN: f64 = 1.088754;
const LAB_EPSILON: f64 = 0.008856;

fn srgb_to_linear(v: u8) -> f64 {
    let c = v as f64 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f64) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let v = if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    saturate_u8((v * 255.0) as f32)
}

fn lab_f(t: f64) -> f64 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(f: f64) -> f64 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        (f - 16.0 / 116.0) / 7.787
    }
}

fn rgb_to_lab8(rgb: [u8; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(srgb_to_linear);
    let x = (0.412453 * r + 0.357580 * g + 0.180423 * b) / XN;
    let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
    let z = (0.019334 * r + 0.119193 * g + 0.950227 * b) / ZN;

    let l = if y > LAB_EPSILON {
        116.0 * y.cbrt() - 16.0
    } else {
        903.3 * y
    };
    let (fx, fy, fz) = (lab_f(x), lab_f(y), lab_f(z));
    [
        (l * 255.0 / 100.0) as f32,
        (500.0 * (fx - fy) + 128.0) as f32,
        (200.0 * (fy - fz) + 128.0) as f32,
    ]
}

fn lab8_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let l = lab[0] as f64 * 100.0 / 255.0;
    let a = lab[1] as f64 - 128.0;
    let b = lab[2] as f64 - 128.0;

    let fy = (l + 16.0) / 116.0;
    let y = if l > 903.3 * LAB_EPSILON {
        fy * fy * fy
    } else {
        l / 903.3
    };
    let x = XN * lab_f_inv(fy + a / 500.0);
    let z = ZN * lab_f_inv(fy - b / 200.0);

    let r = 3.240479 * x - 1.537150 * y - 0.498535 * z;
    let g = -0.969256 * x + 1.875991 * y + 0.041556 * z;
    let bl = 0.055648 * x - 0.204043 * y + 1.057311 * z;
    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(bl)]
}
