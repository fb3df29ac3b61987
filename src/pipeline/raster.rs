//! Float raster plane and the convolution primitives shared by the quality
//! metrics and the in-process filters.
//!
//! Borders use reflect-101 (`gfedcb|abcdefgh|gfedcba`), the usual default
//! for image convolution, so edge pixels are never treated as black.

use std::path::Path;

use image::{Rgb, RgbImage};

use super::ImageLoadError;

/// Single-channel f32 raster, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Read with reflect-101 border handling for out-of-range coordinates.
    #[inline]
    pub fn get_reflect(&self, x: isize, y: isize) -> f32 {
        self.get(reflect101(x, self.width), reflect101(y, self.height))
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq: f64 = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum();
        (sum_sq / self.data.len() as f64).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Element-wise `self - other`. Planes must share dimensions.
    pub fn difference(&self, other: &Plane) -> Plane {
        debug_assert_eq!((self.width, self.height), (other.width, other.height));
        Plane {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Horizontal pass with `kx`, then vertical pass with `ky`.
    /// Both kernels must have odd length.
    pub fn convolve_separable(&self, kx: &[f32], ky: &[f32]) -> Plane {
        if self.is_empty() {
            return self.clone();
        }
        let rx = (kx.len() / 2) as isize;
        let ry = (ky.len() / 2) as isize;

        let horizontal = Plane::from_fn(self.width, self.height, |x, y| {
            kx.iter()
                .enumerate()
                .map(|(i, k)| k * self.get_reflect(x as isize + i as isize - rx, y as isize))
                .sum()
        });

        Plane::from_fn(self.width, self.height, |x, y| {
            ky.iter()
                .enumerate()
                .map(|(i, k)| k * horizontal.get_reflect(x as isize, y as isize + i as isize - ry))
                .sum()
        })
    }

    /// Full 3x3 convolution.
    pub fn convolve3x3(&self, kernel: &[[f32; 3]; 3]) -> Plane {
        Plane::from_fn(self.width, self.height, |x, y| {
            let mut acc = 0.0f32;
            for (ky, row) in kernel.iter().enumerate() {
                for (kx, k) in row.iter().enumerate() {
                    if *k != 0.0 {
                        acc += k * self.get_reflect(
                            x as isize + kx as isize - 1,
                            y as isize + ky as isize - 1,
                        );
                    }
                }
            }
            acc
        })
    }

    /// Gaussian smoothing with a square `size` x `size` kernel.
    pub fn gaussian(&self, size: usize, sigma: f32) -> Plane {
        let kernel = gaussian_kernel(size, sigma);
        self.convolve_separable(&kernel, &kernel)
    }
}

/// Map an out-of-range index into `0..n` by reflect-101.
#[inline]
pub fn reflect101(i: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

/// Normalized 1-D Gaussian kernel of odd length `size`.
///
/// Non-positive `sigma` is derived from the size as
/// `0.3 * ((size - 1) * 0.5 - 1) + 0.8`.
pub fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let size = size.max(1) | 1;
    let sigma = if sigma > 0.0 {
        sigma as f64
    } else {
        0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let center = (size as f64 - 1.0) / 2.0;
    let scale = -0.5 / (sigma * sigma);

    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - center;
            (scale * x * x).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| (v / sum) as f32).collect()
}

/// Kernel size covering ±3σ for 8-bit images: `round(6σ + 1) | 1`.
pub fn kernel_size_for_sigma(sigma: f32) -> usize {
    ((sigma as f64 * 6.0 + 1.0).round() as usize).max(1) | 1
}

/// Round and clamp to the 8-bit pixel range.
#[inline]
pub fn saturate_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// ITU-R BT.601 luminance, rounded to integer levels like an 8-bit gray image.
pub fn luminance(img: &RgbImage) -> Plane {
    Plane::from_fn(img.width() as usize, img.height() as usize, |x, y| {
        let p = img.get_pixel(x as u32, y as u32);
        (0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32).round()
    })
}

/// Decode an image file as 8-bit RGB. Gray and alpha inputs are converted.
/// The format comes from the file's leading bytes, not its extension.
pub fn load_rgb_image(path: &Path) -> Result<RgbImage, ImageLoadError> {
    let load_error = |reason: String| ImageLoadError {
        path: path.to_path_buf(),
        reason,
    };
    let image = image::io::Reader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| load_error(e.to_string()))?
        .decode()
        .map_err(|e| load_error(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Split into R, G, B planes.
pub fn split_channels(img: &RgbImage) -> [Plane; 3] {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let channel = |c: usize| Plane::from_fn(w, h, |x, y| img.get_pixel(x as u32, y as u32).0[c] as f32);
    [channel(0), channel(1), channel(2)]
}

/// Merge R, G, B planes back into an 8-bit image, saturating each sample.
pub fn merge_channels(planes: &[Plane; 3]) -> RgbImage {
    let (w, h) = (planes[0].width(), planes[0].height());
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            saturate_u8(planes[0].get(x, y)),
            saturate_u8(planes[1].get(x, y)),
            saturate_u8(planes[2].get(x, y)),
        ])
    })
}
