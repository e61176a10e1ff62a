//! Hypercube data product.
//!
//! A `height x width x steps` grid of grayscale samples. Storage is laid out
//! `[row][col][step]` so a pixel's spectrum is one contiguous slice. Every plane
//! starts at zero and is only overwritten by a successful capture of matching
//! dimensions; `is_populated` tells a written plane from an untouched one.

use crate::hardware::ImagePlane;

/// Three-channel composite, row-major, each channel in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbComposite {
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// `[r, g, b]` per pixel
    pub pixels: Vec<[f64; 3]>,
}

/// Wavelength-resolved image stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypercube {
    height: usize,
    width: usize,
    steps: usize,
    samples: Vec<u16>,
    populated: Vec<bool>,
}

impl Hypercube {
    /// Zero-initialised cube
    pub fn new(height: usize, width: usize, steps: usize) -> Self {
        Self {
            height,
            width,
            steps,
            samples: vec![0; height * width * steps],
            populated: vec![false; steps],
        }
    }

    /// `0 x 0 x steps`, for runs where no capture ever succeeded
    pub fn empty(steps: usize) -> Self {
        Self::new(0, 0, steps)
    }

    /// `(height, width, steps)`
    pub fn dimensions(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.steps)
    }

    /// Whether `plane` fits this cube's spatial dimensions
    pub fn accepts(&self, plane: &ImagePlane) -> bool {
        plane.dimensions() == (self.height, self.width)
    }

    /// Write `plane` at step `index`.
    ///
    /// Returns false, leaving the cube untouched, when the index is out of range or
    /// the plane's dimensions differ from the cube's.
    pub fn write_plane(&mut self, index: usize, plane: &ImagePlane) -> bool {
        if index >= self.steps || !self.accepts(plane) {
            return false;
        }
        for (pixel, &value) in plane.pixels().iter().enumerate() {
            self.samples[pixel * self.steps + index] = value;
        }
        self.populated[index] = true;
        true
    }

    /// Whether step `index` holds a captured plane
    pub fn is_populated(&self, index: usize) -> bool {
        self.populated.get(index).copied().unwrap_or(false)
    }

    /// Number of populated planes
    pub fn populated_count(&self) -> usize {
        self.populated.iter().filter(|p| **p).count()
    }

    /// Copy of the plane at step `index`
    pub fn plane(&self, index: usize) -> Option<ImagePlane> {
        if index >= self.steps {
            return None;
        }
        let pixels = (0..self.height * self.width)
            .map(|pixel| self.samples[pixel * self.steps + index])
            .collect();
        ImagePlane::new(self.height, self.width, pixels)
    }

    /// All samples of one pixel, in sweep order
    pub fn pixel_spectrum(&self, row: usize, col: usize) -> Option<&[u16]> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let start = (row * self.width + col) * self.steps;
        Some(&self.samples[start..start + self.steps])
    }

    /// One sample
    pub fn sample(&self, row: usize, col: usize, index: usize) -> Option<u16> {
        self.pixel_spectrum(row, col)
            .and_then(|spectrum| spectrum.get(index).copied())
    }

    /// Raw `[row][col][step]` samples
    pub fn as_slice(&self) -> &[u16] {
        &self.samples
    }

    /// False-colour composite: R = last plane, G = plane `steps / 2`, B = first
    /// plane, all divided by the cube's global maximum. An all-zero cube yields
    /// zeros.
    pub fn rgb_composite(&self) -> RgbComposite {
        let pixel_count = self.height * self.width;
        if self.steps == 0 {
            return RgbComposite {
                height: self.height,
                width: self.width,
                pixels: vec![[0.0; 3]; pixel_count],
            };
        }

        let max = f64::from(self.samples.iter().copied().max().unwrap_or(0));
        let scaled = |value: u16| if max == 0.0 { 0.0 } else { f64::from(value) / max };
        let (r, g, b) = (self.steps - 1, self.steps / 2, 0);

        let pixels = (0..pixel_count)
            .map(|pixel| {
                let base = pixel * self.steps;
                [
                    scaled(self.samples[base + r]),
                    scaled(self.samples[base + g]),
                    scaled(self.samples[base + b]),
                ]
            })
            .collect();

        RgbComposite {
            height: self.height,
            width: self.width,
            pixels,
        }
    }
}
