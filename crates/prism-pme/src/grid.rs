//! Real and half-complex grid storage.
//!
//! Real grids are `[x][y][z]` with z fastest. Complex grids hold the
//! non-redundant half of the transform, `[x][y][kz]` with
//! `kz in 0..nz/2+1` fastest, matching the layout of cuFFT R2C output.

use prism_core::DIM;
use rustfft::num_complex::Complex;

/// Dimensions of the half-complex grid for real dimensions `dims`.
pub fn complex_dims(dims: [usize; DIM]) -> [usize; DIM] {
    [dims[0], dims[1], dims[2] / 2 + 1]
}

/// One real and one complex grid per charge state.
#[derive(Debug, Clone)]
pub struct GridArena {
    dims: [usize; DIM],
    real: Vec<Vec<f64>>,
    complex: Vec<Vec<Complex<f64>>>,
}

impl GridArena {
    pub fn new(dims: [usize; DIM], ngrids: usize) -> Self {
        let cdims = complex_dims(dims);
        let real_len = dims.iter().product();
        let complex_len = cdims.iter().product();
        Self {
            dims,
            real: vec![vec![0.0; real_len]; ngrids],
            complex: vec![vec![Complex::new(0.0, 0.0); complex_len]; ngrids],
        }
    }

    pub fn ngrids(&self) -> usize {
        self.real.len()
    }

    pub fn dims(&self) -> [usize; DIM] {
        self.dims
    }

    pub fn complex_dims(&self) -> [usize; DIM] {
        complex_dims(self.dims)
    }

    pub fn real(&self, grid: usize) -> &[f64] {
        &self.real[grid]
    }

    pub fn real_mut(&mut self, grid: usize) -> &mut [f64] {
        &mut self.real[grid]
    }

    pub fn complex(&self, grid: usize) -> &[Complex<f64>] {
        &self.complex[grid]
    }

    pub fn complex_mut(&mut self, grid: usize) -> &mut [Complex<f64>] {
        &mut self.complex[grid]
    }

    /// Both representations of one grid, for in-place transforms.
    pub fn pair_mut(&mut self, grid: usize) -> (&mut [f64], &mut [Complex<f64>]) {
        (&mut self.real[grid], &mut self.complex[grid])
    }

    pub fn real_grids(&self) -> &[Vec<f64>] {
        &self.real
    }

    /// Zeroes every real and complex grid.
    pub fn clear(&mut self) {
        for grid in &mut self.real {
            grid.fill(0.0);
        }
        for grid in &mut self.complex {
            grid.fill(Complex::new(0.0, 0.0));
        }
    }

    #[inline]
    pub fn real_index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.dims[1] + y) * self.dims[2] + z
    }
}
