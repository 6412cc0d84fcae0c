//! Host 3D real-to-complex transforms over the PME grids.
//!
//! The forward transform runs 1D passes along z (real to half-complex), then
//! y, then x. The inverse runs x, y, then rebuilds each full z line from its
//! Hermitian half before the final complex pass. Neither direction
//! normalises.

use crate::threading::{static_range, HostThreads};
use prism_core::{PrismError, DIM};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftDirection {
    RealToComplex,
    ComplexToReal,
}

const ZERO: Complex<f64> = Complex { re: 0.0, im: 0.0 };

pub struct Parallel3dFft {
    dims: [usize; DIM],
    z_forward: Arc<dyn Fft<f64>>,
    z_inverse: Arc<dyn Fft<f64>>,
    y_forward: Arc<dyn Fft<f64>>,
    y_inverse: Arc<dyn Fft<f64>>,
    x_forward: Arc<dyn Fft<f64>>,
    x_inverse: Arc<dyn Fft<f64>>,
}

impl Parallel3dFft {
    pub fn new(dims: [usize; DIM]) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let [nx, ny, nz] = dims;
        Self {
            dims,
            z_forward: planner.plan_fft_forward(nz),
            z_inverse: planner.plan_fft_inverse(nz),
            y_forward: planner.plan_fft_forward(ny),
            y_inverse: planner.plan_fft_inverse(ny),
            x_forward: planner.plan_fft_forward(nx),
            x_inverse: planner.plan_fft_inverse(nx),
        }
    }

    pub fn dims(&self) -> [usize; DIM] {
        self.dims
    }

    fn nzc(&self) -> usize {
        self.dims[2] / 2 + 1
    }

    /// Transforms one grid in the requested direction.
    pub fn execute(
        &self,
        threads: &HostThreads,
        direction: FftDirection,
        real: &mut [f64],
        complex: &mut [Complex<f64>],
    ) -> Result<(), PrismError> {
        let [nx, ny, nz] = self.dims;
        if real.len() != nx * ny * nz || complex.len() != nx * ny * self.nzc() {
            return Err(PrismError::fft(
                format!("{:?}", direction),
                format!(
                    "grid sizes {}/{} do not match plan {:?}",
                    real.len(),
                    complex.len(),
                    self.dims
                ),
            ));
        }
        match direction {
            FftDirection::RealToComplex => {
                self.real_to_half_complex_z(threads, real, complex);
                self.transform_y(threads, complex, &self.y_forward);
                self.transform_x(threads, complex, &self.x_forward);
            }
            FftDirection::ComplexToReal => {
                self.transform_x(threads, complex, &self.x_inverse);
                self.transform_y(threads, complex, &self.y_inverse);
                self.half_complex_to_real_z(threads, complex, real);
            }
        }
        Ok(())
    }

    fn real_to_half_complex_z(&self, threads: &HostThreads, real: &[f64], complex: &mut [Complex<f64>]) {
        let nz = self.dims[2];
        let nzc = self.nzc();
        let chunk = threads.chunk_len(self.dims[0] * self.dims[1]);
        let fft = &self.z_forward;
        threads.install(|| {
            real.par_chunks(chunk * nz)
                .zip(complex.par_chunks_mut(chunk * nzc))
                .for_each_init(
                    || (vec![ZERO; nz], vec![ZERO; fft.get_inplace_scratch_len()]),
                    |(line, scratch), (src, dst)| {
                        for (r, c) in src.chunks(nz).zip(dst.chunks_mut(nzc)) {
                            for (l, &v) in line.iter_mut().zip(r) {
                                *l = Complex::new(v, 0.0);
                            }
                            fft.process_with_scratch(line, scratch);
                            c.copy_from_slice(&line[..nzc]);
                        }
                    },
                );
        });
    }

    fn half_complex_to_real_z(&self, threads: &HostThreads, complex: &[Complex<f64>], real: &mut [f64]) {
        let nz = self.dims[2];
        let nzc = self.nzc();
        let chunk = threads.chunk_len(self.dims[0] * self.dims[1]);
        let fft = &self.z_inverse;
        threads.install(|| {
            real.par_chunks_mut(chunk * nz)
                .zip(complex.par_chunks(chunk * nzc))
                .for_each_init(
                    || (vec![ZERO; nz], vec![ZERO; fft.get_inplace_scratch_len()]),
                    |(line, scratch), (dst, src)| {
                        for (r, c) in dst.chunks_mut(nz).zip(src.chunks(nzc)) {
                            line[..nzc].copy_from_slice(c);
                            for k in nzc..nz {
                                line[k] = c[nz - k].conj();
                            }
                            fft.process_with_scratch(line, scratch);
                            for (v, l) in r.iter_mut().zip(line.iter()) {
                                *v = l.re;
                            }
                        }
                    },
                );
        });
    }

    /// 1D passes along y, one block of x-planes per worker.
    fn transform_y(&self, threads: &HostThreads, complex: &mut [Complex<f64>], fft: &Arc<dyn Fft<f64>>) {
        let [nx, ny, _] = self.dims;
        let nzc = self.nzc();
        let plane = ny * nzc;
        let chunk = threads.chunk_len(nx);
        threads.install(|| {
            complex.par_chunks_mut(chunk * plane).for_each_init(
                || (vec![ZERO; ny], vec![ZERO; fft.get_inplace_scratch_len()]),
                |(line, scratch), planes| {
                    for p in planes.chunks_mut(plane) {
                        for kz in 0..nzc {
                            for (y, l) in line.iter_mut().enumerate() {
                                *l = p[y * nzc + kz];
                            }
                            fft.process_with_scratch(line, scratch);
                            for (y, l) in line.iter().enumerate() {
                                p[y * nzc + kz] = *l;
                            }
                        }
                    }
                },
            );
        });
    }

    /// 1D passes along x. Columns are transformed into per-worker blocks and
    /// scattered back plane by plane.
    fn transform_x(&self, threads: &HostThreads, complex: &mut [Complex<f64>], fft: &Arc<dyn Fft<f64>>) {
        let nx = self.dims[0];
        let columns = self.dims[1] * self.nzc();
        let nthreads = threads.nthreads();

        let src: &[Complex<f64>] = complex;
        let blocks: Vec<Vec<Complex<f64>>> = threads.map_static(columns, |_, range| {
            let mut line = vec![ZERO; nx];
            let mut scratch = vec![ZERO; fft.get_inplace_scratch_len()];
            let mut out = Vec::with_capacity(range.len() * nx);
            for col in range {
                for (x, l) in line.iter_mut().enumerate() {
                    *l = src[x * columns + col];
                }
                fft.process_with_scratch(&mut line, &mut scratch);
                out.extend_from_slice(&line);
            }
            out
        });

        threads.install(|| {
            complex
                .par_chunks_mut(columns)
                .enumerate()
                .for_each(|(x, plane)| {
                    for (t, block) in blocks.iter().enumerate() {
                        let range = static_range(columns, nthreads, t);
                        for (i, col) in range.enumerate() {
                            plane[col] = block[i * nx + x];
                        }
                    }
                });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn test_field(dims: [usize; 3]) -> Vec<f64> {
        let n: usize = dims.iter().product();
        (0..n).map(|i| ((i * 37 % 11) as f64 - 5.0) * 0.1 + (i as f64).sin()).collect()
    }

    #[test]
    fn test_forward_matches_direct_dft() {
        let dims = [4, 3, 6];
        let [nx, ny, nz] = dims;
        let nzc = nz / 2 + 1;
        let threads = HostThreads::new(2, "fft-test").unwrap();
        let fft = Parallel3dFft::new(dims);
        let mut real = test_field(dims);
        let input = real.clone();
        let mut complex = vec![ZERO; nx * ny * nzc];
        fft.execute(&threads, FftDirection::RealToComplex, &mut real, &mut complex)
            .unwrap();

        for kx in 0..nx {
            for ky in 0..ny {
                for kz in 0..nzc {
                    let mut expected = ZERO;
                    for x in 0..nx {
                        for y in 0..ny {
                            for z in 0..nz {
                                let phase = -2.0
                                    * PI
                                    * ((kx * x) as f64 / nx as f64
                                        + (ky * y) as f64 / ny as f64
                                        + (kz * z) as f64 / nz as f64);
                                expected += Complex::from_polar(input[(x * ny + y) * nz + z], phase);
                            }
                        }
                    }
                    let got = complex[(kx * ny + ky) * nzc + kz];
                    assert!((got - expected).norm() < 1e-10, "k=({}, {}, {})", kx, ky, kz);
                }
            }
        }
    }

    #[test]
    fn test_inverse_is_unnormalised() {
        let dims = [5, 4, 7];
        let n: usize = dims.iter().product();
        let threads = HostThreads::new(3, "fft-test").unwrap();
        let fft = Parallel3dFft::new(dims);
        let mut real = test_field(dims);
        let input = real.clone();
        let mut complex = vec![ZERO; dims[0] * dims[1] * (dims[2] / 2 + 1)];
        fft.execute(&threads, FftDirection::RealToComplex, &mut real, &mut complex)
            .unwrap();
        real.fill(0.0);
        fft.execute(&threads, FftDirection::ComplexToReal, &mut real, &mut complex)
            .unwrap();
        for (a, b) in real.iter().zip(&input) {
            assert!((a - n as f64 * b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_size_mismatch_is_error() {
        let threads = HostThreads::new(1, "fft-test").unwrap();
        let fft = Parallel3dFft::new([4, 4, 4]);
        let mut real = vec![0.0; 10];
        let mut complex = vec![ZERO; 48];
        let err = fft
            .execute(&threads, FftDirection::RealToComplex, &mut real, &mut complex)
            .unwrap_err();
        assert!(err.is_backend_failure());
    }
}
