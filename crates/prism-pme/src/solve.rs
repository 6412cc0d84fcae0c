//! Reciprocal-space solve: convolution of the transformed charge grid with the
//! Ewald influence function, optionally accumulating energy and virial.

use crate::threading::HostThreads;
use nalgebra::Matrix3;
use prism_core::{DIM, XX, YY, ZZ};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Traversal order of the half-complex grid.
///
/// `Xyz` walks x-planes with kz fastest. `Yzx` walks y outermost, then kz,
/// then x, matching the decomposed-transform output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridOrdering {
    #[default]
    Xyz,
    Yzx,
}

/// Reciprocal energy and virial of one grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyAndVirial {
    pub energy: f64,
    pub virial: Matrix3<f64>,
}

impl Default for EnergyAndVirial {
    fn default() -> Self {
        Self {
            energy: 0.0,
            virial: Matrix3::zeros(),
        }
    }
}

/// Inputs of the influence function for the current box.
#[derive(Debug, Clone, Copy)]
pub struct SolveInput<'a> {
    pub dims: [usize; DIM],
    pub recip: &'a Matrix3<f64>,
    pub volume: f64,
    pub ewald_coeff: f64,
    /// Coulomb prefactor, ONE_4PI_EPS0 / epsilon_r
    pub elfac: f64,
    pub bsp_mod: &'a [Vec<f64>; DIM],
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    energy: f64,
    vxx: f64,
    vyy: f64,
    vzz: f64,
    vxy: f64,
    vxz: f64,
    vyz: f64,
}

impl Accumulator {
    fn add(&mut self, other: &Accumulator) {
        self.energy += other.energy;
        self.vxx += other.vxx;
        self.vyy += other.vyy;
        self.vzz += other.vzz;
        self.vxy += other.vxy;
        self.vxz += other.vxz;
        self.vyz += other.vyz;
    }
}

struct InfluenceKernel<'a> {
    input: &'a SolveInput<'a>,
    nzc: usize,
    factor: f64,
    compute_ev: bool,
}

impl InfluenceKernel<'_> {
    #[inline]
    fn apply(&self, kx: usize, ky: usize, kz: usize, value: &mut Complex<f64>, acc: &mut Accumulator) {
        let [nx, ny, nz] = self.input.dims;
        let r = self.input.recip;

        let mx = if kx < (nx + 1) / 2 { kx as f64 } else { kx as f64 - nx as f64 };
        let my = if ky < (ny + 1) / 2 { ky as f64 } else { ky as f64 - ny as f64 };
        let mz = kz as f64;

        let mhxk = mx * r[(XX, XX)];
        let mhyk = mx * r[(YY, XX)] + my * r[(YY, YY)];
        let mhzk = mx * r[(ZZ, XX)] + my * r[(ZZ, YY)] + mz * r[(ZZ, ZZ)];
        let m2k = mhxk * mhxk + mhyk * mhyk + mhzk * mhzk;

        if m2k == 0.0 {
            *value = Complex::new(0.0, 0.0);
            return;
        }

        let bsp = self.input.bsp_mod;
        let denom = m2k * bsp[XX][kx] * bsp[YY][ky] * bsp[ZZ][kz] * PI * self.input.volume;
        let eterm = self.input.elfac * (-self.factor * m2k).exp() / denom;

        if self.compute_ev {
            let corner_fac = if kz == 0 || kz == (nz + 1) / 2 { 0.5 } else { 1.0 };
            let struct2 = 2.0 * corner_fac * value.norm_sqr();
            let tmp1 = eterm * struct2;
            let vfactor = (self.factor * m2k + 1.0) * 2.0 / m2k;
            acc.energy += tmp1;
            acc.vxx += tmp1 * (vfactor * mhxk * mhxk - 1.0);
            acc.vyy += tmp1 * (vfactor * mhyk * mhyk - 1.0);
            acc.vzz += tmp1 * (vfactor * mhzk * mhzk - 1.0);
            acc.vxy += tmp1 * vfactor * mhxk * mhyk;
            acc.vxz += tmp1 * vfactor * mhxk * mhzk;
            acc.vyz += tmp1 * vfactor * mhyk * mhzk;
        }

        *value *= eterm;
    }
}

/// Multiplies the half-complex `grid` by the influence function in place.
///
/// Returns the energy and virial when `compute_ev` is set, zeros otherwise.
/// The k = 0 element is zeroed.
pub fn solve_pme(
    threads: &HostThreads,
    grid: &mut [Complex<f64>],
    input: &SolveInput<'_>,
    ordering: GridOrdering,
    compute_ev: bool,
) -> EnergyAndVirial {
    let [nx, ny, nz] = input.dims;
    let nzc = nz / 2 + 1;
    assert_eq!(grid.len(), nx * ny * nzc, "complex grid size mismatch");

    let kernel = InfluenceKernel {
        input,
        nzc,
        factor: PI * PI / (input.ewald_coeff * input.ewald_coeff),
        compute_ev,
    };

    let partials = match ordering {
        GridOrdering::Xyz => solve_xyz(threads, grid, &kernel),
        GridOrdering::Yzx => solve_yzx(threads, grid, &kernel),
    };

    if !compute_ev {
        return EnergyAndVirial::default();
    }

    let mut total = Accumulator::default();
    for partial in &partials {
        total.add(partial);
    }
    let virial = Matrix3::new(
        total.vxx, total.vxy, total.vxz, //
        total.vxy, total.vyy, total.vyz, //
        total.vxz, total.vyz, total.vzz,
    ) * 0.25;
    EnergyAndVirial {
        energy: 0.5 * total.energy,
        virial,
    }
}

fn solve_xyz(threads: &HostThreads, grid: &mut [Complex<f64>], kernel: &InfluenceKernel<'_>) -> Vec<Accumulator> {
    let [nx, ny, _] = kernel.input.dims;
    let nzc = kernel.nzc;
    let plane = ny * nzc;
    let chunk = threads.chunk_len(nx);
    threads.install(|| {
        grid.par_chunks_mut(chunk * plane)
            .enumerate()
            .map(|(t, planes)| {
                let mut acc = Accumulator::default();
                for (i, p) in planes.chunks_mut(plane).enumerate() {
                    let kx = t * chunk + i;
                    for ky in 0..ny {
                        for kz in 0..nzc {
                            kernel.apply(kx, ky, kz, &mut p[ky * nzc + kz], &mut acc);
                        }
                    }
                }
                acc
            })
            .collect()
    })
}

fn solve_yzx(threads: &HostThreads, grid: &mut [Complex<f64>], kernel: &InfluenceKernel<'_>) -> Vec<Accumulator> {
    let [nx, ny, _] = kernel.input.dims;
    let nzc = kernel.nzc;

    // Rows of constant (x, y), bucketed by y and ordered by x within a bucket
    let mut rows: Vec<Vec<&mut [Complex<f64>]>> = (0..ny).map(|_| Vec::with_capacity(nx)).collect();
    for (r, row) in grid.chunks_mut(nzc).enumerate() {
        rows[r % ny].push(row);
    }

    let chunk = threads.chunk_len(ny);
    threads.install(|| {
        rows.par_chunks_mut(chunk)
            .enumerate()
            .map(|(t, buckets)| {
                let mut acc = Accumulator::default();
                for (j, bucket) in buckets.iter_mut().enumerate() {
                    let ky = t * chunk + j;
                    for kz in 0..nzc {
                        for (kx, row) in bucket.iter_mut().enumerate() {
                            kernel.apply(kx, ky, kz, &mut row[kz], &mut acc);
                        }
                    }
                }
                acc
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspline::make_bspline_moduli;
    use prism_core::invert_box_matrix;

    fn random_grid(len: usize) -> Vec<Complex<f64>> {
        (0..len)
            .map(|i| {
                let f = i as f64;
                Complex::new((f * 0.731).sin(), (f * 1.37).cos())
            })
            .collect()
    }

    #[test]
    fn test_orderings_agree() {
        let dims = [8, 10, 12];
        let b = Matrix3::new(2.0, 0.0, 0.0, 0.3, 2.2, 0.0, -0.2, 0.4, 2.5);
        let recip = invert_box_matrix(&b);
        let bsp_mod = [
            make_bspline_moduli(dims[0], 4),
            make_bspline_moduli(dims[1], 4),
            make_bspline_moduli(dims[2], 4),
        ];
        let input = SolveInput {
            dims,
            recip: &recip,
            volume: 2.0 * 2.2 * 2.5,
            ewald_coeff: 3.12,
            elfac: 138.935458,
            bsp_mod: &bsp_mod,
        };
        let threads = HostThreads::new(3, "solve-test").unwrap();
        let mut a = random_grid(8 * 10 * 7);
        let mut b_grid = a.clone();
        let ev_a = solve_pme(&threads, &mut a, &input, GridOrdering::Xyz, true);
        let ev_b = solve_pme(&threads, &mut b_grid, &input, GridOrdering::Yzx, true);

        assert!(ev_a.energy > 0.0);
        assert!((ev_a.energy - ev_b.energy).abs() < 1e-10 * ev_a.energy);
        assert!((ev_a.virial - ev_b.virial).norm() < 1e-10 * ev_a.virial.norm());
        for (x, y) in a.iter().zip(&b_grid) {
            assert_eq!(x, y);
        }
        assert_eq!(a[0], Complex::new(0.0, 0.0));
        assert_eq!(ev_a.virial, ev_a.virial.transpose());
    }

    #[test]
    fn test_no_energy_without_request() {
        let dims = [8, 8, 8];
        let recip = Matrix3::from_diagonal_element(0.5);
        let bsp_mod = [
            make_bspline_moduli(8, 4),
            make_bspline_moduli(8, 4),
            make_bspline_moduli(8, 4),
        ];
        let input = SolveInput {
            dims,
            recip: &recip,
            volume: 8.0,
            ewald_coeff: 3.0,
            elfac: 138.935458,
            bsp_mod: &bsp_mod,
        };
        let threads = HostThreads::new(2, "solve-test").unwrap();
        let mut grid = random_grid(8 * 8 * 5);
        let ev = solve_pme(&threads, &mut grid, &input, GridOrdering::Xyz, false);
        assert_eq!(ev, EnergyAndVirial::default());
        assert_eq!(grid[0], Complex::new(0.0, 0.0));
    }
}
