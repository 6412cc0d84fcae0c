//! Charge spreading onto the real-space grids.
//!
//! Each worker spreads its block of atoms into a private grid; the private
//! grids are then summed element-wise in worker order.

use crate::bspline::{AtomSplines, InterpolationWeights};
use crate::grid::GridArena;
use crate::threading::HostThreads;
use nalgebra::Matrix3;
use prism_core::{RVec, DIM};
use rayon::prelude::*;

/// Computes interpolation weights for `x` and spreads every charge state onto
/// its grid. Grids must be zeroed beforehand.
pub fn spread_charges(
    threads: &HostThreads,
    x: &[RVec],
    recip: &Matrix3<f64>,
    charges: &[Vec<f64>],
    weights: &mut InterpolationWeights,
    grids: &mut GridArena,
) {
    assert!(
        charges.len() <= grids.ngrids(),
        "{} charge states for {} grids",
        charges.len(),
        grids.ngrids()
    );
    weights.compute(threads, x, recip, grids.dims());
    for (g, q) in charges.iter().enumerate() {
        spread_on_grid(threads, weights, q, grids.real_mut(g));
    }
}

/// Accumulates `charges` onto `grid` using precomputed weights.
pub fn spread_on_grid(threads: &HostThreads, weights: &InterpolationWeights, charges: &[f64], grid: &mut [f64]) {
    let n_atoms = weights.n_atoms();
    assert_eq!(
        charges.len(),
        n_atoms,
        "charge count does not match interpolation weights"
    );
    let dims = weights.dims();
    let order = weights.order();
    let atoms = weights.atoms();

    if threads.nthreads() == 1 {
        spread_atoms(atoms, charges, dims, order, grid);
        return;
    }

    let grid_len = grid.len();
    let partials: Vec<Vec<f64>> = threads.map_static(n_atoms, |_, range| {
        let mut local = vec![0.0; grid_len];
        spread_atoms(&atoms[range.clone()], &charges[range], dims, order, &mut local);
        local
    });

    let chunk = threads.chunk_len(grid_len);
    threads.install(|| {
        grid.par_chunks_mut(chunk).enumerate().for_each(|(c, out)| {
            let offset = c * chunk;
            for (i, v) in out.iter_mut().enumerate() {
                let mut sum = 0.0;
                for partial in &partials {
                    sum += partial[offset + i];
                }
                *v += sum;
            }
        });
    });
}

fn spread_atoms(atoms: &[AtomSplines], charges: &[f64], dims: [usize; DIM], order: usize, grid: &mut [f64]) {
    let [nx, ny, nz] = dims;
    for (spline, &q) in atoms.iter().zip(charges) {
        if q == 0.0 {
            continue;
        }
        for ix in 0..order {
            let x = (spline.index[0] + ix) % nx;
            let vx = q * spline.theta[0][ix];
            for iy in 0..order {
                let y = (spline.index[1] + iy) % ny;
                let vxy = vx * spline.theta[1][iy];
                let row = (x * ny + y) * nz;
                for iz in 0..order {
                    let z = (spline.index[2] + iz) % nz;
                    grid[row + z] += vxy * spline.theta[2][iz];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spread_conserves_charge() {
        let threads = HostThreads::new(3, "spread-test").unwrap();
        let recip = Matrix3::from_diagonal_element(1.0 / 2.0);
        let x = vec![
            RVec::new(0.1, 0.2, 0.3),
            RVec::new(1.9, 1.95, 0.01),
            RVec::new(1.0, -0.4, 2.7),
        ];
        let charges = vec![vec![0.8, -0.5, 0.3]];
        let mut weights = InterpolationWeights::new(5);
        let mut grids = GridArena::new([10, 12, 9], 1);
        spread_charges(&threads, &x, &recip, &charges, &mut weights, &mut grids);
        let total: f64 = grids.real(0).iter().sum();
        assert!((total - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let recip = Matrix3::from_diagonal_element(1.0 / 1.5);
        let x: Vec<RVec> = (0..40)
            .map(|i| {
                let f = i as f64;
                RVec::new((f * 0.37) % 1.5, (f * 0.61) % 1.5, (f * 0.83) % 1.5)
            })
            .collect();
        let q: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();

        let mut results = Vec::new();
        for nthreads in [1, 4] {
            let threads = HostThreads::new(nthreads, "spread-test").unwrap();
            let mut weights = InterpolationWeights::new(4);
            let mut grids = GridArena::new([12, 12, 12], 1);
            spread_charges(&threads, &x, &recip, &[q.clone()], &mut weights, &mut grids);
            results.push(grids.real(0).to_vec());
        }
        for (a, b) in results[0].iter().zip(&results[1]) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
