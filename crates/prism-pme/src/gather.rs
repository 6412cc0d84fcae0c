//! Force interpolation from the potential grids back to the atoms.

use crate::bspline::{AtomSplines, InterpolationWeights};
use crate::output::lambda_weights;
use crate::threading::HostThreads;
use nalgebra::Matrix3;
use prism_core::{RVec, DIM};
use rayon::prelude::*;

/// Overwrites `forces` with the lambda-weighted sum of the forces from every
/// grid. `grids` must hold the back-transformed potential.
pub fn gather_forces(
    threads: &HostThreads,
    weights: &InterpolationWeights,
    grids: &[Vec<f64>],
    charges: &[Vec<f64>],
    lambda_q: f64,
    recip: &Matrix3<f64>,
    forces: &mut [RVec],
) {
    assert!(
        weights.is_valid(),
        "gather requires interpolation weights from this step's spread"
    );
    let n_atoms = weights.n_atoms();
    assert_eq!(forces.len(), n_atoms, "force buffer size mismatch");
    assert_eq!(grids.len(), charges.len(), "one charge state per grid");

    let scales = lambda_weights(grids.len(), lambda_q);
    let dims = weights.dims();
    let order = weights.order();
    let atoms = weights.atoms();
    let chunk = threads.chunk_len(n_atoms);

    threads.install(|| {
        forces
            .par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(t, block)| {
                let start = t * chunk;
                for (i, f) in block.iter_mut().enumerate() {
                    let atom = start + i;
                    let mut total = RVec::zeros();
                    for (g, grid) in grids.iter().enumerate() {
                        let q = charges[g][atom];
                        if q == 0.0 || scales[g] == 0.0 {
                            continue;
                        }
                        let grad = grid_gradient(&atoms[atom], grid, dims, order);
                        total += scales[g] * cartesian_force(q, &grad, dims, recip);
                    }
                    *f = total;
                }
            });
    });
}

/// Gradient of the interpolated potential with respect to the scaled
/// fractional coordinates `u_d = K_d * s_d`.
fn grid_gradient(spline: &AtomSplines, grid: &[f64], dims: [usize; DIM], order: usize) -> [f64; DIM] {
    let [nx, ny, nz] = dims;
    let (mut fx, mut fy, mut fz) = (0.0, 0.0, 0.0);
    for ix in 0..order {
        let x = (spline.index[0] + ix) % nx;
        let tx = spline.theta[0][ix];
        let dx = spline.dtheta[0][ix];
        for iy in 0..order {
            let y = (spline.index[1] + iy) % ny;
            let ty = spline.theta[1][iy];
            let dy = spline.dtheta[1][iy];
            let row = (x * ny + y) * nz;
            let mut fxy1 = 0.0;
            let mut fz1 = 0.0;
            for iz in 0..order {
                let z = (spline.index[2] + iz) % nz;
                let gval = grid[row + z];
                fxy1 += spline.theta[2][iz] * gval;
                fz1 += spline.dtheta[2][iz] * gval;
            }
            fx += dx * ty * fxy1;
            fy += tx * dy * fxy1;
            fz += tx * ty * fz1;
        }
    }
    [fx, fy, fz]
}

/// F_c = -q * sum_d K_d * recip[(c, d)] * grad_d
fn cartesian_force(q: f64, grad: &[f64; DIM], dims: [usize; DIM], recip: &Matrix3<f64>) -> RVec {
    let mut f = RVec::zeros();
    for c in 0..DIM {
        let mut sum = 0.0;
        for d in 0..DIM {
            sum += dims[d] as f64 * recip[(c, d)] * grad[d];
        }
        f[c] = -q * sum;
    }
    f
}
