//! Cardinal B-spline interpolation weights and their Fourier moduli.
//!
//! For each atom and dimension the spline covers `order` consecutive grid
//! points starting at `index[d]` (wrapped periodically). `theta` holds the
//! weights and `dtheta` their derivatives with respect to the scaled
//! fractional coordinate `u = K * s`.

use crate::threading::HostThreads;
use nalgebra::Matrix3;
use prism_core::{RVec, DIM, PME_ORDER_MAX, PME_ORDER_MIN};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Spline data for one atom.
#[derive(Debug, Clone, Copy)]
pub struct AtomSplines {
    pub index: [usize; DIM],
    pub theta: [[f64; PME_ORDER_MAX]; DIM],
    pub dtheta: [[f64; PME_ORDER_MAX]; DIM],
}

impl Default for AtomSplines {
    fn default() -> Self {
        Self {
            index: [0; DIM],
            theta: [[0.0; PME_ORDER_MAX]; DIM],
            dtheta: [[0.0; PME_ORDER_MAX]; DIM],
        }
    }
}

/// Interpolation weights for every atom, produced by spreading and reused by
/// gathering within the same step.
#[derive(Debug, Clone)]
pub struct InterpolationWeights {
    order: usize,
    dims: [usize; DIM],
    atoms: Vec<AtomSplines>,
    valid: bool,
}

impl InterpolationWeights {
    pub fn new(order: usize) -> Self {
        assert!(
            (PME_ORDER_MIN..=PME_ORDER_MAX).contains(&order),
            "interpolation order {} out of range",
            order
        );
        Self {
            order,
            dims: [0; DIM],
            atoms: Vec::new(),
            valid: false,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn dims(&self) -> [usize; DIM] {
        self.dims
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn atoms(&self) -> &[AtomSplines] {
        &self.atoms
    }

    /// Whether the weights belong to the current step.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the weights stale; gathering with stale weights is rejected.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Computes grid indices and spline weights for all positions.
    pub fn compute(
        &mut self,
        threads: &HostThreads,
        x: &[RVec],
        recip: &Matrix3<f64>,
        dims: [usize; DIM],
    ) {
        let order = self.order;
        self.dims = dims;
        self.atoms.resize(x.len(), AtomSplines::default());
        let chunk = threads.chunk_len(x.len());
        let atoms = &mut self.atoms;
        threads.install(|| {
            atoms
                .par_chunks_mut(chunk)
                .zip(x.par_chunks(chunk))
                .for_each(|(splines, positions)| {
                    for (spline, pos) in splines.iter_mut().zip(positions) {
                        compute_atom_splines(pos, recip, dims, order, spline);
                    }
                });
        });
        self.valid = true;
    }
}

fn compute_atom_splines(
    x: &RVec,
    recip: &Matrix3<f64>,
    dims: [usize; DIM],
    order: usize,
    out: &mut AtomSplines,
) {
    for d in 0..DIM {
        // Fractional coordinate along box vector d
        let s = x[0] * recip[(0, d)] + x[1] * recip[(1, d)] + x[2] * recip[(2, d)];
        let u = dims[d] as f64 * s;
        let floor = u.floor();
        out.index[d] = (floor as i64).rem_euclid(dims[d] as i64) as usize;
        let dr = u - floor;
        make_bsplines(dr, order, &mut out.theta[d], &mut out.dtheta[d]);
    }
}

/// Evaluates the order-`order` B-spline weights and derivatives at offset `dr`.
pub fn make_bsplines(dr: f64, order: usize, theta: &mut [f64], dtheta: &mut [f64]) {
    let data = theta;
    data[order - 1] = 0.0;
    data[1] = dr;
    data[0] = 1.0 - dr;

    for k in 3..order {
        let div = 1.0 / (k as f64 - 1.0);
        data[k - 1] = div * dr * data[k - 2];
        for l in 1..(k - 1) {
            data[k - l - 1] = div
                * ((dr + l as f64) * data[k - l - 2] + (k as f64 - l as f64 - dr) * data[k - l - 1]);
        }
        data[0] = div * (1.0 - dr) * data[0];
    }

    // Derivatives from the order-1 spline
    dtheta[0] = -data[0];
    for k in 1..order {
        dtheta[k] = data[k - 1] - data[k];
    }

    let div = 1.0 / (order as f64 - 1.0);
    data[order - 1] = div * dr * data[order - 2];
    for l in 1..(order - 1) {
        data[order - l - 1] = div
            * ((dr + l as f64) * data[order - l - 2]
                + (order as f64 - l as f64 - dr) * data[order - l - 1]);
    }
    data[0] = div * (1.0 - dr) * data[0];
}

/// Squared DFT moduli of the spline sampled at integer points, one entry per
/// wave number of an `n`-point grid. The solve divides by their product.
pub fn make_bspline_moduli(n: usize, order: usize) -> Vec<f64> {
    let mut theta = [0.0; PME_ORDER_MAX];
    let mut dtheta = [0.0; PME_ORDER_MAX];
    make_bsplines(0.0, order, &mut theta, &mut dtheta);

    let mut bsp_data = vec![0.0; n];
    for i in 1..=order.min(n) {
        bsp_data[i % n] = theta[i - 1];
    }

    let mut moduli: Vec<f64> = (0..n)
        .map(|k| {
            let sum: Complex<f64> = bsp_data
                .iter()
                .enumerate()
                .map(|(j, &b)| Complex::from_polar(b, 2.0 * PI * (j * k) as f64 / n as f64))
                .sum();
            sum.norm_sqr()
        })
        .collect();

    // Interpolation zeros at odd orders: average the neighbours
    for k in 0..n {
        if moduli[k] < 1.0e-7 {
            moduli[k] = (moduli[(k + n - 1) % n] + moduli[(k + 1) % n]) * 0.5;
        }
    }
    moduli
}
