//! Direct Ewald reciprocal sum.
//!
//! Evaluates the reciprocal-space Ewald energy, forces and virial by explicit
//! summation over lattice vectors. O(N · K³); intended for validating the
//! mesh pipeline on small systems.

use crate::ewald::ONE_4PI_EPS0;
use nalgebra::Matrix3;
use prism_core::{invert_box_matrix, RVec, SimulationBox, DIM};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct EwaldReference {
    pub energy: f64,
    pub forces: Vec<RVec>,
    pub virial: Matrix3<f64>,
}

struct SlabSum {
    energy: f64,
    virial: Matrix3<f64>,
    forces: Vec<RVec>,
}

/// Reciprocal Ewald sum over all lattice vectors with |n_d| <= `kmax[d]`.
///
/// Uses the same conventions as the mesh solve: energy in kJ/mol for
/// lengths in nm, virial `-0.5 Σ r ⊗ F`.
pub fn ewald_reciprocal_reference(
    x: &[RVec],
    charges: &[f64],
    simulation_box: &SimulationBox,
    ewald_coeff: f64,
    epsilon_r: f64,
    kmax: [usize; DIM],
) -> EwaldReference {
    assert_eq!(x.len(), charges.len(), "one charge per coordinate");
    let n_atoms = x.len();
    let recip = invert_box_matrix(simulation_box.matrix());
    let volume = simulation_box.volume();
    let elfac = ONE_4PI_EPS0 / epsilon_r;
    let factor = PI * PI / (ewald_coeff * ewald_coeff);

    // phases[d][j][n + kmax[d]] = exp(2πi n s_jd)
    let phases: Vec<Vec<Vec<Complex<f64>>>> = (0..DIM)
        .map(|d| {
            let k = kmax[d] as i64;
            x.iter()
                .map(|r| {
                    let s = r.x * recip[(0, d)] + r.y * recip[(1, d)] + r.z * recip[(2, d)];
                    (-k..=k)
                        .map(|n| Complex::from_polar(1.0, 2.0 * PI * n as f64 * s))
                        .collect()
                })
                .collect()
        })
        .collect();

    let kx_range: Vec<i64> = (-(kmax[0] as i64)..=kmax[0] as i64).collect();
    let slabs: Vec<SlabSum> = kx_range
        .par_iter()
        .map(|&nx| {
            let mut slab = SlabSum {
                energy: 0.0,
                virial: Matrix3::zeros(),
                forces: vec![RVec::zeros(); n_atoms],
            };
            let mut atom_phase = vec![Complex::new(0.0, 0.0); n_atoms];
            for ny in -(kmax[1] as i64)..=kmax[1] as i64 {
                for nz in -(kmax[2] as i64)..=kmax[2] as i64 {
                    if nx == 0 && ny == 0 && nz == 0 {
                        continue;
                    }
                    let n = [nx, ny, nz];
                    let m = RVec::from_fn(|c, _| (0..DIM).map(|d| n[d] as f64 * recip[(c, d)]).sum());
                    let m2 = m.norm_squared();
                    let weight = (-factor * m2).exp() / m2;

                    let mut structure = Complex::new(0.0, 0.0);
                    for (j, phase) in atom_phase.iter_mut().enumerate() {
                        *phase = phases[0][j][(nx + kmax[0] as i64) as usize]
                            * phases[1][j][(ny + kmax[1] as i64) as usize]
                            * phases[2][j][(nz + kmax[2] as i64) as usize];
                        structure += charges[j] * *phase;
                    }
                    let s2 = structure.norm_sqr();

                    slab.energy += weight * s2;
                    let eterm = elfac * weight / (PI * volume);
                    let vfactor = 2.0 * (factor * m2 + 1.0) / m2;
                    slab.virial += (m * m.transpose() * vfactor - Matrix3::identity()) * (eterm * s2);

                    let force_scale = 2.0 * elfac * weight / volume;
                    for (j, phase) in atom_phase.iter().enumerate() {
                        let im = structure.re * phase.im - structure.im * phase.re;
                        slab.forces[j] += m * (force_scale * charges[j] * im);
                    }
                }
            }
            slab
        })
        .collect();

    let mut energy = 0.0;
    let mut virial = Matrix3::zeros();
    let mut forces = vec![RVec::zeros(); n_atoms];
    for slab in &slabs {
        energy += slab.energy;
        virial += slab.virial;
        for (f, s) in forces.iter_mut().zip(&slab.forces) {
            *f += s;
        }
    }

    EwaldReference {
        energy: energy * elfac / (2.0 * PI * volume),
        forces,
        virial: virial * 0.25,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forces_match_energy_gradient() {
        let b = SimulationBox::cubic(1.5).unwrap();
        let mut x = vec![
            RVec::new(0.1, 0.2, 0.3),
            RVec::new(0.9, 0.4, 1.1),
            RVec::new(0.5, 1.3, 0.7),
        ];
        let q = [0.8, -0.5, -0.3];
        let kmax = [6, 6, 6];
        let reference = ewald_reciprocal_reference(&x, &q, &b, 2.5, 1.0, kmax);

        let h = 1e-5;
        x[1].y += h;
        let plus = ewald_reciprocal_reference(&x, &q, &b, 2.5, 1.0, kmax).energy;
        x[1].y -= 2.0 * h;
        let minus = ewald_reciprocal_reference(&x, &q, &b, 2.5, 1.0, kmax).energy;
        let fd = -(plus - minus) / (2.0 * h);
        assert!(
            (reference.forces[1].y - fd).abs() < 1e-5 * fd.abs().max(1.0),
            "analytic {} vs finite difference {}",
            reference.forces[1].y,
            fd
        );
    }

    #[test]
    fn test_neutral_pair_net_force_vanishes() {
        let b = SimulationBox::cubic(2.0).unwrap();
        let x = vec![RVec::new(0.3, 0.3, 0.3), RVec::new(1.0, 1.2, 0.8)];
        let reference = ewald_reciprocal_reference(&x, &[1.0, -1.0], &b, 3.0, 1.0, [8, 8, 8]);
        let net = reference.forces[0] + reference.forces[1];
        assert!(net.norm() < 1e-9 * reference.forces[0].norm().max(1.0));
        assert!((reference.virial - reference.virial.transpose()).norm() < 1e-9);
    }
}
