//! Per-step PME results and their reduction into caller-owned accumulators.

use crate::solve::EnergyAndVirial;
use crate::threading::HostThreads;
use nalgebra::Matrix3;
use prism_core::{EnergyData, ForceWithVirial, RVec};
use rayon::prelude::*;

/// Results of one PME step.
#[derive(Debug, Clone, PartialEq)]
pub struct PmeOutput {
    /// Reciprocal forces; empty when forces stay on the accelerator
    pub forces: Vec<RVec>,
    pub have_force_output: bool,
    pub coulomb_energy: f64,
    pub coulomb_virial: Matrix3<f64>,
    /// dE/dlambda; nonzero only with two grids
    pub coulomb_dvdl: f64,
}

impl PmeOutput {
    pub fn forces_only(forces: Vec<RVec>, have_force_output: bool) -> Self {
        Self {
            forces,
            have_force_output,
            coulomb_energy: 0.0,
            coulomb_virial: Matrix3::zeros(),
            coulomb_dvdl: 0.0,
        }
    }
}

/// Weights of the A and B grids. A single grid always has weight 1.
pub fn lambda_weights(ngrids: usize, lambda_q: f64) -> [f64; 2] {
    if ngrids > 1 {
        [lambda_q, 1.0 - lambda_q]
    } else {
        [1.0, 0.0]
    }
}

/// Blends per-grid energies and virials; returns (energy, virial, dvdl).
pub fn combine_energy_virial(per_grid: &[EnergyAndVirial], lambda_q: f64) -> (f64, Matrix3<f64>, f64) {
    let scales = lambda_weights(per_grid.len(), lambda_q);
    let mut energy = 0.0;
    let mut virial = Matrix3::zeros();
    for (ev, scale) in per_grid.iter().zip(scales) {
        energy += scale * ev.energy;
        virial += ev.virial * scale;
    }
    let dvdl = if per_grid.len() > 1 {
        per_grid[0].energy - per_grid[1].energy
    } else {
        0.0
    };
    (energy, virial, dvdl)
}

/// Adds `output` into the caller's force buffer and energy terms.
pub fn reduce_outputs(
    threads: &HostThreads,
    compute_energy_and_virial: bool,
    output: &PmeOutput,
    force_with_virial: &mut ForceWithVirial,
    enerd: &mut EnergyData,
) {
    if output.have_force_output {
        sum_forces(threads, &output.forces, &mut force_with_virial.force);
    }
    if compute_energy_and_virial {
        force_with_virial.add_virial_contribution(&output.coulomb_virial);
        enerd.coulomb_recip += output.coulomb_energy;
        enerd.dvdl_lin_coul += output.coulomb_dvdl;
    }
}

fn sum_forces(threads: &HostThreads, pme_forces: &[RVec], forces: &mut [RVec]) {
    assert_eq!(
        pme_forces.len(),
        forces.len(),
        "PME force count does not match the force buffer"
    );
    let chunk = threads.chunk_len(forces.len());
    threads.install(|| {
        forces
            .par_chunks_mut(chunk)
            .zip(pme_forces.par_chunks(chunk))
            .for_each(|(dst, src)| {
                for (f, p) in dst.iter_mut().zip(src) {
                    *f += p;
                }
            });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lambda_weights() {
        assert_eq!(lambda_weights(1, 0.3), [1.0, 0.0]);
        assert_eq!(lambda_weights(2, 0.25), [0.25, 0.75]);
    }

    #[test]
    fn test_combine_two_grids() {
        let a = EnergyAndVirial {
            energy: 10.0,
            virial: Matrix3::identity(),
        };
        let b = EnergyAndVirial {
            energy: 4.0,
            virial: Matrix3::identity() * 3.0,
        };
        let (energy, virial, dvdl) = combine_energy_virial(&[a, b], 0.5);
        assert_eq!(energy, 7.0);
        assert_eq!(virial[(0, 0)], 2.0);
        assert_eq!(dvdl, 6.0);

        let (energy, _, dvdl) = combine_energy_virial(&[a], 0.5);
        assert_eq!(energy, 10.0);
        assert_eq!(dvdl, 0.0);
    }

    #[test]
    fn test_reduce_accumulates_into_running_totals() {
        let threads = HostThreads::new(2, "reduce-test").unwrap();
        let output = PmeOutput {
            forces: vec![RVec::new(1.0, 2.0, 3.0); 5],
            have_force_output: true,
            coulomb_energy: -12.5,
            coulomb_virial: Matrix3::identity(),
            coulomb_dvdl: 0.75,
        };
        let mut fwv = ForceWithVirial::new(5, true);
        fwv.force[2] = RVec::new(1.0, 1.0, 1.0);
        let mut enerd = EnergyData {
            coulomb_recip: 100.0,
            dvdl_lin_coul: 0.25,
            ..EnergyData::default()
        };
        reduce_outputs(&threads, true, &output, &mut fwv, &mut enerd);
        assert_eq!(fwv.force[2], RVec::new(2.0, 3.0, 4.0));
        assert_eq!(fwv.force[4], RVec::new(1.0, 2.0, 3.0));
        assert_eq!(enerd.coulomb_recip, 87.5);
        assert_eq!(enerd.dvdl_lin_coul, 1.0);
        assert_eq!(fwv.virial()[(2, 2)], 1.0);
    }

    #[test]
    fn test_reduce_skips_forces_left_on_device() {
        let threads = HostThreads::new(1, "reduce-test").unwrap();
        let output = PmeOutput::forces_only(Vec::new(), false);
        let mut fwv = ForceWithVirial::new(3, false);
        let mut enerd = EnergyData::default();
        reduce_outputs(&threads, false, &output, &mut fwv, &mut enerd);
        assert!(fwv.force.iter().all(|f| *f == RVec::zeros()));
    }
}
