//! Construction-time PME parameters derived from the run configuration.

use crate::bspline::make_bspline_moduli;
use crate::ewald::{check_grid_dims, compute_ewald_beta, grid_dims_for_spacing, ONE_4PI_EPS0};
use crate::grid::complex_dims;
use prism_core::{PmeRunConfig, PrismError, SimulationBox, DIM};

/// Everything the host kernels and accelerator backends need that does not
/// change between steps.
#[derive(Debug, Clone)]
pub struct PmeParameters {
    pub grid_dims: [usize; DIM],
    pub pme_order: usize,
    pub ewald_coeff: f64,
    pub epsilon_r: f64,
    pub ngrids: usize,
    pub host_threads: usize,
    pub wall_ewald_zfac: Option<f64>,
    /// B-spline moduli along x, y and z
    pub bsp_mod: [Vec<f64>; DIM],
}

impl PmeParameters {
    pub fn from_config(config: &PmeRunConfig, initial_box: &SimulationBox) -> Result<Self, PrismError> {
        config.validate()?;

        let grid_dims = match config.grid {
            Some(dims) => dims,
            None => grid_dims_for_spacing(initial_box, config.fourier_spacing),
        };
        check_grid_dims(grid_dims, config.pme_order)?;

        let ewald_coeff = config
            .ewald_coefficient
            .unwrap_or_else(|| compute_ewald_beta(config.coulomb_cutoff, config.ewald_rtol));

        let bsp_mod = [
            make_bspline_moduli(grid_dims[0], config.pme_order),
            make_bspline_moduli(grid_dims[1], config.pme_order),
            make_bspline_moduli(grid_dims[2], config.pme_order),
        ];

        Ok(Self {
            grid_dims,
            pme_order: config.pme_order,
            ewald_coeff,
            epsilon_r: config.epsilon_r,
            ngrids: config.ngrids(),
            host_threads: config.host_threads,
            wall_ewald_zfac: config.wall_ewald_zfac,
            bsp_mod,
        })
    }

    /// Coulomb prefactor ONE_4PI_EPS0 / epsilon_r.
    pub fn elfac(&self) -> f64 {
        ONE_4PI_EPS0 / self.epsilon_r
    }

    pub fn complex_dims(&self) -> [usize; DIM] {
        complex_dims(self.grid_dims)
    }

    pub fn real_grid_len(&self) -> usize {
        self.grid_dims.iter().product()
    }

    pub fn complex_grid_len(&self) -> usize {
        self.complex_dims().iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_derives_grid_and_beta() {
        let config = PmeRunConfig {
            host_threads: 2,
            ..PmeRunConfig::default()
        };
        let b = SimulationBox::cubic(3.0).unwrap();
        let params = PmeParameters::from_config(&config, &b).unwrap();
        assert_eq!(params.grid_dims, [25, 25, 25]);
        assert_eq!(params.complex_dims(), [25, 25, 13]);
        assert!((params.ewald_coeff - 3.12341).abs() < 1e-4);
        assert_eq!(params.ngrids, 1);
        assert_eq!(params.bsp_mod[2].len(), 25);
    }

    #[test]
    fn test_explicit_grid_and_coefficient() {
        let config = PmeRunConfig {
            grid: Some([32, 36, 40]),
            ewald_coefficient: Some(3.5),
            free_energy_coulomb: true,
            host_threads: 1,
            ..PmeRunConfig::default()
        };
        let b = SimulationBox::cubic(3.0).unwrap();
        let params = PmeParameters::from_config(&config, &b).unwrap();
        assert_eq!(params.grid_dims, [32, 36, 40]);
        assert_eq!(params.ewald_coeff, 3.5);
        assert_eq!(params.ngrids, 2);
        assert_eq!(params.real_grid_len(), 32 * 36 * 40);
    }
}
