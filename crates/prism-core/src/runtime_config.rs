//! PmeRunConfig - construction-time settings for the PME pipeline
//!
//! Loaded from TOML (or built in code) and validated before any PME state is
//! allocated. Per-step choices live in [`crate::StepWorkload`] instead.

use crate::errors::PrismError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported B-spline interpolation orders.
pub const PME_ORDER_MIN: usize = 3;
pub const PME_ORDER_MAX: usize = 12;

/// Where the PME stages execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PmeRunMode {
    /// All stages on host threads
    #[default]
    Cpu,
    /// All stages on the accelerator
    Gpu,
    /// Spread and gather on the accelerator, transforms and solve on the host
    Mixed,
}

impl PmeRunMode {
    pub fn uses_accelerator(&self) -> bool {
        !matches!(self, PmeRunMode::Cpu)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmeRunConfig {
    #[serde(default)]
    pub run_mode: PmeRunMode,

    /// Explicit grid dimensions; derived from `fourier_spacing` when absent
    #[serde(default)]
    pub grid: Option<[usize; 3]>,

    /// Maximum grid spacing in nm
    #[serde(default = "default_fourier_spacing")]
    pub fourier_spacing: f64,

    /// B-spline interpolation order
    #[serde(default = "default_pme_order")]
    pub pme_order: usize,

    /// Real-space Coulomb cutoff in nm, used to derive the Ewald coefficient
    #[serde(default = "default_coulomb_cutoff")]
    pub coulomb_cutoff: f64,

    /// Relative strength of the direct-space potential at the cutoff
    #[serde(default = "default_ewald_rtol")]
    pub ewald_rtol: f64,

    /// Explicit Ewald splitting coefficient (1/nm), overrides cutoff/rtol
    #[serde(default)]
    pub ewald_coefficient: Option<f64>,

    #[serde(default = "default_epsilon_r")]
    pub epsilon_r: f64,

    /// Host worker threads for spread, transforms, solve, gather and reduction
    #[serde(default = "default_host_threads")]
    pub host_threads: usize,

    /// Multi-rank decomposition of the grid (single-rank only)
    #[serde(default)]
    pub use_decomposition: bool,

    /// Perturbed charges: two grids, A and B state
    #[serde(default)]
    pub free_energy_coulomb: bool,

    #[serde(default = "default_true")]
    pub do_coulomb: bool,

    #[serde(default)]
    pub do_lj: bool,

    /// Z scaling for slab geometries with walls (Ewald "3DC" box scaling)
    #[serde(default)]
    pub wall_ewald_zfac: Option<f64>,

    /// Gather as a standalone accelerator stage
    #[serde(default = "default_true")]
    pub gpu_gather: bool,
}

fn default_fourier_spacing() -> f64 {
    0.12
}

fn default_pme_order() -> usize {
    4
}

fn default_coulomb_cutoff() -> f64 {
    1.0
}

fn default_ewald_rtol() -> f64 {
    1e-5
}

fn default_epsilon_r() -> f64 {
    1.0
}

fn default_host_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_true() -> bool {
    true
}

impl Default for PmeRunConfig {
    fn default() -> Self {
        Self {
            run_mode: PmeRunMode::default(),
            grid: None,
            fourier_spacing: default_fourier_spacing(),
            pme_order: default_pme_order(),
            coulomb_cutoff: default_coulomb_cutoff(),
            ewald_rtol: default_ewald_rtol(),
            ewald_coefficient: None,
            epsilon_r: default_epsilon_r(),
            host_threads: default_host_threads(),
            use_decomposition: false,
            free_energy_coulomb: false,
            do_coulomb: true,
            do_lj: false,
            wall_ewald_zfac: None,
            gpu_gather: true,
        }
    }
}

impl PmeRunConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PrismError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        log::debug!("Loaded PME config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, PrismError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// JSON snapshot, used when recording run metadata.
    pub fn to_json(&self) -> Result<String, PrismError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Number of grids: two when Coulomb charges are perturbed.
    pub fn ngrids(&self) -> usize {
        if self.free_energy_coulomb {
            2
        } else {
            1
        }
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), PrismError> {
        if !(PME_ORDER_MIN..=PME_ORDER_MAX).contains(&self.pme_order) {
            return Err(PrismError::config(format!(
                "pme_order must be in {}..={}, got {}",
                PME_ORDER_MIN, PME_ORDER_MAX, self.pme_order
            )));
        }
        if let Some(grid) = self.grid {
            let min = 2 * (self.pme_order - 1);
            if grid.iter().any(|&n| n < min) {
                return Err(PrismError::config(format!(
                    "PME grid {:?} too small for order {} (each dimension needs >= {})",
                    grid, self.pme_order, min
                )));
            }
        } else if !(self.fourier_spacing > 0.0) {
            return Err(PrismError::config(format!(
                "fourier_spacing must be positive, got {}",
                self.fourier_spacing
            )));
        }
        match self.ewald_coefficient {
            Some(beta) if !(beta > 0.0) => {
                return Err(PrismError::config(format!(
                    "ewald_coefficient must be positive, got {}",
                    beta
                )));
            }
            None if !(self.coulomb_cutoff > 0.0 && self.ewald_rtol > 0.0 && self.ewald_rtol < 1.0) => {
                return Err(PrismError::config(format!(
                    "coulomb_cutoff ({}) and ewald_rtol ({}) cannot define an Ewald coefficient",
                    self.coulomb_cutoff, self.ewald_rtol
                )));
            }
            _ => {}
        }
        if !(self.epsilon_r > 0.0) {
            return Err(PrismError::config(format!(
                "epsilon_r must be positive, got {}",
                self.epsilon_r
            )));
        }
        if self.host_threads == 0 {
            return Err(PrismError::config("host_threads must be at least 1"));
        }
        if self.use_decomposition {
            return Err(PrismError::config(
                "PME grid decomposition across ranks is not supported",
            ));
        }
        if self.do_lj {
            return Err(PrismError::config("LJ-PME is not supported"));
        }
        if !self.do_coulomb {
            return Err(PrismError::config("only Coulomb PME can be run"));
        }
        if let Some(zfac) = self.wall_ewald_zfac {
            if !(zfac >= 1.0) {
                return Err(PrismError::config(format!(
                    "wall_ewald_zfac must be >= 1, got {}",
                    zfac
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PmeRunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ngrids(), 1);
        assert_eq!(config.run_mode, PmeRunMode::Cpu);
    }

    #[test]
    fn test_from_toml() {
        let config = PmeRunConfig::from_toml_str(
            r#"
            run_mode = "mixed"
            grid = [32, 32, 40]
            pme_order = 5
            free_energy_coulomb = true
            host_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.run_mode, PmeRunMode::Mixed);
        assert_eq!(config.grid, Some([32, 32, 40]));
        assert_eq!(config.pme_order, 5);
        assert_eq!(config.ngrids(), 2);
        assert!(config.gpu_gather);
        assert_eq!(config.coulomb_cutoff, 1.0);
    }

    #[test]
    fn test_rejects_bad_order_and_small_grid() {
        let mut config = PmeRunConfig::default();
        config.pme_order = 13;
        assert!(config.validate().is_err());

        config.pme_order = 6;
        config.grid = Some([10, 32, 32]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_decomposition_and_lj() {
        let config = PmeRunConfig {
            use_decomposition: true,
            ..PmeRunConfig::default()
        };
        assert!(config.validate().is_err());
        let config = PmeRunConfig {
            do_lj: true,
            ..PmeRunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_snapshot() {
        let json = PmeRunConfig::default().to_json().unwrap();
        assert!(json.contains("\"run_mode\": \"cpu\""));
    }
}
