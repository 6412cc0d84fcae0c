//! Per-step box handling: change detection, wall scaling and the
//! reciprocal box used by host-side solves.

use nalgebra::Matrix3;
use prism_core::{invert_box_matrix, SimulationBox, XX, YY, ZZ};

/// Stretches the box along z for slab systems with walls.
#[derive(Debug, Clone, Copy)]
pub struct BoxScaler {
    scaling_factor: f64,
}

impl BoxScaler {
    pub fn new(wall_ewald_zfac: Option<f64>) -> Self {
        Self {
            scaling_factor: wall_ewald_zfac.unwrap_or(1.0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.scaling_factor != 1.0
    }

    /// Scaled copy of `b`; the third box vector is multiplied by the factor.
    pub fn scale_box(&self, b: &Matrix3<f64>) -> Matrix3<f64> {
        let mut scaled = *b;
        if self.is_active() {
            for c in 0..3 {
                scaled[(ZZ, c)] *= self.scaling_factor;
            }
        }
        scaled
    }
}

/// Reciprocal box and volume of a (scaled) box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReciprocalBox {
    pub recip: Matrix3<f64>,
    pub volume: f64,
}

impl ReciprocalBox {
    pub fn from_box(b: &Matrix3<f64>) -> Self {
        Self {
            recip: invert_box_matrix(b),
            volume: b[(XX, XX)] * b[(YY, YY)] * b[(ZZ, ZZ)],
        }
    }
}

/// Tracks the box between steps.
#[derive(Debug, Clone)]
pub struct BoxSetup {
    scaler: BoxScaler,
    previous: Option<Matrix3<f64>>,
    host: Option<ReciprocalBox>,
    updates: u64,
}

impl BoxSetup {
    pub fn new(scaler: BoxScaler) -> Self {
        Self {
            scaler,
            previous: None,
            host: None,
            updates: 0,
        }
    }

    /// Records `simulation_box` and reports whether derived quantities must be
    /// refreshed: on the first step, when a lower-triangle element changed,
    /// or when the box is declared dynamic.
    pub fn observe(&mut self, simulation_box: &SimulationBox, dynamic_box: bool) -> bool {
        let m = simulation_box.matrix();
        let changed = match &self.previous {
            None => true,
            Some(prev) => (0..3).any(|i| (0..=i).any(|j| prev[(i, j)] != m[(i, j)])),
        };
        self.previous = Some(*m);
        let update = changed || dynamic_box;
        if update {
            self.updates += 1;
        }
        update
    }

    pub fn scaled_box(&self, simulation_box: &SimulationBox) -> Matrix3<f64> {
        self.scaler.scale_box(simulation_box.matrix())
    }

    /// Recomputes the host reciprocal box from the scaled box.
    pub fn recompute_host(&mut self, simulation_box: &SimulationBox) {
        let scaled = self.scaled_box(simulation_box);
        self.host = Some(ReciprocalBox::from_box(&scaled));
    }

    /// Host reciprocal box, available once any host-side solve was prepared.
    pub fn host(&self) -> Option<&ReciprocalBox> {
        self.host.as_ref()
    }

    /// Number of steps on which the box was refreshed.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_detection() {
        let mut setup = BoxSetup::new(BoxScaler::new(None));
        let b = SimulationBox::cubic(3.0).unwrap();
        assert!(setup.observe(&b, false));
        assert!(!setup.observe(&b, false));
        assert!(setup.observe(&b, true));
        let c = SimulationBox::rectangular(3.0, 3.0, 3.1).unwrap();
        assert!(setup.observe(&c, false));
        assert_eq!(setup.updates(), 3);
    }

    #[test]
    fn test_wall_scaling() {
        let scaler = BoxScaler::new(Some(3.0));
        assert!(scaler.is_active());
        let b = SimulationBox::triclinic(
            prism_core::RVec::new(2.0, 0.0, 0.0),
            prism_core::RVec::new(0.0, 2.0, 0.0),
            prism_core::RVec::new(0.5, 0.0, 1.5),
        )
        .unwrap();
        let scaled = scaler.scale_box(b.matrix());
        assert_eq!(scaled[(ZZ, ZZ)], 4.5);
        assert_eq!(scaled[(ZZ, XX)], 1.5);
        assert_eq!(scaled[(XX, XX)], 2.0);

        let mut setup = BoxSetup::new(scaler);
        assert!(setup.host().is_none());
        setup.recompute_host(&b);
        let host = setup.host().unwrap();
        assert!((host.volume - 18.0).abs() < 1e-12);
    }
}
