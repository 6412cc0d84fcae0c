//! Core data types shared by the PME pipeline and its callers.
//!
//! Units follow the molecular-dynamics convention used throughout PRISM:
//! lengths in nm, energies in kJ/mol, charges in units of e.

use crate::errors::PrismError;
use nalgebra::{Matrix3, Vector3};

/// 3-component coordinate / force vector.
pub type RVec = Vector3<f64>;

pub const XX: usize = 0;
pub const YY: usize = 1;
pub const ZZ: usize = 2;
pub const DIM: usize = 3;

/// Periodic simulation cell.
///
/// Rows of the matrix are the box vectors. The cell must be lower-triangular
/// (`a = (ax, 0, 0)`, `b = (bx, by, 0)`, `c = (cx, cy, cz)`) with a positive
/// diagonal, which is the canonical orientation every PME backend assumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationBox {
    matrix: Matrix3<f64>,
}

impl SimulationBox {
    /// Creates a box from row vectors, validating the triangular shape.
    pub fn new(matrix: Matrix3<f64>) -> Result<Self, PrismError> {
        if matrix[(XX, YY)] != 0.0 || matrix[(XX, ZZ)] != 0.0 || matrix[(YY, ZZ)] != 0.0 {
            return Err(PrismError::validation(format!(
                "box must be lower-triangular, got upper elements ({}, {}, {})",
                matrix[(XX, YY)],
                matrix[(XX, ZZ)],
                matrix[(YY, ZZ)]
            )));
        }
        for d in 0..DIM {
            let v = matrix[(d, d)];
            if !(v.is_finite() && v > 0.0) {
                return Err(PrismError::validation(format!(
                    "box diagonal element {} must be positive and finite, got {}",
                    d, v
                )));
            }
        }
        Ok(Self { matrix })
    }

    /// Cubic box with edge `l`.
    pub fn cubic(l: f64) -> Result<Self, PrismError> {
        Self::rectangular(l, l, l)
    }

    /// Rectangular box.
    pub fn rectangular(lx: f64, ly: f64, lz: f64) -> Result<Self, PrismError> {
        Self::new(Matrix3::from_diagonal(&Vector3::new(lx, ly, lz)))
    }

    /// Triclinic box from its three row vectors.
    pub fn triclinic(a: RVec, b: RVec, c: RVec) -> Result<Self, PrismError> {
        Self::new(Matrix3::new(
            a.x, a.y, a.z, //
            b.x, b.y, b.z, //
            c.x, c.y, c.z,
        ))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Box vector `d` (row `d` of the matrix).
    pub fn vector(&self, d: usize) -> RVec {
        Vector3::new(self.matrix[(d, XX)], self.matrix[(d, YY)], self.matrix[(d, ZZ)])
    }

    /// Cell volume; the product of the diagonal for a triangular box.
    pub fn volume(&self) -> f64 {
        self.matrix[(XX, XX)] * self.matrix[(YY, YY)] * self.matrix[(ZZ, ZZ)]
    }

    /// Box with every vector multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Result<Self, PrismError> {
        Self::new(self.matrix * factor)
    }
}

/// Inverts a lower-triangular box matrix.
///
/// The result is also lower-triangular. Fractional coordinates of a position
/// `x` are `s_d = sum_c x_c * recip[(c, d)]`.
pub fn invert_box_matrix(b: &Matrix3<f64>) -> Matrix3<f64> {
    let tmp = 1.0 / (b[(XX, XX)] * b[(YY, YY)] * b[(ZZ, ZZ)]);
    let mut r = Matrix3::zeros();
    r[(XX, XX)] = b[(YY, YY)] * b[(ZZ, ZZ)] * tmp;
    r[(YY, XX)] = -b[(YY, XX)] * b[(ZZ, ZZ)] * tmp;
    r[(YY, YY)] = b[(XX, XX)] * b[(ZZ, ZZ)] * tmp;
    r[(ZZ, XX)] = (b[(YY, XX)] * b[(ZZ, YY)] - b[(YY, YY)] * b[(ZZ, XX)]) * tmp;
    r[(ZZ, YY)] = -b[(ZZ, YY)] * b[(XX, XX)] * tmp;
    r[(ZZ, ZZ)] = b[(XX, XX)] * b[(YY, YY)] * tmp;
    r
}

/// Per-step flags that select what the PME pipeline computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepWorkload {
    /// Energy is requested this step
    pub compute_energy: bool,
    /// Virial is requested this step; must equal `compute_energy`
    pub compute_virial: bool,
    /// The box may change between steps (pressure coupling, deformation)
    pub have_dynamic_box: bool,
    /// Forces are reduced on the accelerator by a downstream consumer
    pub use_gpu_pme_force_reduction: bool,
}

impl StepWorkload {
    /// Forces only.
    pub fn forces_only() -> Self {
        Self::default()
    }

    /// Forces plus energy and virial.
    pub fn with_energy_and_virial() -> Self {
        Self {
            compute_energy: true,
            compute_virial: true,
            ..Self::default()
        }
    }

    /// Combined energy/virial flag.
    ///
    /// # Panics
    ///
    /// Panics when energy and virial are requested independently; PME
    /// computes both together or neither.
    pub fn compute_energy_and_virial(&self) -> bool {
        assert!(
            self.compute_energy == self.compute_virial,
            "PME computes energy and virial together (compute_energy = {}, compute_virial = {})",
            self.compute_energy,
            self.compute_virial
        );
        self.compute_energy
    }
}

/// Caller-owned force buffer with a virial accumulator.
#[derive(Debug, Clone)]
pub struct ForceWithVirial {
    pub force: Vec<RVec>,
    virial: Matrix3<f64>,
    compute_virial: bool,
}

impl ForceWithVirial {
    pub fn new(n_atoms: usize, compute_virial: bool) -> Self {
        Self {
            force: vec![RVec::zeros(); n_atoms],
            virial: Matrix3::zeros(),
            compute_virial,
        }
    }

    pub fn compute_virial(&self) -> bool {
        self.compute_virial
    }

    pub fn virial(&self) -> &Matrix3<f64> {
        &self.virial
    }

    /// Adds a virial contribution.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was created without virial accumulation.
    pub fn add_virial_contribution(&mut self, virial: &Matrix3<f64>) {
        assert!(
            self.compute_virial,
            "virial contribution added to a force buffer created without virial"
        );
        self.virial += virial;
    }

    /// Zeroes forces and virial for the next step.
    pub fn clear(&mut self) {
        self.force.iter_mut().for_each(|f| *f = RVec::zeros());
        self.virial = Matrix3::zeros();
    }
}

/// Energy terms the PME pipeline contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyData {
    /// Reciprocal-space Coulomb energy (kJ/mol)
    pub coulomb_recip: f64,
    /// Linear derivative of the Coulomb energy with respect to lambda
    pub dvdl_lin_coul: f64,
}
