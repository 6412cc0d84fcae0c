//! # prism-core
//!
//! Core types, configuration and errors shared by the PRISM PME pipeline.
//!
//! - **Types**: periodic box, per-step workload flags, force/virial and
//!   energy accumulators owned by the caller
//! - **Config**: [`PmeRunConfig`], loaded from TOML and validated up front
//! - **Errors**: unified error handling with [`PrismError`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  prism-core     │  ← box, workload, config, errors
//! └─────────────────┘
//!         ▲
//!         │
//! ┌───────┴─────────┐
//! │  prism-pme      │  ← spread / FFT / solve / gather, host + accelerator
//! └─────────────────┘
//! ```

pub mod errors;
pub mod runtime_config;
pub mod types;

// Re-export commonly used items
pub use errors::PrismError;
pub use runtime_config::{PmeRunConfig, PmeRunMode, PME_ORDER_MAX, PME_ORDER_MIN};
pub use types::{
    invert_box_matrix, EnergyData, ForceWithVirial, RVec, SimulationBox, StepWorkload, DIM, XX,
    YY, ZZ,
};
