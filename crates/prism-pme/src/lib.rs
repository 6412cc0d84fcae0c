//! # prism-pme
//!
//! Particle-mesh Ewald reciprocal-space electrostatics.
//!
//! Spread → R2C FFT → solve → C2R FFT → gather, with each stage on the host
//! thread pool or on an accelerator stream ([`PmeRunMode`]). A step is
//! launched stage by stage and finished through the completion controller on
//! [`Pme`], or through the [`PendingStep`] handle from [`Pme::launch_step`].
//!
//! Accelerator backends:
//! - emulated stream (always available; used by the tests)
//! - CUDA with cuFFT (`cuda` feature)

pub mod box_setup;
pub mod bspline;
pub mod context;
pub mod device;
pub mod ewald;
pub mod fft;
pub mod gather;
pub mod grid;
pub mod output;
pub mod params;
pub mod pme;
pub mod reference;
pub mod solve;
pub mod spread;
pub mod sync;
pub mod task;
pub mod threading;
pub mod timings;

#[cfg(feature = "cuda")]
pub mod cufft_sys;

pub use box_setup::{BoxScaler, BoxSetup, ReciprocalBox};
pub use context::SimulationContext;
pub use device::emulated::{EmulatedDeviceConfig, StreamHold};
pub use device::{DeviceBuffer, DeviceCapabilities, PmeDevice};
pub use ewald::{compute_ewald_beta, round_up_fft_size, ONE_4PI_EPS0};
pub use fft::{FftDirection, Parallel3dFft};
pub use output::PmeOutput;
pub use params::PmeParameters;
pub use pme::{GpuTaskCompletion, Pme, PmeGpuSettings, PmeStats, StepState};
pub use reference::{ewald_reciprocal_reference, EwaldReference};
pub use solve::{EnergyAndVirial, GridOrdering};
pub use sync::GpuEventSynchronizer;
pub use task::{PendingStep, StepPoll};
pub use threading::HostThreads;
pub use timings::{PmeStage, PmeTimings, StageTiming};

pub use prism_core::{PmeRunConfig, PmeRunMode};

#[cfg(feature = "cuda")]
pub use device::cuda::CudaPmeDevice;
