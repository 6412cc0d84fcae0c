//! Simulation-wide accelerator session.
//!
//! A [`SimulationContext`] owns the accelerator runtime for the lifetime of a
//! run and hands out one [`PmeDevice`] (one stream) per PME instance. Devices
//! release their streams when the owning PME instance is dropped; the
//! runtime itself goes away with the context.

use crate::device::emulated::{EmulatedDeviceConfig, EmulatedPmeDevice, StreamGate, StreamHold};
use crate::device::PmeDevice;
use crate::params::PmeParameters;
use anyhow::{bail, Result};

#[cfg(feature = "cuda")]
use anyhow::Context as _;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaContext;
#[cfg(feature = "cuda")]
use std::sync::Arc;

enum AcceleratorRuntime {
    HostOnly,
    Emulated {
        config: EmulatedDeviceConfig,
        gate: StreamGate,
    },
    #[cfg(feature = "cuda")]
    Cuda {
        context: Arc<CudaContext>,
        device_id: usize,
    },
}

pub struct SimulationContext {
    runtime: AcceleratorRuntime,
}

impl SimulationContext {
    /// Session without an accelerator; only `PmeRunMode::Cpu` can run.
    pub fn host_only() -> Self {
        Self {
            runtime: AcceleratorRuntime::HostOnly,
        }
    }

    /// Session backed by the emulated accelerator.
    pub fn emulated(config: EmulatedDeviceConfig) -> Self {
        log::info!(
            "Emulated accelerator session ({} device threads, stream query {})",
            config.device_threads,
            config.stream_query_supported
        );
        Self {
            runtime: AcceleratorRuntime::Emulated {
                config,
                gate: StreamGate::default(),
            },
        }
    }

    /// Session on CUDA device `device_id`.
    #[cfg(feature = "cuda")]
    pub fn cuda(device_id: usize) -> Result<Self> {
        let context = CudaContext::new(device_id)
            .with_context(|| format!("Failed to initialize CUDA device {}", device_id))?;
        log::info!("CUDA device {} initialized for PME", device_id);
        Ok(Self {
            runtime: AcceleratorRuntime::Cuda { context, device_id },
        })
    }

    /// Check if a CUDA device can be opened.
    #[cfg(feature = "cuda")]
    pub fn is_cuda_available() -> bool {
        match CudaContext::new(0) {
            Ok(_) => {
                log::debug!("GPU detected and available");
                true
            }
            Err(e) => {
                log::debug!("GPU not available: {}", e);
                false
            }
        }
    }

    pub fn has_accelerator(&self) -> bool {
        !matches!(self.runtime, AcceleratorRuntime::HostOnly)
    }

    pub fn description(&self) -> String {
        match &self.runtime {
            AcceleratorRuntime::HostOnly => "host only".to_string(),
            AcceleratorRuntime::Emulated { config, .. } => {
                format!("emulated accelerator ({} threads)", config.device_threads)
            }
            #[cfg(feature = "cuda")]
            AcceleratorRuntime::Cuda { device_id, .. } => format!("CUDA device {}", device_id),
        }
    }

    /// Pauses kernel execution on every emulated stream of this session
    /// until the guard is dropped. `None` for other runtimes.
    pub fn hold_streams(&self) -> Option<StreamHold> {
        match &self.runtime {
            AcceleratorRuntime::Emulated { gate, .. } => Some(gate.hold()),
            _ => None,
        }
    }

    /// Creates the accelerator side of one PME instance.
    pub(crate) fn create_pme_device(&self, params: &PmeParameters) -> Result<Box<dyn PmeDevice>> {
        match &self.runtime {
            AcceleratorRuntime::HostOnly => {
                bail!("PME accelerator execution requested but the session has no accelerator")
            }
            AcceleratorRuntime::Emulated { config, gate } => {
                Ok(Box::new(EmulatedPmeDevice::new(params, config, gate.clone())?))
            }
            #[cfg(feature = "cuda")]
            AcceleratorRuntime::Cuda { context, .. } => Ok(Box::new(
                crate::device::cuda::CudaPmeDevice::new(context.clone(), params)?,
            )),
        }
    }
}
