//! Accelerator backends for the PME stages.
//!
//! A [`PmeDevice`] owns one in-order stream plus the device-resident grids,
//! interpolation weights, energy/virial buffer and force buffer. Every
//! `launch_*` call only enqueues work; results become visible to the host
//! after [`PmeDevice::synchronize`] (or a successful [`PmeDevice::query`]).

pub mod emulated;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::fft::FftDirection;
use crate::grid::GridArena;
use crate::solve::{EnergyAndVirial, GridOrdering};
use crate::sync::GpuEventSynchronizer;
use anyhow::Result;
use nalgebra::Matrix3;
use parking_lot::RwLock;
use prism_core::RVec;
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaSlice;

/// Static properties of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The stream can be polled for completion without blocking
    pub stream_query_supported: bool,
    /// Atom buffers are padded to a multiple of this
    pub atom_block_size: usize,
}

/// Caller-owned per-atom vector buffer resident on the accelerator.
///
/// Coordinates are handed to the pipeline as a `DeviceBuffer`; the pipeline
/// hands its force buffer back the same way. Clones share storage.
#[derive(Clone)]
pub enum DeviceBuffer {
    Emulated(Arc<RwLock<Vec<RVec>>>),
    /// xyz-interleaved single precision
    #[cfg(feature = "cuda")]
    Cuda(Arc<RwLock<CudaSlice<f32>>>),
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceBuffer::Emulated(data) => write!(f, "DeviceBuffer::Emulated({} atoms)", data.read().len()),
            #[cfg(feature = "cuda")]
            DeviceBuffer::Cuda(data) => write!(f, "DeviceBuffer::Cuda({} floats)", data.read().len()),
        }
    }
}

impl DeviceBuffer {
    /// Buffer living in emulated device memory.
    pub fn emulated(data: Vec<RVec>) -> Self {
        DeviceBuffer::Emulated(Arc::new(RwLock::new(data)))
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        match self {
            DeviceBuffer::Emulated(data) => data.read().len(),
            #[cfg(feature = "cuda")]
            DeviceBuffer::Cuda(data) => data.read().len() / 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the contents to the host. Blocks on outstanding device work
    /// touching the buffer.
    pub fn to_host(&self) -> Result<Vec<RVec>> {
        match self {
            DeviceBuffer::Emulated(data) => Ok(data.read().clone()),
            #[cfg(feature = "cuda")]
            DeviceBuffer::Cuda(data) => {
                let slice = data.read();
                let flat = slice.stream().memcpy_dtov(&*slice)?;
                Ok(flat
                    .chunks_exact(3)
                    .map(|v| RVec::new(v[0] as f64, v[1] as f64, v[2] as f64))
                    .collect())
            }
        }
    }

    /// Overwrites the contents from the host.
    pub fn copy_from_host(&self, values: &[RVec]) -> Result<()> {
        match self {
            DeviceBuffer::Emulated(data) => {
                let mut data = data.write();
                data.clear();
                data.extend_from_slice(values);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            DeviceBuffer::Cuda(data) => {
                let mut slice = data.write();
                anyhow::ensure!(
                    slice.len() == values.len() * 3,
                    "device buffer holds {} floats, {} atoms given",
                    slice.len(),
                    values.len()
                );
                let flat: Vec<f32> = values
                    .iter()
                    .flat_map(|v| [v.x as f32, v.y as f32, v.z as f32])
                    .collect();
                let stream = slice.stream().clone();
                stream.memcpy_htod(&flat, &mut *slice)?;
                Ok(())
            }
        }
    }
}

/// One accelerator-side PME instance.
pub trait PmeDevice: Send {
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Uploads charges (one vector per grid) and sizes per-atom buffers.
    fn reinit_atoms(&mut self, charges: &[Vec<f64>]) -> Result<()>;

    fn set_coordinates(&mut self, coordinates: DeviceBuffer) -> Result<()>;

    fn has_coordinates(&self) -> bool;

    /// Stores the scaled box; the reciprocal box is derived on the device
    /// side when the next kernels run.
    fn update_box(&mut self, scaled_box: &Matrix3<f64>) -> Result<()>;

    /// Zeroes grids and marks the interpolation weights stale.
    fn clear_grids(&mut self) -> Result<()>;

    fn clear_energy_virial(&mut self) -> Result<()>;

    /// Computes weights and spreads every grid. The stream first waits for
    /// `coordinates_ready` when given. With `copy_grids_to_host` the real
    /// grids are staged for [`PmeDevice::sync_spread_grids`].
    fn launch_spread(
        &mut self,
        coordinates_ready: Option<&GpuEventSynchronizer>,
        copy_grids_to_host: bool,
    ) -> Result<()>;

    /// Waits for spreading and copies the staged real grids into `host`.
    fn sync_spread_grids(&mut self, host: &mut GridArena) -> Result<()>;

    fn launch_fft(&mut self, grid_index: usize, direction: FftDirection) -> Result<()>;

    fn launch_solve(
        &mut self,
        grid_index: usize,
        ordering: GridOrdering,
        compute_energy_and_virial: bool,
    ) -> Result<()>;

    /// Interpolates forces into the device force buffer and marks
    /// [`PmeDevice::forces_ready`]. `host_grids` are uploaded first when the
    /// potential was computed on the host.
    fn launch_gather(
        &mut self,
        lambda_q: f64,
        host_grids: Option<&GridArena>,
        copy_forces_to_host: bool,
    ) -> Result<()>;

    /// Non-blocking completion check of all enqueued work.
    fn query(&self) -> Result<bool>;

    fn synchronize(&self) -> Result<()>;

    /// Per-grid energy and virial; valid after completion.
    fn energy_and_virial(&mut self) -> Result<Vec<EnergyAndVirial>>;

    /// Forces staged by the last gather; valid after completion.
    fn host_forces(&mut self) -> Result<Vec<RVec>>;

    fn device_forces(&self) -> DeviceBuffer;

    fn forces_ready(&self) -> GpuEventSynchronizer;
}
