//! Emulated accelerator.
//!
//! Each device owns a worker thread that executes enqueued kernels strictly
//! in order, like a CUDA stream. Kernels run the host implementations on a
//! private thread pool and operate on device-private grids and buffers, so
//! asynchronous launch, polling and event semantics behave as on real
//! hardware.

use super::{DeviceBuffer, DeviceCapabilities, PmeDevice};
use crate::box_setup::ReciprocalBox;
use crate::bspline::InterpolationWeights;
use crate::fft::{FftDirection, Parallel3dFft};
use crate::gather::gather_forces;
use crate::grid::GridArena;
use crate::params::PmeParameters;
use crate::solve::{solve_pme, EnergyAndVirial, GridOrdering, SolveInput};
use crate::spread::spread_charges;
use crate::sync::GpuEventSynchronizer;
use crate::threading::HostThreads;
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use nalgebra::Matrix3;
use parking_lot::{Condvar, Mutex, RwLock};
use prism_core::{PrismError, RVec};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

static STREAM_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Behaviour of emulated devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedDeviceConfig {
    /// Whether streams can be polled; when false, completion checks block
    pub stream_query_supported: bool,
    /// Worker threads executing each kernel
    pub device_threads: usize,
    pub atom_block_size: usize,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            stream_query_supported: true,
            device_threads: 2,
            atom_block_size: 1,
        }
    }
}

/// Blocks kernel execution on every stream of a runtime while held.
#[derive(Clone, Default)]
pub struct StreamGate {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl StreamGate {
    /// Pauses kernel execution until the returned guard is dropped. Kernels
    /// already running finish; queued ones wait.
    pub fn hold(&self) -> StreamHold {
        *self.inner.0.lock() += 1;
        StreamHold { gate: self.clone() }
    }

    fn wait_open(&self) {
        let (holds, cv) = &*self.inner;
        let mut holds = holds.lock();
        while *holds > 0 {
            cv.wait(&mut holds);
        }
    }
}

pub struct StreamHold {
    gate: StreamGate,
}

impl Drop for StreamHold {
    fn drop(&mut self) {
        let (holds, cv) = &*self.gate.inner;
        *holds.lock() -= 1;
        cv.notify_all();
    }
}

type StreamTask = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PendingWork {
    count: Mutex<usize>,
    cv: Condvar,
    failure: Mutex<Option<String>>,
}

impl PendingWork {
    fn complete(&self, failure: Option<String>) {
        if let Some(message) = failure {
            log::error!("❌ Emulated kernel failed: {}", message);
            self.failure.lock().get_or_insert(message);
        }
        let mut count = self.count.lock();
        *count -= 1;
        self.cv.notify_all();
    }

    fn check_failure(&self) -> Result<()> {
        match &*self.failure.lock() {
            Some(message) => Err(PrismError::gpu("emulated stream", message.clone()).into()),
            None => Ok(()),
        }
    }
}

/// In-order execution queue backed by one worker thread.
pub struct EmulatedStream {
    name: String,
    sender: Option<Sender<StreamTask>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<PendingWork>,
}

impl EmulatedStream {
    pub fn new(gate: StreamGate) -> Result<Self> {
        let name = format!("pme-emu-stream-{}", STREAM_COUNTER.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded::<StreamTask>();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for task in receiver {
                    gate.wait_open();
                    task();
                }
            })
            .with_context(|| format!("Failed to spawn {}", name))?;
        log::debug!("Created emulated stream {}", name);
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            pending: Arc::new(PendingWork::default()),
        })
    }

    /// Enqueues a kernel. Errors and panics inside the kernel are recorded
    /// and reported by the next `query` or `synchronize`.
    pub fn enqueue<F>(&self, label: &'static str, kernel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let pending = self.pending.clone();
        *pending.count.lock() += 1;
        let task: StreamTask = Box::new(move || {
            let failure = match panic::catch_unwind(AssertUnwindSafe(kernel)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{}: {:#}", label, e)),
                Err(_) => Some(format!("{}: kernel panicked", label)),
            };
            pending.complete(failure);
        });
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("stream {} is shut down", self.name))?;
        if sender.send(task).is_err() {
            *self.pending.count.lock() -= 1;
            bail!("stream {} worker exited", self.name);
        }
        Ok(())
    }

    pub fn query(&self) -> Result<bool> {
        self.pending.check_failure()?;
        Ok(*self.pending.count.lock() == 0)
    }

    pub fn synchronize(&self) -> Result<()> {
        {
            let mut count = self.pending.count.lock();
            while *count > 0 {
                self.pending.cv.wait(&mut count);
            }
        }
        self.pending.check_failure()
    }
}

impl Drop for EmulatedStream {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Emulated stream {} worker panicked", self.name);
            }
        }
    }
}

/// Device-resident state touched only by kernels.
struct DeviceState {
    params: PmeParameters,
    threads: HostThreads,
    fft: Parallel3dFft,
    grids: GridArena,
    weights: InterpolationWeights,
    charges: Vec<Vec<f64>>,
    reciprocal_box: Option<ReciprocalBox>,
    energy_virial: Vec<EnergyAndVirial>,
    staged_grids: Vec<Vec<f64>>,
    staged_forces: Vec<RVec>,
}

impl DeviceState {
    fn reciprocal_box(&self) -> Result<ReciprocalBox> {
        self.reciprocal_box
            .ok_or_else(|| anyhow!("box was never set on the device"))
    }
}

pub struct EmulatedPmeDevice {
    stream: EmulatedStream,
    state: Arc<Mutex<DeviceState>>,
    capabilities: DeviceCapabilities,
    coordinates: Option<Arc<RwLock<Vec<RVec>>>>,
    forces: Arc<RwLock<Vec<RVec>>>,
    forces_ready: GpuEventSynchronizer,
    spread_done: GpuEventSynchronizer,
}

impl EmulatedPmeDevice {
    pub fn new(params: &PmeParameters, config: &EmulatedDeviceConfig, gate: StreamGate) -> Result<Self> {
        let threads = HostThreads::new(config.device_threads, "pme-emu")?;
        let state = DeviceState {
            params: params.clone(),
            threads,
            fft: Parallel3dFft::new(params.grid_dims),
            grids: GridArena::new(params.grid_dims, params.ngrids),
            weights: InterpolationWeights::new(params.pme_order),
            charges: Vec::new(),
            reciprocal_box: None,
            energy_virial: vec![EnergyAndVirial::default(); params.ngrids],
            staged_grids: Vec::new(),
            staged_forces: Vec::new(),
        };
        log::info!(
            "⚡ Emulated PME device: grid {:?}, order {}, {} grid(s), stream query {}",
            params.grid_dims,
            params.pme_order,
            params.ngrids,
            if config.stream_query_supported { "on" } else { "off" }
        );
        Ok(Self {
            stream: EmulatedStream::new(gate)?,
            state: Arc::new(Mutex::new(state)),
            capabilities: DeviceCapabilities {
                stream_query_supported: config.stream_query_supported,
                atom_block_size: config.atom_block_size.max(1),
            },
            coordinates: None,
            forces: Arc::new(RwLock::new(Vec::new())),
            forces_ready: GpuEventSynchronizer::new(),
            spread_done: GpuEventSynchronizer::new(),
        })
    }
}

impl PmeDevice for EmulatedPmeDevice {
    fn backend_name(&self) -> &'static str {
        "emulated"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn reinit_atoms(&mut self, charges: &[Vec<f64>]) -> Result<()> {
        let charges = charges.to_vec();
        let state = self.state.clone();
        let forces = self.forces.clone();
        self.stream.enqueue("reinit_atoms", move || {
            let n_atoms = charges.first().map_or(0, Vec::len);
            forces.write().resize(n_atoms, RVec::zeros());
            let mut st = state.lock();
            st.charges = charges;
            st.weights.invalidate();
            Ok(())
        })
    }

    fn set_coordinates(&mut self, coordinates: DeviceBuffer) -> Result<()> {
        match coordinates {
            DeviceBuffer::Emulated(data) => {
                self.coordinates = Some(data);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            DeviceBuffer::Cuda(_) => bail!("CUDA coordinate buffer passed to the emulated device"),
        }
    }

    fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    fn update_box(&mut self, scaled_box: &Matrix3<f64>) -> Result<()> {
        let scaled_box = *scaled_box;
        let state = self.state.clone();
        self.stream.enqueue("update_box", move || {
            state.lock().reciprocal_box = Some(ReciprocalBox::from_box(&scaled_box));
            Ok(())
        })
    }

    fn clear_grids(&mut self) -> Result<()> {
        let state = self.state.clone();
        self.stream.enqueue("clear_grids", move || {
            let mut st = state.lock();
            st.grids.clear();
            st.weights.invalidate();
            Ok(())
        })
    }

    fn clear_energy_virial(&mut self) -> Result<()> {
        let state = self.state.clone();
        self.stream.enqueue("clear_energy_virial", move || {
            let mut st = state.lock();
            st.energy_virial.fill(EnergyAndVirial::default());
            Ok(())
        })
    }

    fn launch_spread(
        &mut self,
        coordinates_ready: Option<&GpuEventSynchronizer>,
        copy_grids_to_host: bool,
    ) -> Result<()> {
        let coordinates = self
            .coordinates
            .clone()
            .ok_or_else(|| anyhow!("coordinates were never set on the device"))?;
        let ready = coordinates_ready.cloned();
        let state = self.state.clone();
        let done = self.spread_done.clone();
        done.reset();
        self.stream.enqueue("spline_and_spread", move || {
            if let Some(event) = ready {
                event.wait_for_event();
            }
            let result = (|| -> Result<()> {
                let mut guard = state.lock();
                let st = &mut *guard;
                let recip = st.reciprocal_box()?.recip;
                let x = coordinates.read();
                if x.len() != st.charges.first().map_or(0, Vec::len) {
                    bail!(
                        "{} coordinates for {} charges",
                        x.len(),
                        st.charges.first().map_or(0, Vec::len)
                    );
                }
                spread_charges(&st.threads, &x, &recip, &st.charges, &mut st.weights, &mut st.grids);
                if copy_grids_to_host {
                    st.staged_grids = st.grids.real_grids().to_vec();
                }
                Ok(())
            })();
            done.mark_event();
            result
        })
    }

    fn sync_spread_grids(&mut self, host: &mut GridArena) -> Result<()> {
        self.spread_done.wait_for_event();
        self.stream.pending.check_failure()?;
        let st = self.state.lock();
        if st.staged_grids.len() != host.ngrids() {
            bail!("spread grids were not staged for the host");
        }
        for (g, grid) in st.staged_grids.iter().enumerate() {
            host.real_mut(g).copy_from_slice(grid);
        }
        Ok(())
    }

    fn launch_fft(&mut self, grid_index: usize, direction: FftDirection) -> Result<()> {
        let state = self.state.clone();
        self.stream.enqueue("fft", move || {
            let mut guard = state.lock();
            let st = &mut *guard;
            let (real, complex) = st.grids.pair_mut(grid_index);
            st.fft.execute(&st.threads, direction, real, complex)?;
            Ok(())
        })
    }

    fn launch_solve(
        &mut self,
        grid_index: usize,
        ordering: GridOrdering,
        compute_energy_and_virial: bool,
    ) -> Result<()> {
        let state = self.state.clone();
        self.stream.enqueue("solve", move || {
            let mut guard = state.lock();
            let st = &mut *guard;
            let reciprocal_box = st.reciprocal_box()?;
            let input = SolveInput {
                dims: st.params.grid_dims,
                recip: &reciprocal_box.recip,
                volume: reciprocal_box.volume,
                ewald_coeff: st.params.ewald_coeff,
                elfac: st.params.elfac(),
                bsp_mod: &st.params.bsp_mod,
            };
            let ev = solve_pme(
                &st.threads,
                st.grids.complex_mut(grid_index),
                &input,
                ordering,
                compute_energy_and_virial,
            );
            if compute_energy_and_virial {
                st.energy_virial[grid_index] = ev;
            }
            Ok(())
        })
    }

    fn launch_gather(
        &mut self,
        lambda_q: f64,
        host_grids: Option<&GridArena>,
        copy_forces_to_host: bool,
    ) -> Result<()> {
        let uploaded: Option<Vec<Vec<f64>>> = host_grids.map(|grids| grids.real_grids().to_vec());
        let state = self.state.clone();
        let forces = self.forces.clone();
        let ready = self.forces_ready.clone();
        ready.reset();
        self.stream.enqueue("gather", move || {
            let result = (|| -> Result<()> {
                let mut guard = state.lock();
                let st = &mut *guard;
                if let Some(grids) = uploaded {
                    for (g, grid) in grids.iter().enumerate() {
                        st.grids.real_mut(g).copy_from_slice(grid);
                    }
                }
                let recip = st.reciprocal_box()?.recip;
                let mut f = forces.write();
                f.resize(st.weights.n_atoms(), RVec::zeros());
                gather_forces(
                    &st.threads,
                    &st.weights,
                    st.grids.real_grids(),
                    &st.charges,
                    lambda_q,
                    &recip,
                    &mut f,
                );
                if copy_forces_to_host {
                    st.staged_forces = f.clone();
                }
                Ok(())
            })();
            ready.mark_event();
            result
        })
    }

    fn query(&self) -> Result<bool> {
        self.stream.query()
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    fn energy_and_virial(&mut self) -> Result<Vec<EnergyAndVirial>> {
        Ok(self.state.lock().energy_virial.clone())
    }

    fn host_forces(&mut self) -> Result<Vec<RVec>> {
        Ok(std::mem::take(&mut self.state.lock().staged_forces))
    }

    fn device_forces(&self) -> DeviceBuffer {
        DeviceBuffer::Emulated(self.forces.clone())
    }

    fn forces_ready(&self) -> GpuEventSynchronizer {
        self.forces_ready.clone()
    }
}
