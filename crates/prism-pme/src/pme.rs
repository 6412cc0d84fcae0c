//! PME reciprocal-space pipeline
//!
//! One [`Pme`] instance runs, once per MD step:
//! 1. `prepare_computation` - box change detection and reciprocal box
//! 2. `launch_spread` - B-spline weights and charge spreading
//! 3. `launch_complex_transforms` - R2C FFT, reciprocal solve, C2R FFT per grid
//! 4. `launch_gather` - force interpolation
//! 5. `try_finish_task` / `wait_finish_task` / `wait_and_reduce` - completion
//! 6. `reinit_computation` - grid and accumulator reset
//!
//! Where each stage runs is fixed at construction by [`PmeRunMode`]. On the
//! accelerator every `launch_*` call only enqueues work on the instance's
//! stream; the completion calls are the only blocking points.

use crate::box_setup::{BoxScaler, BoxSetup};
use crate::bspline::InterpolationWeights;
use crate::context::SimulationContext;
use crate::device::{DeviceBuffer, PmeDevice};
use crate::fft::{FftDirection, Parallel3dFft};
use crate::gather::gather_forces;
use crate::grid::GridArena;
use crate::output::{combine_energy_virial, reduce_outputs, PmeOutput};
use crate::params::PmeParameters;
use crate::solve::{solve_pme, EnergyAndVirial, GridOrdering, SolveInput};
use crate::spread::spread_charges;
use crate::sync::GpuEventSynchronizer;
use crate::task::PendingStep;
use crate::threading::HostThreads;
use crate::timings::{PmeStage, PmeTimings};
use anyhow::{Context, Result};
use prism_core::{
    EnergyData, ForceWithVirial, PmeRunConfig, PmeRunMode, PrismError, RVec, SimulationBox,
    StepWorkload,
};
use serde::Serialize;
use std::time::Instant;

/// How a completion call waits for accelerator work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuTaskCompletion {
    /// Block until the stream is idle
    Wait,
    /// Poll the stream; falls back to `Wait` when the backend cannot poll
    Check,
}

/// Which stages run on the accelerator. Derived once from the run mode and
/// the device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmeGpuSettings {
    pub perform_gpu_spread: bool,
    pub perform_gpu_fft: bool,
    pub perform_gpu_solve: bool,
    /// Gather is a standalone stage; otherwise it is enqueued right after
    /// the last inverse transform
    pub perform_gpu_gather: bool,
    /// Forces stay on the accelerator for a device-side reduction this step
    pub use_gpu_force_reduction: bool,
    pub stream_query_supported: bool,
}

impl PmeGpuSettings {
    fn new(mode: PmeRunMode, gpu_gather: bool, stream_query_supported: bool) -> Self {
        match mode {
            PmeRunMode::Cpu => Self::default(),
            PmeRunMode::Gpu => Self {
                perform_gpu_spread: true,
                perform_gpu_fft: true,
                perform_gpu_solve: true,
                perform_gpu_gather: gpu_gather,
                use_gpu_force_reduction: false,
                stream_query_supported,
            },
            PmeRunMode::Mixed => Self {
                perform_gpu_spread: true,
                perform_gpu_fft: false,
                perform_gpu_solve: false,
                perform_gpu_gather: gpu_gather,
                use_gpu_force_reduction: false,
                stream_query_supported,
            },
        }
    }
}

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepState {
    Idle,
    Prepared,
    Spread,
    Transformed,
    /// All stages submitted; completion pending
    Launched,
    /// Outputs retrieved without reduction
    Completed,
    /// Outputs retrieved and reduced into the caller's accumulators
    Reduced,
}

/// Counters for step bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PmeStats {
    pub steps_launched: u64,
    /// Steps on which the reciprocal box was recomputed
    pub box_updates: u64,
    pub reductions: u64,
    /// Completion polls that found the stream still busy
    pub completion_polls: u64,
}

pub struct Pme {
    params: PmeParameters,
    mode: PmeRunMode,
    settings: PmeGpuSettings,
    do_coulomb: bool,
    threads: HostThreads,
    fft: Parallel3dFft,
    grids: GridArena,
    weights: InterpolationWeights,
    charges: Vec<Vec<f64>>,
    host_x: Vec<RVec>,
    host_forces: Vec<RVec>,
    host_energy_virial: Vec<EnergyAndVirial>,
    box_setup: BoxSetup,
    device: Option<Box<dyn PmeDevice>>,
    host_ordering: GridOrdering,
    device_ordering: GridOrdering,
    state: StepState,
    step_work: StepWorkload,
    spread_lambda: f64,
    timings: PmeTimings,
    stats: PmeStats,
}

impl Pme {
    /// Builds the pipeline for `config`. Accelerator modes take one stream
    /// from `context`; it is released when the instance is dropped.
    pub fn new(context: &SimulationContext, config: &PmeRunConfig, initial_box: &SimulationBox) -> Result<Self> {
        let params = PmeParameters::from_config(config, initial_box).context("Invalid PME configuration")?;
        let threads = HostThreads::new(params.host_threads, "pme")?;

        let device = if config.run_mode.uses_accelerator() {
            Some(
                context
                    .create_pme_device(&params)
                    .with_context(|| format!("Failed to create PME device on {}", context.description()))?,
            )
        } else {
            None
        };
        let stream_query_supported = device
            .as_ref()
            .map_or(false, |d| d.capabilities().stream_query_supported);
        let settings = PmeGpuSettings::new(config.run_mode, config.gpu_gather, stream_query_supported);

        if device.is_some() && !stream_query_supported {
            log::warn!(
                "⚠️  PME stream query unsupported on {}: try_finish_task(Check) will block like Wait",
                context.description()
            );
        }

        log::info!(
            "⚡ PME {:?}: grid {}×{}×{}, order {}, β={:.5} nm⁻¹, {} grid(s), {} host threads",
            config.run_mode,
            params.grid_dims[0],
            params.grid_dims[1],
            params.grid_dims[2],
            params.pme_order,
            params.ewald_coeff,
            params.ngrids,
            params.host_threads
        );

        Ok(Self {
            fft: Parallel3dFft::new(params.grid_dims),
            grids: GridArena::new(params.grid_dims, params.ngrids),
            weights: InterpolationWeights::new(params.pme_order),
            charges: Vec::new(),
            host_x: Vec::new(),
            host_forces: Vec::new(),
            host_energy_virial: vec![EnergyAndVirial::default(); params.ngrids],
            box_setup: BoxSetup::new(BoxScaler::new(params.wall_ewald_zfac)),
            mode: config.run_mode,
            settings,
            do_coulomb: config.do_coulomb,
            threads,
            device,
            host_ordering: GridOrdering::Yzx,
            device_ordering: GridOrdering::Xyz,
            state: StepState::Idle,
            step_work: StepWorkload::default(),
            spread_lambda: 1.0,
            timings: PmeTimings::default(),
            stats: PmeStats::default(),
            params,
        })
    }

    pub fn params(&self) -> &PmeParameters {
        &self.params
    }

    pub fn run_mode(&self) -> PmeRunMode {
        self.mode
    }

    pub fn settings(&self) -> PmeGpuSettings {
        self.settings
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn is_accelerator_active(&self) -> bool {
        self.device.is_some()
    }

    /// Overrides the solve traversal order used by host and device solves.
    pub fn set_solve_ordering(&mut self, ordering: GridOrdering) {
        self.host_ordering = ordering;
        self.device_ordering = ordering;
    }

    /// Sets the per-grid charges. `charges_b` is required exactly when the
    /// run perturbs Coulomb interactions.
    pub fn reinit_atoms(&mut self, charges_a: &[f64], charges_b: Option<&[f64]>) -> Result<()> {
        assert_eq!(
            charges_b.is_some(),
            self.params.ngrids == 2,
            "B-state charges must be given exactly when free-energy Coulomb is enabled"
        );
        if let Some(b) = charges_b {
            assert_eq!(charges_a.len(), b.len(), "A and B charge counts differ");
        }
        self.charges = std::iter::once(charges_a.to_vec())
            .chain(charges_b.map(<[f64]>::to_vec))
            .collect();
        let n_atoms = charges_a.len();
        self.host_forces = vec![RVec::zeros(); n_atoms];
        self.weights.invalidate();
        if let Some(device) = self.device.as_mut() {
            device.reinit_atoms(&self.charges)?;
        }
        log::debug!("PME atoms reinitialized: {} atoms, {} grid(s)", n_atoms, self.charges.len());
        Ok(())
    }

    pub fn n_atoms(&self) -> usize {
        self.charges.first().map_or(0, Vec::len)
    }

    /// Coordinates for host-side spreading.
    pub fn set_host_coordinates(&mut self, x: &[RVec]) {
        assert!(
            self.device.is_none(),
            "host coordinates are only used when PME runs on the host"
        );
        self.host_x.clear();
        self.host_x.extend_from_slice(x);
    }

    /// Coordinate buffer read by accelerator spreading.
    pub fn set_device_coordinates(&mut self, coordinates: DeviceBuffer) -> Result<()> {
        let device = self
            .device
            .as_mut()
            .expect("device coordinates set but PME accelerator execution is not enabled");
        device.set_coordinates(coordinates)
    }

    /// Per-step setup. `step_work` must request energy and virial together.
    pub fn prepare_computation(&mut self, simulation_box: &SimulationBox, step_work: &StepWorkload) -> Result<()> {
        assert_eq!(self.state, StepState::Idle, "prepare_computation called before reinit_computation");
        // Panics when only one of energy and virial is requested.
        step_work.compute_energy_and_virial();
        assert!(
            !step_work.use_gpu_pme_force_reduction || self.device.is_some(),
            "accelerator force reduction requested for a host-only PME run"
        );

        let start = Instant::now();
        self.step_work = *step_work;
        self.settings.use_gpu_force_reduction = step_work.use_gpu_pme_force_reduction;

        if self.box_setup.observe(simulation_box, step_work.have_dynamic_box) {
            if let Some(device) = self.device.as_mut() {
                device.update_box(&self.box_setup.scaled_box(simulation_box))?;
            }
            if !self.settings.perform_gpu_solve {
                self.box_setup.recompute_host(simulation_box);
            }
            log::trace!("PME box updated (update #{})", self.box_setup.updates());
        }
        self.timings.record(PmeStage::BoxUpdate, start.elapsed());
        self.state = StepState::Prepared;
        Ok(())
    }

    /// Spreads the charges of every grid. On the accelerator the stream waits
    /// for `x_ready` before reading coordinates.
    pub fn launch_spread(&mut self, x_ready: Option<&GpuEventSynchronizer>, lambda_q: f64) -> Result<()> {
        debug_assert!(self.do_coulomb, "PME spreading requires Coulomb interactions");
        assert_eq!(self.state, StepState::Prepared, "launch_spread called out of order");
        assert!((0.0..=1.0).contains(&lambda_q), "lambda_q {} outside [0, 1]", lambda_q);
        assert_eq!(
            self.charges.len(),
            self.params.ngrids,
            "charges for {} grid(s) set, {} expected",
            self.charges.len(),
            self.params.ngrids
        );

        let start = Instant::now();
        self.spread_lambda = lambda_q;
        match self.device.as_mut() {
            Some(device) => {
                // x_ready orders the stream after the producer of the buffer; it
                // does not stand in for the buffer itself.
                assert!(
                    device.has_coordinates(),
                    "accelerator spreading needs a coordinate buffer"
                );
                // Mixed runs transform on the host and need the spread grids back.
                device.launch_spread(x_ready, !self.settings.perform_gpu_fft)?;
            }
            None => {
                if let Some(event) = x_ready {
                    event.wait_for_event();
                }
                assert_eq!(
                    self.host_x.len(),
                    self.n_atoms(),
                    "host coordinates not set for this step"
                );
                let recip = self.host_recip();
                spread_charges(
                    &self.threads,
                    &self.host_x,
                    &recip,
                    &self.charges,
                    &mut self.weights,
                    &mut self.grids,
                );
            }
        }
        self.timings.record(PmeStage::Spread, start.elapsed());
        self.state = StepState::Spread;
        Ok(())
    }

    /// Forward transform, solve and inverse transform for each grid, one grid
    /// after the other.
    pub fn launch_complex_transforms(&mut self, step_work: &StepWorkload) -> Result<()> {
        assert_eq!(self.state, StepState::Spread, "launch_complex_transforms called out of order");
        let compute_ev = step_work.compute_energy_and_virial();

        if let Err(e) = self.transform_grids(compute_ev) {
            if is_backend_failure(&e) {
                log::error!("❌ PME transforms failed in the backend: {:#}", e);
            }
            return Err(e);
        }

        self.state = StepState::Transformed;
        if self.device.is_some() && !self.settings.perform_gpu_gather {
            self.enqueue_device_gather(self.spread_lambda)?;
        }
        Ok(())
    }

    fn transform_grids(&mut self, compute_ev: bool) -> Result<()> {
        if self.settings.perform_gpu_fft {
            let device = self.device.as_mut().expect("accelerator transforms without a device");
            for g in 0..self.params.ngrids {
                device.launch_fft(g, FftDirection::RealToComplex)?;
                device.launch_solve(g, self.device_ordering, compute_ev)?;
                device.launch_fft(g, FftDirection::ComplexToReal)?;
            }
        } else {
            if self.settings.perform_gpu_spread {
                let start = Instant::now();
                let device = self.device.as_mut().expect("mixed mode without a device");
                device.sync_spread_grids(&mut self.grids)?;
                self.timings.record(PmeStage::SpreadSync, start.elapsed());
            }
            for g in 0..self.params.ngrids {
                self.host_grid_transforms(g, compute_ev)
                    .with_context(|| format!("PME reciprocal solve failed on grid {}", g))?;
            }
        }
        Ok(())
    }

    fn host_grid_transforms(&mut self, g: usize, compute_ev: bool) -> Result<()> {
        let start = Instant::now();
        {
            let (real, complex) = self.grids.pair_mut(g);
            self.fft
                .execute(&self.threads, FftDirection::RealToComplex, real, complex)
                .context("forward transform")?;
        }
        self.timings.record(PmeStage::FftRealToComplex, start.elapsed());

        let start = Instant::now();
        let reciprocal_box = *self
            .box_setup
            .host()
            .expect("host reciprocal box missing; prepare_computation not called");
        let input = SolveInput {
            dims: self.params.grid_dims,
            recip: &reciprocal_box.recip,
            volume: reciprocal_box.volume,
            ewald_coeff: self.params.ewald_coeff,
            elfac: self.params.elfac(),
            bsp_mod: &self.params.bsp_mod,
        };
        let ev = solve_pme(
            &self.threads,
            self.grids.complex_mut(g),
            &input,
            self.host_ordering,
            compute_ev,
        );
        if compute_ev {
            self.host_energy_virial[g] = ev;
        }
        self.timings.record(PmeStage::Solve, start.elapsed());

        let start = Instant::now();
        {
            let (real, complex) = self.grids.pair_mut(g);
            self.fft
                .execute(&self.threads, FftDirection::ComplexToReal, real, complex)
                .context("inverse transform")?;
        }
        self.timings.record(PmeStage::FftComplexToReal, start.elapsed());
        Ok(())
    }

    /// Interpolates forces. A no-op for accelerator runs where the gather
    /// was already enqueued with the transforms.
    pub fn launch_gather(&mut self, lambda_q: f64) -> Result<()> {
        assert_eq!(self.state, StepState::Transformed, "launch_gather called out of order");
        assert!((0.0..=1.0).contains(&lambda_q), "lambda_q {} outside [0, 1]", lambda_q);

        if self.device.is_some() {
            if self.settings.perform_gpu_gather {
                self.enqueue_device_gather(lambda_q)?;
            }
        } else {
            let start = Instant::now();
            let recip = self.host_recip();
            gather_forces(
                &self.threads,
                &self.weights,
                self.grids.real_grids(),
                &self.charges,
                lambda_q,
                &recip,
                &mut self.host_forces,
            );
            self.timings.record(PmeStage::Gather, start.elapsed());
        }
        self.state = StepState::Launched;
        self.stats.steps_launched += 1;
        Ok(())
    }

    fn enqueue_device_gather(&mut self, lambda_q: f64) -> Result<()> {
        let start = Instant::now();
        let copy_forces_to_host = !self.settings.use_gpu_force_reduction;
        let host_grids = (!self.settings.perform_gpu_fft).then_some(&self.grids);
        let device = self.device.as_mut().expect("device gather without a device");
        device.launch_gather(lambda_q, host_grids, copy_forces_to_host)?;
        self.timings.record(PmeStage::Gather, start.elapsed());
        Ok(())
    }

    /// Runs every launch stage of one step and returns a handle to its
    /// results.
    pub fn launch_step(
        &mut self,
        simulation_box: &SimulationBox,
        step_work: &StepWorkload,
        x_ready: Option<&GpuEventSynchronizer>,
        lambda_q: f64,
    ) -> Result<PendingStep<'_>> {
        self.prepare_computation(simulation_box, step_work)?;
        self.launch_spread(x_ready, lambda_q)?;
        self.launch_complex_transforms(step_work)?;
        self.launch_gather(lambda_q)?;
        Ok(PendingStep::new(self, *step_work, lambda_q))
    }

    /// Non-blocking completion with reduction.
    ///
    /// With [`GpuTaskCompletion::Check`] the stream is polled and `false` is
    /// returned while work is outstanding; the step stays launched and the
    /// call may be repeated. **When the backend cannot poll its stream,
    /// `Check` blocks exactly like [`GpuTaskCompletion::Wait`].** Once the
    /// work is complete the outputs are reduced into `force_with_virial` and
    /// `enerd` exactly once and `true` is returned.
    ///
    /// Must not be used while forces are reduced on the accelerator.
    pub fn try_finish_task(
        &mut self,
        step_work: &StepWorkload,
        force_with_virial: &mut ForceWithVirial,
        enerd: &mut EnergyData,
        lambda_q: f64,
        completion: GpuTaskCompletion,
    ) -> Result<bool> {
        assert!(
            !self.settings.use_gpu_force_reduction,
            "try_finish_task cannot be used with accelerator force reduction"
        );
        assert_eq!(self.state, StepState::Launched, "try_finish_task called without a launched step");

        if !self.poll_completion(completion)? {
            return Ok(false);
        }
        let compute_ev = step_work.compute_energy_and_virial();
        let output = self.collect_output(compute_ev, lambda_q)?;
        self.reduce(compute_ev, &output, force_with_virial, enerd);
        Ok(true)
    }

    /// Blocks until the step's outputs are available and returns them
    /// without reducing. When forces stay on the accelerator and no energy is
    /// requested there is nothing to wait for and the stream is not
    /// synchronized; consumers of the device forces wait on
    /// [`Pme::forces_ready_synchronizer`].
    pub fn wait_finish_task(&mut self, compute_energy_and_virial: bool, lambda_q: f64) -> Result<PmeOutput> {
        assert_eq!(self.state, StepState::Launched, "wait_finish_task called without a launched step");
        assert_eq!(
            compute_energy_and_virial,
            self.step_work.compute_energy_and_virial(),
            "energy/virial request differs from the one the step was launched with"
        );
        if !(self.settings.use_gpu_force_reduction && !compute_energy_and_virial) {
            self.synchronize()?;
        }
        let output = self.collect_output(compute_energy_and_virial, lambda_q)?;
        self.state = StepState::Completed;
        Ok(output)
    }

    /// Blocking completion followed by the reduction.
    pub fn wait_and_reduce(
        &mut self,
        step_work: &StepWorkload,
        force_with_virial: &mut ForceWithVirial,
        enerd: &mut EnergyData,
        lambda_q: f64,
    ) -> Result<()> {
        let compute_ev = step_work.compute_energy_and_virial();
        let output = self.wait_finish_task(compute_ev, lambda_q)?;
        self.reduce(compute_ev, &output, force_with_virial, enerd);
        Ok(())
    }

    /// Clears grids and energy accumulators. Required between steps.
    pub fn reinit_computation(&mut self) -> Result<()> {
        match self.device.as_mut() {
            Some(device) => {
                device.clear_grids()?;
                device.clear_energy_virial()?;
                if !self.settings.perform_gpu_fft {
                    self.grids.clear();
                }
            }
            None => {
                self.grids.clear();
                self.weights.invalidate();
            }
        }
        self.host_energy_virial.fill(EnergyAndVirial::default());
        self.state = StepState::Idle;
        Ok(())
    }

    /// Returns `true` once all work of the step is done. Only returns
    /// `false` for a `Check` on a backend that can poll.
    pub(crate) fn poll_completion(&mut self, completion: GpuTaskCompletion) -> Result<bool> {
        let Some(device) = self.device.as_ref() else {
            return Ok(true);
        };
        if completion == GpuTaskCompletion::Check && self.settings.stream_query_supported {
            if !device.query()? {
                self.stats.completion_polls += 1;
                return Ok(false);
            }
        }
        self.synchronize()?;
        Ok(true)
    }

    fn synchronize(&mut self) -> Result<()> {
        if let Some(device) = self.device.as_ref() {
            let start = Instant::now();
            device.synchronize().context("PME stream failed")?;
            self.timings.record(PmeStage::WaitGather, start.elapsed());
        }
        Ok(())
    }

    fn collect_output(&mut self, compute_ev: bool, lambda_q: f64) -> Result<PmeOutput> {
        let lambda = if self.params.ngrids > 1 { lambda_q } else { 1.0 };
        let have_force_output = !self.settings.use_gpu_force_reduction;

        let forces = match self.device.as_mut() {
            Some(_) if !have_force_output => Vec::new(),
            Some(device) => device.host_forces()?,
            None => self.host_forces.clone(),
        };
        let mut output = PmeOutput::forces_only(forces, have_force_output);

        if compute_ev {
            let per_grid = match self.device.as_mut() {
                Some(device) if self.settings.perform_gpu_solve => device.energy_and_virial()?,
                _ => self.host_energy_virial.clone(),
            };
            let (energy, virial, dvdl) = combine_energy_virial(&per_grid, lambda);
            output.coulomb_energy = energy;
            output.coulomb_virial = virial;
            output.coulomb_dvdl = dvdl;
        }
        Ok(output)
    }

    /// Reduces `output` into the caller's accumulators and closes the step.
    pub(crate) fn reduce(
        &mut self,
        compute_ev: bool,
        output: &PmeOutput,
        force_with_virial: &mut ForceWithVirial,
        enerd: &mut EnergyData,
    ) {
        assert_eq!(
            self.settings.use_gpu_force_reduction,
            !output.have_force_output,
            "forces must be reduced either on the accelerator or on the host"
        );
        let start = Instant::now();
        reduce_outputs(&self.threads, compute_ev, output, force_with_virial, enerd);
        self.timings.record(PmeStage::Reduction, start.elapsed());
        self.stats.reductions += 1;
        self.state = StepState::Reduced;
        log::debug!(
            "PME step reduced: E_recip = {:.6} kJ/mol (reduction #{})",
            output.coulomb_energy,
            self.stats.reductions
        );
    }

    /// Force buffer written by accelerator gathers.
    pub fn device_forces(&self) -> DeviceBuffer {
        self.device
            .as_ref()
            .expect("device forces requested but PME accelerator execution is not enabled")
            .device_forces()
    }

    /// Marked by the accelerator once this step's forces are in
    /// [`Pme::device_forces`]. `None` for host runs.
    pub fn forces_ready_synchronizer(&self) -> Option<GpuEventSynchronizer> {
        self.device.as_ref().map(|d| d.forces_ready())
    }

    /// Padding granularity of accelerator atom buffers; 0 for host runs.
    pub fn atom_block_size(&self) -> usize {
        self.device.as_ref().map_or(0, |d| d.capabilities().atom_block_size)
    }

    pub fn timings(&self) -> &PmeTimings {
        &self.timings
    }

    pub fn reset_timings(&mut self) {
        self.timings.reset();
    }

    pub fn stats(&self) -> PmeStats {
        PmeStats {
            box_updates: self.box_setup.updates(),
            ..self.stats
        }
    }

    fn host_recip(&self) -> nalgebra::Matrix3<f64> {
        self.box_setup
            .host()
            .expect("host reciprocal box missing; prepare_computation not called")
            .recip
    }
}

/// Whether any error in the chain came from the accelerator or transform backend.
fn is_backend_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<PrismError>())
        .any(PrismError::is_backend_failure)
}

impl Drop for Pme {
    fn drop(&mut self) {
        if let Some(device) = self.device.as_ref() {
            if let Err(e) = device.synchronize() {
                log::error!("❌ PME stream failed during shutdown: {:#}", e);
            }
            log::debug!("🧹 PME {} stream released", device.backend_name());
        }
    }
}
