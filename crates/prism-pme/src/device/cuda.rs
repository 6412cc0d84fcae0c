//! CUDA PME backend
//!
//! Kernels from `kernels/pme.cu` are compiled with NVRTC when the device is
//! created. Transforms use cuFFT plans bound to the instance's own stream, so
//! every stage of a step is ordered on that stream and the host only blocks
//! in `synchronize` and the explicit download calls.
//!
//! Data on the device is single precision; energy and virial are accumulated
//! in double precision.

use super::{DeviceBuffer, DeviceCapabilities, PmeDevice};
use crate::box_setup::ReciprocalBox;
use crate::cufft_sys::{
    cufftDestroy, cufftExecC2R, cufftExecR2C, cufftPlan3d, cufftSetStream, cufft_error_string,
    CufftComplex, CufftHandle, CUFFT_C2R, CUFFT_R2C, CUFFT_SUCCESS,
};
use crate::fft::FftDirection;
use crate::grid::GridArena;
use crate::output::lambda_weights;
use crate::params::PmeParameters;
use crate::solve::{EnergyAndVirial, GridOrdering};
use crate::sync::GpuEventSynchronizer;
use anyhow::{anyhow, bail, Context, Result};
use cudarc::driver::{
    sys, CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, DevicePtrMut, LaunchConfig,
    PushKernelArg,
};
use nalgebra::Matrix3;
use parking_lot::RwLock;
use prism_core::{PrismError, RVec};
use std::os::raw::c_void;
use std::sync::Arc;

/// Threads per block for all PME kernels
const BLOCK_SIZE: usize = 128;

/// Energy plus six virial components per grid
const EV_COMPONENTS: usize = 7;

fn launch_config(n: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (n.max(1).div_ceil(BLOCK_SIZE) as u32, 1, 1),
        block_dim: (BLOCK_SIZE as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

pub struct CudaPmeDevice {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    _module: Arc<CudaModule>,

    spread_kernel: CudaFunction,
    solve_kernel: CudaFunction,
    gather_kernel: CudaFunction,
    zero_float_kernel: CudaFunction,
    zero_double_kernel: CudaFunction,

    fft_plan_r2c: CufftHandle,
    fft_plan_c2r: CufftHandle,

    grid_dims: [usize; 3],
    order: usize,
    ngrids: usize,
    ewald_coeff: f32,
    elfac: f32,
    volume: Option<f32>,

    // Device buffers
    d_real_grids: CudaSlice<f32>,    // [ngrids * nx * ny * nz]
    d_complex_grids: CudaSlice<f32>, // [ngrids * nx * ny * (nz/2+1) * 2] interleaved
    d_recip: CudaSlice<f32>,         // [9] row-major
    d_bsp_mod: [CudaSlice<f32>; 3],
    d_energy_virial: CudaSlice<f64>, // [ngrids * 7]
    d_charges: CudaSlice<f32>,       // [ngrids * n_atoms]
    d_spline_index: CudaSlice<i32>,  // [n_atoms * 3]
    d_theta: CudaSlice<f32>,         // [n_atoms * 3 * order]
    d_dtheta: CudaSlice<f32>,

    n_atoms: usize,
    coordinates: Option<Arc<RwLock<CudaSlice<f32>>>>,
    forces: Arc<RwLock<CudaSlice<f32>>>,
    forces_ready: GpuEventSynchronizer,
    grids_staged: bool,
    forces_staged: bool,
}

impl CudaPmeDevice {
    pub fn new(context: Arc<CudaContext>, params: &PmeParameters) -> Result<Self> {
        let stream = context.new_stream().context("Failed to create PME stream")?;

        let kernel_source = include_str!("../kernels/pme.cu");
        let ptx = cudarc::nvrtc::compile_ptx_with_opts(
            kernel_source,
            cudarc::nvrtc::CompileOptions {
                include_paths: vec![],
                // Double-precision atomicAdd in pme_solve
                arch: Some("compute_60"),
                fmad: Some(true),
                ..Default::default()
            },
        )
        .context("Failed to compile pme.cu")?;
        let module = context.load_module(ptx)?;

        let spread_kernel = module
            .load_function("pme_spline_and_spread")
            .context("Failed to load pme_spline_and_spread")?;
        let solve_kernel = module
            .load_function("pme_solve")
            .context("Failed to load pme_solve")?;
        let gather_kernel = module
            .load_function("pme_gather")
            .context("Failed to load pme_gather")?;
        let zero_float_kernel = module
            .load_function("pme_zero_float")
            .context("Failed to load pme_zero_float")?;
        let zero_double_kernel = module
            .load_function("pme_zero_double")
            .context("Failed to load pme_zero_double")?;

        let [nx, ny, nz] = params.grid_dims;
        let real_size = params.ngrids * params.real_grid_len();
        let complex_size = params.ngrids * params.complex_grid_len() * 2;

        let d_real_grids = stream.alloc_zeros::<f32>(real_size)?;
        let d_complex_grids = stream.alloc_zeros::<f32>(complex_size)?;
        let d_recip = stream.alloc_zeros::<f32>(9)?;
        let d_energy_virial = stream.alloc_zeros::<f64>(params.ngrids * EV_COMPONENTS)?;

        let upload_moduli = |moduli: &[f64]| -> Result<CudaSlice<f32>> {
            let host: Vec<f32> = moduli.iter().map(|&v| v as f32).collect();
            let mut d = stream.alloc_zeros::<f32>(host.len())?;
            stream.memcpy_htod(&host, &mut d)?;
            Ok(d)
        };
        let d_bsp_mod = [
            upload_moduli(&params.bsp_mod[0])?,
            upload_moduli(&params.bsp_mod[1])?,
            upload_moduli(&params.bsp_mod[2])?,
        ];

        let (fft_plan_r2c, fft_plan_c2r) =
            create_fft_plans(nx, ny, nz, &stream).context("Failed to create cuFFT plans")?;

        let d_charges = stream.alloc_zeros::<f32>(params.ngrids)?;
        let d_spline_index = stream.alloc_zeros::<i32>(3)?;
        let d_theta = stream.alloc_zeros::<f32>(3 * params.pme_order)?;
        let d_dtheta = stream.alloc_zeros::<f32>(3 * params.pme_order)?;
        let forces = stream.alloc_zeros::<f32>(3)?;

        log::info!(
            "⚡ CUDA PME device: grid {}×{}×{}, order {}, {} grid(s)",
            nx,
            ny,
            nz,
            params.pme_order,
            params.ngrids
        );

        Ok(Self {
            context,
            stream,
            _module: module,
            spread_kernel,
            solve_kernel,
            gather_kernel,
            zero_float_kernel,
            zero_double_kernel,
            fft_plan_r2c,
            fft_plan_c2r,
            grid_dims: params.grid_dims,
            order: params.pme_order,
            ngrids: params.ngrids,
            ewald_coeff: params.ewald_coeff as f32,
            elfac: params.elfac() as f32,
            volume: None,
            d_real_grids,
            d_complex_grids,
            d_recip,
            d_bsp_mod,
            d_energy_virial,
            d_charges,
            d_spline_index,
            d_theta,
            d_dtheta,
            n_atoms: 0,
            coordinates: None,
            forces: Arc::new(RwLock::new(forces)),
            forces_ready: GpuEventSynchronizer::new(),
            grids_staged: false,
            forces_staged: false,
        })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    fn real_grid_len(&self) -> usize {
        self.grid_dims.iter().product()
    }

    fn complex_grid_len(&self) -> usize {
        self.grid_dims[0] * self.grid_dims[1] * (self.grid_dims[2] / 2 + 1)
    }
}

impl PmeDevice for CudaPmeDevice {
    fn backend_name(&self) -> &'static str {
        "cuda"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            stream_query_supported: true,
            atom_block_size: 1,
        }
    }

    fn reinit_atoms(&mut self, charges: &[Vec<f64>]) -> Result<()> {
        let n_atoms = charges.first().map_or(0, Vec::len);
        let flat: Vec<f32> = charges.iter().flatten().map(|&q| q as f32).collect();

        self.d_charges = self.stream.alloc_zeros::<f32>(flat.len().max(1))?;
        if !flat.is_empty() {
            self.stream.memcpy_htod(&flat, &mut self.d_charges)?;
        }
        let n = n_atoms.max(1);
        self.d_spline_index = self.stream.alloc_zeros::<i32>(3 * n)?;
        self.d_theta = self.stream.alloc_zeros::<f32>(3 * n * self.order)?;
        self.d_dtheta = self.stream.alloc_zeros::<f32>(3 * n * self.order)?;
        *self.forces.write() = self.stream.alloc_zeros::<f32>(3 * n)?;
        self.n_atoms = n_atoms;
        Ok(())
    }

    fn set_coordinates(&mut self, coordinates: DeviceBuffer) -> Result<()> {
        match coordinates {
            DeviceBuffer::Cuda(data) => {
                self.coordinates = Some(data);
                Ok(())
            }
            DeviceBuffer::Emulated(_) => bail!("emulated coordinate buffer passed to the CUDA device"),
        }
    }

    fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    fn update_box(&mut self, scaled_box: &Matrix3<f64>) -> Result<()> {
        let reciprocal_box = ReciprocalBox::from_box(scaled_box);
        let r = reciprocal_box.recip;
        let host: Vec<f32> = (0..3)
            .flat_map(|c| (0..3).map(move |d| r[(c, d)] as f32))
            .collect();
        self.stream.memcpy_htod(&host, &mut self.d_recip)?;
        self.volume = Some(reciprocal_box.volume as f32);
        Ok(())
    }

    fn clear_grids(&mut self) -> Result<()> {
        zero_floats(&self.stream, &self.zero_float_kernel, &mut self.d_real_grids)?;
        zero_floats(&self.stream, &self.zero_float_kernel, &mut self.d_complex_grids)?;
        self.grids_staged = false;
        Ok(())
    }

    fn clear_energy_virial(&mut self) -> Result<()> {
        let n = self.d_energy_virial.len() as i32;
        unsafe {
            let mut builder = self.stream.launch_builder(&self.zero_double_kernel);
            builder.arg(&mut self.d_energy_virial);
            builder.arg(&n);
            builder.launch(launch_config(n as usize))?;
        }
        Ok(())
    }

    fn launch_spread(
        &mut self,
        coordinates_ready: Option<&GpuEventSynchronizer>,
        copy_grids_to_host: bool,
    ) -> Result<()> {
        if let Some(event) = coordinates_ready {
            event.enqueue_wait(&self.stream)?;
        }
        let coordinates = self
            .coordinates
            .clone()
            .ok_or_else(|| anyhow!("coordinates were never set on the device"))?;
        let x = coordinates.read();
        if x.len() != 3 * self.n_atoms {
            bail!("{} coordinate floats for {} atoms", x.len(), self.n_atoms);
        }

        let n_atoms = self.n_atoms as i32;
        let ngrids = self.ngrids as i32;
        let order = self.order as i32;
        let [nx, ny, nz] = self.grid_dims.map(|n| n as i32);

        unsafe {
            let mut builder = self.stream.launch_builder(&self.spread_kernel);
            builder.arg(&*x);
            builder.arg(&self.d_charges);
            builder.arg(&self.d_recip);
            builder.arg(&mut self.d_real_grids);
            builder.arg(&mut self.d_spline_index);
            builder.arg(&mut self.d_theta);
            builder.arg(&mut self.d_dtheta);
            builder.arg(&n_atoms);
            builder.arg(&ngrids);
            builder.arg(&order);
            builder.arg(&nx);
            builder.arg(&ny);
            builder.arg(&nz);
            builder.launch(launch_config(self.n_atoms))?;
        }
        self.grids_staged = copy_grids_to_host;
        Ok(())
    }

    fn sync_spread_grids(&mut self, host: &mut GridArena) -> Result<()> {
        if !self.grids_staged {
            bail!("spread grids were not staged for the host");
        }
        self.stream.synchronize()?;
        let flat = self.stream.memcpy_dtov(&self.d_real_grids)?;
        let n_real = self.real_grid_len();
        for (g, chunk) in flat.chunks_exact(n_real).enumerate().take(host.ngrids()) {
            for (dst, &src) in host.real_mut(g).iter_mut().zip(chunk) {
                *dst = src as f64;
            }
        }
        Ok(())
    }

    fn launch_fft(&mut self, grid_index: usize, direction: FftDirection) -> Result<()> {
        let real_offset = grid_index * self.real_grid_len() * std::mem::size_of::<f32>();
        let complex_offset = grid_index * self.complex_grid_len() * std::mem::size_of::<CufftComplex>();
        let (real_ptr, _sync_real) = self.d_real_grids.device_ptr_mut(&self.stream);
        let (complex_ptr, _sync_complex) = self.d_complex_grids.device_ptr_mut(&self.stream);
        let real_ptr = (real_ptr + real_offset as u64) as *mut f32;
        let complex_ptr = (complex_ptr + complex_offset as u64) as *mut CufftComplex;

        let (result, name) = unsafe {
            match direction {
                FftDirection::RealToComplex => (cufftExecR2C(self.fft_plan_r2c, real_ptr, complex_ptr), "cufftExecR2C"),
                FftDirection::ComplexToReal => (cufftExecC2R(self.fft_plan_c2r, complex_ptr, real_ptr), "cufftExecC2R"),
            }
        };
        if result != CUFFT_SUCCESS {
            return Err(PrismError::fft(
                format!("{} on grid {}", name, grid_index),
                cufft_error_string(result),
            )
            .into());
        }
        Ok(())
    }

    fn launch_solve(
        &mut self,
        grid_index: usize,
        ordering: GridOrdering,
        compute_energy_and_virial: bool,
    ) -> Result<()> {
        let volume = self
            .volume
            .ok_or_else(|| anyhow!("box was never set on the device"))?;
        let n_complex = self.complex_grid_len();
        let [nx, ny, nz] = self.grid_dims.map(|n| n as i32);
        let yzx = i32::from(ordering == GridOrdering::Yzx);
        let compute_ev = i32::from(compute_energy_and_virial);

        let mut grid = self
            .d_complex_grids
            .slice_mut(grid_index * n_complex * 2..(grid_index + 1) * n_complex * 2);
        let mut energy_virial = self
            .d_energy_virial
            .slice_mut(grid_index * EV_COMPONENTS..(grid_index + 1) * EV_COMPONENTS);

        unsafe {
            let mut builder = self.stream.launch_builder(&self.solve_kernel);
            builder.arg(&mut grid);
            builder.arg(&self.d_recip);
            builder.arg(&self.d_bsp_mod[0]);
            builder.arg(&self.d_bsp_mod[1]);
            builder.arg(&self.d_bsp_mod[2]);
            builder.arg(&mut energy_virial);
            builder.arg(&volume);
            builder.arg(&self.ewald_coeff);
            builder.arg(&self.elfac);
            builder.arg(&nx);
            builder.arg(&ny);
            builder.arg(&nz);
            builder.arg(&yzx);
            builder.arg(&compute_ev);
            builder.launch(launch_config(n_complex))?;
        }
        Ok(())
    }

    fn launch_gather(
        &mut self,
        lambda_q: f64,
        host_grids: Option<&GridArena>,
        copy_forces_to_host: bool,
    ) -> Result<()> {
        if let Some(grids) = host_grids {
            let flat: Vec<f32> = grids
                .real_grids()
                .iter()
                .flatten()
                .map(|&v| v as f32)
                .collect();
            self.stream.memcpy_htod(&flat, &mut self.d_real_grids)?;
        }

        let scales = lambda_weights(self.ngrids, lambda_q).map(|s| s as f32);
        let n_atoms = self.n_atoms as i32;
        let ngrids = self.ngrids as i32;
        let order = self.order as i32;
        let [nx, ny, nz] = self.grid_dims.map(|n| n as i32);

        self.forces_ready.reset();
        {
            let mut forces = self.forces.write();
            unsafe {
                let mut builder = self.stream.launch_builder(&self.gather_kernel);
                builder.arg(&self.d_real_grids);
                builder.arg(&self.d_charges);
                builder.arg(&self.d_spline_index);
                builder.arg(&self.d_theta);
                builder.arg(&self.d_dtheta);
                builder.arg(&self.d_recip);
                builder.arg(&mut *forces);
                builder.arg(&scales[0]);
                builder.arg(&scales[1]);
                builder.arg(&n_atoms);
                builder.arg(&ngrids);
                builder.arg(&order);
                builder.arg(&nx);
                builder.arg(&ny);
                builder.arg(&nz);
                builder.launch(launch_config(self.n_atoms))?;
            }
        }
        self.forces_ready.mark_on_stream(&self.stream)?;
        self.forces_staged = copy_forces_to_host;
        Ok(())
    }

    fn query(&self) -> Result<bool> {
        let status = unsafe { sys::cuStreamQuery(self.stream.cu_stream()) };
        match status {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            other => Err(PrismError::gpu("cuStreamQuery", format!("{:?}", other)).into()),
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()?;
        Ok(())
    }

    fn energy_and_virial(&mut self) -> Result<Vec<EnergyAndVirial>> {
        let raw = self.stream.memcpy_dtov(&self.d_energy_virial)?;
        Ok(raw
            .chunks_exact(EV_COMPONENTS)
            .map(|c| EnergyAndVirial {
                energy: 0.5 * c[0],
                virial: Matrix3::new(
                    c[1], c[4], c[5], //
                    c[4], c[2], c[6], //
                    c[5], c[6], c[3],
                ) * 0.25,
            })
            .collect())
    }

    fn host_forces(&mut self) -> Result<Vec<RVec>> {
        if !self.forces_staged {
            bail!("forces were left on the device for accelerator-side reduction");
        }
        let forces = self.forces.read();
        let flat = self.stream.memcpy_dtov(&*forces)?;
        Ok(flat
            .chunks_exact(3)
            .take(self.n_atoms)
            .map(|f| RVec::new(f[0] as f64, f[1] as f64, f[2] as f64))
            .collect())
    }

    fn device_forces(&self) -> DeviceBuffer {
        DeviceBuffer::Cuda(self.forces.clone())
    }

    fn forces_ready(&self) -> GpuEventSynchronizer {
        self.forces_ready.clone()
    }
}

impl Drop for CudaPmeDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stream.synchronize() {
            log::error!("❌ PME stream synchronization failed on drop: {:?}", e);
        }
        unsafe {
            cufftDestroy(self.fft_plan_r2c);
            cufftDestroy(self.fft_plan_c2r);
        }
        log::debug!("🧹 PME cuFFT plans destroyed");
    }
}

fn zero_floats(stream: &CudaStream, kernel: &CudaFunction, buffer: &mut CudaSlice<f32>) -> Result<()> {
    let n = buffer.len() as i32;
    unsafe {
        let mut builder = stream.launch_builder(kernel);
        builder.arg(buffer);
        builder.arg(&n);
        builder.launch(launch_config(n as usize))?;
    }
    Ok(())
}

/// Creates R2C and C2R plans bound to `stream`.
fn create_fft_plans(nx: usize, ny: usize, nz: usize, stream: &CudaStream) -> Result<(CufftHandle, CufftHandle)> {
    let mut plan_r2c: CufftHandle = 0;
    let mut plan_c2r: CufftHandle = 0;

    unsafe {
        let result = cufftPlan3d(&mut plan_r2c, nx as i32, ny as i32, nz as i32, CUFFT_R2C);
        if result != CUFFT_SUCCESS {
            return Err(PrismError::fft("cufftPlan3d R2C", cufft_error_string(result)).into());
        }

        let result = cufftPlan3d(&mut plan_c2r, nx as i32, ny as i32, nz as i32, CUFFT_C2R);
        if result != CUFFT_SUCCESS {
            cufftDestroy(plan_r2c);
            return Err(PrismError::fft("cufftPlan3d C2R", cufft_error_string(result)).into());
        }

        let raw_stream = stream.cu_stream() as *mut c_void;
        for plan in [plan_r2c, plan_c2r] {
            let result = cufftSetStream(plan, raw_stream);
            if result != CUFFT_SUCCESS {
                cufftDestroy(plan_r2c);
                cufftDestroy(plan_c2r);
                return Err(PrismError::fft("cufftSetStream", cufft_error_string(result)).into());
            }
        }
    }

    Ok((plan_r2c, plan_c2r))
}
