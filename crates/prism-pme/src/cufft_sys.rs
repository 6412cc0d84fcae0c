//! Minimal cuFFT bindings for the PME grid transforms.
//!
//! Only single-precision 3D R2C/C2R plans are needed. Plans are bound to a
//! stream with `cufftSetStream` so transforms are ordered with the kernels.

use std::ffi::c_int;
use std::os::raw::c_void;

pub type CufftHandle = c_int;

/// Single-precision complex value as laid out by cuFFT
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CufftComplex {
    pub x: f32,
    pub y: f32,
}

pub type CufftResult = c_int;

pub const CUFFT_SUCCESS: CufftResult = 0;
pub const CUFFT_INVALID_PLAN: CufftResult = 1;
pub const CUFFT_ALLOC_FAILED: CufftResult = 2;
pub const CUFFT_INVALID_TYPE: CufftResult = 3;
pub const CUFFT_INVALID_VALUE: CufftResult = 4;
pub const CUFFT_INTERNAL_ERROR: CufftResult = 5;
pub const CUFFT_EXEC_FAILED: CufftResult = 6;
pub const CUFFT_SETUP_FAILED: CufftResult = 7;
pub const CUFFT_INVALID_SIZE: CufftResult = 8;
pub const CUFFT_UNALIGNED_DATA: CufftResult = 9;

pub const CUFFT_R2C: c_int = 0x2a;
pub const CUFFT_C2R: c_int = 0x2c;

#[link(name = "cufft")]
extern "C" {
    pub fn cufftPlan3d(plan: *mut CufftHandle, nx: c_int, ny: c_int, nz: c_int, type_: c_int) -> CufftResult;

    pub fn cufftDestroy(plan: CufftHandle) -> CufftResult;

    /// Unnormalized forward transform
    pub fn cufftExecR2C(plan: CufftHandle, idata: *mut f32, odata: *mut CufftComplex) -> CufftResult;

    /// Unnormalized inverse transform; overwrites its input
    pub fn cufftExecC2R(plan: CufftHandle, idata: *mut CufftComplex, odata: *mut f32) -> CufftResult;

    pub fn cufftSetStream(plan: CufftHandle, stream: *mut c_void) -> CufftResult;
}

pub fn cufft_error_string(result: CufftResult) -> &'static str {
    match result {
        CUFFT_SUCCESS => "CUFFT_SUCCESS",
        CUFFT_INVALID_PLAN => "CUFFT_INVALID_PLAN",
        CUFFT_ALLOC_FAILED => "CUFFT_ALLOC_FAILED",
        CUFFT_INVALID_TYPE => "CUFFT_INVALID_TYPE",
        CUFFT_INVALID_VALUE => "CUFFT_INVALID_VALUE",
        CUFFT_INTERNAL_ERROR => "CUFFT_INTERNAL_ERROR",
        CUFFT_EXEC_FAILED => "CUFFT_EXEC_FAILED",
        CUFFT_SETUP_FAILED => "CUFFT_SETUP_FAILED",
        CUFFT_INVALID_SIZE => "CUFFT_INVALID_SIZE",
        CUFFT_UNALIGNED_DATA => "CUFFT_UNALIGNED_DATA",
        _ => "CUFFT_UNKNOWN_ERROR",
    }
}
