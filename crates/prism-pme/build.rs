//! Build script for prism-pme
//!
//! PME kernels are compiled at runtime with NVRTC, so the build only has to
//! make cuFFT linkable when the `cuda` feature is enabled.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/kernels/");
    println!("cargo:rerun-if-env-changed=CUDA_HOME");

    if env::var("CARGO_FEATURE_CUDA").is_err() {
        return;
    }

    if let Some(lib_dir) = find_cuda_lib_dir() {
        println!("cargo:rustc-link-search=native={}", lib_dir.display());
    } else {
        println!("cargo:warning=CUDA library directory not found; relying on the system linker path");
    }
    println!("cargo:rustc-link-lib=cufft");
}

/// Finds the CUDA library directory via CUDA_HOME or common install paths
fn find_cuda_lib_dir() -> Option<PathBuf> {
    if let Ok(cuda_home) = env::var("CUDA_HOME") {
        let lib_dir = PathBuf::from(cuda_home).join("lib64");
        if lib_dir.exists() {
            return Some(lib_dir);
        }
    }

    ["/usr/local/cuda/lib64", "/usr/local/cuda-12/lib64", "/opt/cuda/lib64"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}
