//! Ewald parameters: splitting coefficient, grid sizing and unit constants.

use prism_core::{PrismError, SimulationBox, DIM};
use statrs::function::erf::erfc;

/// Coulomb conversion factor 1/(4 pi eps0) in kJ mol^-1 nm e^-2.
pub const ONE_4PI_EPS0: f64 = 138.935_458;

/// Smallest grid dimension `round_up_fft_size` will return.
const MIN_FFT_SIZE: usize = 8;

/// Compute the Ewald splitting parameter beta from the cutoff and tolerance.
///
/// Finds beta such that `erfc(beta * cutoff) = tolerance` by doubling to
/// bracket the root and then bisecting.
pub fn compute_ewald_beta(cutoff: f64, tolerance: f64) -> f64 {
    debug_assert!(cutoff > 0.0, "Cutoff must be positive");
    debug_assert!(tolerance > 0.0 && tolerance < 1.0, "Tolerance must be in (0, 1)");

    let mut beta = 5.0;
    let mut doublings = 0;
    loop {
        doublings += 1;
        beta *= 2.0;
        if erfc(beta * cutoff) <= tolerance {
            break;
        }
    }

    let mut low = 0.0;
    let mut high = beta;
    for _ in 0..doublings + 60 {
        beta = (low + high) / 2.0;
        if erfc(beta * cutoff) > tolerance {
            low = beta;
        } else {
            high = beta;
        }
    }
    beta
}

/// Smallest size >= n whose prime factors are all 2, 3 or 5.
pub fn round_up_fft_size(n: usize) -> usize {
    let mut size = n.max(MIN_FFT_SIZE);
    while !has_small_factors(size) {
        size += 1;
    }
    size
}

fn has_small_factors(mut n: usize) -> bool {
    for p in [2, 3, 5] {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

/// Grid dimensions with spacing no larger than `spacing` along each box vector.
pub fn grid_dims_for_spacing(simulation_box: &SimulationBox, spacing: f64) -> [usize; 3] {
    let mut dims = [0; DIM];
    for (d, dim) in dims.iter_mut().enumerate() {
        let length = simulation_box.vector(d).norm();
        *dim = round_up_fft_size((length / spacing).ceil() as usize);
    }
    dims
}

/// Validate grid dimensions against the interpolation order.
pub fn check_grid_dims(dims: [usize; 3], order: usize) -> Result<(), PrismError> {
    let min = 2 * (order - 1);
    if dims.iter().any(|&n| n < min) {
        return Err(PrismError::config(format!(
            "PME grid {:?} needs every dimension >= 2*(pme_order-1) = {}",
            dims, min
        )));
    }
    Ok(())
}
