//! PME Validation Tests
//!
//! Checks the mesh pipeline against the direct reciprocal Ewald sum and
//! against itself across run modes:
//! 1. Energy, forces and virial versus the explicit lattice sum
//! 2. Virial trace versus the energy derivative under uniform scaling
//! 3. Free-energy grid blending
//! 4. Agreement between host, emulated accelerator and mixed execution
//!
//! Run with: cargo test -p prism-pme --test pme_validation

use prism_core::{EnergyData, ForceWithVirial, RVec, SimulationBox, StepWorkload};
use prism_pme::{
    ewald_reciprocal_reference, DeviceBuffer, EmulatedDeviceConfig, GpuTaskCompletion, Pme, PmeOutput,
    PmeRunConfig, PmeRunMode, SimulationContext,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BETA: f64 = 3.0;

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Neutral system of alternating ±`q` charges at random positions.
fn random_system(n: usize, box_len: f64, q: f64, seed: u64) -> (Vec<RVec>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = (0..n)
        .map(|_| {
            RVec::new(
                rng.gen_range(0.0..box_len),
                rng.gen_range(0.0..box_len),
                rng.gen_range(0.0..box_len),
            )
        })
        .collect();
    let charges = (0..n).map(|i| if i % 2 == 0 { q } else { -q }).collect();
    (x, charges)
}

fn config(mode: PmeRunMode, grid: usize, order: usize) -> PmeRunConfig {
    PmeRunConfig {
        run_mode: mode,
        grid: Some([grid; 3]),
        pme_order: order,
        ewald_coefficient: Some(BETA),
        host_threads: 2,
        ..PmeRunConfig::default()
    }
}

fn context_for(mode: PmeRunMode) -> SimulationContext {
    match mode {
        PmeRunMode::Cpu => SimulationContext::host_only(),
        _ => SimulationContext::emulated(EmulatedDeviceConfig::default()),
    }
}

/// Runs one blocking step and returns its outputs.
fn run_step(
    pme: &mut Pme,
    simulation_box: &SimulationBox,
    x: &[RVec],
    work: &StepWorkload,
    lambda_q: f64,
) -> PmeOutput {
    if pme.is_accelerator_active() {
        pme.set_device_coordinates(DeviceBuffer::emulated(x.to_vec())).unwrap();
    } else {
        pme.set_host_coordinates(x);
    }
    let output = pme
        .launch_step(simulation_box, work, None, lambda_q)
        .unwrap()
        .get()
        .unwrap();
    pme.reinit_computation().unwrap();
    output
}

fn single_step(
    mode: PmeRunMode,
    cfg: &PmeRunConfig,
    simulation_box: &SimulationBox,
    x: &[RVec],
    charges: &[f64],
) -> PmeOutput {
    let ctx = context_for(mode);
    let mut pme = Pme::new(&ctx, cfg, simulation_box).unwrap();
    pme.reinit_atoms(charges, None).unwrap();
    run_step(&mut pme, simulation_box, x, &StepWorkload::with_energy_and_virial(), 1.0)
}

fn rms_relative_force_error(forces: &[RVec], reference: &[RVec]) -> f64 {
    let err: f64 = forces.iter().zip(reference).map(|(f, r)| (f - r).norm_squared()).sum();
    let norm: f64 = reference.iter().map(|r| r.norm_squared()).sum();
    (err / norm).sqrt()
}

fn max_abs(m: &nalgebra::Matrix3<f64>) -> f64 {
    m.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
}

#[test]
fn test_small_system_matches_ewald_sum() {
    init_logging();

    let b = SimulationBox::cubic(2.0).unwrap();
    let (x, q) = random_system(16, 2.0, 1.0, 7);
    let output = single_step(PmeRunMode::Cpu, &config(PmeRunMode::Cpu, 32, 6), &b, &x, &q);
    let reference = ewald_reciprocal_reference(&x, &q, &b, BETA, 1.0, [10, 10, 10]);

    println!(
        "E_pme = {:.6}, E_ewald = {:.6} kJ/mol",
        output.coulomb_energy, reference.energy
    );
    let rel = ((output.coulomb_energy - reference.energy) / reference.energy).abs();
    assert!(rel < 1e-4, "energy relative error {:.3e}", rel);

    let force_err = rms_relative_force_error(&output.forces, &reference.forces);
    assert!(force_err < 1e-3, "force RMS relative error {:.3e}", force_err);

    let vir_err = max_abs(&(output.coulomb_virial - reference.virial)) / max_abs(&reference.virial);
    assert!(vir_err < 1e-3, "virial relative error {:.3e}", vir_err);
}

#[test]
fn test_thousand_particles_in_3nm_box() {
    init_logging();

    let b = SimulationBox::cubic(3.0).unwrap();
    let (x, q) = random_system(1000, 3.0, 0.5, 1234);
    let output = single_step(PmeRunMode::Cpu, &config(PmeRunMode::Cpu, 28, 4), &b, &x, &q);
    let reference = ewald_reciprocal_reference(&x, &q, &b, BETA, 1.0, [12, 12, 12]);

    let rel = ((output.coulomb_energy - reference.energy) / reference.energy).abs();
    println!("1000 particles: energy relative error {:.3e}", rel);
    assert!(rel < 5e-3, "energy relative error {:.3e}", rel);

    let force_err = rms_relative_force_error(&output.forces, &reference.forces);
    assert!(force_err < 2e-2, "force RMS relative error {:.3e}", force_err);

    // Interpolation breaks exact momentum conservation; the drift stays small.
    let net: RVec = output.forces.iter().sum();
    let mean_force = output.forces.iter().map(|f| f.norm()).sum::<f64>() / output.forces.len() as f64;
    assert!(
        net.norm() < 0.05 * mean_force * (output.forces.len() as f64).sqrt(),
        "net force {:.3e} vs mean |F| {:.3e}",
        net.norm(),
        mean_force
    );
}

#[test]
fn test_triclinic_box_matches_ewald_sum() {
    init_logging();

    let b = SimulationBox::triclinic(
        RVec::new(2.2, 0.0, 0.0),
        RVec::new(0.4, 2.0, 0.0),
        RVec::new(-0.3, 0.5, 2.1),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let x: Vec<RVec> = (0..12)
        .map(|_| {
            let s: [f64; 3] = [rng.gen(), rng.gen(), rng.gen()];
            b.vector(0) * s[0] + b.vector(1) * s[1] + b.vector(2) * s[2]
        })
        .collect();
    let q: Vec<f64> = (0..12).map(|i| if i % 3 == 0 { 1.0 } else { -0.5 }).collect();

    let output = single_step(PmeRunMode::Cpu, &config(PmeRunMode::Cpu, 36, 6), &b, &x, &q);
    let reference = ewald_reciprocal_reference(&x, &q, &b, BETA, 1.0, [12, 12, 12]);

    let rel = ((output.coulomb_energy - reference.energy) / reference.energy).abs();
    assert!(rel < 1e-4, "energy relative error {:.3e}", rel);
    let force_err = rms_relative_force_error(&output.forces, &reference.forces);
    assert!(force_err < 1e-3, "force RMS relative error {:.3e}", force_err);
}

#[test]
fn test_virial_trace_matches_scaling_derivative() {
    init_logging();

    let b = SimulationBox::cubic(2.5).unwrap();
    let (x, q) = random_system(40, 2.5, 1.0, 5);
    let cfg = config(PmeRunMode::Cpu, 24, 4);

    let energy_at = |s: f64| {
        let scaled = b.scaled(s).unwrap();
        let xs: Vec<RVec> = x.iter().map(|r| r * s).collect();
        single_step(PmeRunMode::Cpu, &cfg, &scaled, &xs, &q).coulomb_energy
    };

    let h = 1e-4;
    let de_ds = (energy_at(1.0 + h) - energy_at(1.0 - h)) / (2.0 * h);
    let output = single_step(PmeRunMode::Cpu, &cfg, &b, &x, &q);
    let trace = output.coulomb_virial.trace();

    println!("tr Ξ = {:.6}, ½ dE/ds = {:.6}", trace, 0.5 * de_ds);
    assert!(
        (trace - 0.5 * de_ds).abs() < 1e-5 * output.coulomb_energy.abs().max(1.0),
        "virial trace {} vs ½ dE/ds {}",
        trace,
        0.5 * de_ds
    );
}

#[test]
fn test_repeated_steps_are_deterministic() {
    init_logging();

    let b = SimulationBox::cubic(2.0).unwrap();
    let (x, q) = random_system(64, 2.0, 1.0, 11);
    let ctx = SimulationContext::host_only();
    let mut pme = Pme::new(&ctx, &config(PmeRunMode::Cpu, 20, 5), &b).unwrap();
    pme.reinit_atoms(&q, None).unwrap();

    let work = StepWorkload::with_energy_and_virial();
    let first = run_step(&mut pme, &b, &x, &work, 1.0);
    for _ in 0..3 {
        let again = run_step(&mut pme, &b, &x, &work, 1.0);
        assert_eq!(again.coulomb_energy, first.coulomb_energy);
        assert_eq!(again.coulomb_virial, first.coulomb_virial);
        assert_eq!(again.forces, first.forces);
    }
}

#[test]
fn test_free_energy_endpoints_match_single_grids() {
    init_logging();

    let b = SimulationBox::cubic(2.0).unwrap();
    let (x, q_a) = random_system(20, 2.0, 1.0, 3);
    let q_b: Vec<f64> = q_a.iter().enumerate().map(|(i, q)| if i < 4 { 0.0 } else { *q }).collect();

    let single = config(PmeRunMode::Cpu, 20, 4);
    let out_a = single_step(PmeRunMode::Cpu, &single, &b, &x, &q_a);
    let out_b = single_step(PmeRunMode::Cpu, &single, &b, &x, &q_b);

    let fep_cfg = PmeRunConfig {
        free_energy_coulomb: true,
        ..single.clone()
    };
    let ctx = SimulationContext::host_only();
    let mut pme = Pme::new(&ctx, &fep_cfg, &b).unwrap();
    pme.reinit_atoms(&q_a, Some(&q_b)).unwrap();

    let work = StepWorkload::with_energy_and_virial();
    let at_a = run_step(&mut pme, &b, &x, &work, 1.0);
    let at_b = run_step(&mut pme, &b, &x, &work, 0.0);

    let tol = 1e-10 * out_a.coulomb_energy.abs();
    assert!((at_a.coulomb_energy - out_a.coulomb_energy).abs() < tol);
    assert!((at_b.coulomb_energy - out_b.coulomb_energy).abs() < tol);
    for (f, r) in at_a.forces.iter().zip(&out_a.forces) {
        assert!((f - r).norm() < 1e-9 * (1.0 + r.norm()));
    }
    for (f, r) in at_b.forces.iter().zip(&out_b.forces) {
        assert!((f - r).norm() < 1e-9 * (1.0 + r.norm()));
    }

    // dV/dλ is independent of λ for linear charge blending.
    let expected_dvdl = out_a.coulomb_energy - out_b.coulomb_energy;
    assert!((at_a.coulomb_dvdl - expected_dvdl).abs() < tol);
    let mid = run_step(&mut pme, &b, &x, &work, 0.5);
    assert!((mid.coulomb_dvdl - expected_dvdl).abs() < tol);
    assert!(
        (mid.coulomb_energy - 0.5 * (out_a.coulomb_energy + out_b.coulomb_energy)).abs() < tol
    );
}

#[test]
fn test_run_modes_agree() {
    init_logging();

    let b = SimulationBox::rectangular(2.0, 2.2, 2.4).unwrap();
    let (x, q) = random_system(50, 2.0, 1.0, 21);
    let reference = single_step(PmeRunMode::Cpu, &config(PmeRunMode::Cpu, 24, 4), &b, &x, &q);

    for mode in [PmeRunMode::Gpu, PmeRunMode::Mixed] {
        let output = single_step(mode, &config(mode, 24, 4), &b, &x, &q);
        let rel = ((output.coulomb_energy - reference.coulomb_energy) / reference.coulomb_energy).abs();
        assert!(rel < 1e-5, "{:?} energy relative error {:.3e}", mode, rel);

        let vir_err = max_abs(&(output.coulomb_virial - reference.coulomb_virial))
            / max_abs(&reference.coulomb_virial);
        assert!(vir_err < 1e-5, "{:?} virial relative error {:.3e}", mode, vir_err);

        let force_err = rms_relative_force_error(&output.forces, &reference.forces);
        assert!(force_err < 1e-5, "{:?} force relative error {:.3e}", mode, force_err);
    }
}

#[test]
fn test_try_finish_reduces_into_caller_buffers() {
    init_logging();

    let b = SimulationBox::cubic(2.0).unwrap();
    let (x, q) = random_system(10, 2.0, 1.0, 8);
    let expected = single_step(PmeRunMode::Cpu, &config(PmeRunMode::Cpu, 16, 4), &b, &x, &q);

    let ctx = SimulationContext::emulated(EmulatedDeviceConfig::default());
    let mut pme = Pme::new(&ctx, &config(PmeRunMode::Gpu, 16, 4), &b).unwrap();
    pme.reinit_atoms(&q, None).unwrap();
    pme.set_device_coordinates(DeviceBuffer::emulated(x.clone())).unwrap();

    // Forces from other interactions already in the buffer are kept.
    let mut fwv = ForceWithVirial::new(x.len(), true);
    fwv.force[0] = RVec::new(1.0, 2.0, 3.0);
    let mut enerd = EnergyData::default();

    let work = StepWorkload::with_energy_and_virial();
    pme.prepare_computation(&b, &work).unwrap();
    pme.launch_spread(None, 1.0).unwrap();
    pme.launch_complex_transforms(&work).unwrap();
    pme.launch_gather(1.0).unwrap();
    while !pme
        .try_finish_task(&work, &mut fwv, &mut enerd, 1.0, GpuTaskCompletion::Check)
        .unwrap()
    {
        std::thread::yield_now();
    }

    let expected_f0 = expected.forces[0] + RVec::new(1.0, 2.0, 3.0);
    assert!((fwv.force[0] - expected_f0).norm() < 1e-6 * expected_f0.norm());
    assert!((enerd.coulomb_recip - expected.coulomb_energy).abs() < 1e-8 * expected.coulomb_energy.abs());
    assert!(max_abs(&(fwv.virial() - expected.coulomb_virial)) < 1e-8 * max_abs(&expected.coulomb_virial));
    assert_eq!(enerd.dvdl_lin_coul, 0.0);
}
