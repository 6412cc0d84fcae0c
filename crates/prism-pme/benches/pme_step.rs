//! PME Step Benchmarks
//!
//! Benchmarked operations:
//! - Full host step (spread, transforms, solve, gather) for growing systems
//! - Host step versus the emulated accelerator
//! - Direct Ewald sum on a small system, for scale
//!
//! ## Usage
//! ```bash
//! cargo bench --bench pme_step
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prism_core::{RVec, SimulationBox, StepWorkload};
use prism_pme::{
    ewald_reciprocal_reference, DeviceBuffer, EmulatedDeviceConfig, Pme, PmeRunConfig, PmeRunMode,
    SimulationContext,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BOX_LEN: f64 = 4.0;

fn random_system(n: usize) -> (Vec<RVec>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(42);
    let x = (0..n)
        .map(|_| {
            RVec::new(
                rng.gen_range(0.0..BOX_LEN),
                rng.gen_range(0.0..BOX_LEN),
                rng.gen_range(0.0..BOX_LEN),
            )
        })
        .collect();
    let q = (0..n).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
    (x, q)
}

fn config(mode: PmeRunMode) -> PmeRunConfig {
    PmeRunConfig {
        run_mode: mode,
        fourier_spacing: 0.12,
        pme_order: 4,
        ewald_coefficient: Some(3.12),
        ..PmeRunConfig::default()
    }
}

fn step(pme: &mut Pme, b: &SimulationBox, work: &StepWorkload) -> f64 {
    let output = pme
        .launch_step(b, work, None, 1.0)
        .expect("launch")
        .get()
        .expect("complete");
    pme.reinit_computation().expect("reinit");
    output.coulomb_energy
}

/// Benchmark full host steps
fn bench_host_step(c: &mut Criterion) {
    let sizes = vec![1000, 10000, 50000];
    let mut group = c.benchmark_group("pme_host_step");
    group.sample_size(20);

    let b = SimulationBox::cubic(BOX_LEN).expect("box");
    let work = StepWorkload::with_energy_and_virial();
    let ctx = SimulationContext::host_only();

    for size in sizes {
        let (x, q) = random_system(size);
        let mut pme = Pme::new(&ctx, &config(PmeRunMode::Cpu), &b).expect("pme");
        pme.reinit_atoms(&q, None).expect("atoms");
        pme.set_host_coordinates(&x);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| black_box(step(&mut pme, &b, &work)));
        });
    }

    group.finish();
}

/// Benchmark run modes on the same system
fn bench_run_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("pme_run_mode");
    group.sample_size(20);

    let b = SimulationBox::cubic(BOX_LEN).expect("box");
    let work = StepWorkload::with_energy_and_virial();
    let (x, q) = random_system(10000);

    for mode in [PmeRunMode::Cpu, PmeRunMode::Gpu, PmeRunMode::Mixed] {
        let ctx = match mode {
            PmeRunMode::Cpu => SimulationContext::host_only(),
            _ => SimulationContext::emulated(EmulatedDeviceConfig::default()),
        };
        let mut pme = Pme::new(&ctx, &config(mode), &b).expect("pme");
        pme.reinit_atoms(&q, None).expect("atoms");
        if mode.uses_accelerator() {
            pme.set_device_coordinates(DeviceBuffer::emulated(x.clone()))
                .expect("coordinates");
        } else {
            pme.set_host_coordinates(&x);
        }

        group.bench_function(BenchmarkId::from_parameter(format!("{:?}", mode)), |bench| {
            bench.iter(|| black_box(step(&mut pme, &b, &work)));
        });
    }

    group.finish();
}

/// Benchmark the direct sum the mesh replaces
fn bench_direct_ewald(c: &mut Criterion) {
    let b = SimulationBox::cubic(BOX_LEN).expect("box");
    let (x, q) = random_system(200);

    c.bench_function("ewald_direct_200", |bench| {
        bench.iter(|| black_box(ewald_reciprocal_reference(&x, &q, &b, 3.12, 1.0, [8, 8, 8]).energy));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets =
        bench_host_step,
        bench_run_modes,
        bench_direct_ewald
}
criterion_main!(benches);
