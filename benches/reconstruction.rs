//! Benchmarks for queue throughput and solver iterations
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use recon_rs::operators::{
    CartesianTransform, DiagonalPreconditioner, IdentityOperator, KaiserBesselTransform,
    LinearOperator, SenseEncoding, TvOperator,
};
use recon_rs::phantom::{Phantom, PhantomSpec};
use recon_rs::pipeline::BoundedQueue;
use recon_rs::solvers::{CgSolver, GpBbSolver, OutputMode, Solver, SolverSettings};
use std::thread;

fn settings(max_iterations: usize) -> SolverSettings {
    SolverSettings {
        max_iterations,
        tolerance: 1e-12,
        output_mode: OutputMode::Silent,
    }
}

fn phantom(matrix_size: usize) -> Phantom {
    Phantom::new(PhantomSpec {
        matrix_size,
        profiles_per_frame: matrix_size,
        ..Default::default()
    })
    .unwrap()
}

fn bench_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_throughput");
    let items = 10_000u64;
    group.throughput(Throughput::Elements(items));

    for capacity in [1usize, 16, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("spsc", capacity), capacity, |b, &capacity| {
            b.iter(|| {
                let queue = BoundedQueue::new(capacity);
                let producer = {
                    let queue = queue.clone();
                    thread::spawn(move || {
                        for i in 0..items {
                            if queue.push(i).is_err() {
                                break;
                            }
                        }
                        queue.close();
                    })
                };
                let mut sum = 0u64;
                while let Some(v) = queue.pop() {
                    sum += v;
                }
                let _ = producer.join();
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("sense_encoding");

    for n in [16usize, 32, 64].iter() {
        let source = phantom(*n);
        let job = source.job().unwrap();
        let encoding =
            SenseEncoding::new(&job, Box::new(KaiserBesselTransform::new()), 1.25, 5.5).unwrap();
        group.bench_with_input(BenchmarkId::new("normal", n), source.image(), |b, x| {
            b.iter(|| black_box(encoding.apply_normal(x).unwrap()))
        });
    }

    group.finish();
}

fn bench_cg_sense(c: &mut Criterion) {
    let mut group = c.benchmark_group("cg_sense");
    group.sample_size(20);

    for n in [16usize, 32].iter() {
        let source = phantom(*n);
        let job = source.job().unwrap();
        let dims = job.image_dims();

        group.bench_with_input(BenchmarkId::new("10_iterations", n), &job, |b, job| {
            b.iter(|| {
                let encoding =
                    SenseEncoding::new(job, Box::new(KaiserBesselTransform::new()), 1.25, 5.5)
                        .unwrap();
                let rhs = encoding.weighted_samples(&job.samples).unwrap();
                let mut cg = CgSolver::new(settings(10));
                cg.add_regularization_operator(Box::new(
                    IdentityOperator::new(&dims).with_weight(0.1),
                ));
                cg.set_encoding_operator(Box::new(encoding));
                cg.set_preconditioner(Box::new(DiagonalPreconditioner::new(&dims)));
                black_box(cg.solve(&rhs).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_gp_tv(c: &mut Criterion) {
    let mut group = c.benchmark_group("gp_tv");
    group.sample_size(20);

    let source = phantom(16);
    let job = source.job().unwrap();
    let dims = job.image_dims();

    group.bench_function("16x16_10_iterations", |b| {
        b.iter(|| {
            let encoding =
                SenseEncoding::new(&job, Box::new(CartesianTransform::new()), 1.0, 5.5).unwrap();
            let rhs = encoding.weighted_samples(&job.samples).unwrap();
            let mut gp = GpBbSolver::new(settings(10));
            gp.set_encoding_operator(Box::new(encoding));
            gp.add_nonlinear_operator(Box::new(TvOperator::new(&dims).with_weight(1e-3)));
            black_box(gp.solve(&rhs).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_throughput,
    bench_encoding,
    bench_cg_sense,
    bench_gp_tv
);
criterion_main!(benches);
