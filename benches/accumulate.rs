use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use irmad::mad::{DenseImagePair, IrMadModel, IrMadOptions, WeightedCovariance};
use ndarray::{Array2, Array3, Axis};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_pixels(pixels: usize, dim: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED_00AD + pixels as u64);
    Array2::from_shape_fn((pixels, dim), |_| 100.0 + 20.0 * rng.sample::<f64, _>(Standard))
}

fn benchmark_accumulate(c: &mut Criterion) {
    let dim = 12;
    let mut group = c.benchmark_group("weighted_covariance");
    for pixels in [4_096_usize, 65_536] {
        let batch = random_pixels(pixels, dim);
        group.throughput(Throughput::Elements(pixels as u64));

        group.bench_with_input(BenchmarkId::new("single_update", pixels), &batch, |b, input| {
            b.iter(|| {
                let mut stats = WeightedCovariance::new(dim);
                stats.update(black_box(input.view()), None).unwrap();
                black_box(stats.covariance().unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("chunked_merge", pixels), &batch, |b, input| {
            b.iter(|| {
                let mut total = WeightedCovariance::new(dim);
                for chunk in input.axis_chunks_iter(Axis(0), 1_024) {
                    let mut partial = WeightedCovariance::new(dim);
                    partial.update(black_box(chunk), None).unwrap();
                    total.merge(&partial).unwrap();
                }
                black_box(total.covariance().unwrap());
            });
        });
    }
    group.finish();
}

fn benchmark_fit(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x1AAD);
    let shape = (6, 128, 128);
    let reference = Array3::from_shape_fn(shape, |_| 100.0 + 20.0 * rng.sample::<f64, _>(Standard));
    let target = reference.mapv(|v| 0.9 * v + 5.0 + rng.sample::<f64, _>(Standard));
    let options = IrMadOptions::default();

    let mut group = c.benchmark_group("irmad_fit");
    group.sample_size(10);
    group.throughput(Throughput::Elements((shape.1 * shape.2) as u64));
    group.bench_function("6_bands_128x128", |b| {
        b.iter(|| {
            let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
            black_box(IrMadModel::fit(&mut source, &options).unwrap());
        });
    });
    group.finish();
}

criterion_group!(accumulate, benchmark_accumulate, benchmark_fit);
criterion_main!(accumulate);
