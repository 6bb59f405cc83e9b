use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

fn test_image(width: u16, height: u16, progressive: bool) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(0);
    let pixels: Vec<u8> = (0..usize::from(width) * usize::from(height) * 3)
        .map(|i| ((i / 7) % 200) as u8 + rng.u8(..40))
        .collect();

    let mut out = Vec::new();
    let mut enc = Encoder::new(&mut out, 85);
    enc.set_sampling_factor(SamplingFactor::R_4_2_0);
    enc.set_progressive(progressive);
    enc.encode(&pixels, width, height, ColorType::Rgb).unwrap();
    out
}

fn read_dct(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_dct");
    for (name, progressive) in [("baseline", false), ("progressive", true)] {
        let jpeg = test_image(512, 384, progressive);
        let total = dctpack::plan_layout(&jpeg).unwrap().total_bytes();
        let mut out = vec![0; total];

        group.throughput(Throughput::Bytes(jpeg.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| dctpack::read_dct_into(black_box(&jpeg), &mut out).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, read_dct);
criterion_main!(benches);
