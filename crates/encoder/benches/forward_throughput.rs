use attention::masks::encoder_mask_from_lengths;
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use encoder::{EncoderConfig, EncoderModule, WeightName};

const HEADS: usize = 12;
const HEAD_SIZE: usize = 64;

fn build_module(dtype: DType, remove_padding: bool) -> EncoderModule {
    let device = Device::Cpu;
    let config = EncoderConfig::new(HEADS, HEAD_SIZE, remove_padding);
    let weights = WeightName::ALL.map(|name| {
        Tensor::randn(0f32, 0.02, name.expected_shape(config.hidden_dim()), &device)
            .and_then(|w| w.to_dtype(dtype))
            .expect("weight")
    });
    EncoderModule::new(config, weights).expect("module")
}

/// Half the batch is full length, the rest a quarter of it.
fn ragged_lengths(batch: usize, seq: usize) -> Vec<usize> {
    (0..batch)
        .map(|b| if b % 2 == 0 { seq } else { (seq / 4).max(1) })
        .collect()
}

fn bench_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let hidden = HEADS * HEAD_SIZE;

    for &dtype in &[DType::F32, DType::F16] {
        let mut group = c.benchmark_group(format!("encoder_forward/{dtype:?}"));
        for &seq in &[32usize, 128] {
            let lengths = ragged_lengths(batch, seq);
            let valid: usize = lengths.iter().sum();
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .and_then(|t| t.to_dtype(dtype))
                .expect("input");
            let mask = encoder_mask_from_lengths(&device, &lengths, seq, dtype).expect("mask");
            let length_tensor = Tensor::new(
                lengths.iter().map(|&len| len as u32).collect::<Vec<_>>(),
                &device,
            )
            .expect("lengths");
            group.throughput(Throughput::Elements(valid as u64));

            for remove_padding in [false, true] {
                let module = build_module(dtype, remove_padding);
                let mode = if remove_padding { "packed" } else { "dense" };
                group.bench_with_input(
                    BenchmarkId::new(mode, seq),
                    &(module, &input, &mask, &length_tensor),
                    |b, (module, input, mask, lengths)| {
                        b.iter(|| {
                            let out = module
                                .forward(black_box(input), mask, Some(*lengths))
                                .expect("forward");
                            black_box(out);
                        });
                    },
                );
            }
        }
        group.finish();
    }
}

criterion_group!(benches, bench_forward);
criterion_main!(benches);
