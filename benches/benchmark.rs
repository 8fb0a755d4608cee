use calvados::decoder::PartitionDecoder;
use calvados::insn_set::InsnSet;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

pub fn benchmark(c: &mut Criterion) {
    let set = InsnSet::builtin();
    let fast = PartitionDecoder::new(&set).unwrap();

    // One word per encoding, cycled through during the measurement.
    let words: Vec<u32> = set
        .opcodes()
        .iter()
        .map(|o| o.match_value() | (0x5555_5555 & !o.mask()))
        .collect();

    let mut g = c.benchmark_group("decode");
    g.sample_size(20);

    g.bench_function("linear_scan", |b| {
        b.iter(|| {
            for &word in &words {
                let _ = black_box(set.decode(black_box(word)));
            }
        })
    });

    g.bench_function("partition_tree", |b| {
        b.iter(|| {
            for &word in &words {
                let _ = black_box(fast.decode(black_box(word)));
            }
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
