use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use piece_tree::{LineEnding, TextBuffer};
use std::hint::black_box;

fn document(lines: usize) -> String {
    let mut text = String::new();
    for i in 0..lines {
        text.push_str("line ");
        text.push_str(&i.to_string());
        text.push_str(" with some representative content\n");
    }
    text
}

fn bench_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("creation");
    for lines in [100, 1_000, 10_000].iter() {
        let text = document(*lines);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, _| {
            b.iter(|| {
                let buffer = TextBuffer::from_str(black_box(text.as_str()), LineEnding::Lf);
                black_box(buffer)
            })
        });
    }
    group.finish();
}

fn bench_sequential_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("typing");
    for keystrokes in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*keystrokes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(keystrokes), keystrokes, |b, &n| {
            b.iter_batched(
                || TextBuffer::new(LineEnding::Lf),
                |mut buffer| {
                    for i in 0..n {
                        let text = if i % 40 == 39 { "\n" } else { "x" };
                        buffer.insert(buffer.len(), black_box(text));
                    }
                    black_box(buffer)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_scattered_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("scattered_inserts");
    let base = document(2_000);
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("insert_1000_spread", |b| {
        b.iter_batched(
            || TextBuffer::from_str(&base, LineEnding::Lf),
            |mut buffer| {
                let mut position = 7usize;
                for _ in 0..1_000 {
                    position = (position * 31 + 17) % buffer.len();
                    buffer.insert(position, black_box("insert"));
                }
                black_box(buffer)
            },
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_line_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_queries");
    let buffer = TextBuffer::from_str(&document(10_000), LineEnding::Lf);

    group.bench_function("line_content_scan", |b| {
        b.iter(|| {
            let mut total = 0usize;
            for line in 1..=buffer.line_count() {
                total += buffer.line_content(black_box(line)).unwrap().len();
            }
            black_box(total)
        })
    });

    group.bench_function("position_at_spread", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            let step = buffer.len() / 1_000;
            let mut offset = 0;
            while offset < buffer.len() {
                let pos = buffer.position_at(black_box(offset));
                acc += pos.line;
                offset += step;
            }
            black_box(acc)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_creation,
    bench_sequential_typing,
    bench_scattered_inserts,
    bench_line_queries
);
criterion_main!(benches);
