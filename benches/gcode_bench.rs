// Benchmark for line parsing and queue throughput
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use micro_firmware::gcode::{checksum, parse_line, CommandQueue, Dequeued, EmergencyStop, ParserConfig};
use std::hint::black_box;

fn numbered_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let body = format!("N{} G1 X{}.5 Y{}.25 E0.0{} F1500", i, i % 100, i % 90, i % 10);
            format!("{}*{}", body, checksum(body.as_bytes()))
        })
        .collect()
}

fn bench_parse_line(c: &mut Criterion) {
    let lines = numbered_lines(10_000);
    let config = ParserConfig::default();
    c.bench_function("parse 10k numbered G1 lines", |b| {
        b.iter(|| {
            let valid = lines
                .iter()
                .filter(|line| parse_line(black_box(line), &config).has_valid_checksum())
                .count();
            assert_eq!(valid, 10_000);
        });
    });
}

fn bench_queue_cycle(c: &mut Criterion) {
    let config = ParserConfig::default();
    let commands: Vec<_> = numbered_lines(64).iter().map(|line| parse_line(line, &config)).collect();
    c.bench_function("enqueue/take 64 commands", |b| {
        let mut queue = CommandQueue::new(16, EmergencyStop::new());
        b.iter(|| {
            for chunk in commands.chunks(16) {
                for command in chunk {
                    queue.enqueue(command.clone());
                }
                while let Dequeued::Dispatch(command) = queue.take_next() {
                    black_box(command);
                }
            }
        });
    });
}

criterion_group!(benches, bench_parse_line, bench_queue_cycle);
criterion_main!(benches);
