use bevy_chat_stream::{ChatError, LineDecoder, decode_stream};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_lite::{StreamExt, stream};
use std::hint::black_box;

fn body(fragments: usize) -> Vec<u8> {
    let mut out = String::new();
    for i in 0..fragments {
        out.push_str(&format!("data: {{\"chunk\": \"token {i} – ünïcode \"}}\n"));
        if i % 16 == 0 {
            out.push_str(": keep-alive\n");
        }
    }
    out.push_str("data: [DONE]\n");
    out.into_bytes()
}

fn bench_line_decoder(c: &mut Criterion) {
    let bytes = body(2_000);
    let mut group = c.benchmark_group("line_decoder");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    for chunk in [1usize, 64, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut dec = LineDecoder::new();
                let mut n = 0;
                for piece in bytes.chunks(chunk) {
                    n += dec.push(black_box(piece)).len();
                }
                n += dec.finish().len();
                black_box(n)
            })
        });
    }
    group.finish();
}

fn bench_event_stream(c: &mut Criterion) {
    let bytes = body(2_000);
    c.bench_function("event_stream/4096", |b| {
        b.iter(|| {
            let chunks: Vec<Result<Vec<u8>, ChatError>> =
                bytes.chunks(4096).map(|c| Ok(c.to_vec())).collect();
            let events = pollster::block_on(decode_stream(stream::iter(chunks)).count());
            black_box(events)
        })
    });
}

criterion_group!(benches, bench_line_decoder, bench_event_stream);
criterion_main!(benches);
