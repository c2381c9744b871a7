use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use flare_buffer::ByteSpanAggregate;
use std::hint::black_box;

/// 比较“队首片段内切分”与“跨片段拼接”两条 `pull_bytes` 路径的成本。
///
/// # 设计目的（Why）
/// - 帧解析通常落在单个片段内，零拷贝路径应明显快于拼接路径；
/// - 若两者差距消失，通常意味着切分路径退化成了拷贝。
fn bench_pull(c: &mut Criterion) {
    let spans: Vec<Bytes> = (0..64).map(|_| Bytes::from(vec![0u8; 1024])).collect();

    c.bench_function("pull_within_span", |b| {
        b.iter(|| {
            let mut aggregate: ByteSpanAggregate = spans.iter().cloned().collect();
            while aggregate.len() >= 256 {
                black_box(aggregate.pull_bytes(256).ok());
            }
        })
    });

    c.bench_function("pull_across_spans", |b| {
        b.iter(|| {
            let mut aggregate: ByteSpanAggregate = spans.iter().cloned().collect();
            while aggregate.len() >= 1000 {
                black_box(aggregate.pull_bytes(1000).ok());
            }
        })
    });
}

criterion_group!(aggregate_benches, bench_pull);
criterion_main!(aggregate_benches);
