use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::Utc;
use ingest_core::{IngestPayload, RequestLogRecord, SystemClock, UploadId, UploadKind};
use ingest_events::{InMemoryEventBus, Notification};
use ingest_infra::dedup::InMemoryDedupLedger;
use ingest_infra::files::LocalFileStore;
use ingest_infra::jobs::{InMemoryJobStore, JobStore};
use ingest_infra::session::InMemorySessionStore;
use ingest_infra::sinks::InMemorySink;
use ingest_infra::sync::{LogSync, SyncWorker, SyncWorkerConfig};
use ingest_infra::uploads::{ChunkReassembler, ReassemblerConfig};
use tokio::runtime::Runtime;

fn request_payload(i: usize) -> String {
    serde_json::json!({
        "method": "GET",
        "url": format!("/items/{i}"),
        "status_code": 200,
        "duration": 4,
        "timestamp": Utc::now(),
    })
    .to_string()
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    let request = request_payload(1);
    let analytics = serde_json::json!({
        "event_id": "evt-1",
        "user_id": "u-1",
        "properties": { "page": "/home", "ms": 120 },
    })
    .to_string();
    let unknown = serde_json::json!({ "hello": "world" }).to_string();

    group.bench_function("request", |b| {
        b.iter(|| IngestPayload::classify(black_box("log_stream"), black_box(&request)))
    });
    group.bench_function("analytics", |b| {
        b.iter(|| IngestPayload::classify(black_box("tracker_event"), black_box(&analytics)))
    });
    group.bench_function("unknown", |b| {
        b.iter(|| IngestPayload::classify(black_box("log_stream"), black_box(&unknown)))
    });

    group.finish();
}

fn bench_merge_chunks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("merge_chunks");

    for chunks in [4_u32, 64, 512].iter() {
        let chunk = vec![7_u8; 16 * 1024];
        group.throughput(Throughput::Bytes(u64::from(*chunks) * chunk.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunks), chunks, |b, &chunks| {
            let reassembler = ChunkReassembler::new(
                Arc::new(InMemorySessionStore::new()),
                InMemoryJobStore::arc("file-merge"),
                Arc::new(LocalFileStore::new(dir.path())),
                ReassemblerConfig::default(),
            );
            let upload = UploadId::parse(format!("bench-{chunks}")).unwrap();
            rt.block_on(async {
                // Reverse order exercises the sort on merge.
                for index in (0..chunks).rev() {
                    reassembler
                        .store_chunk(&upload, UploadKind::Media, index, chunk.clone(), chunks)
                        .await
                        .unwrap();
                }
            });

            b.iter(|| {
                rt.block_on(reassembler.merge_chunks(&upload, UploadKind::Media))
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_sync_tick(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("sync_tick");

    for batch_size in [10_usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let queue = InMemoryJobStore::arc("redis");
                        rt.block_on(async {
                            for i in 0..batch_size {
                                queue.enqueue("log_stream", request_payload(i)).await.unwrap();
                            }
                        });
                        let sink: Arc<InMemorySink<RequestLogRecord>> =
                            Arc::new(InMemorySink::new("request_logs"));
                        let bus: Arc<InMemoryEventBus<Notification>> = Arc::new(InMemoryEventBus::new());
                        SyncWorker::new(
                            Arc::new(LogSync::new(sink)),
                            queue,
                            Arc::new(InMemoryDedupLedger::new()),
                            bus,
                            Arc::new(SystemClock),
                            SyncWorkerConfig {
                                batch_size,
                                ..SyncWorkerConfig::default()
                            },
                        )
                    },
                    |worker| rt.block_on(worker.sync_once()).unwrap(),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_merge_chunks, bench_sync_tick);
criterion_main!(benches);
