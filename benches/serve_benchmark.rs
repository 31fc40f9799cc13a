//! Performance benchmarks for office-hours-queue
//!
//! Run with: cargo bench

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use office_hours_queue::{
    MessageId, RecentMessage, RenderPayload, RenderTransport, Result, Workspace, WorkspaceBuilder,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// Honour RUST_LOG while benchmarking; silent by default
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Transport that keeps only message ids, so every render stays safe
#[derive(Default)]
struct NullTransport {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<MessageId>>>,
}

#[async_trait]
impl RenderTransport for NullTransport {
    fn system_author(&self) -> &str {
        "bench"
    }

    async fn send_message(&self, channel_id: &str, _payload: &RenderPayload) -> Result<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.channels
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    async fn edit_message(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _payload: &RenderPayload,
    ) -> Result<()> {
        Ok(())
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        n: usize,
    ) -> Result<Vec<RecentMessage>> {
        let channels = self.channels.lock().unwrap();
        let ids = channels.get(channel_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(ids[ids.len().saturating_sub(n)..]
            .iter()
            .map(|id| RecentMessage {
                message_id: id.clone(),
                author_id: "bench".to_string(),
            })
            .collect())
    }

    async fn delete_all_messages(&self, channel_id: &str) -> Result<()> {
        self.channels.lock().unwrap().remove(channel_id);
        Ok(())
    }
}

/// Workspace with `queues` open queues all served by helper "h"
async fn workspace_with_queues(queues: usize) -> Workspace {
    let ws = WorkspaceBuilder::new("bench", Arc::new(NullTransport::default()))
        .build()
        .await
        .unwrap();
    for q in 0..queues {
        let id = format!("q{}", q);
        ws.create_queue(&id, &format!("Queue {}", q)).await.unwrap();
        ws.authorize_helper(&id, "h").await.unwrap();
    }
    ws.start_helping("h").await.unwrap();
    ws
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    init_tracing();
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("enqueue_throughput");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let ws = workspace_with_queues(1).await;
                for p in 0..size {
                    ws.enqueue("q0", &format!("p{}", p)).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_serve_across_queues(c: &mut Criterion) {
    init_tracing();
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("serve_across_queues");

    for queues in [1, 10, 50].iter() {
        let waiting_per_queue = 20;
        group.throughput(Throughput::Elements((*queues * waiting_per_queue) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(queues),
            queues,
            |b, &queues| {
                b.to_async(&rt).iter(|| async move {
                    let ws = workspace_with_queues(queues).await;
                    for p in 0..waiting_per_queue {
                        for q in 0..queues {
                            ws.enqueue(&format!("q{}", q), &format!("p{}-{}", q, p))
                                .await
                                .unwrap();
                        }
                    }
                    for _ in 0..queues * waiting_per_queue {
                        ws.serve_next("h", None, None).await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue_throughput, bench_serve_across_queues);
criterion_main!(benches);
