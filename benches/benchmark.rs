//! Health-check server performance benchmarks
//!
//! Measures:
//! - Rate limiter admission cost across many client identities
//! - Admission gate acquire/release round trips
//! - Full WebSocket check cycle against an in-process checker

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::{SinkExt, StreamExt};
use mailcheck_server::{
    config::ServerConfig,
    server::{router, AdmissionGate, CheckError, CheckRateLimiter, CheckRunner, ClientIdentity, ServerState},
};
use serde_json::{json, Value};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, runtime::Runtime};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Checker that answers immediately so the benchmark measures the server.
struct InstantRunner;

impl CheckRunner for InstantRunner {
    fn run(&self, domain: &str) -> impl Future<Output = Result<Value, CheckError>> + Send {
        let data = json!({ "domain": domain, "mx": "ok" });
        async move { Ok(data) }
    }
}

/// Initializes and starts a test server instance with limits out of the way.
async fn start_test_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let config = ServerConfig {
        rate_limit_max_requests: usize::MAX,
        connection_rate_limit: 0,
        max_parallel_checks: 64,
        ..ServerConfig::default()
    };
    let state = Arc::new(ServerState::new(config, InstantRunner).expect("Failed to build state"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to read local address");
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    let server_task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, server_task)
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    for identities in [1usize, 1_000, 100_000] {
        let limiter = CheckRateLimiter::new(3, Duration::from_secs(900));
        let keys: Vec<_> = (0..identities)
            .map(|i| ClientIdentity::new(format!("10.{}.{}.{}", i >> 16, (i >> 8) & 0xff, i & 0xff)))
            .collect();

        group.bench_with_input(BenchmarkId::new("admit", identities), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                limiter.admit(&keys[i])
            });
        });
    }

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let gate = AdmissionGate::new(10);
    let gate = &gate;

    c.bench_function("admission_acquire_release", |b| {
        b.to_async(&rt).iter(move || async move {
            let token = gate.acquire().await.unwrap();
            drop(token);
        });
    });
}

/// Measures a full check cycle: request, progress frame, result frame.
fn bench_check_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (addr, server) = rt.block_on(start_test_server());
    let url = Url::parse(&format!("ws://{}/ws", addr)).unwrap();
    let (ws, _) = rt.block_on(connect_async(url)).unwrap();
    let ws = Arc::new(tokio::sync::Mutex::new(ws));

    let mut group = c.benchmark_group("messages");
    group.throughput(criterion::Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("check_cycle", |b| {
        b.to_async(&rt).iter(|| {
            let ws = ws.clone();
            async move {
                let mut ws = ws.lock().await;
                ws.send(Message::Text(r#"{"domain":"example.com"}"#.into()))
                    .await
                    .unwrap();
                let _progress = ws.next().await.unwrap().unwrap();
                let _complete = ws.next().await.unwrap().unwrap();
            }
        });
    });

    group.finish();
    server.abort();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .significance_level(0.05)
        .noise_threshold(0.05);
    targets = bench_rate_limiter, bench_admission, bench_check_cycle
);
criterion_main!(benches);
