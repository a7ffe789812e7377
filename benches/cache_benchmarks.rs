use std::convert::Infallible;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use http::header::{HOST, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::runtime::Runtime;
use tokio::time::sleep;
use tower::{Layer, Service, ServiceExt};
use tower_proxy_cache::key::KeyBuilder;
use tower_proxy_cache::prelude::*;

fn tokio_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to build Tokio runtime"))
}

fn request(path_and_query: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header(HOST, "origin.test")
        .header(USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
        .body(())
        .expect("valid request")
}

fn quiet_layer() -> ProxyCacheLayer {
    ProxyCacheLayer::builder()
        .memory_check_interval(None)
        .stale_check_interval(None)
        .build()
}

fn bench_layer_throughput(c: &mut Criterion) {
    let rt = tokio_runtime();
    let inner_counter = Arc::new(AtomicUsize::new(0));

    let inner_service = tower::service_fn({
        let counter = inner_counter.clone();
        move |_req: Request<()>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                sleep(Duration::from_micros(200)).await;
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "application/json")
                        .body(Full::from(Bytes::from_static(b"{\"ok\":true}")))
                        .expect("valid response"),
                )
            }
        }
    });

    let mut baseline_service = inner_service.clone();
    let mut cached_service = quiet_layer().layer(inner_service.clone());

    let hit_request = request("/bench/hit");
    rt.block_on(async {
        let resp = cached_service
            .ready()
            .await
            .unwrap()
            .call(hit_request.clone())
            .await
            .unwrap();
        resp.into_body().collect().await.unwrap();
        sleep(Duration::from_millis(5)).await;
    });

    let miss_cursor = Arc::new(AtomicUsize::new(0));

    c.bench_function("layer_throughput/baseline_inner", |b| {
        b.iter(|| {
            rt.block_on(async {
                baseline_service.ready().await.unwrap();
                let resp = baseline_service.call(hit_request.clone()).await.unwrap();
                black_box(resp.status());
            });
        });
    });

    c.bench_function("layer_throughput/cache_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                cached_service.ready().await.unwrap();
                let resp = cached_service.call(hit_request.clone()).await.unwrap();
                black_box(resp.into_body().collect().await.unwrap());
            });
        });
    });

    c.bench_function("layer_throughput/cache_miss", |b| {
        b.iter(|| {
            let idx = miss_cursor.fetch_add(1, Ordering::Relaxed);
            let req = request(&format!("/bench/miss/{idx}"));
            rt.block_on(async {
                cached_service.ready().await.unwrap();
                let resp = cached_service.call(req).await.unwrap();
                black_box(resp.into_body().collect().await.unwrap());
            });
        });
    });
}

fn bench_key_builder(c: &mut Criterion) {
    let builder = KeyBuilder::default();
    let desktop = request("/articles/2024/05/01/some-long-slug?utm_source=feed");
    let phone = Request::builder()
        .uri("/articles?page=2")
        .header(HOST, "origin.test")
        .header(
            USER_AGENT,
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148",
        )
        .body(())
        .expect("valid request");

    c.bench_function("key_builder/desktop", |b| {
        b.iter(|| black_box(builder.key_for(black_box(&desktop))));
    });

    c.bench_function("key_builder/phone", |b| {
        b.iter(|| black_box(builder.key_for(black_box(&phone))));
    });

    let pattern = KeyPattern::new("*:origin.test:/articles*");
    let key = builder.key_for(&desktop);
    c.bench_function("key_pattern/match", |b| {
        b.iter(|| black_box(pattern.matches(black_box(key.as_str()))));
    });
}

fn bench_codec(c: &mut Criterion) {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "text/html; charset=utf-8".parse().unwrap());
    headers.insert("cache-control", "public, max-age=60".parse().unwrap());

    let small = PersistedEntry {
        created_at: Utc::now(),
        response: CachedResponse::new(StatusCode::OK, headers.clone(), Bytes::from_static(b"hello")),
    };
    let large = PersistedEntry {
        created_at: Utc::now(),
        response: CachedResponse::new(StatusCode::OK, headers, Bytes::from(vec![b'x'; 256 * 1024])),
    };
    let large_payload = JsonCodec.encode(&large).unwrap();

    c.bench_function("codec/json_encode_small", |b| {
        b.iter(|| black_box(JsonCodec.encode(black_box(&small)).unwrap()));
    });

    c.bench_function("codec/json_encode_large", |b| {
        b.iter(|| black_box(JsonCodec.encode(black_box(&large)).unwrap()));
    });

    c.bench_function("codec/json_decode_large", |b| {
        b.iter(|| black_box(JsonCodec.decode(black_box(&large_payload)).unwrap()));
    });
}

fn bench_coalescing(c: &mut Criterion) {
    let rt = tokio_runtime();
    let concurrency = 32;
    let slow_counter = Arc::new(AtomicUsize::new(0));

    let slow_upstream = tower::service_fn({
        let counter = slow_counter.clone();
        move |_req: Request<()>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                sleep(Duration::from_millis(4)).await;
                Ok::<_, Infallible>(Response::new(Full::from(Bytes::from_static(
                    b"slow-response",
                ))))
            }
        }
    });

    c.bench_function("coalescing/proxy_cache", |b| {
        b.iter(|| {
            rt.block_on(async {
                let svc = quiet_layer().layer(slow_upstream.clone());
                let mut tasks = Vec::with_capacity(concurrency);
                for _ in 0..concurrency {
                    let svc = svc.clone();
                    tasks.push(tokio::spawn(async move {
                        let resp = svc.oneshot(request("/stampede/hot")).await.unwrap();
                        black_box(resp.into_body().collect().await.unwrap());
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    });

    c.bench_function("coalescing/no_cache", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut tasks = Vec::with_capacity(concurrency);
                for _ in 0..concurrency {
                    let svc = slow_upstream.clone();
                    tasks.push(tokio::spawn(async move {
                        let resp = svc.oneshot(request("/stampede/hot")).await.unwrap();
                        black_box(resp.status());
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    });
}

fn bench_free_memory(c: &mut Criterion) {
    let rt = tokio_runtime();

    c.bench_function("eviction/free_memory_1k_entries", |b| {
        b.iter_batched(
            || {
                let layer = quiet_layer();
                let store = layer.store().clone();
                let svc = layer.layer(tower::service_fn(|req: Request<()>| async move {
                    let size = req.uri().path().len() * 64;
                    Ok::<_, Infallible>(Response::new(Full::from(vec![b'x'; size])))
                }));
                rt.block_on(async {
                    for idx in 0..1_000 {
                        let resp = svc
                            .clone()
                            .oneshot(request(&format!("/evict/{idx}")))
                            .await
                            .unwrap();
                        resp.into_body().collect().await.unwrap();
                    }
                    sleep(Duration::from_millis(5)).await;
                });
                store
            },
            |store| black_box(store.free_memory(64 * 1024)),
            criterion::BatchSize::LargeInput,
        );
    });
}

fn init_criterion() -> Criterion {
    Criterion::default().sample_size(50)
}

criterion_group! {
    name = benches;
    config = init_criterion();
    targets =
        bench_layer_throughput,
        bench_key_builder,
        bench_codec,
        bench_coalescing,
        bench_free_memory
}

criterion_main!(benches);
