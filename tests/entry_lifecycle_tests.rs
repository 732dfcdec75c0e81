//! Integration tests for entry lifecycle
//!
//! Covers deferred eviction, polling and the suspense signals as seen
//! through the public client API.

use ouroboros_query::{
    query_key, ClientConfig, QueryClient, QueryError, QueryOptions, QueryRequest, QueryStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn client_with(options: QueryOptions) -> QueryClient {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    QueryClient::new(ClientConfig::builder().default_options(options).build())
}

fn short_lived() -> QueryOptions {
    QueryOptions::builder()
        .retry(0)
        .cache_time(Duration::from_millis(50))
        .build()
}

#[tokio::test]
async fn test_entry_evicted_after_last_unsubscribe() {
    let client = client_with(short_lived());
    client
        .fetch::<u32>(QueryRequest::new("profile", |_token| async { Ok(1u32) }))
        .await
        .unwrap();

    let entry = client.entry(&"profile".into()).unwrap();
    let id = entry.subscribe(|| {});
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(client.entry(&"profile".into()).is_some());

    entry.unsubscribe(id);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.entry(&"profile".into()).is_none());
    assert_eq!(client.stats().evictions, 1);
}

#[tokio::test]
async fn test_resubscribe_keeps_entry() {
    let client = client_with(short_lived());
    client
        .fetch::<u32>(QueryRequest::new("profile", |_token| async { Ok(1u32) }))
        .await
        .unwrap();

    let entry = client.entry(&"profile".into()).unwrap();
    let id = entry.subscribe(|| {});
    entry.unsubscribe(id);
    tokio::time::sleep(Duration::from_millis(20)).await;
    entry.subscribe(|| {});

    tokio::time::sleep(Duration::from_millis(100)).await;
    let kept = client.entry(&"profile".into()).unwrap();
    assert!(Arc::ptr_eq(&entry, &kept));
    assert_eq!(kept.status(), QueryStatus::Success);
}

#[tokio::test]
async fn test_never_subscribed_entry_is_evicted() {
    let client = client_with(short_lived());
    client
        .fetch::<u32>(QueryRequest::new("config", |_token| async { Ok(7u32) }))
        .await
        .unwrap();
    assert!(client.entry(&"config".into()).is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.entry(&"config".into()).is_none());
    assert_eq!(client.stats().evictions, 1);
}

#[tokio::test]
async fn test_fetch_recovers_after_caller_times_out() {
    let client = client_with(QueryOptions::builder().retry(0).build());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let request = QueryRequest::new("slow", move |_token| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(n)
        }
    });

    let abandoned = tokio::time::timeout(Duration::from_millis(10), client.fetch::<usize>(request.clone())).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ne!(client.get_query_state(&"slow".into()).unwrap().status, QueryStatus::Loading);

    let value = assert_ok!(
        tokio::time::timeout(Duration::from_millis(500), client.fetch::<usize>(request)).await
    );
    assert_eq!(assert_ok!(value), 2);
}

#[tokio::test]
async fn test_interval_change_mid_poll_releases_loading() {
    let client = client_with(QueryOptions::builder().retry(0).build());
    let request = QueryRequest::new(query_key!["ticker"], |_token| async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        Ok(1u32)
    });

    let entry = client.ensure_entry(&request.clone().refetch_interval(Duration::from_millis(20)));
    entry.subscribe(|| {});
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(entry.status(), QueryStatus::Loading);

    client.ensure_entry(&request.clone().refetch_interval(Duration::ZERO));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_ne!(entry.status(), QueryStatus::Loading);

    let value = tokio::time::timeout(Duration::from_millis(500), client.fetch::<u32>(request)).await;
    assert_eq!(assert_ok!(assert_ok!(value)), 1);
}

#[tokio::test]
async fn test_cancelled_fetch_stops_retrying() {
    let client = client_with(QueryOptions::builder().retry(0).build());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let request = QueryRequest::new("flaky", move |_token| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(anyhow::anyhow!("backend down"))
        }
    })
    .retry(3)
    .retry_delay(Duration::from_millis(30));

    let background = client.clone();
    let task = tokio::spawn(async move { background.fetch::<u32>(request).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.cancel_queries(Some(&"flaky".into()));

    assert_err!(assert_ok!(task.await));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_polling_refetches_observed_entry() {
    let client = client_with(QueryOptions::builder().retry(0).build());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let request = QueryRequest::new(query_key!["prices"], move |_token| {
        let counter = counter.clone();
        async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    })
    .stale_time(Duration::MAX)
    .refetch_interval(Duration::from_millis(30));

    client.fetch::<usize>(request).await.unwrap();
    let entry = client.entry(&query_key!["prices"]).unwrap();
    assert!(entry.is_polling());

    let id = entry.subscribe(|| {});
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(calls.load(Ordering::SeqCst) >= 3);

    entry.unsubscribe(id);
    client.remove_queries(Some(&query_key!["prices"]));
    assert!(!entry.is_polling());
}

#[tokio::test]
async fn test_suspense_signals_pending_then_error() {
    let client = client_with(QueryOptions::builder().retry(0).suspense(true).build());
    let request = QueryRequest::new("report", |_token| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err::<u32, _>(anyhow::anyhow!("report failed"))
    });

    let background = client.clone();
    let first_request = request.clone();
    let first = tokio::spawn(async move { background.fetch::<u32>(first_request).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pending = assert_err!(client.fetch::<u32>(request).await);
    assert!(matches!(pending, QueryError::Pending { .. }));

    let settled = assert_err!(assert_ok!(first.await));
    assert!(matches!(settled, QueryError::Operation(_)));
}

#[tokio::test]
async fn test_static_content_survives_unsubscribe() {
    let client = client_with(QueryOptions::static_content());
    client
        .fetch::<String>(QueryRequest::new("terms", |_token| async { Ok("v1") }))
        .await
        .unwrap();

    let entry = client.entry(&"terms".into()).unwrap();
    let id = entry.subscribe(|| {});
    entry.unsubscribe(id);

    assert!(!client.registry().has_pending_eviction(entry.key()));
}
