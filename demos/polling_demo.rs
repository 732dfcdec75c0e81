//! Polling Demo Application
//!
//! Subscribes to a price feed that refetches on an interval while it is
//! observed, then unsubscribes and lets the entry be evicted.
//!
//! Usage:
//!   cargo run --example polling_demo

use ouroboros_query::{query_key, ClientConfig, QueryClient, QueryOptions, QueryRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("=== Polling Demo ===");

    let config = ClientConfig::builder()
        .default_options(
            QueryOptions::builder()
                .retry(2)
                .retry_delay(Duration::from_millis(200))
                .cache_time(Duration::from_secs(1))
                .build(),
        )
        .build();
    config.validate()?;
    let client = QueryClient::new(config);

    let ticks = Arc::new(AtomicU64::new(100));
    let feed = ticks.clone();
    let request = QueryRequest::new(query_key!["prices", {"symbol": "ACME"}], move |_token| {
        let feed = feed.clone();
        async move { Ok(feed.fetch_add(1, Ordering::SeqCst)) }
    })
    .refetch_interval(Duration::from_millis(250));

    let price: u64 = client.fetch(request).await?;
    info!("Initial price: {}", price);

    let entry = client
        .entry(&query_key!["prices", {"symbol": "ACME"}])
        .ok_or_else(|| anyhow::anyhow!("price entry missing"))?;

    let observed = entry.clone();
    let id = entry.subscribe(move || {
        if let Ok(Some(price)) = observed.state().data_as::<u64>() {
            info!("Price update: {}", price);
        }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("\n--- Unsubscribing ---");
    entry.unsubscribe(id);
    drop(entry);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let remaining = client.get_queries(Some(&query_key!["prices"])).len();
    info!("Price entries after cache time: {}", remaining);
    info!("{}", client.stats());

    Ok(())
}
