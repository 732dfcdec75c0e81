//! Todo Sync Demo Application
//!
//! Fetches a todo list, adds an item through a mutation that updates the
//! cache in place, then invalidates the list to resync with the "server".
//!
//! Usage:
//!   cargo run --example todo_sync
//!
//! Environment variables (also read from `.env`):
//!   QUERY_STALE_TIME_MS - Default stale time in milliseconds (default: 0)
//!   QUERY_RETRY         - Default attempts per fetch (default: 3)
//!   RUST_LOG            - Log filter (default: info)

use ouroboros_query::{query_key, ClientConfig, DataUpdate, MutationOptions, QueryClient, QueryRequest};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Server = Arc<Mutex<Vec<String>>>;

fn todos_request(server: &Server) -> QueryRequest {
    let server = server.clone();
    QueryRequest::new(query_key!["todos"], move |_token| {
        let server = server.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let todos = server
                .lock()
                .map_err(|_| anyhow::anyhow!("server state poisoned"))?
                .clone();
            info!("Server returned {} todos", todos.len());
            Ok(todos)
        }
    })
    .stale_time(Duration::MAX)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Todo Sync Demo ===");

    let client = QueryClient::new(ClientConfig::from_env()?);
    let server: Server = Arc::new(Mutex::new(vec!["buy milk".to_string()]));

    info!("\n--- Initial fetch ---");
    let todos: Vec<String> = client.fetch(todos_request(&server)).await?;
    info!("Todos: {:?}", todos);

    info!("\n--- Fetch again (served from cache) ---");
    let todos: Vec<String> = client.fetch(todos_request(&server)).await?;
    info!("Todos: {:?}", todos);

    info!("\n--- Add a todo ---");
    let remote = server.clone();
    let cache = client.clone();
    let add_todo = MutationOptions::new(move |title: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote
            .lock()
            .map_err(|_| anyhow::anyhow!("server state poisoned"))?
            .push(title.clone());
        Ok(title)
    })
    .on_success(move |title: &String, _vars: &String| {
        let title = title.clone();
        let result = cache.set_query_data(
            query_key!["todos"],
            DataUpdate::updater(move |todos: Option<Vec<String>>| {
                let mut todos = todos.unwrap_or_default();
                todos.push(title);
                todos
            }),
        );
        if let Err(e) = result {
            info!("Could not update cached todos: {}", e);
        }
    });

    client.mutate(add_todo, "write docs".to_string()).await?;
    let cached: Option<Vec<String>> = client.get_query_data(&query_key!["todos"])?;
    info!("Cached todos after mutation: {:?}", cached);

    info!("\n--- Invalidate and resync ---");
    client.invalidate_queries(Some(&query_key!["todos"])).await;
    let todos: Vec<String> = client.fetch(todos_request(&server)).await?;
    info!("Todos: {:?}", todos);

    info!("\n--- Cache statistics ---");
    info!("{}", client.stats());

    Ok(())
}
