//! HTTP Client Pool for maintaining persistent connections.
//!
//! Every provider backend and the Qdrant store fetch their `reqwest::Client` from
//! here, so connections are reused per base URL instead of paying DNS/TLS setup on
//! each completion, embedding, upsert or query.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    /// Global cache of HTTP clients indexed by base URL.
    static ref CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> = Mutex::new(HashMap::new());
}

/// Creates or retrieves a shared HTTP client for the given base URL.
///
/// The client is configured with:
/// - up to 10 idle connections per host, kept for 90 seconds
/// - TCP keepalive every 60 seconds
/// - a 30-second connection timeout
///
/// No overall request timeout is set; requests are bounded by the caller's
/// cancellation token instead.
pub fn get_or_create_client(base_url: &str) -> reqwest::Client {
    let mut pool = CLIENT_POOL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }

    let client = create_pooled_client();
    pool.insert(base_url.to_string(), client.clone());
    client
}

fn create_pooled_client() -> reqwest::Client {
    let builder = reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30));

    match builder.build() {
        Ok(client) => client,
        Err(err) => {
            log::error!(
                "trio::http_client_pool: falling back to a default client: {}",
                err
            );
            reqwest::Client::new()
        }
    }
}
