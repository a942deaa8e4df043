use std::sync::{Mutex, OnceLock};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamClientError {
    #[error("failed to build upstream http client: {0}")]
    Build(#[from] wreq::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
}

static CLIENTS: OnceLock<Mutex<std::collections::HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

/// Returns a process-wide cached client for the given timeout pair,
/// building one on first use. Every upstream credential with the same
/// timeout configuration reuses the same connection pool.
pub fn shared_client(
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<wreq::Client, UpstreamClientError> {
    let key = ClientKey {
        connect_timeout_secs: connect_timeout.as_secs(),
        request_timeout_secs: request_timeout.as_secs(),
    };
    let clients = CLIENTS.get_or_init(|| Mutex::new(std::collections::HashMap::new()));
    let mut guard = clients.lock().expect("upstream client cache poisoned");
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .build()?;
    guard.insert(key, client.clone());
    Ok(client)
}
