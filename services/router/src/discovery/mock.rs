//! In-memory SRV resolver for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::resolver::{SrvRecord, SrvResolver, SRV_SERVICE};
use super::DiscoveryError;

#[derive(Debug, Clone)]
enum MockAnswer {
    Records(Vec<SrvRecord>),
    Fail,
}

#[derive(Debug, Default)]
struct MockState {
    answers: HashMap<String, MockAnswer>,
    queries: Vec<String>,
}

/// Mock SRV resolver keyed by routed hostname.
///
/// Hostnames without an answer fail like an NXDOMAIN from a broken
/// nameserver would.
#[derive(Debug, Default)]
pub struct MockSrvResolver {
    state: Mutex<MockState>,
    /// Simulated network latency per lookup.
    delay: Option<Duration>,
}

impl MockSrvResolver {
    /// Create a mock resolver with no answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock resolver that sleeps before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            delay: Some(delay),
        }
    }

    /// Answer lookups for `hostname` with `records`.
    pub fn set(&self, hostname: &str, records: Vec<SrvRecord>) {
        self.lock()
            .answers
            .insert(hostname.to_string(), MockAnswer::Records(records));
    }

    /// Make lookups for `hostname` fail.
    pub fn fail(&self, hostname: &str) {
        self.lock()
            .answers
            .insert(hostname.to_string(), MockAnswer::Fail);
    }

    /// Number of lookups issued for `hostname`.
    pub fn calls_for(&self, hostname: &str) -> usize {
        let name = super::srv_name(hostname);
        self.lock().queries.iter().filter(|q| **q == name).count()
    }

    /// Every SRV name queried, in order.
    pub fn queried_names(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SrvResolver for MockSrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, DiscoveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let hostname = name
            .strip_prefix(SRV_SERVICE)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);

        let answer = {
            let mut state = self.lock();
            state.queries.push(name.to_string());
            state.answers.get(hostname).cloned()
        };

        debug!(name, "[MOCK] SRV lookup");

        match answer {
            Some(MockAnswer::Records(records)) => Ok(records),
            Some(MockAnswer::Fail) | None => Err(DiscoveryError::DnsLookupFailed {
                name: name.to_string(),
                reason: "mock resolver has no answer".to_string(),
            }),
        }
    }
}
