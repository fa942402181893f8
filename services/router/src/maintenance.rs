//! Periodic background work: discovery refresh, certificate reload and idle
//! eviction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryCache, RefreshReport};
use crate::tls::CertificateStore;

/// One refresh pass.
///
/// Re-resolves every cached hostname, then re-reads the certificate
/// configuration. A config that fails to load leaves the current table in
/// place.
pub async fn refresh_once(
    cache: &DiscoveryCache,
    certs: &CertificateStore,
    config_path: &Path,
) -> RefreshReport {
    let report = cache.refresh_all().await;
    debug!(
        refreshed = report.refreshed,
        failed = report.failed,
        "Discovery refresh complete"
    );

    match certs.reload(config_path).await {
        Ok(patterns) => debug!(patterns, "Certificate table reloaded"),
        Err(e) => warn!(
            path = %config_path.display(),
            error = %e,
            "Certificate reload failed, keeping previous table"
        ),
    }

    report
}

/// Spawn the refresh loop. The first pass runs one `period` after start.
pub fn spawn_refresh_task(
    cache: Arc<DiscoveryCache>,
    certs: Arc<CertificateStore>,
    config_path: PathBuf,
    period: Duration,
) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "Starting refresh task");

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            refresh_once(&cache, &certs, &config_path).await;
        }
    })
}

/// Spawn the idle eviction loop. The first sweep runs one `period` after
/// start.
pub fn spawn_eviction_task(cache: Arc<DiscoveryCache>, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "Starting eviction task");

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = cache.evict_idle(Utc::now()).await;
            if removed > 0 {
                info!(removed, "Evicted idle cache entries");
            }
        }
    })
}
