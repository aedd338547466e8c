//! Auto-dialer lifecycle and batch orchestration, `SPEC_FULL.md` §4.10.
//!
//! Grounded on `timers.rs`'s sweep-loop shape (periodic, bounded, idempotent
//! cleanup) for the post-batch residual-registration sweep, and on
//! `routing.rs`'s single coarse `RegistrarTable` for where the dialer's own
//! binding lives alongside every other AOR the proxy tracks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};

use crate::dialer::client::{AutoDialerClient, CallOutcome, DialerConfig};
use crate::registrar::RegistrarTable;

/// Auto-dialer batches never run longer than this regardless of how many
/// callees remain (`SPEC_FULL.md` §4.10).
pub const BATCH_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// At most this many calls run concurrently within a batch.
pub const MAX_CONCURRENT_CALLS: usize = 10;

#[derive(Debug, Clone)]
pub struct DialerStatus {
    pub running: bool,
    pub registered: bool,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub accepted: usize,
    pub total: usize,
    pub message: String,
    pub results: Vec<(String, CallOutcome)>,
}

/// Owns one [`AutoDialerClient`] and the shared [`RegistrarTable`] it
/// registers against, exposing start/stop/dial/dial_batch as the
/// operator-facing surface.
pub struct AutoDialerManager {
    client: Arc<AutoDialerClient>,
    registrar: Arc<RegistrarTable>,
}

impl AutoDialerManager {
    pub fn new(config: DialerConfig, cdr: Arc<crate::cdr::CdrEngine>, registrar: Arc<RegistrarTable>) -> AutoDialerManager {
        AutoDialerManager { client: Arc::new(AutoDialerClient::new(config, cdr)), registrar }
    }

    pub async fn start(&self) -> bool {
        self.client.register().await.unwrap_or(false)
    }

    pub fn stop(&self) {
        self.client.stop();
        self.cleanup_residual_registrations();
    }

    pub fn get_status(&self) -> DialerStatus {
        DialerStatus { running: self.client.is_registered(), registered: self.client.is_registered() }
    }

    pub fn get_config(&self) -> DialerConfig {
        self.client.config().clone()
    }

    pub async fn dial(&self, callee: &str, media_file: impl AsRef<Path>, duration: Duration) -> CallOutcome {
        self.client.dial(callee, media_file, duration).await
    }

    /// Dials each of `callees` under a shared semaphore bounding
    /// concurrency to [`MAX_CONCURRENT_CALLS`] and a global deadline of
    /// [`BATCH_DEADLINE`] from the moment the batch starts. Calls still
    /// queued when the deadline passes are reported as failed rather than
    /// started late.
    pub async fn dial_batch(&self, callees: Vec<String>, media_file: impl AsRef<Path>, duration: Duration) -> BatchResult {
        let total = callees.len();
        let media_file: PathBuf = media_file.as_ref().to_path_buf();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CALLS));
        let deadline = Instant::now() + BATCH_DEADLINE;

        let mut handles = Vec::with_capacity(total);
        for callee in callees {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&self.client);
            let media_file = media_file.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return (
                            callee,
                            CallOutcome { success: false, message: "dialer shutting down".to_string() },
                        )
                    }
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return (
                        callee,
                        CallOutcome { success: false, message: "batch deadline exceeded before call started".to_string() },
                    );
                }
                match timeout(remaining, client.dial(&callee, &media_file, duration)).await {
                    Ok(outcome) => (callee, outcome),
                    Err(_) => (
                        callee,
                        CallOutcome { success: false, message: "call exceeded batch deadline".to_string() },
                    ),
                }
            }));
        }

        let mut results = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => tracing::warn!(error = %err, "dial task panicked"),
            }
        }

        self.cleanup_residual_registrations();

        let accepted = results.iter().filter(|(_, outcome)| outcome.success).count();
        BatchResult {
            accepted,
            total,
            message: format!("{accepted}/{total} calls completed successfully"),
            results,
        }
    }

    /// Truncates the dialer's own AOR binding list down to its main
    /// registered contact (`SPEC_FULL.md` §4.10), dropping anything a crashed
    /// or interrupted prior run left behind. The dialer never REGISTERs a
    /// per-call Contact, so any other binding under this AOR is stale.
    fn cleanup_residual_registrations(&self) {
        let config = self.client.config();
        let aor = format!("sip:{}@{}", config.username, config.server_ip);
        let main_contact = format!("sip:{}@{}:{}", config.username, config.local_ip, config.local_port);
        self.registrar.retain_contacts(&aor, |binding| binding.contact_uri == main_contact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::CdrEngine;

    fn test_manager(dir: &std::path::Path) -> AutoDialerManager {
        let cdr = Arc::new(CdrEngine::new(dir.to_path_buf(), false));
        let registrar = Arc::new(RegistrarTable::new());
        let config = DialerConfig {
            server_ip: "127.0.0.1".to_string(),
            server_port: 5060,
            local_ip: "127.0.0.1".to_string(),
            username: "dialer".to_string(),
            password: "secret".to_string(),
            realm: "sip.local".to_string(),
            local_port: 19_999,
        };
        AutoDialerManager::new(config, cdr, registrar)
    }

    #[tokio::test]
    async fn cleanup_keeps_only_main_contact() {
        let dir = std::env::temp_dir().join(format!("dialertest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let manager = test_manager(&dir);

        let aor = "sip:dialer@127.0.0.1";
        manager.registrar.apply_contact(aor, "sip:dialer@127.0.0.1:19999", 3600);
        manager.registrar.apply_contact(aor, "sip:dialer@127.0.0.1:12345", 3600);
        assert_eq!(manager.registrar.active_bindings(aor).len(), 2);

        manager.cleanup_residual_registrations();

        let remaining = manager.registrar.active_bindings(aor);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].contact_uri, "sip:dialer@127.0.0.1:19999");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn dial_batch_reports_not_registered_for_every_callee() {
        let dir = std::env::temp_dir().join(format!("dialertest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let manager = test_manager(&dir);

        let result = manager
            .dial_batch(
                vec!["1001".to_string(), "1002".to_string()],
                dir.join("missing.wav"),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.total, 2);
        assert_eq!(result.accepted, 0);
        assert!(result.results.iter().all(|(_, outcome)| !outcome.success));

        std::fs::remove_dir_all(&dir).ok();
    }
}
