//! Timer service, `SPEC_FULL.md` §4.6.
//!
//! Grounded on `examples/original_source/sipcore/timers.py`: four
//! independent sweep loops with RFC 3261-derived constants, each observing
//! a cancellation signal between iterations and completing its current
//! iteration before exiting.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::NonceStore;
use crate::dialog_store::{Dialogs, InviteBranches, PendingRequests};
use crate::registrar::RegistrarTable;

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);
/// 64 * T1, shared by Timer B/F/H/J.
pub const TIMER_B: Duration = Duration::from_secs(32);
pub const TIMER_F: Duration = TIMER_B;
pub const TIMER_H: Duration = TIMER_B;
pub const TIMER_J: Duration = TIMER_B;
pub const TIMER_C: Duration = Duration::from_secs(180);

pub const REGISTRATION_CHECK_PERIOD: Duration = Duration::from_secs(30);
pub const PENDING_CLEANUP_PERIOD: Duration = Duration::from_secs(300);
pub const PENDING_CLEANUP_AGE: Duration = Duration::from_secs(300);
pub const DIALOG_SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const DIALOG_TIMEOUT: Duration = Duration::from_secs(3600);
pub const BRANCH_SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const BRANCH_CLEANUP_AGE: Duration = TIMER_H;
pub const DEFAULT_NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Handles to the tables the timer service sweeps. Cloned cheaply (all
/// fields are `Arc`s) and handed to both the proxy loop and the timer
/// service, per the `ProxyState` re-architecture note in `SPEC_FULL.md` §9.
#[derive(Clone)]
pub struct TimerTargets {
    pub registrar: Arc<RegistrarTable>,
    pub pending: Arc<PendingRequests>,
    pub dialogs: Arc<Dialogs>,
    pub branches: Arc<InviteBranches>,
    pub nonces: Arc<NonceStore>,
}

/// Spawns the four sweep loops as cooperative tokio tasks and returns a
/// handle whose `shutdown()` cancels all of them and waits for the current
/// iteration of each to finish.
pub struct TimerService {
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TimerService {
    pub fn start(targets: TimerTargets) -> TimerService {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(registration_sweep_loop(targets.registrar.clone(), token.clone())));
        tasks.push(tokio::spawn(pending_sweep_loop(targets.pending.clone(), token.clone())));
        tasks.push(tokio::spawn(dialog_sweep_loop(targets.dialogs.clone(), token.clone())));
        tasks.push(tokio::spawn(branch_sweep_loop(targets.branches.clone(), token.clone())));
        tasks.push(tokio::spawn(nonce_sweep_loop(targets.nonces.clone(), token.clone())));

        TimerService { token, tasks }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn registration_sweep_loop(registrar: Arc<RegistrarTable>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(REGISTRATION_CHECK_PERIOD) => {
                registrar.sweep_expired();
                tracing::debug!("registration sweep complete");
            }
        }
    }
}

async fn pending_sweep_loop(pending: Arc<PendingRequests>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(PENDING_CLEANUP_PERIOD) => {
                pending.sweep_older_than(PENDING_CLEANUP_AGE);
                tracing::debug!("pending-request sweep complete");
            }
        }
    }
}

async fn dialog_sweep_loop(dialogs: Arc<Dialogs>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(DIALOG_SWEEP_PERIOD) => {
                dialogs.sweep_older_than(DIALOG_TIMEOUT);
                tracing::debug!("dialog sweep complete");
            }
        }
    }
}

async fn branch_sweep_loop(branches: Arc<InviteBranches>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(BRANCH_SWEEP_PERIOD) => {
                branches.sweep_older_than(BRANCH_CLEANUP_AGE);
                tracing::debug!("invite-branch sweep complete");
            }
        }
    }
}

async fn nonce_sweep_loop(nonces: Arc<NonceStore>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(REGISTRATION_CHECK_PERIOD) => {
                nonces.sweep(DEFAULT_NONCE_LIFETIME.as_secs());
                tracing::debug!(remaining = nonces.len(), "nonce sweep complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn registration_sweep_drops_expired_binding() {
        let registrar = Arc::new(RegistrarTable::new());
        registrar.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5061", 0);
        // Force an already-expired entry directly via a zero-duration window isn't
        // representative; exercise the sweep call itself instead.
        registrar.sweep_expired();
        assert_eq!(registrar.aor_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_service_shuts_down_cleanly() {
        let targets = TimerTargets {
            registrar: Arc::new(RegistrarTable::new()),
            pending: Arc::new(PendingRequests::new()),
            dialogs: Arc::new(Dialogs::new()),
            branches: Arc::new(InviteBranches::new()),
            nonces: Arc::new(NonceStore::new("sip.local")),
        };
        let service = TimerService::start(targets);
        service.shutdown().await;
    }
}
