//! Process-wide proxy state, `SPEC_FULL.md` §4.12/§9.
//!
//! A single `ProxyState` aggregate owns every shared table plus the engines
//! that act on them, wired together the way `SPEC_FULL.md` §9's
//! "Global mutable proxy tables" re-architecture note describes: each table
//! behind its own `Arc`+lock, handed to whichever engine needs it rather
//! than passed around as loose globals. This is also the collaborator
//! surface the MML/management layer is exposed through (§6): a plain Rust
//! API, no HTTP or WebSocket endpoint of its own.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::auth::NonceStore;
use crate::cdr::CdrEngine;
use crate::config::{ConfigStore, StaticConfig};
use crate::dialog_store::{Dialogs, InviteBranches, PendingRequests};
use crate::error::Result;
use crate::message::parse;
use crate::registrar::RegistrarTable;
use crate::routing::{Action, RoutingEngine};
use crate::timers::{TimerService, TimerTargets};
use crate::transport::DatagramHandler;
use crate::users::UserStore;

/// The full set of shared tables plus the engines that operate over them.
/// Cheap to clone (an `Arc` around the whole thing is typical), every field
/// is itself already `Arc`-wrapped so individual pieces can be handed to the
/// timer service, the auto-dialer, or a future management surface without
/// cloning the aggregate.
pub struct ProxyState {
    pub config: Arc<ConfigStore>,
    pub users: Arc<UserStore>,
    pub cdr: Arc<CdrEngine>,
    pub registrar: Arc<RegistrarTable>,
    pub dialogs: Arc<Dialogs>,
    pub pending: Arc<PendingRequests>,
    pub branches: Arc<InviteBranches>,
    pub nonces: Arc<NonceStore>,
    pub routing: RoutingEngine,
}

impl ProxyState {
    /// Builds every table fresh and loads config/users from disk, in the
    /// order `SPEC_FULL.md` §9 specifies: config, then CDR engine, then user
    /// store. The caller is responsible for starting the transport and
    /// timer service afterwards.
    pub fn init(config_path: impl AsRef<Path>) -> Result<ProxyState> {
        let config = Arc::new(ConfigStore::load(config_path)?);
        let static_config = config.static_config();

        let cdr_merge_mode = config.get_bool("CDR_MERGE_MODE", true);
        let cdr = Arc::new(CdrEngine::new(static_config.cdr_base_dir.clone(), cdr_merge_mode));
        let users = Arc::new(UserStore::load(static_config.users_file.clone())?);

        let registrar = Arc::new(RegistrarTable::new());
        let dialogs = Arc::new(Dialogs::new());
        let pending = Arc::new(PendingRequests::new());
        let branches = Arc::new(InviteBranches::new());
        let nonces = Arc::new(NonceStore::new(static_config.realm.clone()));

        let routing = RoutingEngine {
            registrar: registrar.clone(),
            dialogs: dialogs.clone(),
            pending: pending.clone(),
            branches: branches.clone(),
            nonces: nonces.clone(),
            config: config.clone(),
            cdr: cdr.clone(),
            server_ip: static_config.server_ip.clone(),
            server_port: static_config.server_port,
        };

        Ok(ProxyState { config, users, cdr, registrar, dialogs, pending, branches, nonces, routing })
    }

    pub fn static_config(&self) -> StaticConfig {
        self.config.static_config()
    }

    pub fn timer_targets(&self) -> TimerTargets {
        TimerTargets {
            registrar: self.registrar.clone(),
            pending: self.pending.clone(),
            dialogs: self.dialogs.clone(),
            branches: self.branches.clone(),
            nonces: self.nonces.clone(),
        }
    }

    pub fn start_timers(&self) -> TimerService {
        TimerService::start(self.timer_targets())
    }

    // --- MML-style read/mutate accessors (SPEC_FULL.md §6) ---

    pub fn registration_count(&self, aor: &str) -> usize {
        self.registrar.active_bindings(aor).len()
    }

    pub fn active_dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    pub fn force_expire_registration(&self, aor: &str) {
        self.registrar.retain_contacts(aor, |_| false);
    }

    pub fn terminate_dialog(&self, call_id: &str) -> bool {
        self.dialogs.remove(call_id).is_some()
    }

    pub fn config_snapshot(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.config.get_all()
    }

    pub fn set_config(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.config.set(key, value)
    }

    pub fn cdr_stats(&self, date: Option<&str>) -> Result<std::collections::HashMap<String, u64>> {
        self.cdr.get_stats(date)
    }
}

/// Adapts [`ProxyState`] to [`DatagramHandler`]: parses the datagram,
/// dispatches to the routing engine, and sends back whatever [`Action`]s
/// result. Parse failures are logged and dropped at this boundary per
/// `SPEC_FULL.md` §4.15 — the only fatal error in this crate is a bind
/// failure at startup.
pub struct SipDatagramHandler {
    pub state: Arc<ProxyState>,
}

#[async_trait]
impl DatagramHandler for SipDatagramHandler {
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, socket: &UdpSocket) {
        let msg = match parse(data) {
            Ok(m) => m,
            Err(err) => {
                tracing::debug!(%src, error = %err, "dropping unparsable datagram");
                return;
            }
        };

        let call_id = msg.call_id().unwrap_or("").to_string();
        let span = tracing::info_span!("datagram", call_id = %call_id, peer = %src);
        let _enter = span.enter();

        let actions = if msg.is_request() {
            self.state.routing.handle_request(&msg, src, &self.state.users)
        } else {
            self.state.routing.handle_response(&msg, src)
        };

        for action in actions {
            match action {
                Action::Send { message, to } => {
                    let bytes = message.serialize();
                    if let Err(err) = socket.send_to(&bytes, to).await {
                        tracing::warn!(%to, error = %err, "failed to send response");
                    }
                }
                Action::Drop => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_builds_tables_and_bootstraps_defaults() {
        let dir = std::env::temp_dir().join(format!("statetest-{}", uuid::Uuid::new_v4()));
        let state = ProxyState::init(dir.join("config.json")).unwrap();
        assert_eq!(state.active_dialog_count(), 0);
        assert_eq!(state.users.user_count(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn handler_replies_to_options_locally() {
        let dir = std::env::temp_dir().join(format!("statetest-{}", uuid::Uuid::new_v4()));
        let state = Arc::new(ProxyState::init(dir.join("config.json")).unwrap());
        let handler = SipDatagramHandler { state };

        let server = UdpSocket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let raw = b"OPTIONS sip:192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 1.2.3.4:5060;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:server@h>\r\nCall-ID: opt1\r\nCSeq: 1 OPTIONS\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        handler.handle_datagram(raw, client_addr, &server).await;

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_millis(200), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..len]);
        assert!(text.starts_with("SIP/2.0 200 OK"));
        assert!(text.contains("Supported: replaces, timer"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
