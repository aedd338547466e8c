//! Registrar bindings table, `SPEC_FULL.md` §4.3.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::uri::SipUri;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub contact_uri: String,
    pub absolute_expiry_epoch: u64,
}

impl Binding {
    pub fn is_live(&self, now: u64) -> bool {
        self.absolute_expiry_epoch > now
    }
}

/// AOR -> ordered list of [`Binding`]s, one coarse lock per `SPEC_FULL.md` §5.
pub struct RegistrarTable {
    bindings: Mutex<HashMap<String, Vec<Binding>>>,
}

impl Default for RegistrarTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrarTable {
    pub fn new() -> RegistrarTable {
        RegistrarTable { bindings: Mutex::new(HashMap::new()) }
    }

    /// Live (non-expired) bindings for `aor`, in registration order.
    pub fn active_bindings(&self, aor: &str) -> Vec<Binding> {
        let now = now_secs();
        let guard = self.bindings.lock().expect("registrar lock poisoned");
        guard
            .get(aor)
            .map(|list| list.iter().filter(|b| b.is_live(now)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_active_binding(&self, aor: &str) -> bool {
        !self.active_bindings(aor).is_empty()
    }

    /// Applies one incoming Contact to `aor`: removes expired bindings for
    /// the AOR first, then either removes the matching contact
    /// (`expires_secs == 0`) or upserts `(contact_uri, now + expires_secs)`.
    /// Returns the AOR's binding list (including still-live prior bindings)
    /// after the update, for echoing in the 200 OK.
    pub fn apply_contact(&self, aor: &str, contact_uri: &str, expires_secs: u64) -> Vec<Binding> {
        let now = now_secs();
        let mut guard = self.bindings.lock().expect("registrar lock poisoned");
        let list = guard.entry(aor.to_string()).or_default();
        list.retain(|b| b.is_live(now));

        if expires_secs == 0 {
            list.retain(|b| b.contact_uri != contact_uri);
        } else {
            let expiry = now + expires_secs;
            match list.iter_mut().find(|b| b.contact_uri == contact_uri) {
                Some(existing) => existing.absolute_expiry_epoch = expiry,
                None => list.push(Binding { contact_uri: contact_uri.to_string(), absolute_expiry_epoch: expiry }),
            }
        }

        if list.is_empty() {
            guard.remove(aor);
            Vec::new()
        } else {
            list.clone()
        }
    }

    /// Periodic sweep (`SPEC_FULL.md` §4.6): drops expired bindings and
    /// empty AORs.
    pub fn sweep_expired(&self) {
        let now = now_secs();
        let mut guard = self.bindings.lock().expect("registrar lock poisoned");
        guard.retain(|_, list| {
            list.retain(|b| b.is_live(now));
            !list.is_empty()
        });
    }

    /// Used by the auto-dialer's residual-registration cleanup
    /// (`SPEC_FULL.md` §4.10): truncates `aor`'s binding list to whichever
    /// bindings are kept, by contact URI.
    pub fn retain_contacts(&self, aor: &str, keep: impl Fn(&Binding) -> bool) {
        let mut guard = self.bindings.lock().expect("registrar lock poisoned");
        if let Some(list) = guard.get_mut(aor) {
            list.retain(|b| keep(b));
            if list.is_empty() {
                guard.remove(aor);
            }
        }
    }

    pub fn aor_count(&self) -> usize {
        self.bindings.lock().expect("registrar lock poisoned").len()
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Extracts the AOR (`sip:user@host`, no params/port) from a To/From header
/// value such as `<sip:1001@192.168.8.126>;tag=abc`.
pub fn aor_from_header(header_value: &str) -> Option<String> {
    let uri = crate::uri::extract_uri(header_value)?;
    SipUri::parse(uri).map(|u| u.aor())
}

/// Extracts `(user_part, expires_secs)` from one Contact header value,
/// honouring a Contact-parameter `expires=` over the top-level `Expires`
/// header, defaulting to 3600 (`SPEC_FULL.md` §4.3).
pub fn contact_uri_and_expires(header_value: &str, top_level_expires: Option<u64>) -> Option<(String, u64)> {
    let uri_str = crate::uri::extract_uri(header_value)?;
    let uri = SipUri::parse(uri_str)?;
    let expires = uri
        .param("expires")
        .and_then(|v| v.parse::<u64>().ok())
        .or(top_level_expires)
        .unwrap_or(3600);
    Some((uri.to_string(), expires))
}

/// NAT-learned Contact rewriting: replaces host:port with the datagram's
/// source address, preserving any other parameters (e.g. `;ob`).
pub fn rewrite_contact_host(contact_uri: &str, source: SocketAddr) -> String {
    match SipUri::parse(contact_uri) {
        Some(uri) => uri.with_host_port(&source.ip().to_string(), source.port()).to_string(),
        None => contact_uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upserts_and_expires() {
        let table = RegistrarTable::new();
        table.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5061", 3600);
        assert!(table.has_active_binding("sip:1001@h"));
    }

    #[test]
    fn expires_zero_removes_matching_contact_only() {
        let table = RegistrarTable::new();
        table.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5061", 3600);
        table.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5062", 3600);
        table.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5061", 0);

        let remaining = table.active_bindings("sip:1001@h");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].contact_uri, "sip:1001@1.2.3.4:5062");
    }

    #[test]
    fn preserves_ob_param_after_rewrite() {
        let rewritten = rewrite_contact_host("sip:1001@10.0.0.5:5061;ob", "192.168.8.50:5061".parse().unwrap());
        assert!(rewritten.contains(";ob"));
        assert!(rewritten.contains("192.168.8.50:5061"));
    }

    #[test]
    fn sweep_drops_expired_and_empty_aor() {
        let table = RegistrarTable::new();
        table.apply_contact("sip:1001@h", "sip:1001@1.2.3.4:5061", 0);
        // expires=0 with nothing pre-existing is a no-op insert-then-remove; use a real expiry path instead:
        let table2 = RegistrarTable::new();
        {
            let mut guard = table2.bindings.lock().unwrap();
            guard.insert(
                "sip:1001@h".to_string(),
                vec![Binding { contact_uri: "sip:1001@1.2.3.4:5061".to_string(), absolute_expiry_epoch: 1 }],
            );
        }
        table2.sweep_expired();
        assert_eq!(table2.aor_count(), 0);
        assert_eq!(table.aor_count(), 0);
    }

    #[test]
    fn aor_from_header_strips_tag_and_brackets() {
        let aor = aor_from_header("<sip:1001@192.168.8.126>;tag=abc").unwrap();
        assert_eq!(aor, "sip:1001@192.168.8.126");
    }
}
