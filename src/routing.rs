//! Stateful proxy forwarding / routing engine, `SPEC_FULL.md` §4.4/§4.5.
//!
//! Grounded on `SPEC_FULL.md` §4.4 as primary authority — no routing-specific
//! file was retrieved in `original_source/`, so the hop-by-hop Via/Route/
//! Record-Route manipulation below follows the spec directly. The
//! loose-routing shape (`;lr` Record-Route, strip-our-own-top-Route) follows
//! RFC 3261 §16.12 the way the teacher's `dialog/dialog.rs::do_request`
//! walks a Route set, generalised from a dialog-owned in-process transaction
//! to a stateless per-hop proxy decision.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;

use crate::auth::NonceStore;
use crate::cdr::CdrEngine;
use crate::config::ConfigStore;
use crate::dialog_store::{DialogEndpoints, Dialogs, InviteBranches, PendingRequests};
use crate::message::{Method, SipMessage, StartLine};
use crate::registrar::{self, RegistrarTable};
use crate::sdp;
use crate::uri::{extract_header_param, extract_uri, SipUri};
use crate::users::UserStore;

/// One outbound effect the routing engine wants the transport to perform.
#[derive(Debug)]
pub enum Action {
    Send { message: SipMessage, to: SocketAddr },
    Drop,
}

impl Action {
    pub fn send(message: SipMessage, to: SocketAddr) -> Action {
        Action::Send { message, to }
    }
}

/// One parsed `Via` hop: `SIP/2.0/UDP host:port;branch=...;received=...;rport=...`.
#[derive(Debug, Clone)]
struct ViaHop {
    sent_by_host: String,
    sent_by_port: u16,
    received: Option<String>,
    rport: Option<String>,
}

fn parse_via(raw: &str) -> Option<ViaHop> {
    let raw = raw.trim();
    let space = raw.find(char::is_whitespace)?;
    let rest = raw[space..].trim_start();
    let mut segs = rest.split(';');
    let sent_by = segs.next()?.trim();
    let (host, port) = match sent_by.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(5060)),
        None => (sent_by.to_string(), 5060),
    };
    let mut received = None;
    let mut rport = None;
    for seg in segs {
        let seg = seg.trim();
        if let Some(v) = seg.strip_prefix("received=") {
            received = Some(v.to_string());
        } else if let Some(v) = seg.strip_prefix("rport=") {
            if !v.is_empty() {
                rport = Some(v.to_string());
            }
        }
    }
    Some(ViaHop { sent_by_host: host, sent_by_port: port, received, rport })
}

fn build_via(server_ip: &str, server_port: u16, branch: &str) -> String {
    format!("SIP/2.0/UDP {}:{};branch={}", server_ip, server_port, branch)
}

/// `z9hG4bK-<16 hex chars>`, the RFC 3261-mandated magic-cookie branch.
fn fresh_branch() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("z9hG4bK-{}", hex)
}

fn same_user(from_header: &str, to_header: &str) -> bool {
    let from_user = extract_uri(from_header).and_then(SipUri::parse).and_then(|u| u.user);
    let to_user = extract_uri(to_header).and_then(SipUri::parse).and_then(|u| u.user);
    matches!((from_user, to_user), (Some(a), Some(b)) if a == b)
}

fn next_hop_from_route_or_ruri(msg: &SipMessage) -> Option<(String, u16)> {
    if let Some(route) = msg.headers.get_first("route") {
        let uri_str = extract_uri(route)?;
        return Some(SipUri::parse(uri_str)?.socket_host_port());
    }
    let ruri = msg.request_uri()?;
    Some(SipUri::parse(ruri)?.socket_host_port())
}

fn addr_of(host: &str, port: u16) -> Option<SocketAddr> {
    format!("{host}:{port}").parse().ok()
}

fn reason_phrase(msg: &SipMessage) -> String {
    match &msg.start_line {
        StartLine::Response { reason, .. } => reason.clone(),
        StartLine::Request { .. } => String::new(),
    }
}

pub struct RoutingEngine {
    pub registrar: Arc<RegistrarTable>,
    pub dialogs: Arc<Dialogs>,
    pub pending: Arc<PendingRequests>,
    pub branches: Arc<InviteBranches>,
    pub nonces: Arc<NonceStore>,
    pub config: Arc<ConfigStore>,
    pub cdr: Arc<CdrEngine>,
    pub server_ip: String,
    pub server_port: u16,
}

impl RoutingEngine {
    fn is_self(&self, host: &str, port: u16) -> bool {
        host == self.server_ip && port == self.server_port
    }

    /// Builds a locally-generated response echoing Via/From/To/Call-ID/CSeq,
    /// adding a To-tag if one is absent (skipped for 100 Trying, which must
    /// not establish a dialog).
    fn reply_locally(&self, req: &SipMessage, src: SocketAddr, code: u16, reason: &str) -> Action {
        let mut resp = SipMessage::new_response(code, reason);
        for via in req.headers.get_all("via") {
            resp.headers.push("via", via.clone());
        }
        resp.headers.set("from", req.headers.get_first("from").unwrap_or_default());

        let to = req.headers.get_first("to").unwrap_or_default().to_string();
        let to = if code != 100 && extract_header_param(&to, "tag").is_none() {
            format!("{};tag={}", to, uuid::Uuid::new_v4().simple())
        } else {
            to
        };
        resp.headers.set("to", to);
        resp.headers.set("call-id", req.call_id().unwrap_or_default());
        if let Some(cseq) = req.headers.get_first("cseq") {
            resp.headers.set("cseq", cseq.to_string());
        }
        resp.headers.set("content-length", "0");
        Action::send(resp, src)
    }

    /// Self-loop recovery (`SPEC_FULL.md` §4.4 "Next-hop selection"): when
    /// the raw next hop resolves back to us, substitute the appropriate
    /// Dialog endpoint instead of forwarding to ourselves.
    fn resolve_next_hop(&self, msg: &SipMessage, call_id: &str, prefer_callee: bool) -> Option<SocketAddr> {
        let (host, port) = next_hop_from_route_or_ruri(msg)?;
        if !self.is_self(&host, port) {
            return addr_of(&host, port);
        }
        let endpoints = self.dialogs.get(call_id)?;
        Some(if prefer_callee { endpoints.callee } else { endpoints.caller })
    }

    pub fn handle_request(&self, req: &SipMessage, src: SocketAddr, users: &UserStore) -> Vec<Action> {
        let method = match req.method() {
            Some(m) => m,
            None => return vec![],
        };

        if method == Method::Register {
            return self.handle_register(req, src, users);
        }
        if method == Method::Options {
            return vec![self.reply_options(req, src)];
        }

        let mf = req.max_forwards().unwrap_or(70);
        if mf - 1 < 0 {
            return vec![self.reply_locally(req, src, 483, "Too Many Hops")];
        }
        let new_mf = mf - 1;

        match method {
            Method::Invite => self.handle_invite(req, src, new_mf),
            Method::Cancel => self.handle_cancel(req, src, new_mf),
            Method::Ack => self.handle_ack(req, new_mf),
            Method::Message => self.handle_message(req, src, new_mf),
            Method::Bye | Method::Update | Method::Prack | Method::Refer | Method::Notify | Method::Subscribe => {
                self.handle_in_dialog(req, src, new_mf)
            }
            _ => vec![self.reply_locally(req, src, 501, "Not Implemented")],
        }
    }

    fn reply_options(&self, req: &SipMessage, src: SocketAddr) -> Action {
        if let Some(call_id) = req.call_id() {
            let from_header = req.headers.get_first("from").unwrap_or_default();
            self.cdr.record_options(call_id, from_header).ok();
        }
        match self.reply_locally(req, src, 200, "OK") {
            Action::Send { mut message, to } => {
                message.headers.set("accept", "application/sdp");
                message.headers.set("supported", "replaces, timer");
                Action::Send { message, to }
            }
            other => other,
        }
    }

    fn handle_register(&self, req: &SipMessage, src: SocketAddr, users: &UserStore) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };

        let lifetime = self
            .config
            .get("NONCE_LIFETIME_SECS")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(300);

        if !crate::auth::check_digest(&self.nonces, users, req, Method::Register, lifetime) {
            // A 401 challenge is a normal step, not a recorded failure (§4.3).
            let resp = crate::auth::make_401(&self.nonces, req);
            return vec![Action::send(resp, src)];
        }

        let to_header = req.headers.get_first("to").unwrap_or_default().to_string();
        let aor = match registrar::aor_from_header(&to_header) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 400, "Bad Request")],
        };

        let top_level_expires = req.headers.get_first("expires").and_then(|v| v.trim().parse::<u64>().ok());

        let mut bindings = self.registrar.active_bindings(&aor);
        let mut last_applied: Option<(String, u64)> = None;
        for contact_header in req.headers.get_all("contact") {
            if let Some((uri, expires)) = registrar::contact_uri_and_expires(contact_header, top_level_expires) {
                let rewritten = registrar::rewrite_contact_host(&uri, src);
                bindings = self.registrar.apply_contact(&aor, &rewritten, expires);
                last_applied = Some((rewritten, expires));
            }
        }

        let mut resp = SipMessage::new_response(200, "OK");
        for via in req.headers.get_all("via") {
            resp.headers.push("via", via.clone());
        }
        resp.headers.set("from", req.headers.get_first("from").unwrap_or_default());
        let to = if extract_header_param(&to_header, "tag").is_none() {
            format!("{};tag={}", to_header, uuid::Uuid::new_v4().simple())
        } else {
            to_header.clone()
        };
        resp.headers.set("to", to);
        resp.headers.set("call-id", &call_id);
        if let Some(cseq) = req.headers.get_first("cseq") {
            resp.headers.set("cseq", cseq.to_string());
        }
        let now = registrar::now_secs();
        for binding in &bindings {
            resp.headers.push(
                "contact",
                format!("<{}>;expires={}", binding.contact_uri, binding.absolute_expiry_epoch.saturating_sub(now)),
            );
        }
        resp.headers.set("content-length", "0");

        if let Some((contact, expires)) = last_applied {
            if expires == 0 {
                self.cdr.record_unregister(&call_id, &aor, &contact).ok();
            } else {
                self.cdr.record_register(&call_id, &aor, &contact, expires, true).ok();
            }
        }

        vec![Action::send(resp, src)]
    }

    fn handle_invite(&self, req: &SipMessage, src: SocketAddr, new_mf: i32) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };

        if self.dialogs.contains(&call_id) {
            // Retransmitted INVITE for an already-confirmed dialog (§4.5).
            return vec![self.reply_locally(req, src, 100, "Trying")];
        }

        let to_header = req.headers.get_first("to").unwrap_or_default().to_string();
        let from_header = req.headers.get_first("from").unwrap_or_default().to_string();

        let to_aor = match registrar::aor_from_header(&to_header) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 404, "Not Found")],
        };

        let bindings = self.registrar.active_bindings(&to_aor);
        if bindings.is_empty() {
            return vec![self.reply_locally(req, src, 480, "Temporarily Unavailable")];
        }

        let contact = match SipUri::parse(&bindings[0].contact_uri) {
            Some(u) => u.without_params(&["ob", "transport"]),
            None => return vec![self.reply_locally(req, src, 502, "Bad Gateway")],
        };
        let (callee_host, callee_port) = contact.socket_host_port();
        if self.is_self(&callee_host, callee_port) {
            return vec![self.reply_locally(req, src, 502, "Bad Gateway")];
        }
        let callee_addr = match addr_of(&callee_host, callee_port) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 502, "Bad Gateway")],
        };

        let mut out = req.clone();
        out.headers.remove("route"); // IMS mode: strip any incoming Route set.
        out.set_request_uri(contact.to_string());

        if same_user(&from_header, &to_header) {
            if let Some(rewritten) = self.normalize_from(&from_header, src) {
                out.headers.set("from", rewritten);
            }
        }

        out.headers.push_front("record-route", format!("<sip:{}:{};lr>", self.server_ip, self.server_port));
        let branch = fresh_branch();
        out.headers.push_front("via", build_via(&self.server_ip, self.server_port, &branch));
        out.headers.set("max-forwards", new_mf.to_string());

        self.branches.insert(&call_id, branch);
        self.pending.insert(&call_id, src);
        self.dialogs.insert(&call_id, DialogEndpoints { caller: src, callee: callee_addr });
        self.cdr.record_call_start(&call_id, &from_header, &to_header, chrono::Utc::now());

        vec![Action::send(out, callee_addr)]
    }

    /// Rewrites the From URI's host:port to the datagram source, preserving
    /// the tag, to normalise loopback test calls where a UA calls itself
    /// (`SPEC_FULL.md` §4.4).
    fn normalize_from(&self, from_header: &str, src: SocketAddr) -> Option<String> {
        let uri_str = extract_uri(from_header)?;
        let uri = SipUri::parse(uri_str)?;
        let rewritten = uri.with_host_port(&src.ip().to_string(), src.port());
        Some(match extract_header_param(from_header, "tag") {
            Some(tag) => format!("<{}>;tag={}", rewritten, tag),
            None => format!("<{}>", rewritten),
        })
    }

    fn handle_cancel(&self, req: &SipMessage, src: SocketAddr, new_mf: i32) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };
        let to_header = req.headers.get_first("to").unwrap_or_default().to_string();

        let mut out = req.clone();
        if let Some(uri) = out.request_uri().and_then(SipUri::parse) {
            let (h, p) = uri.socket_host_port();
            if self.is_self(&h, p) {
                if let Some(aor) = registrar::aor_from_header(&to_header) {
                    if let Some(binding) = self.registrar.active_bindings(&aor).first() {
                        if let Some(contact) = SipUri::parse(&binding.contact_uri) {
                            out.set_request_uri(contact.without_params(&["ob", "transport"]).to_string());
                        }
                    }
                }
            }
        }

        let dest = match self.resolve_next_hop(&out, &call_id, true) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 502, "Bad Gateway")],
        };

        let reuse = self.config.get_bool("CANCEL_REUSE_BRANCH", true);
        let branch = if reuse { self.branches.get(&call_id).unwrap_or_else(fresh_branch) } else { fresh_branch() };
        out.headers.push_front("via", build_via(&self.server_ip, self.server_port, &branch));
        out.headers.set("max-forwards", new_mf.to_string());

        vec![Action::send(out, dest)]
    }

    fn handle_ack(&self, req: &SipMessage, new_mf: i32) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };
        let to_header = req.headers.get_first("to").unwrap_or_default();
        let has_to_tag = extract_header_param(to_header, "tag").is_some();
        let has_route = req.headers.contains("route");
        let is_2xx_ack = has_to_tag && (has_route || self.dialogs.contains(&call_id));

        if is_2xx_ack {
            let mut out = req.clone();
            if let Some(route0) = out.headers.get_first("route") {
                if let Some(uri) = SipUri::parse(extract_uri(route0).unwrap_or(route0)) {
                    let (h, p) = uri.socket_host_port();
                    if self.is_self(&h, p) {
                        out.headers.remove_first("route");
                    }
                }
            }
            out.headers.set("max-forwards", new_mf.to_string());
            match self.resolve_next_hop(&out, &call_id, true) {
                Some(addr) => vec![Action::send(out, addr)],
                None => vec![Action::Drop],
            }
        } else {
            // Non-2xx ACK: transparent forward, no header manipulation at all.
            match self.dialogs.get(&call_id) {
                Some(endpoints) => vec![Action::send(req.clone(), endpoints.callee)],
                None => vec![Action::Drop],
            }
        }
    }

    fn handle_message(&self, req: &SipMessage, src: SocketAddr, new_mf: i32) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };
        let to_header = req.headers.get_first("to").unwrap_or_default().to_string();
        let from_header = req.headers.get_first("from").unwrap_or_default().to_string();

        let to_aor = match registrar::aor_from_header(&to_header) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 404, "Not Found")],
        };
        let bindings = self.registrar.active_bindings(&to_aor);
        if bindings.is_empty() {
            return vec![self.reply_locally(req, src, 480, "Temporarily Unavailable")];
        }
        let contact = match SipUri::parse(&bindings[0].contact_uri) {
            Some(u) => u.without_params(&["ob", "transport"]),
            None => return vec![self.reply_locally(req, src, 502, "Bad Gateway")],
        };
        let (host, port) = contact.socket_host_port();
        if self.is_self(&host, port) {
            return vec![self.reply_locally(req, src, 502, "Bad Gateway")];
        }
        let addr = match addr_of(&host, port) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 502, "Bad Gateway")],
        };

        let mut out = req.clone();
        out.headers.remove("route");
        out.set_request_uri(contact.to_string());
        let branch = fresh_branch();
        out.headers.push_front("via", build_via(&self.server_ip, self.server_port, &branch));
        out.headers.set("max-forwards", new_mf.to_string());

        self.pending.insert(&call_id, src);
        let body = String::from_utf8_lossy(&req.body).to_string();
        self.cdr.record_message(&call_id, &from_header, &to_header, &body).ok();

        vec![Action::send(out, addr)]
    }

    fn handle_in_dialog(&self, req: &SipMessage, src: SocketAddr, new_mf: i32) -> Vec<Action> {
        let call_id = match req.call_id() {
            Some(c) => c.to_string(),
            None => return vec![],
        };
        let method = req.method();

        let mut out = req.clone();
        if let Some(route0) = out.headers.get_first("route") {
            if let Some(uri) = SipUri::parse(extract_uri(route0).unwrap_or(route0)) {
                let (h, p) = uri.socket_host_port();
                if self.is_self(&h, p) {
                    out.headers.remove_first("route");
                }
            }
        }

        let ruri_has_ob = out.request_uri().and_then(SipUri::parse).map(|u| u.has_param("ob")).unwrap_or(false);
        if ruri_has_ob {
            let to_header = out.headers.get_first("to").unwrap_or_default().to_string();
            if let Some(aor) = registrar::aor_from_header(&to_header) {
                if let Some(binding) = self.registrar.active_bindings(&aor).first() {
                    if let Some(contact) = SipUri::parse(&binding.contact_uri) {
                        out.set_request_uri(contact.without_params(&["ob", "transport"]).to_string());
                        out.headers.remove("route");
                        out.headers.remove("record-route");
                    }
                }
            }
        }

        let branch = fresh_branch();
        out.headers.push_front("via", build_via(&self.server_ip, self.server_port, &branch));
        out.headers.set("max-forwards", new_mf.to_string());

        let prefer_callee = self.dialogs.get(&call_id).map(|e| e.caller == src).unwrap_or(true);
        let dest = match self.resolve_next_hop(&out, &call_id, prefer_callee) {
            Some(a) => a,
            None => return vec![self.reply_locally(req, src, 480, "Temporarily Unavailable")],
        };

        self.pending.insert(&call_id, src);
        if method == Some(Method::Bye) {
            self.dialogs.touch(&call_id);
        }

        vec![Action::send(out, dest)]
    }

    pub fn handle_response(&self, msg: &SipMessage, src: SocketAddr) -> Vec<Action> {
        let call_id = match msg.call_id() {
            Some(c) => c.to_string(),
            None => return vec![Action::Drop],
        };
        let status = msg.status_code().unwrap_or(0);
        let cseq = msg.cseq();

        if self.config.get_bool("DROP_REFLECTED_ERRORS", false) && matches!(status, 482 | 483 | 502 | 503 | 504) {
            return vec![Action::Drop];
        }

        let mut out = msg.clone();
        let top_via = out.headers.get_first("via").and_then(parse_via);
        let via_is_ours = top_via.as_ref().map(|v| self.is_self(&v.sent_by_host, v.sent_by_port)).unwrap_or(false);
        if via_is_ours {
            out.headers.remove_first("via");
        }

        if self.config.get_bool("FORCE_LOCAL_ADDR", false) {
            self.rewrite_contacts_to_loopback(&mut out);
        }

        let is_invite = cseq.map(|(_, m)| m == Method::Invite).unwrap_or(false);
        let is_bye = cseq.map(|(_, m)| m == Method::Bye).unwrap_or(false);

        let dest = if is_invite && status >= 200 {
            self.dialogs.get(&call_id).map(|e| e.caller)
        } else {
            None
        }
        .or_else(|| self.via_derived_dest(&out))
        .or_else(|| self.pending.get(&call_id))
        .unwrap_or(src);

        if status >= 200 {
            self.pending.remove(&call_id);
        }

        if is_invite {
            if (200..300).contains(&status) {
                self.dialogs.touch(&call_id);
                let (call_type, codec) = sdp::extract_sdp_info(&out.body);
                self.cdr.record_call_answer(&call_id, chrono::Utc::now(), &call_type, &codec);
            } else if status >= 400 && self.dialogs.contains(&call_id) {
                self.dialogs.remove(&call_id);
                self.pending.remove(&call_id);
                self.branches.remove(&call_id);
                if status == 487 {
                    self.cdr.record_call_cancel(&call_id, chrono::Utc::now()).ok();
                } else {
                    self.cdr.record_call_fail(&call_id, chrono::Utc::now(), status, &reason_phrase(&out)).ok();
                }
            } else if status == 180 || status == 183 {
                self.cdr.record_ringing(&call_id, chrono::Utc::now());
            }
        } else if is_bye && status == 200 {
            self.dialogs.remove(&call_id);
            self.branches.remove(&call_id);
            self.cdr.record_call_end(&call_id, chrono::Utc::now(), "normal").ok();
        }

        vec![Action::send(out, dest)]
    }

    /// `received`/`rport` on the (now-topmost, already-stripped) Via if
    /// present, else its `sent-by`.
    fn via_derived_dest(&self, msg: &SipMessage) -> Option<SocketAddr> {
        let via = msg.headers.get_first("via").and_then(parse_via)?;
        let host = via.received.unwrap_or(via.sent_by_host);
        let port = via.rport.and_then(|p| p.parse().ok()).unwrap_or(via.sent_by_port);
        addr_of(&host, port)
    }

    fn rewrite_contacts_to_loopback(&self, msg: &mut SipMessage) {
        let rewritten: Vec<String> = msg
            .headers
            .get_all("contact")
            .iter()
            .map(|c| match extract_uri(c).and_then(SipUri::parse) {
                Some(uri) => {
                    let port = uri.port.unwrap_or(5060);
                    format!("<{}>", uri.with_host_port("127.0.0.1", port))
                }
                None => c.clone(),
            })
            .collect();
        if !rewritten.is_empty() {
            msg.headers.remove("contact");
            for c in rewritten {
                msg.headers.push("contact", c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parse;

    fn engine() -> RoutingEngine {
        RoutingEngine {
            registrar: Arc::new(RegistrarTable::new()),
            dialogs: Arc::new(Dialogs::new()),
            pending: Arc::new(PendingRequests::new()),
            branches: Arc::new(InviteBranches::new()),
            nonces: Arc::new(NonceStore::new("sip.local")),
            config: Arc::new(ConfigStore::load(std::env::temp_dir().join(format!("rt-{}", uuid::Uuid::new_v4())).join("c.json")).unwrap()),
            cdr: Arc::new(CdrEngine::new(std::env::temp_dir().join(format!("rt-cdr-{}", uuid::Uuid::new_v4())), true)),
            server_ip: "192.168.8.126".to_string(),
            server_port: 5060,
        }
    }

    fn users() -> UserStore {
        UserStore::load(std::env::temp_dir().join(format!("rt-users-{}", uuid::Uuid::new_v4())).join("u.json")).unwrap()
    }

    fn register(engine: &RoutingEngine, aor_user: &str, addr: SocketAddr) {
        engine.registrar.apply_contact(&format!("sip:{}@192.168.8.126", aor_user), &format!("sip:{}@{}", aor_user, addr), 3600);
    }

    #[test]
    fn initial_invite_sets_via_and_record_route_and_memoises_branch() {
        let eng = engine();
        let callee: SocketAddr = "192.168.8.51:5062".parse().unwrap();
        register(&eng, "1002", callee);

        let raw = b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.8.50:5061;branch=z9hG4bK-orig\r\n\
From: <sip:1001@192.168.8.126>;tag=a\r\n\
To: <sip:1002@192.168.8.126>\r\n\
Call-ID: abc@1001\r\n\
CSeq: 1 INVITE\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let src: SocketAddr = "192.168.8.50:5061".parse().unwrap();
        let actions = eng.handle_request(&req, src, &users());

        assert_eq!(actions.len(), 1);
        let Action::Send { message, to } = &actions[0] else { panic!("expected Send") };
        assert_eq!(*to, callee);
        assert!(message.headers.get_first("record-route").unwrap().contains("192.168.8.126:5060;lr"));
        let via = message.headers.get_first("via").unwrap();
        assert!(via.contains("z9hG4bK-"));
        assert!(!via.contains("z9hG4bK-orig"));

        let stored_branch = eng.branches.get("abc@1001").unwrap();
        assert!(via.contains(&stored_branch));
        assert!(eng.dialogs.contains("abc@1001"));
        assert_eq!(message.max_forwards(), Some(69));
    }

    #[test]
    fn retransmitted_invite_for_existing_dialog_gets_100_trying() {
        let eng = engine();
        eng.dialogs.insert(
            "abc@1001",
            DialogEndpoints { caller: "192.168.8.50:5061".parse().unwrap(), callee: "192.168.8.51:5062".parse().unwrap() },
        );
        let raw = b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: abc@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let actions = eng.handle_request(&req, "192.168.8.50:5061".parse().unwrap(), &users());
        assert_eq!(actions.len(), 1);
        let Action::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(message.status_code(), Some(100));
    }

    #[test]
    fn unregistered_callee_yields_480_and_no_dialog() {
        let eng = engine();
        let raw = b"INVITE sip:1003@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1003@h>\r\nCall-ID: c2@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let actions = eng.handle_request(&req, "192.168.8.50:5061".parse().unwrap(), &users());
        let Action::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(message.status_code(), Some(480));
        assert!(!eng.dialogs.contains("c2@1001"));
    }

    #[test]
    fn max_forwards_exceeded_yields_483() {
        let eng = engine();
        let raw = b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: c3@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 0\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let actions = eng.handle_request(&req, "192.168.8.50:5061".parse().unwrap(), &users());
        let Action::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(message.status_code(), Some(483));
    }

    #[test]
    fn cancel_reuses_saved_invite_branch_by_default() {
        let eng = engine();
        let callee: SocketAddr = "192.168.8.51:5062".parse().unwrap();
        register(&eng, "1002", callee);
        let caller: SocketAddr = "192.168.8.50:5061".parse().unwrap();

        let invite = parse(b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: c4@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n").unwrap();
        eng.handle_request(&invite, caller, &users());
        let saved_branch = eng.branches.get("c4@1001").unwrap();

        let cancel = parse(b"CANCEL sip:1002@192.168.8.51:5062 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=2\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: c4@1001\r\nCSeq: 2 CANCEL\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n").unwrap();
        let actions = eng.handle_request(&cancel, caller, &users());
        let Action::Send { message, .. } = &actions[0] else { panic!() };
        assert!(message.headers.get_first("via").unwrap().contains(&saved_branch));
    }

    #[test]
    fn non_2xx_ack_is_transparent_and_drops_without_dialog() {
        let eng = engine();
        // No Route header -> a non-2xx ACK per RFC 3261 §17.1.1.3. Without a
        // live Dialog (already destroyed on the 4xx/5xx/6xx response) it is
        // dropped.
        let raw = b"ACK sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c5@1001\r\nCSeq: 1 ACK\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let actions = eng.handle_request(&req, "192.168.8.50:5061".parse().unwrap(), &users());
        assert!(matches!(actions[0], Action::Drop));
    }

    #[test]
    fn twoxx_ack_routes_via_route_header_and_strips_our_hop() {
        let eng = engine();
        let caller: SocketAddr = "192.168.8.50:5061".parse().unwrap();
        let callee: SocketAddr = "192.168.8.51:5062".parse().unwrap();
        eng.dialogs.insert("c5@1001", DialogEndpoints { caller, callee });

        let raw = format!(
            "ACK sip:1002@192.168.8.51:5062 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nRoute: <sip:{}:{};lr>\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c5@1001\r\nCSeq: 1 ACK\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n",
            eng.server_ip, eng.server_port
        );
        let req = parse(raw.as_bytes()).unwrap();
        let actions = eng.handle_request(&req, caller, &users());
        let Action::Send { message, to } = &actions[0] else { panic!() };
        assert_eq!(*to, callee);
        assert!(!message.headers.contains("route"));
    }

    #[test]
    fn invite_200_then_bye_200_destroys_dialog() {
        let eng = engine();
        let callee: SocketAddr = "192.168.8.51:5062".parse().unwrap();
        register(&eng, "1002", callee);
        let caller: SocketAddr = "192.168.8.50:5061".parse().unwrap();

        let invite = parse(b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: c6@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n").unwrap();
        let fwd = eng.handle_request(&invite, caller, &users());
        let Action::Send { message: out_invite, .. } = &fwd[0] else { panic!() };
        let our_branch = out_invite.headers.get_first("via").unwrap().to_string();

        let ok = parse(
            format!(
                "SIP/2.0 200 OK\r\nVia: {}\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c6@1001\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
                our_branch
            )
            .as_bytes(),
        )
        .unwrap();
        let actions = eng.handle_response(&ok, callee);
        let Action::Send { message, to } = &actions[0] else { panic!() };
        assert_eq!(*to, caller);
        assert!(!message.headers.get_all("via").iter().any(|v| v.contains("192.168.8.126")));
        assert!(eng.dialogs.contains("c6@1001"));

        let bye = parse(b"BYE sip:1002@192.168.8.51:5062 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=3\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c6@1001\r\nCSeq: 2 BYE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n").unwrap();
        let fwd_bye = eng.handle_request(&bye, caller, &users());
        let Action::Send { message: out_bye, to } = &fwd_bye[0] else { panic!() };
        assert_eq!(*to, callee);

        let bye_ok = parse(
            format!(
                "SIP/2.0 200 OK\r\nVia: {}\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=3\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c6@1001\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n",
                out_bye.headers.get_first("via").unwrap()
            )
            .as_bytes(),
        )
        .unwrap();
        eng.handle_response(&bye_ok, callee);
        assert!(!eng.dialogs.contains("c6@1001"));
    }

    #[test]
    fn busy_486_destroys_dialog_and_records_failed_once() {
        let eng = engine();
        let callee: SocketAddr = "192.168.8.51:5062".parse().unwrap();
        register(&eng, "1002", callee);
        let caller: SocketAddr = "192.168.8.50:5061".parse().unwrap();

        let invite = parse(b"INVITE sip:1002@192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>\r\nCall-ID: c7@1001\r\nCSeq: 1 INVITE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n").unwrap();
        let fwd = eng.handle_request(&invite, caller, &users());
        let Action::Send { message: out, .. } = &fwd[0] else { panic!() };
        let via = out.headers.get_first("via").unwrap().to_string();

        let busy = parse(
            format!(
                "SIP/2.0 486 Busy Here\r\nVia: {}\r\nFrom: <sip:1001@h>;tag=a\r\nTo: <sip:1002@h>;tag=b\r\nCall-ID: c7@1001\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
                via
            )
            .as_bytes(),
        )
        .unwrap();
        eng.handle_response(&busy, callee);
        assert!(!eng.dialogs.contains("c7@1001"));
        assert!(eng.branches.get("c7@1001").is_none());
    }

    #[test]
    fn register_200_echoes_bindings() {
        let eng = engine();
        let raw = b"REGISTER sip:192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@192.168.8.126>;tag=a\r\nTo: <sip:1001@192.168.8.126>\r\nCall-ID: reg1@1001\r\nCSeq: 1 REGISTER\r\nContact: <sip:1001@192.168.8.50:5061>\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let u = users();
        u.add_user(crate::users::User {
            username: "1001".to_string(),
            password: "1001".to_string(),
            display_name: String::new(),
            phone: String::new(),
            email: String::new(),
            status: crate::users::UserStatus::Active,
            service_type: "BASIC".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

        // First pass: no Authorization -> 401.
        let actions = eng.handle_request(&req, "192.168.8.50:5061".parse().unwrap(), &u);
        let Action::Send { message, .. } = &actions[0] else { panic!() };
        assert_eq!(message.status_code(), Some(401));

        let nonce = message.headers.get_first("www-authenticate").unwrap();
        let nonce = nonce.split("nonce=\"").nth(1).unwrap().split('"').next().unwrap();
        let ha1 = format!("{:x}", md5::compute(b"1001:sip.local:1001"));
        let ha2 = format!("{:x}", md5::compute(b"REGISTER:sip:192.168.8.126"));
        let expected = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()));
        let raw2 = format!(
            "REGISTER sip:192.168.8.126 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.50:5061;branch=1\r\nFrom: <sip:1001@192.168.8.126>;tag=a\r\nTo: <sip:1001@192.168.8.126>\r\nCall-ID: reg1@1001\r\nCSeq: 2 REGISTER\r\nContact: <sip:1001@192.168.8.50:5061>\r\nAuthorization: Digest username=\"1001\", realm=\"sip.local\", nonce=\"{}\", uri=\"sip:192.168.8.126\", response=\"{}\"\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n",
            nonce, expected
        );
        let req2 = parse(raw2.as_bytes()).unwrap();
        let actions2 = eng.handle_request(&req2, "192.168.8.50:5061".parse().unwrap(), &u);
        let Action::Send { message, .. } = &actions2[0] else { panic!() };
        assert_eq!(message.status_code(), Some(200));
        assert!(message.headers.get_first("contact").unwrap().contains("192.168.8.50:5061"));
    }
}
