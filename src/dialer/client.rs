//! Auto-dialer SIP client, `SPEC_FULL.md` §4.10.
//!
//! Grounded on the teacher's `dialog/registration.rs.teacher-ref` (401
//! retry loop, Contact re-derivation) and `dialog/invitation.rs.teacher-ref`
//! (INVITE construction, tag/branch generation) adapted from `rsip`'s typed
//! header builders to this crate's own `message::SipMessage`/`uri::SipUri`,
//! and on `routing.rs`'s `fresh_branch`/`build_via` shape (duplicated here
//! rather than imported since those helpers are private to the proxy
//! engine's module). One call = one local UDP socket, exactly as
//! `SPEC_FULL.md` §4.10 calls for so concurrent calls never share a dialog.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::cdr::CdrEngine;
use crate::error::Result;
use crate::media::player::play_wav_as_rtp;
use crate::message::{parse, Method, SipMessage};
use crate::sdp;
use crate::uri::{extract_header_param, extract_uri, SipUri};

const CALL_SETUP_TIMEOUT: Duration = Duration::from_secs(30);
const BYE_TIMEOUT: Duration = Duration::from_secs(5);
const SIP_PORT_BASE: u32 = 10_000;
const SIP_PORT_TOP: u32 = 15_000;
const RTP_PORT_BASE: u32 = 20_000;
const RTP_PORT_TOP: u32 = 30_000;

fn fresh_branch() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("z9hG4bK-{}", hex)
}

fn make_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn build_via(local_ip: &str, local_port: u16, branch: &str) -> String {
    format!("SIP/2.0/UDP {}:{};branch={}", local_ip, local_port, branch)
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// Legacy (no-`qop`) digest response, matching `auth::check_digest`'s
/// verification formula on the server side.
fn digest_response(username: &str, password: &str, realm: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
}

/// Static dial-out parameters; distinct from the proxy's `ConfigStore`,
/// which only governs proxy-side dynamic keys (`SPEC_FULL.md` §4.10/§4.12a).
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub local_ip: String,
    pub username: String,
    pub password: String,
    pub realm: String,
    pub local_port: u16,
}

impl Default for DialerConfig {
    fn default() -> Self {
        DialerConfig {
            server_ip: "127.0.0.1".to_string(),
            server_port: 5060,
            local_ip: "127.0.0.1".to_string(),
            username: String::new(),
            password: String::new(),
            realm: "sip.local".to_string(),
            local_port: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub success: bool,
    pub message: String,
}

/// One outbound call's dialog bookkeeping, `SPEC_FULL.md` §3
/// "CallState (outbound auto-dialer)".
struct CallSession {
    call_id: String,
    from_tag: String,
    to_tag: Option<String>,
    local_cseq: u32,
    route_set: Vec<String>,
    remote_contact: Option<String>,
    callee_username: String,
    remote_rtp_endpoint: Option<SocketAddr>,
    local_sip_port: u16,
    local_rtp_port: u16,
}

/// A UA issuing REGISTER/INVITE/ACK/BYE against the proxy, one background
/// socket per concurrent call (`SPEC_FULL.md` §4.10).
pub struct AutoDialerClient {
    config: DialerConfig,
    cdr: Arc<CdrEngine>,
    registered: AtomicBool,
    main_socket: Mutex<Option<Arc<UdpSocket>>>,
    main_cseq: Mutex<u32>,
    sip_port_counter: AtomicU32,
    rtp_port_counter: AtomicU32,
    seen_bye: Mutex<HashSet<(String, u32)>>,
}

impl AutoDialerClient {
    pub fn new(config: DialerConfig, cdr: Arc<CdrEngine>) -> AutoDialerClient {
        let local_port = config.local_port as u32;
        AutoDialerClient {
            config,
            cdr,
            registered: AtomicBool::new(false),
            main_socket: Mutex::new(None),
            main_cseq: Mutex::new(1),
            sip_port_counter: AtomicU32::new(local_port + 1),
            rtp_port_counter: AtomicU32::new(RTP_PORT_BASE),
            seen_bye: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn next_sip_port(&self) -> u16 {
        let port = self.sip_port_counter.fetch_add(1, Ordering::SeqCst);
        if port > SIP_PORT_TOP {
            self.sip_port_counter.store(SIP_PORT_BASE + 1, Ordering::SeqCst);
            (SIP_PORT_BASE + 1) as u16
        } else {
            port as u16
        }
    }

    fn next_rtp_port(&self) -> u16 {
        let port = self.rtp_port_counter.fetch_add(1, Ordering::SeqCst);
        if port > RTP_PORT_TOP {
            self.rtp_port_counter.store(RTP_PORT_BASE, Ordering::SeqCst);
            RTP_PORT_BASE as u16
        } else {
            port as u16
        }
    }

    fn server_addr(&self) -> SocketAddr {
        format!("{}:{}", self.config.server_ip, self.config.server_port).parse().expect("valid server addr")
    }

    fn aor(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.server_ip)
    }

    /// Sends REGISTER once; on a 401 challenge, recomputes the digest
    /// response and resends with an incremented CSeq (`SPEC_FULL.md` §4.10).
    pub async fn register(&self) -> Result<bool> {
        let local_addr: SocketAddr = format!("0.0.0.0:{}", self.config.local_port).parse().expect("valid addr");
        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let server = self.server_addr();

        let call_id = format!("{}-reg", uuid::Uuid::new_v4());
        let from_tag = make_tag();
        let contact = format!("sip:{}@{}:{}", self.config.username, self.config.local_ip, self.config.local_port);

        let mut cseq = { *self.main_cseq.lock().expect("cseq lock poisoned") };
        let mut request = self.build_register(&call_id, &from_tag, &contact, cseq, None);

        socket.send_to(&request.serialize(), server).await?;
        let resp = match self.recv_response(&socket, CALL_SETUP_TIMEOUT).await {
            Some(r) => r,
            None => return Ok(false),
        };

        if resp.status_code() == Some(401) {
            let www_auth = resp.headers.get_first("www-authenticate").unwrap_or_default().to_string();
            let nonce = extract_header_param(&www_auth, "nonce").unwrap_or_default().to_string();
            let uri = format!("sip:{}", self.config.server_ip);
            let response = digest_response(&self.config.username, &self.config.password, &self.config.realm, &nonce, "REGISTER", &uri);

            cseq += 1;
            request = self.build_register(&call_id, &from_tag, &contact, cseq, Some((&nonce, &uri, &response)));
            socket.send_to(&request.serialize(), server).await?;

            let resp2 = match self.recv_response(&socket, CALL_SETUP_TIMEOUT).await {
                Some(r) => r,
                None => return Ok(false),
            };
            *self.main_cseq.lock().expect("cseq lock poisoned") = cseq;
            let ok = resp2.status_code() == Some(200);
            self.registered.store(ok, Ordering::SeqCst);
            if ok {
                *self.main_socket.lock().expect("socket lock poisoned") = Some(socket);
            }
            return Ok(ok);
        }

        let ok = resp.status_code() == Some(200);
        self.registered.store(ok, Ordering::SeqCst);
        if ok {
            *self.main_socket.lock().expect("socket lock poisoned") = Some(socket);
        }
        Ok(ok)
    }

    pub fn stop(&self) {
        self.registered.store(false, Ordering::SeqCst);
        *self.main_socket.lock().expect("socket lock poisoned") = None;
    }

    fn build_register(
        &self,
        call_id: &str,
        from_tag: &str,
        contact: &str,
        cseq: u32,
        auth: Option<(&str, &str, &str)>,
    ) -> SipMessage {
        let aor = self.aor();
        let branch = fresh_branch();
        let mut req = SipMessage::new_request(Method::Register, "REGISTER", format!("sip:{}", self.config.server_ip));
        req.headers.push("via", build_via(&self.config.local_ip, self.config.local_port, &branch));
        req.headers.push("from", format!("<{}>;tag={}", aor, from_tag));
        req.headers.push("to", format!("<{}>", aor));
        req.headers.push("call-id", call_id);
        req.headers.push("cseq", format!("{} REGISTER", cseq));
        req.headers.push("contact", format!("<{}>", contact));
        req.headers.push("expires", "3600");
        req.headers.push("max-forwards", "70");
        if let Some((nonce, uri, response)) = auth {
            req.headers.push(
                "authorization",
                format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.config.username, self.config.realm, nonce, uri, response
                ),
            );
        }
        req
    }

    /// Receives datagrams on `socket` until a SIP response parses out, or
    /// `budget` elapses.
    async fn recv_response(&self, socket: &UdpSocket, budget: Duration) -> Option<SipMessage> {
        let deadline = Instant::now() + budget;
        let mut buf = vec![0u8; 65_535];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (len, _src) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok(v)) => v,
                _ => return None,
            };
            if let Ok(msg) = parse(&buf[..len]) {
                if !msg.is_request() {
                    return Some(msg);
                }
            }
        }
    }

    /// Originates one call: INVITE, ACK, media playback, BYE. Returns once
    /// the call has fully ended (answered-then-hung-up, rejected, or timed
    /// out) rather than spawning detached background work.
    pub async fn dial(&self, callee: &str, media_file: impl AsRef<Path>, duration: Duration) -> CallOutcome {
        if !self.is_registered() {
            return CallOutcome { success: false, message: "dialer is not registered".to_string() };
        }

        let local_sip_port = self.next_sip_port();
        let local_rtp_port = self.next_rtp_port();
        let local_addr: SocketAddr = format!("0.0.0.0:{local_sip_port}").parse().expect("valid addr");
        let socket = match UdpSocket::bind(local_addr).await {
            Ok(s) => s,
            Err(err) => return CallOutcome { success: false, message: format!("bind failed: {err}") },
        };
        let server = self.server_addr();

        let call_id = format!("{}@dialer", uuid::Uuid::new_v4());
        let mut session = CallSession {
            call_id: call_id.clone(),
            from_tag: make_tag(),
            to_tag: None,
            local_cseq: 1,
            route_set: Vec::new(),
            remote_contact: None,
            callee_username: callee.to_string(),
            remote_rtp_endpoint: None,
            local_sip_port,
            local_rtp_port,
        };

        let caller_uri = format!("sip:{}@{}", self.config.username, self.config.server_ip);
        let callee_uri = format!("sip:{}@{}", callee, self.config.server_ip);
        let contact = format!("sip:{}@{}:{}", self.config.username, self.config.local_ip, local_sip_port);
        let offer = sdp::build_pcmu_offer(&self.config.local_ip, local_rtp_port, rand::rng().next_u64());

        let invite = self.build_invite(&session, &caller_uri, &callee_uri, &contact, &offer);
        if let Err(err) = socket.send_to(&invite.serialize(), server).await {
            return CallOutcome { success: false, message: format!("send failed: {err}") };
        }
        self.cdr.record_call_start(&call_id, &caller_uri, &callee_uri, chrono::Utc::now());

        let final_resp = match self.await_invite_final(&socket, &call_id).await {
            Some(r) => r,
            None => {
                self.cdr.record_call_fail(&call_id, chrono::Utc::now(), 408, "Request Timeout").ok();
                return CallOutcome { success: false, message: "no final response within call setup timeout".to_string() };
            }
        };

        let status = final_resp.status_code().unwrap_or(0);
        if !(200..300).contains(&status) {
            if status == 487 {
                self.cdr.record_call_cancel(&call_id, chrono::Utc::now()).ok();
            } else {
                self.cdr.record_call_fail(&call_id, chrono::Utc::now(), status, "call setup failed").ok();
            }
            return CallOutcome { success: false, message: format!("call rejected with {status}") };
        }

        self.apply_200_ok(&mut session, &final_resp, &contact);
        let (call_type, codec) = sdp::extract_sdp_info(&final_resp.body);
        self.cdr.record_call_answer(&call_id, chrono::Utc::now(), &call_type, &codec);

        let ack = self.build_ack(&session, &caller_uri, &callee_uri, &contact);
        let ack_dest = ack_bye_destination(&session, &self.config, callee);
        socket.send_to(&ack.serialize(), ack_dest).await.ok();

        let remote_rtp = session.remote_rtp_endpoint.unwrap_or(server);
        let media_path = media_file.as_ref().to_path_buf();
        let local_rtp = session.local_rtp_port;
        let player_handle = tokio::spawn(async move { play_wav_as_rtp(&media_path, local_rtp, remote_rtp, Some(duration)).await });

        let hangup_reason = self.wait_for_hangup(&socket, &mut session, player_handle).await;

        if hangup_reason != "remote-bye" {
            let bye = self.build_bye(&session, &caller_uri, &callee_uri, &contact);
            let dest = ack_bye_destination(&session, &self.config, callee);
            socket.send_to(&bye.serialize(), dest).await.ok();
            self.recv_response(&socket, BYE_TIMEOUT).await;
        }
        self.cdr.record_call_end(&call_id, chrono::Utc::now(), &hangup_reason).ok();

        CallOutcome { success: true, message: "call completed".to_string() }
    }

    /// Waits for the media player to finish, or for the remote side to send
    /// a BYE first, whichever happens first. ACKs inbound BYEs per the
    /// `(Call-ID, CSeq)` dedup rule and local-echo response shape described
    /// in `SPEC_FULL.md` §4.10.
    async fn wait_for_hangup(
        &self,
        socket: &UdpSocket,
        session: &mut CallSession,
        mut player_handle: tokio::task::JoinHandle<Result<()>>,
    ) -> String {
        let mut buf = vec![0u8; 65_535];
        loop {
            tokio::select! {
                result = &mut player_handle => {
                    if let Err(err) = result {
                        tracing::warn!(call_id = %session.call_id, error = %err, "media player task panicked");
                    }
                    return "normal".to_string();
                }
                recv = socket.recv_from(&mut buf) => {
                    let (len, src) = match recv {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let Ok(msg) = parse(&buf[..len]) else { continue };
                    if msg.is_request() && msg.method() == Some(Method::Bye) {
                        if let Some((num, _)) = msg.cseq() {
                            let key = (msg.call_id().unwrap_or_default().to_string(), num);
                            let mut seen = self.seen_bye.lock().expect("bye-dedup lock poisoned");
                            if seen.contains(&key) {
                                continue;
                            }
                            seen.insert(key);
                        }
                        let resp = reply_to_bye(&msg, src, &self.config.server_ip, self.config.server_port);
                        socket.send_to(&resp.0.serialize(), resp.1).await.ok();
                        player_handle.abort();
                        return "remote-bye".to_string();
                    }
                }
            }
        }
    }

    async fn await_invite_final(&self, socket: &UdpSocket, call_id: &str) -> Option<SipMessage> {
        let deadline = Instant::now() + CALL_SETUP_TIMEOUT;
        let mut buf = vec![0u8; 65_535];
        let mut rang = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (len, _src) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok(v)) => v,
                _ => return None,
            };
            let msg = match parse(&buf[..len]) {
                Ok(m) if !m.is_request() => m,
                _ => continue,
            };
            let status = msg.status_code().unwrap_or(0);
            if status == 100 {
                continue;
            }
            if status == 180 || status == 183 {
                if !rang {
                    self.cdr.record_ringing(call_id, chrono::Utc::now());
                    rang = true;
                }
                continue;
            }
            if status >= 200 {
                return Some(msg);
            }
        }
    }

    fn build_invite(
        &self,
        session: &CallSession,
        caller_uri: &str,
        callee_uri: &str,
        contact: &str,
        offer: &[u8],
    ) -> SipMessage {
        let branch = fresh_branch();
        let mut req = SipMessage::new_request(Method::Invite, "INVITE", callee_uri.to_string());
        req.headers.push("via", build_via(&self.config.local_ip, session.local_sip_port, &branch));
        req.headers.push("from", format!("<{}>;tag={}", caller_uri, session.from_tag));
        req.headers.push("to", format!("<{}>", callee_uri));
        req.headers.push("call-id", &session.call_id);
        req.headers.push("cseq", format!("{} INVITE", session.local_cseq));
        req.headers.push("contact", format!("<{}>", contact));
        req.headers.push("max-forwards", "70");
        req.headers.push("content-type", "application/sdp");
        req.body = offer.to_vec();
        req
    }

    fn apply_200_ok(&self, session: &mut CallSession, resp: &SipMessage, _contact: &str) {
        let to = resp.headers.get_first("to").unwrap_or_default();
        session.to_tag = extract_header_param(to, "tag").map(|s| s.to_string());

        session.route_set =
            resp.headers.get_all("record-route").iter().cloned().rev().collect();

        session.remote_contact = resp.headers.get_first("contact").and_then(extract_uri).map(|s| s.to_string());

        session.remote_rtp_endpoint = parse_sdp_connection(&resp.body);
    }

    fn build_ack(&self, session: &CallSession, caller_uri: &str, _callee_uri: &str, contact: &str) -> SipMessage {
        let ruri = in_dialog_request_uri(session, &self.config, &session.callee_username);
        let branch = fresh_branch();
        let mut req = SipMessage::new_request(Method::Ack, "ACK", ruri);
        req.headers.push("via", build_via(&self.config.local_ip, session.local_sip_port, &branch));
        req.headers.push("from", format!("<{}>;tag={}", caller_uri, session.from_tag));
        push_to_with_tag(&mut req, caller_uri, session);
        req.headers.push("call-id", &session.call_id);
        req.headers.push("cseq", format!("{} ACK", session.local_cseq));
        req.headers.push("contact", format!("<{}>", contact));
        req.headers.push("max-forwards", "70");
        for route in &session.route_set {
            req.headers.push("route", route.clone());
        }
        req
    }

    fn build_bye(&self, session: &CallSession, caller_uri: &str, _callee_uri: &str, contact: &str) -> SipMessage {
        let ruri = in_dialog_request_uri(session, &self.config, &session.callee_username);
        let branch = fresh_branch();
        let mut req = SipMessage::new_request(Method::Bye, "BYE", ruri);
        req.headers.push("via", build_via(&self.config.local_ip, session.local_sip_port, &branch));
        req.headers.push("from", format!("<{}>;tag={}", caller_uri, session.from_tag));
        push_to_with_tag(&mut req, caller_uri, session);
        req.headers.push("call-id", &session.call_id);
        req.headers.push("cseq", format!("{} BYE", session.local_cseq + 1));
        req.headers.push("contact", format!("<{}>", contact));
        req.headers.push("max-forwards", "70");
        for route in &session.route_set {
            req.headers.push("route", route.clone());
        }
        req
    }
}

fn push_to_with_tag(req: &mut SipMessage, _caller_uri: &str, session: &CallSession) {
    let callee_aor = format!("sip:{}", session.callee_username);
    match &session.to_tag {
        Some(tag) => req.headers.push("to", format!("<{}>;tag={}", callee_aor, tag)),
        None => req.headers.push("to", format!("<{}>", callee_aor)),
    }
}

/// Resolves the Request-URI for in-dialog ACK/BYE per `SPEC_FULL.md` §4.10:
/// (i) Route set of length >= 2 -> last Route's URI; (ii) single Route
/// pointing at the server -> Contact URI; (iii) else -> Contact URI;
/// (iv) fallback `sip:<callee>@SERVER`.
fn in_dialog_request_uri(session: &CallSession, config: &DialerConfig, callee: &str) -> String {
    if session.route_set.len() >= 2 {
        if let Some(last) = session.route_set.last() {
            if let Some(uri) = extract_uri(last) {
                return uri.to_string();
            }
        }
    }
    if session.route_set.len() == 1 {
        let points_at_server = session
            .route_set
            .first()
            .and_then(|r| extract_uri(r))
            .and_then(SipUri::parse)
            .map(|u| u.host == config.server_ip)
            .unwrap_or(false);
        if points_at_server {
            if let Some(contact) = &session.remote_contact {
                return contact.clone();
            }
        }
    }
    if let Some(contact) = &session.remote_contact {
        return contact.clone();
    }
    format!("sip:{}@{}", callee, config.server_ip)
}

fn ack_bye_destination(session: &CallSession, config: &DialerConfig, callee: &str) -> SocketAddr {
    let ruri = in_dialog_request_uri(session, config, callee);
    SipUri::parse(&ruri)
        .map(|u| u.socket_host_port())
        .and_then(|(h, p)| format!("{h}:{p}").parse().ok())
        .unwrap_or_else(|| format!("{}:{}", config.server_ip, config.server_port).parse().expect("valid addr"))
}

/// Extracts the first `c=IN IP4 <addr>` / `m=audio <port>` pair from an SDP
/// answer body. Distinct from `sdp::parse_sdp`, which only derives
/// `call_type`/`codec_str`; the dialer additionally needs the numeric
/// endpoint to send RTP to.
fn parse_sdp_connection(body: &[u8]) -> Option<SocketAddr> {
    let text = String::from_utf8_lossy(body);
    let mut ip: Option<String> = None;
    let mut port: Option<u16> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            ip = rest.split_whitespace().next().map(|s| s.to_string());
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            port = rest.split_whitespace().next().and_then(|s| s.parse().ok());
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => format!("{ip}:{port}").parse().ok(),
        _ => None,
    }
}

/// Builds the 200 OK to an inbound BYE, echoing the Via stack exactly and
/// choosing the destination from the top Via's sent-by when it equals the
/// server, else the datagram source (`SPEC_FULL.md` §4.10).
fn reply_to_bye(req: &SipMessage, src: SocketAddr, server_ip: &str, server_port: u16) -> (SipMessage, SocketAddr) {
    let mut resp = SipMessage::new_response(200, "OK");
    for via in req.headers.get_all("via") {
        resp.headers.push("via", via.clone());
    }
    resp.headers.set("from", req.headers.get_first("from").unwrap_or_default());
    resp.headers.set("to", req.headers.get_first("to").unwrap_or_default());
    resp.headers.set("call-id", req.call_id().unwrap_or_default());
    if let Some(cseq) = req.headers.get_first("cseq") {
        resp.headers.set("cseq", cseq.to_string());
    }

    let dest = req
        .headers
        .get_first("via")
        .and_then(|v| v.split_whitespace().nth(1))
        .map(|sent_by| sent_by.trim_end_matches(';').to_string())
        .and_then(|sent_by| {
            let host_port = sent_by.split(';').next().unwrap_or(&sent_by);
            let host = host_port.split(':').next().unwrap_or(host_port);
            if host == server_ip {
                format!("{server_ip}:{server_port}").parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(src);

    (resp, dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_response_matches_server_legacy_formula() {
        let response = digest_response("1001", "1001", "sip.local", "abc123", "REGISTER", "sip:192.168.8.126");
        let ha1 = md5_hex("1001:sip.local:1001");
        let ha2 = md5_hex("REGISTER:sip:192.168.8.126");
        let expected = md5_hex(&format!("{}:{}:{}", ha1, "abc123", ha2));
        assert_eq!(response, expected);
    }

    #[test]
    fn sdp_connection_endpoint_parses_ip_and_port() {
        let body = b"v=0\r\no=- 1 1 IN IP4 10.0.0.5\r\ns=-\r\nc=IN IP4 10.0.0.5\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        let addr = parse_sdp_connection(body).unwrap();
        assert_eq!(addr, "10.0.0.5:30000".parse().unwrap());
    }

    #[test]
    fn in_dialog_ruri_falls_back_to_contact_with_single_server_route() {
        let config = DialerConfig { server_ip: "192.168.8.126".to_string(), ..Default::default() };
        let session = CallSession {
            call_id: "c1".to_string(),
            from_tag: "a".to_string(),
            to_tag: Some("b".to_string()),
            local_cseq: 1,
            route_set: vec!["<sip:192.168.8.126:5060;lr>".to_string()],
            remote_contact: Some("sip:1002@192.168.8.51:5062".to_string()),
            callee_username: "1002".to_string(),
            remote_rtp_endpoint: None,
            local_sip_port: 10001,
            local_rtp_port: 20000,
        };
        let ruri = in_dialog_request_uri(&session, &config, "1002");
        assert_eq!(ruri, "sip:1002@192.168.8.51:5062");
    }

    #[test]
    fn in_dialog_ruri_uses_last_route_when_two_or_more() {
        let config = DialerConfig::default();
        let session = CallSession {
            call_id: "c2".to_string(),
            from_tag: "a".to_string(),
            to_tag: None,
            local_cseq: 1,
            route_set: vec!["<sip:proxy1;lr>".to_string(), "<sip:proxy2;lr>".to_string()],
            remote_contact: Some("sip:1002@1.2.3.4:5062".to_string()),
            callee_username: "1002".to_string(),
            remote_rtp_endpoint: None,
            local_sip_port: 10001,
            local_rtp_port: 20000,
        };
        let ruri = in_dialog_request_uri(&session, &config, "1002");
        assert_eq!(ruri, "sip:proxy2");
    }

    #[test]
    fn bye_reply_echoes_via_and_dedups_by_call_id_and_cseq() {
        let raw = b"BYE sip:1001@127.0.0.1:10001 SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.8.126:5060;branch=1\r\nFrom: <sip:1002@h>;tag=b\r\nTo: <sip:1001@h>;tag=a\r\nCall-ID: c3@dialer\r\nCSeq: 2 BYE\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n";
        let req = parse(raw).unwrap();
        let src: SocketAddr = "192.168.8.126:5060".parse().unwrap();
        let (resp, dest) = reply_to_bye(&req, src, "192.168.8.126", 5060);
        assert_eq!(resp.status_code(), Some(200));
        assert_eq!(dest, src);
        assert_eq!(resp.headers.get_first("via"), req.headers.get_first("via"));
    }
}
