//! SIP message model, parser, and serialiser.
//!
//! Grounded on `examples/original_source/sipcore/message.py` and
//! `sipcore/parser.py`: header names are lowercased and kept as an
//! order-preserving multi-map, the start line is never folded, and
//! canonicalisation on output is Title-Case-Per-Hyphen-Segment. See
//! `SPEC_FULL.md` §4.1.

use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Prack,
    Update,
    Refer,
    Notify,
    Subscribe,
    Message,
    Other,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Message => "MESSAGE",
            Method::Other => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Method {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "OPTIONS" => Method::Options,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "MESSAGE" => Method::Message,
            _ => Method::Other,
        }
    }
}

/// Either a request line (`METHOD uri SIP/2.0`) or a status line
/// (`SIP/2.0 code reason`).
#[derive(Debug, Clone)]
pub enum StartLine {
    Request { method: Method, raw_method: String, uri: String },
    Response { code: u16, reason: String },
}

/// Order-preserving multi-map of lowercased header name to its ordered list
/// of raw values. Built as a `Vec` rather than a `HashMap<_, Vec<_>>` so that
/// the *order in which distinct header names first appear* is also
/// preserved, matching the source's dict-insertion-order semantics under
/// CPython 3.7+.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { entries: Vec::new() }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.entries.iter().position(|(k, _)| *k == name)
    }

    /// Appends a value under `name`, creating the entry if absent.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        let lname = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == lname) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((lname, vec![value.into()])),
        }
    }

    /// Inserts a value at the front of the list for `name` (used when adding
    /// a top Via / Record-Route). Creates the header if absent.
    pub fn push_front(&mut self, name: &str, value: impl Into<String>) {
        let lname = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == lname) {
            Some((_, values)) => values.insert(0, value.into()),
            None => self.entries.push((lname, vec![value.into()])),
        }
    }

    /// Replaces all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let lname = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == lname) {
            Some((_, values)) => {
                values.clear();
                values.push(value.into());
            }
            None => self.entries.push((lname, vec![value.into()])),
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(idx) = self.index_of(name) {
            self.entries.remove(idx);
        }
    }

    /// Removes just the first value for `name`, dropping the header
    /// entirely if that was the only value left.
    pub fn remove_first(&mut self, name: &str) {
        if let Some(idx) = self.index_of(name) {
            let values = &mut self.entries[idx].1;
            if !values.is_empty() {
                values.remove(0);
            }
            if values.is_empty() {
                self.entries.remove(idx);
            }
        }
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        match self.index_of(name) {
            Some(idx) => &self.entries[idx].1,
            None => &[],
        }
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn set_request_uri(&mut self, uri: String) {
        if let StartLine::Request { uri: u, .. } = &mut self.start_line {
            *u = uri;
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get_first("call-id")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        let raw = self.headers.get_first("cseq")?;
        let mut parts = raw.trim().splitn(2, char::is_whitespace);
        let num: u32 = parts.next()?.parse().ok()?;
        let method = Method::from_str(parts.next().unwrap_or("").trim());
        Some((num, method))
    }

    pub fn max_forwards(&self) -> Option<i32> {
        self.headers.get_first("max-forwards")?.trim().parse().ok()
    }

    /// Builds a new request with the given method/URI and an empty header set.
    pub fn new_request(method: Method, raw_method: &str, uri: impl Into<String>) -> SipMessage {
        SipMessage {
            start_line: StartLine::Request {
                method,
                raw_method: raw_method.to_string(),
                uri: uri.into(),
            },
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn new_response(code: u16, reason: impl Into<String>) -> SipMessage {
        SipMessage {
            start_line: StartLine::Response { code, reason: reason.into() },
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Serialises with `Content-Length` computed from `self.body` and
    /// canonicalised Title-Case-Per-Hyphen-Segment header names.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();

        match &self.start_line {
            StartLine::Request { raw_method, uri, .. } => {
                out.extend_from_slice(format!("{} {} SIP/2.0\r\n", raw_method, uri).as_bytes());
            }
            StartLine::Response { code, reason } => {
                out.extend_from_slice(format!("SIP/2.0 {} {}\r\n", code, reason).as_bytes());
            }
        }

        for (name, value) in self.headers.iter() {
            if name == "content-length" {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", canonicalize_header_name(name), value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// `content-type` -> `Content-Type`, `www-authenticate` -> `WWW-Authenticate`
/// is the one conventional exception RFC 3261 examples universally use
/// uppercase for; we follow Title-Case-Per-Hyphen-Segment literally per
/// spec §4.1 and special-case the handful of all-caps conventional names.
fn canonicalize_header_name(lower: &str) -> String {
    match lower {
        "www-authenticate" => return "WWW-Authenticate".to_string(),
        "cseq" => return "CSeq".to_string(),
        "call-id" => return "Call-ID".to_string(),
        _ => {}
    }
    lower
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Parses a raw UDP datagram into a [`SipMessage`].
///
/// Fails with [`Error::ParseError`] when no CRLFCRLF delimiter is found, the
/// start line is blank, or (per-header) a line lacks `:` — the latter is
/// logged and the header skipped, not fatal to the whole parse.
pub fn parse(raw: &[u8]) -> Result<SipMessage> {
    let delimiter = find_header_body_split(raw).ok_or_else(|| {
        Error::ParseError("no CRLFCRLF (or LFLF) delimiter found".to_string())
    })?;

    let (head, body) = raw.split_at(delimiter.0);
    let body = &body[delimiter.1..];

    let head_text = String::from_utf8_lossy(head);
    let mut lines = head_text.split("\r\n").flat_map(|l| l.split('\n'));

    let start_line_raw = lines.next().unwrap_or("").trim();
    if start_line_raw.is_empty() {
        return Err(Error::ParseError("blank start line".to_string()));
    }
    let start_line = parse_start_line(start_line_raw)?;

    let mut headers = Headers::new();
    let mut last_name: Option<String> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // RFC 3261 line folding: continuation of the previous header.
            if let Some(name) = &last_name {
                let lname = name.to_ascii_lowercase();
                if let Some((_, values)) = headers.entries.iter_mut().find(|(k, _)| *k == lname) {
                    if let Some(last) = values.last_mut() {
                        last.push(' ');
                        last.push_str(line.trim());
                    }
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                let name = name.trim();
                let value = value.trim();
                if name.is_empty() {
                    tracing::debug!(line, "skipping malformed header with empty name");
                    continue;
                }
                if name.eq_ignore_ascii_case("via") {
                    // Via may be comma-folded on one line; split preserving hop order.
                    for hop in split_comma_preserving_params(value) {
                        headers.push(name, hop);
                    }
                } else {
                    headers.push(name, value);
                }
                last_name = Some(name.to_string());
            }
            None => {
                tracing::debug!(line, "skipping malformed header line (no ':')");
            }
        }
    }

    Ok(SipMessage { start_line, headers, body: body.to_vec() })
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let fields: Vec<&str> = line.splitn(3, ' ').collect();
    if fields.len() < 3 {
        return Err(Error::ParseError(format!("malformed start line: {line:?}")));
    }
    if fields[0].starts_with("SIP/") {
        let code: u16 = fields[1]
            .parse()
            .map_err(|_| Error::ParseError(format!("bad status code in {line:?}")))?;
        Ok(StartLine::Response { code, reason: fields[2].to_string() })
    } else {
        Ok(StartLine::Request {
            method: Method::from_str(fields[0]),
            raw_method: fields[0].to_string(),
            uri: fields[1].to_string(),
        })
    }
}

/// Splits a Via value list on commas that are not inside URI angle brackets
/// or quoted strings, so `Via: a, b` becomes two hops without breaking
/// `received="a, b"`-style edge cases.
fn split_comma_preserving_params(value: &str) -> Vec<String> {
    let mut hops = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                depth += 1;
                current.push(ch);
            }
            '>' if !in_quotes => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 && !in_quotes => {
                hops.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        hops.push(current.trim().to_string());
    }
    hops
}

/// Finds the byte offset of the CRLFCRLF (or bare LFLF, tolerated for
/// interop) head/body split. Returns `(head_end, delimiter_len)`.
fn find_header_body_split(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        return Some((pos, 4));
    }
    find_subslice(raw, b"\n\n").map(|pos| (pos, 2))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.serialize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:192.168.8.126 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.8.50:5061;branch=z9hG4bK-1\r\n\
From: <sip:1001@192.168.8.126>;tag=abc\r\n\
To: <sip:1001@192.168.8.126>\r\n\
Call-ID: reg1@1001\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:1001@192.168.8.50:5061>\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n";

    #[test]
    fn parses_register_request() {
        let msg = parse(REGISTER).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(Method::Register));
        assert_eq!(msg.call_id(), Some("reg1@1001"));
        assert_eq!(msg.cseq(), Some((1, Method::Register)));
        assert_eq!(msg.max_forwards(), Some(70));
    }

    #[test]
    fn header_order_preserved_across_serialize() {
        let msg = parse(REGISTER).unwrap();
        let out = msg.serialize();
        let text = String::from_utf8(out).unwrap();
        let via_pos = text.find("Via:").unwrap();
        let from_pos = text.find("From:").unwrap();
        let cseq_pos = text.find("CSeq:").unwrap();
        assert!(via_pos < from_pos);
        assert!(from_pos < cseq_pos);
    }

    #[test]
    fn canonicalizes_header_case_on_output() {
        let raw = b"invite sip:1002@host SIP/2.0\r\nVIA: SIP/2.0/UDP h:5060;branch=z9hG4bK-1\r\ncall-id: c1\r\ncseq: 1 INVITE\r\ncontent-length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        let text = String::from_utf8(msg.serialize()).unwrap();
        assert!(text.contains("Via:"));
        assert!(text.contains("Call-ID:"));
        assert!(text.contains("CSeq:"));
    }

    #[test]
    fn multiple_via_preserved_in_order() {
        let raw = b"INVITE sip:x SIP/2.0\r\nVia: SIP/2.0/UDP a:1;branch=1\r\nVia: SIP/2.0/UDP b:2;branch=2\r\nCall-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        let vias = msg.headers.get_all("via");
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("a:1"));
        assert!(vias[1].contains("b:2"));
    }

    #[test]
    fn comma_folded_via_splits_preserving_order() {
        let raw = b"INVITE sip:x SIP/2.0\r\nVia: SIP/2.0/UDP a:1;branch=1, SIP/2.0/UDP b:2;branch=2\r\nCall-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        let vias = msg.headers.get_all("via");
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("a:1"));
        assert!(vias[1].contains("b:2"));
    }

    #[test]
    fn line_folding_continues_previous_header() {
        let raw = b"INVITE sip:x SIP/2.0\r\nSubject: I know\r\n you're there,\r\n\tpick up!\r\nCall-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        assert_eq!(msg.headers.get_first("subject"), Some("I know you're there, pick up!"));
    }

    #[test]
    fn missing_delimiter_is_parse_error() {
        let raw = b"INVITE sip:x SIP/2.0\r\nCall-ID: c\r\n";
        assert!(parse(raw).is_err());
    }

    #[test]
    fn blank_start_line_is_parse_error() {
        let raw = b"\r\nCall-ID: c\r\n\r\n";
        assert!(parse(raw).is_err());
    }

    #[test]
    fn malformed_header_line_skipped_not_fatal() {
        let raw = b"INVITE sip:x SIP/2.0\r\nThisHasNoColon\r\nCall-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        assert_eq!(msg.call_id(), Some("c"));
    }

    #[test]
    fn serialize_overwrites_content_length() {
        let mut msg = SipMessage::new_request(Method::Invite, "INVITE", "sip:x");
        msg.headers.push("content-length", "999");
        msg.body = b"hi".to_vec();
        let text = String::from_utf8(msg.serialize()).unwrap();
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn parses_response_start_line() {
        let raw = b"SIP/2.0 200 OK\r\nCall-ID: c\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).unwrap();
        assert_eq!(msg.status_code(), Some(200));
    }
}
