//! CDR engine, `SPEC_FULL.md` §4.8.
//!
//! Grounded on `examples/original_source/sipcore/cdr.py`: a per-Call-ID
//! merge cache where only non-empty updates override existing fields, a
//! session map for computing `duration`/`setup_time`, daily CSV rotation
//! with a lazily-opened file and a header row written on creation, and a
//! post-flush dedup set that ages out after one hour.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::uri::SipUri;

pub const FLUSHED_SET_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Register,
    Call,
    Message,
    Options,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Register => "REGISTER",
            RecordType::Call => "CALL",
            RecordType::Message => "MESSAGE",
            RecordType::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Started,
    Answered,
    Ended,
    Failed,
    Cancelled,
    Success,
    Unregistered,
    Completed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Started => "STARTED",
            CallState::Answered => "ANSWERED",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
            CallState::Cancelled => "CANCELLED",
            CallState::Success => "SUCCESS",
            CallState::Unregistered => "UNREGISTERED",
            CallState::Completed => "COMPLETED",
        }
    }

    /// A terminal event both triggers an immediate flush and may not be
    /// superseded once written.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended
                | CallState::Failed
                | CallState::Cancelled
                | CallState::Success
                | CallState::Unregistered
                | CallState::Completed
        )
    }
}

/// One CSV row. Column order matches `SPEC_FULL.md` §3 exactly; every field
/// is a `String` (empty = unset) so the merge-cache "only non-empty updates
/// override" rule in §4.8 is a single uniform check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CdrRecord {
    pub record_id: String,
    pub record_type: String,
    pub call_state: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub call_id: String,
    pub caller_uri: String,
    pub caller_number: String,
    pub caller_ip: String,
    pub caller_port: String,
    pub callee_uri: String,
    pub callee_number: String,
    pub callee_ip: String,
    pub callee_port: String,
    pub duration: String,
    pub setup_time: String,
    pub status_code: String,
    pub status_text: String,
    pub termination_reason: String,
    pub invite_time: String,
    pub ringing_time: String,
    pub answer_time: String,
    pub bye_time: String,
    pub user_agent: String,
    pub contact: String,
    pub expires: String,
    pub message_body: String,
    pub server_ip: String,
    pub server_port: String,
    pub cseq: String,
    pub extra_info: String,
}

#[derive(Debug, Clone, Default)]
struct Session {
    start_time: Option<DateTime<Utc>>,
    answer_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

/// A sparse set of field updates; only non-empty values are applied
/// (mirrors `_update_or_create_record` in the source).
#[derive(Default)]
pub struct FieldUpdates(Vec<(&'static str, String)>);

impl FieldUpdates {
    pub fn new() -> Self {
        FieldUpdates(Vec::new())
    }

    pub fn set(mut self, field: &'static str, value: impl Into<String>) -> Self {
        self.0.push((field, value.into()));
        self
    }
}

pub struct CdrEngine {
    base_dir: PathBuf,
    merge_mode: Mutex<bool>,
    counter: AtomicU64,
    cache: Mutex<HashMap<String, CdrRecord>>,
    sessions: Mutex<HashMap<String, Session>>,
    flushed: Mutex<HashMap<String, Instant>>,
}

impl CdrEngine {
    pub fn new(base_dir: impl Into<PathBuf>, merge_mode: bool) -> CdrEngine {
        CdrEngine {
            base_dir: base_dir.into(),
            merge_mode: Mutex::new(merge_mode),
            counter: AtomicU64::new(0),
            cache: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            flushed: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_merge_mode(&self, enabled: bool) {
        *self.merge_mode.lock().expect("cdr lock poisoned") = enabled;
    }

    fn generate_record_id(&self) -> String {
        let now = Utc::now();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{:06}", now.format("%Y%m%d%H%M%S"), seq)
    }

    fn update_or_create(&self, call_id: &str, record_type: RecordType, updates: FieldUpdates) {
        let mut cache = self.cache.lock().expect("cdr lock poisoned");
        let record = cache.entry(call_id.to_string()).or_insert_with(|| {
            let mut r = CdrRecord::default();
            r.record_id = self.generate_record_id();
            r.record_type = record_type.as_str().to_string();
            r.call_id = call_id.to_string();
            r.date = Utc::now().format("%Y-%m-%d").to_string();
            r
        });
        record.record_type = record_type.as_str().to_string();
        record.end_time = Utc::now().to_rfc3339();

        for (field, value) in updates.0 {
            if value.is_empty() {
                continue;
            }
            set_field(record, field, value);
            if field == "caller_uri" {
                if let Some(n) = extract_number(&record.caller_uri) {
                    record.caller_number = n;
                }
            }
            if field == "callee_uri" {
                if let Some(n) = extract_number(&record.callee_uri) {
                    record.callee_number = n;
                }
            }
        }
    }

    fn already_flushed(&self, call_id: &str) -> bool {
        let guard = self.flushed.lock().expect("cdr lock poisoned");
        guard.contains_key(call_id)
    }

    fn mark_flushed(&self, call_id: &str) {
        let mut guard = self.flushed.lock().expect("cdr lock poisoned");
        guard.insert(call_id.to_string(), Instant::now());
    }

    /// Appends the cached record for `call_id` as a CSV row and marks it
    /// flushed, unless it was already flushed and `force` is false
    /// (duplicate suppression for retransmitted signalling).
    pub fn flush_record(&self, call_id: &str, force: bool) -> Result<()> {
        if !force && self.already_flushed(call_id) {
            tracing::debug!(call_id, "suppressing duplicate CDR flush");
            return Ok(());
        }
        let record = {
            let cache = self.cache.lock().expect("cdr lock poisoned");
            match cache.get(call_id) {
                Some(r) => r.clone(),
                None => return Ok(()),
            }
        };
        self.write_row(&record)?;
        self.mark_flushed(call_id);
        Ok(())
    }

    /// Immediate-write path for one-shot transactions (MESSAGE/OPTIONS)
    /// that never go through the merge cache (`SPEC_FULL.md` §4.8).
    pub fn write_record(&self, record: CdrRecord) -> Result<()> {
        self.write_row(&record)
    }

    fn write_row(&self, record: &CdrRecord) -> Result<()> {
        let date = if record.date.is_empty() {
            Utc::now().format("%Y-%m-%d").to_string()
        } else {
            record.date.clone()
        };
        let dir = self.base_dir.join(&date);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("cdr_{}.csv", date));
        let write_header = !path.exists();

        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(CSV_HEADER)?;
        }
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    pub fn start_session(&self, call_id: &str, at: DateTime<Utc>) {
        let mut guard = self.sessions.lock().expect("cdr lock poisoned");
        guard.entry(call_id.to_string()).or_default().start_time = Some(at);
    }

    fn note_answer(&self, call_id: &str, at: DateTime<Utc>) {
        let mut guard = self.sessions.lock().expect("cdr lock poisoned");
        guard.entry(call_id.to_string()).or_default().answer_time = Some(at);
    }

    /// Ends the session, returning `(duration_secs, setup_time_ms)` where
    /// available.
    fn end_session(&self, call_id: &str, at: DateTime<Utc>) -> (Option<i64>, Option<i64>) {
        let mut guard = self.sessions.lock().expect("cdr lock poisoned");
        let session = guard.entry(call_id.to_string()).or_default();
        session.end_time = Some(at);
        let duration = session.start_time.map(|s| (at - s).num_seconds());
        let setup_time = match (session.start_time, session.answer_time) {
            (Some(s), Some(a)) => Some((a - s).num_milliseconds()),
            _ => None,
        };
        (duration, setup_time)
    }

    pub fn record_register(&self, call_id: &str, aor_uri: &str, contact: &str, expires: u64, success: bool) -> Result<()> {
        let state = if success { CallState::Success } else { CallState::Failed };
        let updates = FieldUpdates::new()
            .set("caller_uri", aor_uri)
            .set("contact", contact)
            .set("expires", expires.to_string())
            .set("call_state", state.as_str());
        self.update_or_create(call_id, RecordType::Register, updates);
        self.flush_record(call_id, false)
    }

    pub fn record_unregister(&self, call_id: &str, aor_uri: &str, contact: &str) -> Result<()> {
        let updates = FieldUpdates::new()
            .set("caller_uri", aor_uri)
            .set("contact", contact)
            .set("expires", "0")
            .set("call_state", CallState::Unregistered.as_str());
        self.update_or_create(call_id, RecordType::Register, updates);
        self.flush_record(call_id, false)
    }

    pub fn record_call_start(&self, call_id: &str, caller_uri: &str, callee_uri: &str, at: DateTime<Utc>) {
        self.start_session(call_id, at);
        let updates = FieldUpdates::new()
            .set("caller_uri", caller_uri)
            .set("callee_uri", callee_uri)
            .set("invite_time", at.to_rfc3339())
            .set("start_time", at.to_rfc3339())
            .set("call_state", CallState::Started.as_str());
        self.update_or_create(call_id, RecordType::Call, updates);
    }

    pub fn record_ringing(&self, call_id: &str, at: DateTime<Utc>) {
        let updates = FieldUpdates::new().set("ringing_time", at.to_rfc3339());
        self.update_or_create(call_id, RecordType::Call, updates);
    }

    pub fn record_call_answer(&self, call_id: &str, at: DateTime<Utc>, call_type: &str, codec: &str) {
        self.note_answer(call_id, at);
        let mut updates = FieldUpdates::new()
            .set("answer_time", at.to_rfc3339())
            .set("call_state", CallState::Answered.as_str());
        if !call_type.is_empty() || !codec.is_empty() {
            updates = updates.set("extra_info", format!("call_type={};codec={}", call_type, codec));
        }
        self.update_or_create(call_id, RecordType::Call, updates);
    }

    pub fn record_call_end(&self, call_id: &str, at: DateTime<Utc>, reason: &str) -> Result<()> {
        let (duration, setup_time) = self.end_session(call_id, at);
        let mut updates = FieldUpdates::new()
            .set("bye_time", at.to_rfc3339())
            .set("termination_reason", reason)
            .set("call_state", CallState::Ended.as_str());
        if let Some(d) = duration {
            updates = updates.set("duration", d.to_string());
        }
        if let Some(s) = setup_time {
            updates = updates.set("setup_time", s.to_string());
        }
        self.update_or_create(call_id, RecordType::Call, updates);
        self.flush_record(call_id, false)
    }

    pub fn record_call_fail(&self, call_id: &str, at: DateTime<Utc>, status_code: u16, status_text: &str) -> Result<()> {
        let (duration, _) = self.end_session(call_id, at);
        let mut updates = FieldUpdates::new()
            .set("status_code", status_code.to_string())
            .set("status_text", status_text)
            .set("call_state", CallState::Failed.as_str());
        if let Some(d) = duration {
            updates = updates.set("duration", d.to_string());
        }
        self.update_or_create(call_id, RecordType::Call, updates);
        self.flush_record(call_id, false)
    }

    pub fn record_call_cancel(&self, call_id: &str, at: DateTime<Utc>) -> Result<()> {
        let (duration, _) = self.end_session(call_id, at);
        let mut updates = FieldUpdates::new().set("call_state", CallState::Cancelled.as_str());
        if let Some(d) = duration {
            updates = updates.set("duration", d.to_string());
        }
        self.update_or_create(call_id, RecordType::Call, updates);
        self.flush_record(call_id, false)
    }

    pub fn record_message(&self, call_id: &str, caller_uri: &str, callee_uri: &str, body: &str) -> Result<()> {
        let merge_mode = *self.merge_mode.lock().expect("cdr lock poisoned");
        let truncated: String = body.chars().take(500).collect();
        let record = CdrRecord {
            record_id: self.generate_record_id(),
            record_type: RecordType::Message.as_str().to_string(),
            call_state: CallState::Completed.as_str().to_string(),
            date: Utc::now().format("%Y-%m-%d").to_string(),
            call_id: call_id.to_string(),
            caller_uri: caller_uri.to_string(),
            caller_number: extract_number(caller_uri).unwrap_or_default(),
            callee_uri: callee_uri.to_string(),
            callee_number: extract_number(callee_uri).unwrap_or_default(),
            message_body: truncated,
            ..Default::default()
        };
        if merge_mode {
            let mut cache = self.cache.lock().expect("cdr lock poisoned");
            cache.insert(call_id.to_string(), record);
            drop(cache);
            self.flush_record(call_id, false)
        } else {
            self.write_record(record)
        }
    }

    pub fn record_options(&self, call_id: &str, caller_uri: &str) -> Result<()> {
        let record = CdrRecord {
            record_id: self.generate_record_id(),
            record_type: RecordType::Options.as_str().to_string(),
            call_state: CallState::Completed.as_str().to_string(),
            date: Utc::now().format("%Y-%m-%d").to_string(),
            call_id: call_id.to_string(),
            caller_uri: caller_uri.to_string(),
            ..Default::default()
        };
        self.write_record(record)
    }

    /// Drops flushed-set entries older than [`FLUSHED_SET_TTL`].
    pub fn cleanup_flushed_records(&self) {
        let now = Instant::now();
        let mut guard = self.flushed.lock().expect("cdr lock poisoned");
        guard.retain(|_, inserted| now.duration_since(*inserted) <= FLUSHED_SET_TTL);
    }

    pub fn flush_all(&self) -> Result<()> {
        let call_ids: Vec<String> = self.cache.lock().expect("cdr lock poisoned").keys().cloned().collect();
        for call_id in call_ids {
            self.flush_record(&call_id, true)?;
        }
        Ok(())
    }

    /// Reads back today's (or `date`'s) CSV and tallies counts by
    /// `record_type`/`call_state`.
    pub fn get_stats(&self, date: Option<&str>) -> Result<HashMap<String, u64>> {
        let date = date.map(|s| s.to_string()).unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        let path = self.base_dir.join(&date).join(format!("cdr_{}.csv", date));
        let mut stats = HashMap::new();
        if !path.exists() {
            return Ok(stats);
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(&path)?;
        for result in reader.records() {
            let record = result?;
            if let (Some(rtype), Some(state)) = (record.get(1), record.get(2)) {
                *stats.entry(rtype.to_string()).or_insert(0) += 1;
                *stats.entry(format!("state:{}", state)).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}

const CSV_HEADER: &[&str] = &[
    "record_id",
    "record_type",
    "call_state",
    "date",
    "start_time",
    "end_time",
    "call_id",
    "caller_uri",
    "caller_number",
    "caller_ip",
    "caller_port",
    "callee_uri",
    "callee_number",
    "callee_ip",
    "callee_port",
    "duration",
    "setup_time",
    "status_code",
    "status_text",
    "termination_reason",
    "invite_time",
    "ringing_time",
    "answer_time",
    "bye_time",
    "user_agent",
    "contact",
    "expires",
    "message_body",
    "server_ip",
    "server_port",
    "cseq",
    "extra_info",
];

fn set_field(record: &mut CdrRecord, field: &str, value: String) {
    match field {
        "record_id" => record.record_id = value,
        "call_state" => record.call_state = value,
        "start_time" => record.start_time = value,
        "end_time" => record.end_time = value,
        "caller_uri" => record.caller_uri = value,
        "caller_ip" => record.caller_ip = value,
        "caller_port" => record.caller_port = value,
        "callee_uri" => record.callee_uri = value,
        "callee_ip" => record.callee_ip = value,
        "callee_port" => record.callee_port = value,
        "duration" => record.duration = value,
        "setup_time" => record.setup_time = value,
        "status_code" => record.status_code = value,
        "status_text" => record.status_text = value,
        "termination_reason" => record.termination_reason = value,
        "invite_time" => record.invite_time = value,
        "ringing_time" => record.ringing_time = value,
        "answer_time" => record.answer_time = value,
        "bye_time" => record.bye_time = value,
        "user_agent" => record.user_agent = value,
        "contact" => record.contact = value,
        "expires" => record.expires = value,
        "message_body" => record.message_body = value,
        "server_ip" => record.server_ip = value,
        "server_port" => record.server_port = value,
        "cseq" => record.cseq = value,
        "extra_info" => record.extra_info = value,
        _ => tracing::debug!(field, "ignoring unknown CDR field in update"),
    }
}

/// Extracts the user part of a SIP URI by the regex-equivalent of
/// `sip:([^@;>]+)` (`SPEC_FULL.md` §4.8).
fn extract_number(uri: &str) -> Option<String> {
    SipUri::parse(crate::uri::extract_uri(uri).unwrap_or(uri)).and_then(|u| u.user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_engine() -> CdrEngine {
        let dir = std::env::temp_dir().join(format!("cdrtest-{}", uuid::Uuid::new_v4()));
        CdrEngine::new(dir, true)
    }

    #[test]
    fn register_success_flushes_one_row() {
        let engine = temp_engine();
        engine.record_register("c1", "sip:1001@h", "sip:1001@1.2.3.4:5061", 3600, true).unwrap();
        let stats = engine.get_stats(None).unwrap();
        assert_eq!(*stats.get("REGISTER").unwrap(), 1);
    }

    #[test]
    fn duplicate_flush_suppressed() {
        let engine = temp_engine();
        engine.record_call_start("c1", "sip:1001@h", "sip:1002@h", Utc::now());
        engine.record_call_end("c1", Utc::now(), "normal").unwrap();
        // A retransmitted BYE re-triggers the same call path; flush should no-op.
        engine.flush_record("c1", false).unwrap();
        let stats = engine.get_stats(None).unwrap();
        assert_eq!(*stats.get("CALL").unwrap(), 1);
    }

    #[test]
    fn call_lifecycle_computes_duration_and_setup_time() {
        let engine = temp_engine();
        let t0 = Utc::now();
        engine.record_call_start("c1", "sip:1001@h", "sip:1002@h", t0);
        engine.record_call_answer("c1", t0 + chrono::Duration::milliseconds(500), "AUDIO", "PCMU");
        engine.record_call_end("c1", t0 + chrono::Duration::seconds(3), "normal").unwrap();

        let cache_empty_because_flushed = engine.cache.lock().unwrap().get("c1").unwrap().duration.clone();
        assert_eq!(cache_empty_because_flushed, "3");
    }

    #[test]
    fn message_truncates_body_to_500_chars() {
        let engine = temp_engine();
        let long_body = "x".repeat(600);
        engine.record_message("c1", "sip:1001@h", "sip:1002@h", &long_body).unwrap();
        let record = engine.cache.lock().unwrap().get("c1").unwrap().clone();
        assert_eq!(record.message_body.len(), 500);
    }

    #[test]
    fn only_non_empty_updates_override() {
        let engine = temp_engine();
        engine.record_call_start("c1", "sip:1001@h", "sip:1002@h", Utc::now());
        let before = engine.cache.lock().unwrap().get("c1").unwrap().caller_uri.clone();
        let updates = FieldUpdates::new().set("caller_uri", "");
        engine.update_or_create("c1", RecordType::Call, updates);
        let after = engine.cache.lock().unwrap().get("c1").unwrap().caller_uri.clone();
        assert_eq!(before, after);
    }
}
