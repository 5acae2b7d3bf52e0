//! Per-message state and check results

use crate::session::Session;
use chrono::{DateTime, Utc};
use cluegetter_common::{Address, Verdict};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// A single message header. `flag_unique` marks add-headers that must
/// displace existing headers with the same key; `deleted` marks received
/// headers scheduled for removal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeader {
    pub key: String,
    pub value: String,
    pub flag_unique: bool,
    pub deleted: bool,
}

impl MessageHeader {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flag_unique: false,
            deleted: false,
        }
    }
}

/// Callback fired once the final verdict is known
pub type CheckCallback = Arc<dyn Fn(Arc<Message>, Verdict) + Send + Sync>;

/// What one scoring module had to say about a message
#[derive(Clone)]
pub struct CheckResult {
    pub module: &'static str,
    pub suggested_action: Verdict,
    pub message: String,
    pub score: f64,
    pub weighted_score: f64,
    pub duration: Duration,
    pub determinants: serde_json::Map<String, serde_json::Value>,
    pub callbacks: Vec<CheckCallback>,
}

impl CheckResult {
    pub fn new(module: &'static str, suggested_action: Verdict, score: f64) -> Self {
        Self {
            module,
            suggested_action,
            message: String::new(),
            score,
            weighted_score: score,
            duration: Duration::ZERO,
            determinants: serde_json::Map::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_determinant(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.determinants.insert(key.into(), value.into());
        self
    }

    pub fn with_callback(mut self, callback: CheckCallback) -> Self {
        self.callbacks.push(callback);
        self
    }
}

impl fmt::Debug for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckResult")
            .field("module", &self.module)
            .field("suggested_action", &self.suggested_action)
            .field("message", &self.message)
            .field("score", &self.score)
            .field("weighted_score", &self.weighted_score)
            .field("duration", &self.duration)
            .field("determinants", &self.determinants)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// The verdict record written onto a message exactly once
#[derive(Debug, Clone)]
pub struct VerdictOutcome {
    pub verdict: Verdict,
    pub message: String,
    pub reject_score: f64,
    pub reject_score_threshold: f64,
    pub tempfail_score: f64,
    pub tempfail_score_threshold: f64,
    pub check_results: Vec<CheckResult>,
}

/// One message within a session. Envelope, headers and body are fixed
/// once the message is submitted; the add-header list is the only part
/// modules may touch, through [`Message::add_header`].
pub struct Message {
    session: Arc<Session>,

    pub queue_id: String,
    pub from: Address,
    pub rcpt: Vec<Address>,
    pub headers: Vec<MessageHeader>,
    pub body: Vec<u8>,
    pub date: DateTime<Utc>,

    add_headers: Mutex<Vec<MessageHeader>>,
    inject_message_id: OnceLock<String>,
    outcome: OnceLock<VerdictOutcome>,
}

impl Message {
    pub(crate) fn new(
        session: Arc<Session>,
        queue_id: String,
        from: Address,
        rcpt: Vec<Address>,
        headers: Vec<MessageHeader>,
        body: Vec<u8>,
        insert_headers: Vec<MessageHeader>,
    ) -> Self {
        assert!(!rcpt.is_empty(), "a message requires at least one recipient");
        Self {
            session,
            queue_id,
            from,
            rcpt,
            headers,
            body,
            date: Utc::now(),
            add_headers: Mutex::new(insert_headers),
            inject_message_id: OnceLock::new(),
            outcome: OnceLock::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn first_rcpt(&self) -> &Address {
        &self.rcpt[0]
    }

    /// Queue a header for insertion. Safe to call from concurrently
    /// running module checks.
    pub fn add_header(&self, header: MessageHeader) {
        self.add_headers.lock().unwrap().push(header);
    }

    pub(crate) fn pending_add_headers(&self) -> Vec<MessageHeader> {
        self.add_headers.lock().unwrap().clone()
    }

    /// All received headers matching `key`, case-insensitively
    pub fn get_header(&self, key: &str, include_deleted: bool) -> Vec<MessageHeader> {
        self.headers
            .iter()
            .filter(|h| h.key.eq_ignore_ascii_case(key) && (include_deleted || !h.deleted))
            .cloned()
            .collect()
    }

    /// The Message-Id: taken from the received headers, or the injected
    /// one when the message arrived without any
    pub fn message_id(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case("Message-Id"))
            .map(|h| h.value.as_str())
            .or_else(|| self.inject_message_id.get().map(String::as_str))
    }

    pub(crate) fn set_injected_message_id(&self, id: String) {
        let _ = self.inject_message_id.set(id);
    }

    pub fn injected_message_id(&self) -> Option<&str> {
        self.inject_message_id.get().map(String::as_str)
    }

    /// Record the verdict. Panics when a verdict was already assigned:
    /// a message is decided exactly once.
    pub(crate) fn set_outcome(&self, outcome: VerdictOutcome) {
        if self.outcome.set(outcome).is_err() {
            panic!("verdict already assigned to message {}", self.queue_id);
        }
    }

    pub fn outcome(&self) -> Option<&VerdictOutcome> {
        self.outcome.get()
    }

    /// Reconstruct the message as it would be relayed: a Received line,
    /// the stored headers, and the body.
    pub fn raw(&self) -> Vec<u8> {
        let session = self.session();
        let mut out = format!(
            "Received: from {} ({})\r\n\tby {} with SMTP id {}; {}\r\n",
            session.helo,
            session.ip,
            session.mta_host,
            self.queue_id,
            Utc::now().to_rfc2822(),
        );

        for header in &self.headers {
            out.push_str(&header.key);
            out.push_str(": ");
            out.push_str(&header.value);
            out.push_str("\r\n");
        }

        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("queue_id", &self.queue_id)
            .field("from", &self.from)
            .field("rcpt", &self.rcpt)
            .field("date", &self.date)
            .field("verdict", &self.outcome.get().map(|o| o.verdict))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionInfo};
    use cluegetter_common::Config;

    fn sample_message() -> Arc<Message> {
        let session = Arc::new(Session::new(
            Arc::new(Config::default()),
            Vec::new(),
            SessionInfo {
                ip: "198.51.100.9".to_string(),
                helo: "mx.remote.example".to_string(),
                mta_host: "mail.example.com".to_string(),
                ..Default::default()
            },
        ));
        session.new_message(
            "MSG1",
            Address::parse("sender@example.org", true),
            vec![Address::parse("rcpt@example.com", true)],
            vec![
                MessageHeader::new("Subject", "hello"),
                MessageHeader::new("X-Scan", "a"),
                MessageHeader {
                    key: "X-Scan".to_string(),
                    value: "b".to_string(),
                    flag_unique: false,
                    deleted: true,
                },
            ],
            b"Hello there\r\n".to_vec(),
        )
    }

    #[test]
    fn test_get_header_is_case_insensitive_and_skips_deleted() {
        let msg = sample_message();
        let found = msg.get_header("x-scan", false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "a");

        let with_deleted = msg.get_header("X-SCAN", true);
        assert_eq!(with_deleted.len(), 2);
    }

    #[test]
    fn test_raw_rendering() {
        let msg = sample_message();
        let raw = String::from_utf8(msg.raw()).unwrap();

        assert!(raw.starts_with("Received: from mx.remote.example (198.51.100.9)\r\n"));
        assert!(raw.contains("by mail.example.com with SMTP id MSG1;"));
        assert!(raw.contains("Subject: hello\r\n"));
        assert!(raw.ends_with("\r\n\r\nHello there\r\n"));
    }

    #[test]
    fn test_add_header_is_visible_to_mutator() {
        let msg = sample_message();
        msg.add_header(MessageHeader::new("X-Module", "greylisting"));
        let pending = msg.pending_add_headers();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "X-Module");
    }
}
