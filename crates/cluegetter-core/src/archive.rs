//! Archive records and the queue feeding them to a sink
//!
//! Every decided message is serialized exactly once and pushed onto a
//! bounded queue. What happens to the record from there is the sink's
//! business: failures are logged and never retried, and the pipeline
//! never learns about them.

use crate::message::{Message, MessageHeader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluegetter_common::{Address, Result, Verdict};
use cluegetter_storage::repository::DbMessageStore;
use cluegetter_storage::{MessageRecord, SessionRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Session fields carried along with each archived message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub id: Uuid,
    pub instance: i64,
    pub ip: String,
    pub helo: String,
    pub sasl_user: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub mta_host: String,
    pub date_connect: DateTime<Utc>,
}

/// One module's contribution, as archived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCheckResult {
    pub module: String,
    pub verdict: Verdict,
    pub message: String,
    pub score: f64,
    pub weighted_score: f64,
    pub duration_secs: f64,
    pub determinants: serde_json::Value,
}

/// The immutable record of a decided message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub queue_id: String,
    pub from: Address,
    pub rcpt: Vec<Address>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub date: DateTime<Utc>,
    pub verdict: Verdict,
    pub verdict_msg: String,
    pub reject_score: f64,
    pub reject_score_threshold: f64,
    pub tempfail_score: f64,
    pub tempfail_score_threshold: f64,
    pub check_results: Vec<ArchivedCheckResult>,
    pub session: ArchivedSession,
}

impl ArchivedMessage {
    /// Snapshot a decided message. Returns `None` when no verdict has
    /// been assigned yet.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let outcome = msg.outcome()?;
        let session = msg.session();

        let mut headers: Vec<(String, String)> = msg
            .headers
            .iter()
            .map(|h: &MessageHeader| (h.key.clone(), h.value.clone()))
            .collect();
        if let Some(injected) = msg.injected_message_id() {
            headers.push(("Message-Id".to_string(), injected.to_string()));
        }

        let check_results = outcome
            .check_results
            .iter()
            .map(|r| ArchivedCheckResult {
                module: r.module.to_string(),
                verdict: r.suggested_action,
                message: r.message.clone(),
                score: r.score,
                weighted_score: r.weighted_score,
                duration_secs: r.duration.as_secs_f64(),
                determinants: serde_json::Value::Object(r.determinants.clone()),
            })
            .collect();

        Some(Self {
            queue_id: msg.queue_id.clone(),
            from: msg.from.clone(),
            rcpt: msg.rcpt.clone(),
            headers,
            body: msg.body.clone(),
            date: msg.date,
            verdict: outcome.verdict,
            verdict_msg: outcome.message.clone(),
            reject_score: outcome.reject_score,
            reject_score_threshold: outcome.reject_score_threshold,
            tempfail_score: outcome.tempfail_score,
            tempfail_score_threshold: outcome.tempfail_score_threshold,
            check_results,
            session: ArchivedSession {
                id: session.id,
                instance: session.instance,
                ip: session.ip.clone(),
                helo: session.helo.clone(),
                sasl_user: session.sasl_user.clone(),
                tls_version: session.tls_version.clone(),
                cipher: session.cipher.clone(),
                mta_host: session.mta_host.clone(),
                date_connect: session.date_connect,
            },
        })
    }
}

/// Consumes archived messages
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn archive(&self, record: ArchivedMessage) -> Result<()>;
}

/// Bounded queue between the verdict pipeline and the sinks
#[derive(Clone)]
pub struct ArchiveQueue {
    tx: mpsc::Sender<ArchivedMessage>,
}

impl ArchiveQueue {
    /// Start the consumer task. Each record is offered to every sink in
    /// turn; a failing sink only loses its own copy.
    pub fn start(
        sinks: Vec<Arc<dyn ArchiveSink>>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ArchivedMessage>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.archive(record.clone()).await {
                        warn!(queue_id = %record.queue_id, "archive sink error: {}", e);
                    }
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Enqueue a record; waits for queue space, but a closed queue only
    /// logs and drops
    pub async fn push(&self, record: ArchivedMessage) {
        if self.tx.send(record).await.is_err() {
            warn!("archive queue closed, dropping record");
        }
    }
}

/// Sink that projects each record into the relational schema, where the
/// greylisting history reads it back
pub struct RelationalSink {
    store: DbMessageStore,
}

impl RelationalSink {
    pub fn new(store: DbMessageStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArchiveSink for RelationalSink {
    async fn archive(&self, record: ArchivedMessage) -> Result<()> {
        let record = MessageRecord {
            queue_id: record.queue_id,
            session: SessionRecord {
                id: record.session.id,
                instance: record.session.instance,
                ip: record.session.ip,
                helo: record.session.helo,
                sasl_user: record.session.sasl_user,
                tls_version: record.session.tls_version,
                cipher: record.session.cipher,
                mta_host: record.session.mta_host,
                date_connect: record.session.date_connect,
            },
            from: record.from,
            rcpt: record.rcpt,
            date: record.date,
            verdict: record.verdict.as_str().to_string(),
            verdict_msg: record.verdict_msg,
            reject_score: record.reject_score,
            tempfail_score: record.tempfail_score,
        };
        self.store.record(&record).await
    }
}

/// Sink that drops every record; for installations without an archive
pub struct NullSink;

#[async_trait]
impl ArchiveSink for NullSink {
    async fn archive(&self, _record: ArchivedMessage) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ArchivedMessage {
        ArchivedMessage {
            queue_id: "9C1A2B".to_string(),
            from: Address::parse("sender@example.org", true),
            rcpt: vec![
                Address::parse("one@example.com", true),
                Address::parse("two@example.com", true),
            ],
            headers: vec![
                ("Subject".to_string(), "hello".to_string()),
                ("Message-Id".to_string(), "<x@example.org>".to_string()),
            ],
            body: b"Hello there\r\n".to_vec(),
            date: Utc::now(),
            verdict: Verdict::Reject,
            verdict_msg: "Rejected for spam".to_string(),
            reject_score: 7.5,
            reject_score_threshold: 5.0,
            tempfail_score: 0.0,
            tempfail_score_threshold: 8.0,
            check_results: vec![ArchivedCheckResult {
                module: "greylisting".to_string(),
                verdict: Verdict::Permit,
                message: String::new(),
                score: 1.0,
                weighted_score: 1.0,
                duration_secs: 0.012,
                determinants: serde_json::json!({"Found in whitelist": "true"}),
            }],
            session: ArchivedSession {
                id: Uuid::new_v4(),
                instance: 1,
                ip: "198.51.100.9".to_string(),
                helo: "mx.remote.example".to_string(),
                sasl_user: None,
                tls_version: Some("TLSv1.3".to_string()),
                cipher: Some("TLS_AES_128_GCM_SHA256".to_string()),
                mta_host: "mail.example.com".to_string(),
                date_connect: Utc::now(),
            },
        }
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record();
        let serialized = serde_json::to_string(&record).unwrap();
        let restored: ArchivedMessage = serde_json::from_str(&serialized).unwrap();
        assert_eq!(record, restored);
    }

    #[tokio::test]
    async fn test_queue_delivers_to_sink() {
        use std::sync::Mutex;

        struct Capture(Mutex<Vec<ArchivedMessage>>);

        #[async_trait]
        impl ArchiveSink for Capture {
            async fn archive(&self, record: ArchivedMessage) -> Result<()> {
                self.0.lock().unwrap().push(record);
                Ok(())
            }
        }

        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        let (queue, handle) = ArchiveQueue::start(vec![sink.clone()], 4);

        queue.push(sample_record()).await;
        drop(queue);
        handle.await.unwrap();

        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
