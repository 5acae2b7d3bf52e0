//! Storage models

use chrono::{DateTime, Utc};
use cluegetter_common::types::Address;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A past verdict as the greylisting module sees it: disposition plus
/// the moment it was handed down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVerdict {
    pub verdict: String,
    pub date: DateTime<Utc>,
}

impl StoredVerdict {
    pub fn is_permit(&self) -> bool {
        self.verdict == "permit"
    }
}

/// One row of the greylist whitelist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub ip: String,
    pub last_seen: DateTime<Utc>,
}

/// Session fields persisted alongside each message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
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

/// The relational projection of a decided message. The greylisting
/// history queries run against rows written from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub queue_id: String,
    pub session: SessionRecord,
    pub from: Address,
    pub rcpt: Vec<Address>,
    pub date: DateTime<Utc>,
    pub verdict: String,
    pub verdict_msg: String,
    pub reject_score: f64,
    pub tempfail_score: f64,
}
