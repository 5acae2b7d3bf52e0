//! Repositories for the relational store

use crate::db::DatabasePool;
use crate::models::{MessageRecord, StoredVerdict, WhitelistEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluegetter_common::{Error, Result};
use sqlx::Row;

/// Selector for the greylisting history lookup: the sender/recipient/IP
/// tuple a retry must match.
#[derive(Debug, Clone)]
pub struct VerdictSelector {
    pub instance: i64,
    pub from_local: String,
    pub from_domain: String,
    pub rcpt_local: String,
    pub rcpt_domain: String,
    pub ip: String,
}

/// Relational queries the greylisting module depends on
#[async_trait]
pub trait GreylistStore: Send + Sync {
    /// Past verdicts for a sender tuple within `window_secs`, oldest first
    async fn recent_verdicts(
        &self,
        selector: &VerdictSelector,
        window_secs: i64,
    ) -> Result<Vec<StoredVerdict>>;

    /// Whether the IP has a whitelist row younger than `validity_days`
    async fn is_whitelisted(&self, instance: i64, ip: &str, validity_days: i64) -> Result<bool>;

    /// Upsert the whitelist from recent permit verdicts; returns the
    /// number of affected rows (an upsert counts 2 per updated row)
    async fn refresh_whitelist(&self, instance: i64, validity_days: i64) -> Result<u64>;

    /// All whitelist rows younger than `validity_days`
    async fn whitelist_entries(
        &self,
        instance: i64,
        validity_days: i64,
    ) -> Result<Vec<WhitelistEntry>>;
}

/// PostgreSQL greylist store
pub struct DbGreylistStore {
    pool: DatabasePool,
}

impl DbGreylistStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GreylistStore for DbGreylistStore {
    async fn recent_verdicts(
        &self,
        selector: &VerdictSelector,
        window_secs: i64,
    ) -> Result<Vec<StoredVerdict>> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT m.verdict, m.date FROM message m
                LEFT JOIN message_recipient mr ON mr.message = m.id
                LEFT JOIN recipient r ON mr.recipient = r.id
                LEFT JOIN session s ON s.id = m.session
            WHERE m.sender_local = $1 AND m.sender_domain = $2
                AND r.local = $3 AND r.domain = $4
                AND s.ip = $5
                AND s.cluegetter_instance = $6
                AND m.date > now() - make_interval(secs => $7)
                AND m.verdict IS NOT NULL
            ORDER BY m.date ASC
            "#,
        )
        .bind(&selector.from_local)
        .bind(&selector.from_domain)
        .bind(&selector.rcpt_local)
        .bind(&selector.rcpt_domain)
        .bind(&selector.ip)
        .bind(selector.instance)
        .bind(window_secs as f64)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(verdict, date)| StoredVerdict { verdict, date })
            .collect())
    }

    async fn is_whitelisted(&self, instance: i64, ip: &str, validity_days: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM greylist_whitelist
            WHERE cluegetter_instance = $1
                AND ip = $2
                AND last_seen > now() - make_interval(days => $3)
            LIMIT 1
            "#,
        )
        .bind(instance)
        .bind(ip)
        .bind(validity_days as i32)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn refresh_whitelist(&self, instance: i64, validity_days: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO greylist_whitelist (cluegetter_instance, ip, last_seen)
            SELECT s.cluegetter_instance, s.ip, MAX(m.date)
                FROM message m
                    LEFT JOIN message_recipient mr ON mr.message = m.id
                    LEFT JOIN recipient r ON mr.recipient = r.id
                    LEFT JOIN session s ON s.id = m.session
                WHERE s.cluegetter_instance = $1
                    AND m.date > now() - make_interval(days => $2 + 1)
                    AND m.verdict = 'permit'
                GROUP BY s.cluegetter_instance, s.ip
            ON CONFLICT (cluegetter_instance, ip)
                DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(instance)
        .bind(validity_days as i32)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn whitelist_entries(
        &self,
        instance: i64,
        validity_days: i64,
    ) -> Result<Vec<WhitelistEntry>> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT ip, last_seen FROM greylist_whitelist
            WHERE cluegetter_instance = $1
                AND last_seen > now() - make_interval(days => $2)
            "#,
        )
        .bind(instance)
        .bind(validity_days as i32)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(ip, last_seen)| WhitelistEntry { ip, last_seen })
            .collect())
    }
}

/// Writes decided messages into the relational schema the greylisting
/// history reads back: `session`, `message`, `recipient` and the
/// `message_recipient` join table.
pub struct DbMessageStore {
    pool: DatabasePool,
}

impl DbMessageStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persist one decided message. The session row is upserted since
    /// a session carries many messages.
    pub async fn record(&self, record: &MessageRecord) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO session (id, cluegetter_instance, ip, helo, sasl_user,
                                 tls_version, cipher, mta_host, date_connect)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.session.id)
        .bind(record.session.instance)
        .bind(&record.session.ip)
        .bind(&record.session.helo)
        .bind(&record.session.sasl_user)
        .bind(&record.session.tls_version)
        .bind(&record.session.cipher)
        .bind(&record.session.mta_host)
        .bind(record.session.date_connect)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO message (id, session, sender_local, sender_domain, date,
                                 verdict, verdict_msg, reject_score, tempfail_score)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.queue_id)
        .bind(record.session.id)
        .bind(record.from.local())
        .bind(record.from.domain())
        .bind(record.date)
        .bind(&record.verdict)
        .bind(&record.verdict_msg)
        .bind(record.reject_score)
        .bind(record.tempfail_score)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for rcpt in &record.rcpt {
            let recipient_id: i64 = sqlx::query(
                r#"
                INSERT INTO recipient (local, domain)
                VALUES ($1, $2)
                ON CONFLICT (local, domain) DO UPDATE SET local = EXCLUDED.local
                RETURNING id
                "#,
            )
            .bind(rcpt.local())
            .bind(rcpt.domain())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .get(0);

            sqlx::query(
                r#"
                INSERT INTO message_recipient (message, recipient)
                VALUES ($1, $2)
                "#,
            )
            .bind(&record.queue_id)
            .bind(recipient_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
