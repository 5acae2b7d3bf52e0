//! Per-connection session state

use crate::message::{Message, MessageHeader};
use chrono::{DateTime, Utc};
use cluegetter_common::{Address, Config};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Connection-level fields handed over by the MTA when a session is
/// opened. Everything not supplied stays at its default.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub ip: String,
    pub helo: String,
    pub mta_host: String,
    pub sasl_user: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
}

/// One SMTP connection. The identifying fields are immutable after
/// connect; the session owns its messages and each message keeps a
/// shared handle back to its session.
pub struct Session {
    pub id: Uuid,
    pub instance: i64,
    pub ip: String,
    pub helo: String,
    pub sasl_user: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub mta_host: String,
    pub date_connect: DateTime<Utc>,

    config: Arc<Config>,
    insert_headers: Vec<MessageHeader>,
    messages: Mutex<Vec<Arc<Message>>>,
}

impl Session {
    pub(crate) fn new(
        config: Arc<Config>,
        insert_headers: Vec<MessageHeader>,
        info: SessionInfo,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance: config.server.instance,
            ip: info.ip,
            helo: info.helo,
            sasl_user: info.sasl_user,
            tls_version: info.tls_version,
            cipher: info.cipher,
            mta_host: info.mta_host,
            date_connect: Utc::now(),
            config,
            insert_headers,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// The effective configuration for this session
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a freshly received message with this session.
    ///
    /// The configured add-header templates are copied onto the message
    /// so modules can append their own headers next to them.
    pub fn new_message(
        self: &Arc<Self>,
        queue_id: impl Into<String>,
        from: Address,
        rcpt: Vec<Address>,
        headers: Vec<MessageHeader>,
        body: Vec<u8>,
    ) -> Arc<Message> {
        let msg = Arc::new(Message::new(
            Arc::clone(self),
            queue_id.into(),
            from,
            rcpt,
            headers,
            body,
            self.insert_headers.clone(),
        ));
        self.messages.lock().unwrap().push(Arc::clone(&msg));
        msg
    }

    /// Messages received on this session, in order
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.messages.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("ip", &self.ip)
            .field("helo", &self.helo)
            .field("mta_host", &self.mta_host)
            .finish_non_exhaustive()
    }
}
