//! The engine: configuration, registered modules, and shared state
//!
//! Everything that used to be process-global lives here and is passed
//! explicitly into module hooks, which keeps initialization order
//! obvious and lets tests build isolated engines.

use crate::archive::ArchiveQueue;
use crate::headers;
use crate::message::MessageHeader;
use crate::module::{Module, ModuleRegistry};
use crate::session::{Session, SessionInfo};
use crate::verdict::ModuleGroup;
use cluegetter_common::{Address, Config, Result, Verdict};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters
#[derive(Debug, Default)]
pub struct Stats {
    pub message_panics: AtomicU64,
    pub verdict_permit: AtomicU64,
    pub verdict_tempfail: AtomicU64,
    pub verdict_reject: AtomicU64,
}

impl Stats {
    pub(crate) fn count_verdict(&self, verdict: Verdict) {
        match verdict {
            Verdict::Permit => self.verdict_permit.fetch_add(1, Ordering::Relaxed),
            Verdict::TempFail => self.verdict_tempfail.fetch_add(1, Ordering::Relaxed),
            Verdict::Reject => self.verdict_reject.fetch_add(1, Ordering::Relaxed),
            Verdict::Error => 0,
        };
    }
}

/// The policy engine. Construct with [`Engine::new`], register modules,
/// then call [`Engine::start`] before serving traffic.
pub struct Engine {
    config: Arc<Config>,
    registry: ModuleRegistry,
    module_groups: Vec<ModuleGroup>,
    insert_headers: Vec<MessageHeader>,
    archive: ArchiveQueue,
    stats: Arc<Stats>,
}

impl Engine {
    /// Build an engine from configuration. Configured add-header
    /// templates are parsed here; a bad template is a startup error.
    pub fn new(config: Arc<Config>, archive: ArchiveQueue) -> Result<Self> {
        let insert_headers = headers::parse_insert_headers(&config.cluegetter.add_header)?;

        Ok(Self {
            config,
            registry: ModuleRegistry::default(),
            module_groups: Vec::new(),
            insert_headers,
            archive,
            stats: Arc::new(Stats::default()),
        })
    }

    /// Register a scoring module. Modules are checked in registration
    /// order.
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<()> {
        self.registry.register(module)
    }

    /// Validate module groups against the registered modules and run
    /// every enabled module's `init` hook. Must be called once, before
    /// the first message.
    pub async fn start(&mut self) -> Result<()> {
        let names = self.registry.names();
        self.module_groups = ModuleGroup::from_config(&self.config, &names)?;

        for module in self.registry.all() {
            if module.enabled() {
                module.init().await?;
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub(crate) fn module_groups(&self) -> &[ModuleGroup] {
        &self.module_groups
    }

    pub(crate) fn archive(&self) -> &ArchiveQueue {
        &self.archive
    }

    /// Open a session for a new SMTP connection
    pub fn new_session(&self, info: SessionInfo) -> Arc<Session> {
        Arc::new(Session::new(
            Arc::clone(&self.config),
            self.insert_headers.clone(),
            info,
        ))
    }

    /// The connection closed; let modules flush per-session state
    pub async fn session_disconnect(&self, session: &Session) {
        for module in self.registry.enabled() {
            module.session_disconnect(session).await;
        }
    }

    /// Fold the modules' RCPT-time opinions into one verdict. An error
    /// short-circuits; otherwise the most severe verdict wins.
    pub async fn accept_recipient(&self, rcpt: &Address) -> (Verdict, String) {
        let mut final_verdict = Verdict::Permit;
        let mut final_msg = String::new();

        for module in self.registry.enabled() {
            if let Some((verdict, msg)) = module.recipient_check(rcpt).await {
                if verdict == Verdict::Error {
                    return (verdict, msg);
                }
                if verdict > final_verdict {
                    final_verdict = verdict;
                    final_msg = msg;
                }
            }
        }

        (final_verdict, final_msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveQueue, NullSink};
    use crate::message::{CheckResult, Message};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    struct RcptModule {
        name: &'static str,
        verdict: Verdict,
        message: &'static str,
        disconnected: AtomicBool,
    }

    impl RcptModule {
        fn new(name: &'static str, verdict: Verdict, message: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                verdict,
                message,
                disconnected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Module for RcptModule {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(
            &self,
            _msg: &Arc<Message>,
            _done: &CancellationToken,
        ) -> Option<CheckResult> {
            None
        }

        async fn recipient_check(&self, _rcpt: &Address) -> Option<(Verdict, String)> {
            Some((self.verdict, self.message.to_string()))
        }

        async fn session_disconnect(&self, _session: &Session) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    async fn engine_with(modules: Vec<Arc<dyn Module>>) -> Engine {
        let (archive, _consumer) = ArchiveQueue::start(vec![Arc::new(NullSink)], 4);
        let mut engine = Engine::new(Arc::new(Config::default()), archive).unwrap();
        for module in modules {
            engine.register(module).unwrap();
        }
        engine.start().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_accept_recipient_most_severe_wins() {
        let engine = engine_with(vec![
            RcptModule::new("a", Verdict::Permit, ""),
            RcptModule::new("b", Verdict::TempFail, "quota exceeded"),
        ])
        .await;

        let rcpt = Address::parse("rcpt@example.com", true);
        let (verdict, msg) = engine.accept_recipient(&rcpt).await;
        assert_eq!(verdict, Verdict::TempFail);
        assert_eq!(msg, "quota exceeded");
    }

    #[tokio::test]
    async fn test_accept_recipient_error_short_circuits() {
        let engine = engine_with(vec![
            RcptModule::new("a", Verdict::Error, "store down"),
            RcptModule::new("b", Verdict::Reject, "never consulted"),
        ])
        .await;

        let rcpt = Address::parse("rcpt@example.com", true);
        let (verdict, msg) = engine.accept_recipient(&rcpt).await;
        assert_eq!(verdict, Verdict::Error);
        assert_eq!(msg, "store down");
    }

    #[tokio::test]
    async fn test_duplicate_module_registration_fails() {
        let (archive, _consumer) = ArchiveQueue::start(vec![Arc::new(NullSink)], 4);
        let mut engine = Engine::new(Arc::new(Config::default()), archive).unwrap();
        engine
            .register(RcptModule::new("a", Verdict::Permit, ""))
            .unwrap();
        assert!(engine
            .register(RcptModule::new("a", Verdict::Permit, ""))
            .is_err());
    }

    #[tokio::test]
    async fn test_session_disconnect_reaches_modules() {
        let module = RcptModule::new("a", Verdict::Permit, "");
        let engine = engine_with(vec![module.clone() as Arc<dyn Module>]).await;

        let session = engine.new_session(crate::session::SessionInfo::default());
        engine.session_disconnect(&session).await;
        assert!(module.disconnected.load(Ordering::SeqCst));
    }
}
