//! Scoring module interface and registry

use crate::message::{CheckResult, Message};
use crate::session::Session;
use async_trait::async_trait;
use cluegetter_common::{Address, Error, Result, Verdict};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A scoring module. The verdict pipeline runs `check` for every
/// enabled module concurrently; a module must watch `done` at each of
/// its suspension points and bail out promptly once it fires.
///
/// `check` must not mutate the message other than through
/// [`Message::add_header`]. Returning `None` means the module has no
/// opinion; it contributes nothing to the verdict.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable module name, used in module groups and check results
    fn name(&self) -> &'static str;

    /// Whether the module takes part in message checks
    fn enabled(&self) -> bool {
        true
    }

    /// One-time setup, run when the engine starts
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Score one message
    async fn check(&self, msg: &Arc<Message>, done: &CancellationToken) -> Option<CheckResult>;

    /// Veto a recipient at RCPT time
    async fn recipient_check(&self, _rcpt: &Address) -> Option<(Verdict, String)> {
        None
    }

    /// The session closed; flush any per-session state
    async fn session_disconnect(&self, _session: &Session) {}
}

/// Registered modules, enumerated in registration order
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(Error::Module(format!(
                "module {} is already registered",
                module.name()
            )));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn all(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }

    pub fn enabled(&self) -> Vec<Arc<dyn Module>> {
        self.modules
            .iter()
            .filter(|m| m.enabled())
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }
}
