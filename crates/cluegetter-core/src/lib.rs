//! ClueGetter core - the message verdict pipeline and scoring modules
//!
//! This crate implements the policy engine an MTA consults per message:
//! session and message state, the module registry, the concurrent verdict
//! pipeline with its circuit breaker and module-group weighting, the
//! header mutator, the greylisting module, and the archive queue.

pub mod archive;
pub mod engine;
pub mod greylist;
pub mod headers;
pub mod message;
pub mod module;
pub mod session;
pub mod spf;
pub mod verdict;

pub use archive::{
    ArchiveQueue, ArchiveSink, ArchivedCheckResult, ArchivedMessage, NullSink, RelationalSink,
};
pub use engine::{Engine, Stats};
pub use greylist::GreylistModule;
pub use message::{CheckCallback, CheckResult, Message, MessageHeader, VerdictOutcome};
pub use module::Module;
pub use session::{Session, SessionInfo};
pub use spf::{DnsSpfResolver, SpfResolver, SpfResult};
pub use verdict::{ActionResults, ModuleGroup};
