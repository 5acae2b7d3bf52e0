//! Storage backends for ClueGetter
//!
//! This crate owns the two stores the engine writes to: the relational
//! database (past verdicts, the greylist whitelist) and the Redis cache
//! (whitelist mirror, greylist tuples, the maintenance lock).

pub mod cache;
pub mod db;
pub mod models;
pub mod repository;

pub use cache::{Cache, RedisCache};
pub use db::DatabasePool;
pub use models::{MessageRecord, SessionRecord, StoredVerdict, WhitelistEntry};
pub use repository::{DbGreylistStore, DbMessageStore, GreylistStore, VerdictSelector};
