//! Append-only audit ledger backed by `SQLite`.
//!
//! Every validated manifest is recorded here together with its seal,
//! approved or denied, before the client learns the outcome. The ledger is
//! the system's history and must be trustworthy even against gateway bugs,
//! so immutability is enforced by the store itself: schema triggers refuse
//! updates and deletes on manifests and auth events, and permit exactly one
//! transition on a seal, `(was_executed = false, executed_at = NULL)` to
//! `(true, t)`.
//!
//! # Features
//!
//! - **Atomic appends**: manifest and seal land in one transaction or not
//!   at all
//! - **One-time execution**: the executed transition is a conditional
//!   update; at most one caller observes success
//! - **Queries and statistics**: filtered, paginated reads ordered by
//!   creation time, plus aggregate counts for reporting
//! - **Auth forensics**: an append-only trail of authentication events

mod records;
mod store;


pub use records::{
    AgentCount, AuditRecord, AuditStats, AuthEvent, AuthEventKind, AuthEventRecord,
    ExecutionOutcome, ManifestRecord, Page, ProviderCount, QueryFilters, ReasonCount,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use store::{AuditLedger, LedgerError};
