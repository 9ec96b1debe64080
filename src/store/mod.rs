//! Persistence layer: libSQL-backed storage for campaigns, leads, threads,
//! the outbound send ledger and job run history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    CounterDelta, Database, LeadCommit, OutboundSend, OutboundStatus, ThreadTotals,
};
