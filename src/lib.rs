//! Cached workout-schedule sync for trainer dashboards.
//!
//! [`sync::DataSyncService`] serves schedule windows cache-first, shares one
//! store call between concurrent callers and retries transient failures.
//! [`approval::ApprovalMachine`] drives the save/approve button of an
//! editable plan.

pub mod approval;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod query;
pub mod retry;
pub mod store;
pub mod sync;
