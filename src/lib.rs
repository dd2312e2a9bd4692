//! # calcd
//!
//! Distributed arithmetic-expression evaluation: an orchestrator hands
//! jobs to privately-owned worker processes, tracks their liveness via
//! heartbeats, and caches results in SQLite so a repeated submission of
//! the same (expression, owner) pair never recomputes.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod liveness;
pub mod model;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod worker;
