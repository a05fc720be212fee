//! LOYALTY: loyalty-point ledger
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod context;
pub mod engine;
pub mod scoring;
pub mod storage;
pub mod types;
