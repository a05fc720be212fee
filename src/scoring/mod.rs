//! External accrual-scoring service.
//!
//! Defines the `ScoringClient` port and provides the reqwest-backed
//! implementation in [`http`].

pub mod http;

use async_trait::async_trait;

use crate::context::Context;
use crate::types::{OrderNumber, Result, ScoringResult};

/// Abstraction over the scoring service.
///
/// Implementors translate transport outcomes into the closed
/// [`ScoringResult`] vocabulary. `Ok(None)` means the service does not know
/// the order yet; rate limiting and unexpected responses surface as
/// `Internal` errors so the caller's retry policy applies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn get_status(&self, ctx: &Context, number: &OrderNumber) -> Result<Option<ScoringResult>>;
}
