//! Core engine: retry primitive, the scoring poller, the balance
//! reconciler and the request-path ledger service.

pub mod ledger;
pub mod poller;
pub mod reconciler;
pub mod retry;
