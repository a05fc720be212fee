//! Mock scoring service for integration testing.
//!
//! Provides a deterministic `ScoringClient` whose answers are scripted per
//! order number from test code. Orders without a script answer "not yet
//! known", the same as a `204` from the real service.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use loyalty::context::Context;
use loyalty::scoring::ScoringClient;
use loyalty::types::{OrderNumber, Result, ScoringResult, ScoringStatus, ServiceError};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
enum Script {
    Status(ScoringStatus, Option<Decimal>),
    RateLimited,
}

#[derive(Default, Clone)]
pub struct MockScoring {
    scripts: Arc<Mutex<HashMap<OrderNumber, Script>>>,
    calls: Arc<Mutex<Vec<OrderNumber>>>,
}

impl MockScoring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `status` (and `accrual`) for `number` from now on.
    pub fn set(&self, number: &str, status: ScoringStatus, accrual: Option<Decimal>) {
        let number = OrderNumber::parse(number).unwrap();
        self.scripts
            .lock()
            .unwrap()
            .insert(number, Script::Status(status, accrual));
    }

    /// Answer `429` for `number` from now on.
    pub fn rate_limit(&self, number: &str) {
        let number = OrderNumber::parse(number).unwrap();
        self.scripts.lock().unwrap().insert(number, Script::RateLimited);
    }

    pub fn calls_for(&self, number: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == number)
            .count()
    }
}

#[async_trait]
impl ScoringClient for MockScoring {
    async fn get_status(&self, _ctx: &Context, number: &OrderNumber) -> Result<Option<ScoringResult>> {
        self.calls.lock().unwrap().push(number.clone());
        let script = self.scripts.lock().unwrap().get(number).cloned();

        match script {
            None => Ok(None),
            Some(Script::RateLimited) => Err(ServiceError::Internal("rate limited".into())),
            Some(Script::Status(status, accrual)) => Ok(Some(ScoringResult {
                order: number.clone(),
                status,
                accrual,
            })),
        }
    }
}
