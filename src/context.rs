//! Explicit execution context.
//!
//! Every store call, scoring request and retry loop receives a [`Context`]
//! carrying a cancellation signal and a correlation id. Cancellation is a
//! `watch` channel so any number of tasks can observe one [`Canceller`].

use std::future::Future;

use tokio::sync::watch;
use uuid::Uuid;

use crate::types::{Result, ServiceError};

/// Handle that cancels every context derived from its root.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal plus correlation id, passed by reference through
/// the core and cloned into spawned work.
#[derive(Debug, Clone)]
pub struct Context {
    request_id: Uuid,
    cancel: watch::Receiver<bool>,
}

impl Context {
    /// A root context and the handle that cancels it.
    pub fn root() -> (Canceller, Self) {
        let (tx, rx) = watch::channel(false);
        (
            Canceller { tx },
            Self {
                request_id: Uuid::new_v4(),
                cancel: rx,
            },
        )
    }

    /// A context that is never cancelled.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            request_id: Uuid::new_v4(),
            cancel: rx,
        }
    }

    /// Same cancellation, fresh correlation id.
    pub fn child(&self) -> Self {
        self.with_request_id(Uuid::new_v4())
    }

    pub fn with_request_id(&self, request_id: Uuid) -> Self {
        Self {
            request_id,
            cancel: self.cancel.clone(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the context is cancelled; pends forever if the
    /// canceller was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                if *rx.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drive `fut` to completion unless the context is cancelled first.
    ///
    /// On cancellation `fut` is dropped, which rolls back any transaction it
    /// holds, and [`ServiceError::Cancelled`] is returned.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ServiceError::Cancelled),
            res = fut => res,
        }
    }
}
