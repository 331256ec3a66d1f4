//! Cancellable, deadline-bearing operation scopes.
//!
//! Every RPC call and every orchestration wait runs inside a [Context]. Cancelling a
//! [Context] (or letting its deadline pass) cancels all children derived from it, so an
//! outer scope can abort an entire fan-out at once.

use crate::Error;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Scope under which an operation runs.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Create a root [Context] with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root [Context] that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a child that is cancelled whenever `self` is (but not vice versa).
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is the earlier of `self`'s and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    /// Derive a child, injecting `timeout` only if `self` carries no deadline.
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        match self.deadline {
            Some(_) => self.child(),
            None => self.child_with_timeout(timeout),
        }
    }

    /// The instant at which this scope expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this scope and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `future` to completion unless the scope is cancelled or expires first.
    ///
    /// When the scope ends first, `future` is dropped (cancelling any in-flight work it owns).
    pub async fn run<T, F>(&self, future: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::DeadlineExceeded),
            result = future => result,
        }
    }
}
