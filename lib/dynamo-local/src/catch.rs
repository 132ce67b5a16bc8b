//! Fault boundary for lifecycle operations.
//!
//! Every public builder and runtime operation runs inside [`FaultBoundary::guard`]. By default a panic raised while
//! the operation runs is caught, logged, and turned into the operation's error type. When catching is disabled (test
//! and debug harnesses), the panic propagates unchanged.

use std::{
    any::Any,
    future::Future,
    panic::{resume_unwind, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};

use futures::FutureExt as _;
use tracing::error;

/// Converts faults raised inside lifecycle operations into structured errors.
#[derive(Debug, Default)]
pub struct FaultBoundary {
    disabled: AtomicBool,
}

impl FaultBoundary {
    /// Creates a new `FaultBoundary` with catching enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables catching.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Returns `true` if faults propagate unchanged.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Runs `operation`, converting a panic into an error built by `on_fault`.
    ///
    /// `on_fault` receives the panic message.
    pub async fn guard<T, E, F, H>(&self, operation: &'static str, fut: F, on_fault: H) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        H: FnOnce(String) -> E,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                if self.is_disabled() {
                    resume_unwind(payload);
                }

                let message = panic_message(payload.as_ref());
                error!(operation, "Caught fault during lifecycle operation: {}", message);
                Err(on_fault(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown fault".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn boom() -> Result<(), String> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn converts_faults_by_default() {
        let boundary = FaultBoundary::new();

        let result = boundary.guard("boom", boom(), |msg| format!("fault: {}", msg)).await;
        assert_eq!(result, Err("fault: kaboom".to_string()));
    }

    #[tokio::test]
    async fn passes_results_through() {
        let boundary = FaultBoundary::new();

        let ok = boundary.guard("ok", async { Ok::<_, String>(7) }, |msg| msg).await;
        assert_eq!(ok, Ok(7));

        let err = boundary
            .guard("err", async { Err::<u8, _>("plain".to_string()) }, |msg| msg)
            .await;
        assert_eq!(err, Err("plain".to_string()));
    }

    #[tokio::test]
    #[should_panic(expected = "kaboom")]
    async fn propagates_faults_when_disabled() {
        let boundary = FaultBoundary::new();
        boundary.set_disabled(true);

        let _ = boundary.guard("boom", boom(), |msg| msg).await;
    }
}
