// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cancellable periodic background pass.
//!
//! Each tick runs the pass on the blocking pool (passes take parking_lot
//! locks and must not stall the async workers), then sleeps. The cancel
//! flag is checked at the top of the loop and right after the sleep.

use std::sync::Arc;
use std::time::Duration;

use hpc_common::constants::DEFAULT_LOOP_SHUTDOWN_GRACE_MS;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct PeriodicLoop {
    name: String,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl PeriodicLoop {
    /// Spawn a loop running `pass` every `interval`. Must be called from
    /// within a tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, pass: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let pass = Arc::new(pass);
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(loop_name = %loop_name, ?interval, "Background loop started");
            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                let pass = Arc::clone(&pass);
                if let Err(e) = tokio::task::spawn_blocking(move || pass()).await {
                    tracing::error!(loop_name = %loop_name, error = %e, "Background pass panicked");
                }

                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() {
                            // Owner dropped without shutdown.
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                if *cancel_rx.borrow() {
                    break;
                }
            }
            tracing::info!(loop_name = %loop_name, "Background loop stopped");
        });

        Self {
            name,
            cancel_tx,
            handle,
            shutdown_grace: Duration::from_millis(DEFAULT_LOOP_SHUTDOWN_GRACE_MS),
        }
    }

    /// Grace period used by `stop`.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal cancellation and wait up to `grace` for the loop to exit.
    /// Returns false, after logging, when the loop is stuck.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.cancel_tx.send(true);
        match tokio::time::timeout(grace, self.handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    loop_name = %self.name,
                    ?grace,
                    "Background loop did not stop within grace period, considered stuck"
                );
                false
            }
        }
    }

    /// `shutdown` with the loop's configured grace period.
    pub async fn stop(self) -> bool {
        let grace = self.shutdown_grace;
        self.shutdown(grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let lp = PeriodicLoop::spawn("counter", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        assert!(lp.shutdown(Duration::from_secs(2)).await);
        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_long_sleep() {
        let lp = PeriodicLoop::spawn("sleepy", Duration::from_secs(3600), || {});
        assert_eq!(lp.name(), "sleepy");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lp.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_pass_reported() {
        let lp = PeriodicLoop::spawn("stuck", Duration::from_millis(1), || {
            std::thread::sleep(Duration::from_millis(300));
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lp.shutdown(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_stop_uses_configured_grace() {
        let lp = PeriodicLoop::spawn("graced", Duration::from_secs(3600), || {});
        assert_eq!(lp.shutdown_grace(), Duration::from_millis(DEFAULT_LOOP_SHUTDOWN_GRACE_MS));
        let lp = lp.with_shutdown_grace(Duration::from_millis(750));
        assert_eq!(lp.shutdown_grace(), Duration::from_millis(750));
        assert!(lp.stop().await);
    }
}
