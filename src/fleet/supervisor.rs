//! Supervised background loops.
//!
//! Every loop runs its iterations as separate tasks, so an error or a panic in one
//! iteration is caught at the boundary, logged, counted and followed by the error
//! backoff. Loops watch a shared shutdown signal between iterations and while waiting;
//! shutdown aborts an iteration in flight, which drops its open channel and port lock.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::metrics;
use crate::retry::Backoff;

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    loops: Vec<(String, JoinHandle<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            loops: Vec::new(),
        }
    }

    /// Run `iteration` forever, `interval` apart, backing off with `backoff` after a
    /// failed iteration.
    pub fn spawn<F, Fut>(&mut self, name: &str, interval: Duration, backoff: Backoff, iteration: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            info!("{} loop started", label);
            let mut failures = 0u32;
            loop {
                if *stop.borrow() {
                    break;
                }
                let mut task = tokio::spawn(iteration());
                let outcome = tokio::select! {
                    res = &mut task => res,
                    _ = stop.changed() => {
                        task.abort();
                        let _ = task.await;
                        break;
                    }
                };
                let pause = match outcome {
                    Ok(Ok(())) => {
                        failures = 0;
                        interval
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        metrics::inc_loop_iteration_failures();
                        error!("{} iteration failed: {:#}", label, e);
                        backoff.delay(failures)
                    }
                    Err(e) if e.is_panic() => {
                        failures += 1;
                        metrics::inc_loop_iteration_failures();
                        error!("{} iteration panicked", label);
                        backoff.delay(failures)
                    }
                    Err(e) => {
                        warn!("{} iteration cancelled: {}", label, e);
                        backoff.delay(failures.max(1))
                    }
                };
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = stop.changed() => break,
                }
            }
            info!("{} loop stopped", label);
        });
        self.loops.push((name.to_string(), handle));
    }

    pub fn is_running(&self) -> bool {
        self.loops.iter().any(|(_, h)| !h.is_finished())
    }

    /// Signal every loop and wait for all of them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.loops {
            if let Err(e) = handle.await {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn failing_iterations_do_not_stop_the_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sup = Supervisor::new();
        let counter = calls.clone();
        sup.spawn(
            "flaky",
            Duration::from_secs(1),
            Backoff::Fixed(Duration::from_secs(5)),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => anyhow::bail!("transient enumeration error"),
                        1 => panic!("iteration bug"),
                        _ => Ok(()),
                    }
                }
            },
        );
        sleep(Duration::from_secs(13)).await;
        assert!(sup.is_running());
        assert!(calls.load(Ordering::SeqCst) >= 4);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_iteration_in_flight() {
        let finished = Arc::new(AtomicU32::new(0));
        let mut sup = Supervisor::new();
        let done = finished.clone();
        sup.spawn(
            "slow",
            Duration::from_secs(1),
            Backoff::Fixed(Duration::from_secs(5)),
            move || {
                let done = done.clone();
                async move {
                    sleep(Duration::from_secs(3600)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );
        sleep(Duration::from_secs(1)).await;
        sup.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
