//! Process runner for long-lived gateway services.
//!
//! The runner drives a set of named app processes concurrently, stops all of
//! them when one fails or when SIGINT/SIGTERM arrives, and then runs closers
//! under a bounded timeout. Closers run sequentially in registration order so
//! that shutdown steps can depend on each other (drain sessions, then close
//! the broker connection, then flush telemetry).
//!
//! # Example
//!
//! ```no_run
//! use runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_named_process("heartbeat", |ctx| async move {
//!             while !ctx.is_cancelled() {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("still alive");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Boxed future returned by app processes and closers.
pub type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// An app process: receives the shared cancellation token and runs until it is cancelled.
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;

/// A closer: runs once after every app process has stopped.
pub type Closer = Box<dyn FnOnce() -> ProcessFuture + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

/// How a [`Runner`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every process stopped without error (usually after a shutdown signal).
    Clean,
    /// A process failed; carries its name and the rendered error.
    Failed { process: String, error: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

pub struct Runner {
    processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Creates a runner with a 10 second closer timeout and signal handling enabled.
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    /// Adds an app process named after its position.
    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("process_{}", self.processes.len());
        self.with_named_process(name, process)
    }

    /// Adds an app process whose name shows up in lifecycle logs.
    ///
    /// If any process returns an error the shared token is cancelled and the
    /// remaining processes are given the chance to stop before being aborted.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(move |token: CancellationToken| -> ProcessFuture {
                Box::pin(process(token))
            }),
        });
        self
    }

    /// Adds a closer. Closers run in registration order after all processes stop.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers
            .push(Box::new(move || -> ProcessFuture { Box::pin(closer()) }));
        self
    }

    /// Bounds the total time spent in closers. Default is 10 seconds.
    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Uses an externally owned token so other components can trigger shutdown.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disables SIGINT/SIGTERM handling. Used by tests that drive cancellation themselves.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Runs to completion and exits the process with the outcome's exit code.
    pub async fn run(self) {
        let outcome = self.execute().await;
        match &outcome {
            RunOutcome::Clean => info!("application exiting normally"),
            RunOutcome::Failed { process, error } => {
                error!(process = %process, error = %error, "application exiting with error")
            }
        }
        std::process::exit(outcome.exit_code());
    }

    /// Runs all processes and closers and reports how the run ended.
    pub async fn execute(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.processes {
            let process_token = token.clone();
            debug!(process = %name, "starting app process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut outcome = RunOutcome::Clean;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(process = %name, "app process stopped");
                }
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        error!(process = %name, error = %format!("{err:#}"), "app process failed");
                        outcome = RunOutcome::Failed {
                            process: name,
                            error: format!("{err:#}"),
                        };
                        token.cancel();
                    } else {
                        warn!(process = %name, error = %format!("{err:#}"), "app process errored during shutdown");
                    }
                }
                Err(err) => {
                    error!(error = %err, "app process panicked");
                    if !token.is_cancelled() {
                        outcome = RunOutcome::Failed {
                            process: "unknown".to_string(),
                            error: err.to_string(),
                        };
                        token.cancel();
                    }
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        join_set.shutdown().await;

        if !self.closers.is_empty() {
            info!(timeout = ?self.closer_timeout, "running closers");
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => info!("all closers completed"),
                Err(_) => error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        outcome
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "failed to install ctrl-c handler"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>) {
    for (index, closer) in closers.into_iter().enumerate() {
        if let Err(err) = closer().await {
            error!(closer = index, error = %format!("{err:#}"), "closer failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_cancellation_stops_processes_and_runs_closers() {
        let closer_called = Arc::new(AtomicBool::new(false));
        let flag = closer_called.clone();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = Runner::new()
            .with_named_process("waiter", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token)
            .without_signal_handlers()
            .execute()
            .await;

        assert_eq!(outcome, RunOutcome::Clean);
        assert!(closer_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failing_process_cancels_siblings() {
        let outcome = Runner::new()
            .with_named_process("failing", |_ctx| async move {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .with_named_process("sibling", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .without_signal_handlers()
            .execute()
            .await;

        assert_eq!(
            outcome,
            RunOutcome::Failed {
                process: "failing".to_string(),
                error: "boom".to_string(),
            }
        );
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_closers_run_in_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let first = order.clone();
        let second = order.clone();
        let token = CancellationToken::new();
        token.cancel();

        Runner::new()
            .with_closer(move || async move {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            })
            .with_closer(move || async move {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            })
            .with_cancellation_token(token)
            .without_signal_handlers()
            .execute()
            .await;

        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closer_timeout_is_enforced() {
        let token = CancellationToken::new();
        token.cancel();

        let started = tokio::time::Instant::now();
        Runner::new()
            .with_closer(|| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_millis(50))
            .with_cancellation_token(token)
            .without_signal_handlers()
            .execute()
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
