//! Cancellation controller: single interrupt drains, double interrupt hushes.
//!
//! One exchange moves through `Idle → Generating → InterruptedDraining →
//! Hushed → Idle`. The first interrupt cancels the exchange's generation
//! token and leaves queued audio playing. A second interrupt in the same
//! exchange stops every synthesis job and the active player, and clears the
//! playback queue. Interrupts in any other state are absorbed.
//!
//! SIGINT and SIGTERM are mapped to interrupts by [`spawn_signal_listener`]
//! so neither terminates the process.

use crate::speech::SpeechDispatcher;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No exchange in progress.
    Idle,
    /// Tokens are being consumed.
    Generating,
    /// Generation has stopped (interrupted, or finished with audio still
    /// queued) and audio is allowed to finish.
    InterruptedDraining,
    /// Everything stopped; waiting for the exchange to settle.
    Hushed,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::InterruptedDraining => "draining",
            Self::Hushed => "hushed",
        };
        f.write_str(s)
    }
}

/// What an interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Nothing to stop.
    Absorbed,
    /// Generation cancelled, audio left to drain.
    StopGeneration,
    /// Audio stopped and the queue cleared.
    Hush,
}

#[derive(Debug)]
struct Inner {
    state: ControllerState,
    exchange: u64,
    token: CancellationToken,
}

/// Owns the per-exchange cancellation token and the interrupt state machine.
pub struct CancellationController {
    inner: Mutex<Inner>,
    dispatcher: Arc<SpeechDispatcher>,
    grace_period: Duration,
}

impl CancellationController {
    pub fn new(dispatcher: Arc<SpeechDispatcher>, grace_period: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ControllerState::Idle,
                exchange: 0,
                token: CancellationToken::new(),
            }),
            dispatcher,
            grace_period,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start a new exchange. Returns its id and the token the generation
    /// task must observe.
    pub fn begin_exchange(&self) -> (u64, CancellationToken) {
        let mut inner = self.lock();
        inner.exchange += 1;
        inner.state = ControllerState::Generating;
        inner.token = CancellationToken::new();
        debug!(exchange = inner.exchange, "exchange started");
        (inner.exchange, inner.token.clone())
    }

    /// Generation for `exchange` ended. With audio still pending the
    /// controller keeps the exchange open in the draining state, otherwise it
    /// settles immediately.
    pub fn generation_finished(&self, exchange: u64, audio_pending: bool) {
        let mut inner = self.lock();
        if inner.exchange != exchange {
            return;
        }
        if inner.state == ControllerState::Generating {
            inner.state = if audio_pending {
                ControllerState::InterruptedDraining
            } else {
                ControllerState::Idle
            };
        }
        if !audio_pending && inner.state == ControllerState::InterruptedDraining {
            inner.state = ControllerState::Idle;
        }
    }

    /// The exchange has fully settled: generation done and audio drained or
    /// discarded. Stale ids are ignored.
    pub fn settle(&self, exchange: u64) {
        let mut inner = self.lock();
        if inner.exchange == exchange && inner.state != ControllerState::Idle {
            debug!(exchange, from = %inner.state, "exchange settled");
            inner.state = ControllerState::Idle;
        }
    }

    /// Handle one interrupt signal.
    pub fn interrupt(&self) -> InterruptAction {
        let action = {
            let mut inner = self.lock();
            match inner.state {
                ControllerState::Generating => {
                    inner.token.cancel();
                    inner.state = ControllerState::InterruptedDraining;
                    InterruptAction::StopGeneration
                }
                ControllerState::InterruptedDraining => {
                    inner.token.cancel();
                    inner.state = ControllerState::Hushed;
                    InterruptAction::Hush
                }
                ControllerState::Idle | ControllerState::Hushed => InterruptAction::Absorbed,
            }
        };
        match action {
            InterruptAction::StopGeneration => info!("interrupt: generation stopped, audio draining"),
            InterruptAction::Hush => {
                let cleared = self.dispatcher.hush();
                info!(cleared, "interrupt: hushed");
            }
            InterruptAction::Absorbed => debug!("interrupt absorbed"),
        }
        action
    }

    /// Explicit hush (the `/hush` command): stop everything regardless of
    /// state. Returns the number of queued sentences discarded.
    pub fn hush(&self) -> usize {
        {
            let mut inner = self.lock();
            inner.token.cancel();
            if inner.state != ControllerState::Idle {
                inner.state = ControllerState::Hushed;
            }
        }
        self.dispatcher.hush()
    }
}

/// Wait for a generation task. Once `cancel` fires the task gets
/// `grace` to exit on its own before it is aborted.
pub async fn join_with_grace<T>(
    mut handle: JoinHandle<T>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Option<T> {
    tokio::select! {
        result = &mut handle => return result.ok(),
        _ = cancel.cancelled() => {}
    }
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(result) => result.ok(),
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "generation task ignored cancellation, aborting");
            handle.abort();
            None
        }
    }
}

/// Forward SIGINT (and SIGTERM on unix) as interrupt notifications until
/// `shutdown` fires.
pub fn spawn_signal_listener(tx: mpsc::UnboundedSender<()>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                None
            }
        };

        loop {
            #[cfg(unix)]
            let terminate = async {
                match term.as_mut() {
                    Some(signal) => {
                        if signal.recv().await.is_none() {
                            std::future::pending::<()>().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "cannot listen for Ctrl+C");
                        break;
                    }
                    debug!("received SIGINT");
                }
                _ = terminate => debug!("received SIGTERM"),
            }
            if tx.send(()).is_err() {
                break;
            }
        }
    })
}
