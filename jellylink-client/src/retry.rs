//! Countdown-and-reattempt loop run after a temporary connection failure.
//!
//! One cycle walks `Waiting -> Probing` until the server validates, rejects
//! permanently, or the user aborts. Each wait can be cut short in two ways:
//! `interrupt` skips straight to probing, `abort` ends the cycle without
//! probing or navigating. Temporary failures loop back into `Waiting`
//! instead of recursing, so a long outage costs no stack.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use jellylink_core::{CandidateEndpoint, ValidationResult};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    navigation::{Destination, Navigator},
    orchestrator::Validator,
};

pub const REJECTED_PREFIX: &str =
    "Could not connect to the Jellyfin server as it returned an error: ";

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    Waiting,
    Probing,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub interval_total: u64,
    pub seconds_remaining: u64,
    pub phase: RetryPhase,
    pub message: String,
}

impl RetryState {
    fn idle() -> Self {
        Self {
            interval_total: 0,
            seconds_remaining: 0,
            phase: RetryPhase::Idle,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Connected(Url),
    Rejected(String),
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Tick { remaining: u64, message: String },
    Probing { message: String },
    Finished(RetryOutcome),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("a retry cycle is already active")]
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Natural,
    Interrupt,
    Abort,
}

/// Both cancellation triggers of one wait, observed together.
struct CancelContext {
    abort: CancellationToken,
    interrupt: CancellationToken,
}

impl CancelContext {
    async fn sleep(&self, duration: Duration) -> StopReason {
        tokio::select! {
            biased;
            () = self.abort.cancelled() => StopReason::Abort,
            () = self.interrupt.cancelled() => StopReason::Interrupt,
            () = tokio::time::sleep(duration) => StopReason::Natural,
        }
    }
}

struct Shared {
    abort: CancellationToken,
    /// Replaced on every entry into `Waiting`; the lock also orders phase changes
    /// against `interrupt` so a probe can never be interrupted.
    interrupt: Mutex<CancellationToken>,
    state: watch::Sender<RetryState>,
}

impl Shared {
    fn interrupt(&self) -> bool {
        let token = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.borrow().phase != RetryPhase::Waiting {
            return false;
        }
        token.cancel();
        true
    }
}

/// Cloneable remote for a running cycle.
#[derive(Clone)]
pub struct RetryController {
    shared: Arc<Shared>,
}

impl RetryController {
    /// Skips the rest of the countdown. Returns `false` unless waiting.
    pub fn interrupt(&self) -> bool {
        self.shared.interrupt()
    }

    pub fn abort(&self) {
        self.shared.abort.cancel();
    }

    #[must_use]
    pub fn can_interrupt(&self) -> bool {
        self.shared.state.borrow().phase == RetryPhase::Waiting
    }
}

pub struct RetryHandle {
    controller: RetryController,
    state: watch::Receiver<RetryState>,
    events: mpsc::UnboundedReceiver<RetryEvent>,
    task: JoinHandle<RetryOutcome>,
}

impl RetryHandle {
    pub fn interrupt(&self) -> bool {
        self.controller.interrupt()
    }

    pub fn abort(&self) {
        self.controller.abort();
    }

    pub fn controller(&self) -> RetryController {
        self.controller.clone()
    }

    pub fn state(&self) -> watch::Receiver<RetryState> {
        self.state.clone()
    }

    pub async fn next_event(&mut self) -> Option<RetryEvent> {
        self.events.recv().await
    }

    pub async fn join(self) -> RetryOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("retry cycle task failed: {err}");
                RetryOutcome::Aborted
            }
        }
    }
}

pub struct RetryScheduler {
    validator: Arc<Validator>,
    navigator: Arc<dyn Navigator>,
    candidates: Arc<[CandidateEndpoint]>,
    address: String,
    default_interval: Duration,
    active: Arc<AtomicBool>,
}

impl RetryScheduler {
    pub fn new(
        validator: Arc<Validator>,
        navigator: Arc<dyn Navigator>,
        candidates: Vec<CandidateEndpoint>,
        address: impl Into<String>,
        default_interval: Duration,
    ) -> Self {
        Self {
            validator,
            navigator,
            candidates: candidates.into(),
            address: address.into(),
            default_interval,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Starts a cycle, waiting `interval` (or the default) before the first probe.
    ///
    /// Only one cycle may run at a time; a second call is rejected.
    pub fn begin(&self, interval: Option<Duration>) -> Result<RetryHandle, RetryError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("retry cycle already active; ignoring new request");
            return Err(RetryError::AlreadyActive);
        }
        let guard = ActiveGuard(Arc::clone(&self.active));

        let (state_tx, state_rx) = watch::channel(RetryState::idle());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            abort: CancellationToken::new(),
            interrupt: Mutex::new(CancellationToken::new()),
            state: state_tx,
        });

        let cycle = Cycle {
            validator: Arc::clone(&self.validator),
            navigator: Arc::clone(&self.navigator),
            candidates: Arc::clone(&self.candidates),
            address: self.address.clone(),
            default_interval: self.default_interval,
            shared: Arc::clone(&shared),
            events: events_tx,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            cycle.run(interval).await
        });

        Ok(RetryHandle {
            controller: RetryController { shared },
            state: state_rx,
            events: events_rx,
            task,
        })
    }
}

struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Cycle {
    validator: Arc<Validator>,
    navigator: Arc<dyn Navigator>,
    candidates: Arc<[CandidateEndpoint]>,
    address: String,
    default_interval: Duration,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<RetryEvent>,
}

impl Cycle {
    async fn run(self, first_interval: Option<Duration>) -> RetryOutcome {
        let mut interval = first_interval.unwrap_or(self.default_interval);
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            let reason = self.countdown(interval).await;
            info!(attempt, ?reason, "retry wait finished");
            if reason == StopReason::Abort {
                break RetryOutcome::Aborted;
            }

            self.enter_probing();
            let result = tokio::select! {
                biased;
                () = self.shared.abort.cancelled() => None,
                result = self.validator.validate(&self.candidates) => Some(result),
            };
            let Some(result) = result else {
                break RetryOutcome::Aborted;
            };

            match result {
                ValidationResult::Valid(server) => {
                    self.navigator.navigate(Destination::Main);
                    break RetryOutcome::Connected(server.resolved_uri);
                }
                ValidationResult::Failed(err) if err.is_temporary() => {
                    interval = err.retry_after().unwrap_or(self.default_interval);
                    info!(attempt, next_in = ?interval, "still unreachable: {err}");
                }
                ValidationResult::Failed(err) => {
                    let message = format!("{REJECTED_PREFIX}{err}");
                    self.navigator.navigate(Destination::Onboarding {
                        error_message: Some(message.clone()),
                    });
                    break RetryOutcome::Rejected(message);
                }
            }
        };

        self.finish(&outcome);
        outcome
    }

    /// Counts down one tick per second from the interval to zero.
    async fn countdown(&self, interval: Duration) -> StopReason {
        let total = interval.as_secs();
        let cancel = CancelContext {
            abort: self.shared.abort.clone(),
            interrupt: self.enter_waiting(total),
        };

        for remaining in (0..=total).rev() {
            let message = countdown_message(remaining);
            self.shared.state.send_modify(|state| {
                state.seconds_remaining = remaining;
                state.message = message.clone();
            });
            self.emit(RetryEvent::Tick { remaining, message });
            if remaining == 0 {
                break;
            }

            match cancel.sleep(TICK).await {
                StopReason::Natural => {}
                stopped => return stopped,
            }
        }

        if cancel.abort.is_cancelled() {
            StopReason::Abort
        } else {
            StopReason::Natural
        }
    }

    fn enter_waiting(&self, total: u64) -> CancellationToken {
        let mut slot = self
            .shared
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = CancellationToken::new();
        self.shared.state.send_modify(|state| {
            state.phase = RetryPhase::Waiting;
            state.interval_total = total;
            state.seconds_remaining = total;
        });
        slot.clone()
    }

    fn enter_probing(&self) {
        let message = format!("Retrying now to connect to \"{}\" ...", self.address);
        {
            let _slot = self
                .shared
                .interrupt
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.state.send_modify(|state| {
                state.phase = RetryPhase::Probing;
                state.seconds_remaining = 0;
                state.message = message.clone();
            });
        }
        self.emit(RetryEvent::Probing { message });
    }

    fn finish(&self, outcome: &RetryOutcome) {
        let phase = match outcome {
            RetryOutcome::Aborted => RetryPhase::Aborted,
            RetryOutcome::Connected(_) | RetryOutcome::Rejected(_) => RetryPhase::Idle,
        };
        self.shared.state.send_modify(|state| state.phase = phase);
        info!(?outcome, "retry cycle finished");
        self.emit(RetryEvent::Finished(outcome.clone()));
    }

    fn emit(&self, event: RetryEvent) {
        // The handle may already be gone; the cycle still runs to completion.
        let _ = self.events.send(event);
    }
}

pub fn countdown_message(remaining: u64) -> String {
    let plural = if remaining == 1 { "" } else { "s" };
    format!("Retrying in {remaining} second{plural} ...")
}
