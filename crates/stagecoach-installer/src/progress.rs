use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stagecoach_core::{Notification, ProgressNotification};

/// Receives notifications emitted while an operation runs.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Drops everything; for callers that only want the final outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock().unwrap_or_else(|err| err.into_inner()))
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(notification);
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    started_at: Option<Instant>,
    last_emit: Option<Instant>,
    total: u64,
    fraction: f64,
}

/// Turns backend progress into rate-limited `Operation.Progress`
/// notifications with throughput and time-to-completion estimates.
/// Intermediate values may be dropped; completion is always reported.
pub struct ProgressBridge {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    state: Mutex<ProgressState>,
}

impl ProgressBridge {
    pub fn new(notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            notifier,
            interval,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn start(&self, total: u64) {
        let mut state = self.lock();
        *state = ProgressState {
            started_at: Some(Instant::now()),
            total,
            ..ProgressState::default()
        };
    }

    pub fn set_bytes(&self, done: u64) {
        let total = self.lock().total;
        if total == 0 {
            return;
        }
        self.set_fraction(done as f64 / total as f64);
    }

    pub fn set_fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let now = Instant::now();
        let notification = {
            let mut state = self.lock();
            let started_at = *state.started_at.get_or_insert(now);
            state.fraction = fraction;

            let due = match state.last_emit {
                None => true,
                Some(last) => now.duration_since(last) >= self.interval,
            };
            if !due && fraction < 1.0 {
                return;
            }
            state.last_emit = Some(now);

            let elapsed = now.duration_since(started_at).as_secs_f64();
            let bps = if elapsed > 0.0 {
                fraction * state.total as f64 / elapsed
            } else {
                0.0
            };
            let eta = if fraction > 0.0 && elapsed > 0.0 {
                elapsed * (1.0 - fraction) / fraction
            } else {
                0.0
            };
            ProgressNotification {
                progress: fraction,
                eta,
                bps,
            }
        };
        self.notifier.notify(Notification::Progress(notification));
    }

    pub fn end(&self) {
        *self.lock() = ProgressState::default();
    }

    pub fn fraction(&self) -> f64 {
        self.lock().fraction
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}
