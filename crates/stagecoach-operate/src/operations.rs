use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use stagecoach_installer::{CancelToken, Notifier};

use crate::engine::{Engine, OperationOutcome};
use crate::error::OperationError;
use crate::params::StartParams;

type OperationResult = Result<OperationOutcome, OperationError>;

struct Running {
    cancel: CancelToken,
    aborted: Arc<AtomicBool>,
    /// Set once the engine has returned on the operation's thread.
    finished: Arc<AtomicBool>,
    /// `None` while a synchronous `run` owns the operation or a waiter has
    /// taken the handle to join it.
    handle: Option<JoinHandle<OperationResult>>,
}

impl Running {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }
}

/// Flags the operation finished when its thread leaves the engine, panics
/// included.
struct FinishedOnDrop(Arc<AtomicBool>);

impl Drop for FinishedOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Live operations keyed by id. At most one operation runs per id; a second
/// start for a live id is refused rather than queued.
pub struct Operations {
    engine: Arc<Engine>,
    running: Mutex<HashMap<String, Running>>,
}

impl Operations {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Running>> {
        self.running.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Spawns the operation on its own thread and returns once it is
    /// registered.
    pub fn start(
        &self,
        params: StartParams,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(), OperationError> {
        params.validate()?;
        let mut running = self.lock();
        if let Some(existing) = running.get(&params.id) {
            if existing.is_live() {
                return Err(OperationError::AlreadyRunning {
                    id: params.id.clone(),
                });
            }
            warn!(operation = %params.id, "replacing a finished operation nobody waited for");
        }

        let cancel = CancelToken::new();
        let aborted = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let id = params.id.clone();
        let handle = {
            let engine = Arc::clone(&self.engine);
            let cancel = cancel.clone();
            let aborted = Arc::clone(&aborted);
            let finished = FinishedOnDrop(Arc::clone(&finished));
            thread::Builder::new()
                .name(format!("operation-{id}"))
                .spawn(move || {
                    let _finished = finished;
                    let result = engine.run(&params, cancel, notifier);
                    mark_aborted(result, &aborted)
                })
                .map_err(|err| OperationError::Failed {
                    step: "start",
                    source: anyhow::Error::new(err).context("failed to spawn operation thread"),
                })?
        };

        info!(operation = %id, "operation started");
        running.insert(
            id,
            Running {
                cancel,
                aborted,
                finished,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Runs the operation on the calling thread under the same one-per-id
    /// rule as `start`.
    pub fn run(&self, params: StartParams, notifier: Arc<dyn Notifier>) -> OperationResult {
        params.validate()?;
        let cancel = CancelToken::new();
        let aborted = Arc::new(AtomicBool::new(false));
        {
            let mut running = self.lock();
            if running.get(&params.id).is_some_and(Running::is_live) {
                return Err(OperationError::AlreadyRunning {
                    id: params.id.clone(),
                });
            }
            running.insert(
                params.id.clone(),
                Running {
                    cancel: cancel.clone(),
                    aborted: Arc::clone(&aborted),
                    finished: Arc::new(AtomicBool::new(false)),
                    handle: None,
                },
            );
        }

        let _registration = Registration {
            operations: self,
            id: &params.id,
        };
        let result = self.engine.run(&params, cancel, notifier);
        mark_aborted(result, &aborted)
    }

    /// Requests cancellation. Returns whether a live operation had that id.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(running) if running.is_live() => {
                info!(operation = %id, "cancelling operation");
                running.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Like `cancel`, but the operation ends as aborted rather than cancelled.
    pub fn abort(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(running) if running.is_live() => {
                info!(operation = %id, "aborting operation");
                running.aborted.store(true, Ordering::SeqCst);
                running.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn abort_all(&self) -> usize {
        let running = self.lock();
        let mut count = 0;
        for (id, entry) in running.iter().filter(|(_, entry)| entry.is_live()) {
            info!(operation = %id, "aborting operation");
            entry.aborted.store(true, Ordering::SeqCst);
            entry.cancel.cancel();
            count += 1;
        }
        count
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().get(id).is_some_and(Running::is_live)
    }

    /// Joins an operation spawned by `start` and returns its outcome. `None`
    /// when no such operation was started, or another caller is already
    /// waiting for it. The operation stays registered, and so cancellable,
    /// until its thread has been joined.
    pub fn wait(&self, id: &str) -> Option<OperationResult> {
        let (handle, finished) = {
            let mut running = self.lock();
            let entry = running.get_mut(id)?;
            let handle = entry.handle.take()?;
            (handle, Arc::clone(&entry.finished))
        };
        let result = handle.join().unwrap_or_else(|_| {
            Err(OperationError::Failed {
                step: "run",
                source: anyhow!("operation thread panicked"),
            })
        });

        let mut running = self.lock();
        if running
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.finished, &finished))
        {
            running.remove(id);
        }
        Some(result)
    }

    /// Ids of operations still registered.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.lock().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

/// Removes a synchronous run's entry when it ends, panics included.
struct Registration<'a> {
    operations: &'a Operations,
    id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.operations.lock().remove(self.id);
    }
}

fn mark_aborted(result: OperationResult, aborted: &AtomicBool) -> OperationResult {
    match result {
        Err(OperationError::Cancelled { step }) if aborted.load(Ordering::SeqCst) => {
            info!(%step, "operation aborted");
            Err(OperationError::Aborted)
        }
        other => other,
    }
}
