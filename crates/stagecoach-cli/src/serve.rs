use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use stagecoach_core::Notification;
use stagecoach_installer::{Notifier, UninstallStatus};
use stagecoach_operate::{OperationError, OperationOutcome, Operations, StartParams};

pub(crate) const METHOD_START: &str = "Operation.Start";
pub(crate) const METHOD_CANCEL: &str = "Operation.Cancel";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub(crate) struct Request {
    #[serde(default)]
    pub(crate) id: Option<u64>,
    pub(crate) method: String,
    #[serde(default)]
    pub(crate) params: Value,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ErrorBody {
    pub(crate) code: i64,
    pub(crate) message: String,
}

impl ErrorBody {
    fn from_operation(err: &OperationError) -> Self {
        Self {
            code: err.code().value(),
            message: err.to_string(),
        }
    }
}

/// One line written to the control channel.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub(crate) enum Outbound {
    Response {
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Notification {
        operation_id: String,
        notification: Notification,
    },
    Finished {
        operation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        outcome: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

impl Outbound {
    fn result(id: Option<u64>, result: Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<u64>, code: i64, message: String) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(ErrorBody { code, message }),
        }
    }

    fn finished(operation_id: String, result: Result<OperationOutcome, OperationError>) -> Self {
        match result {
            Ok(outcome) => Self::Finished {
                operation_id,
                outcome: Some(outcome_json(&outcome)),
                error: None,
            },
            Err(err) => Self::Finished {
                operation_id,
                outcome: None,
                error: Some(ErrorBody::from_operation(&err)),
            },
        }
    }
}

pub(crate) fn outcome_json(outcome: &OperationOutcome) -> Value {
    match outcome {
        OperationOutcome::Installed(installed) => json!({
            "operation": "install",
            "strategy": installed.strategy.as_str(),
            "patched": installed.patched,
            "receipt": installed.receipt,
            "removedGhosts": installed.removed_ghosts,
        }),
        OperationOutcome::Uninstalled(result) => json!({
            "operation": "uninstall",
            "status": match result.status {
                UninstallStatus::Uninstalled => "uninstalled",
                UninstallStatus::NotInstalled => "not-installed",
            },
            "removedFiles": result.removed_files,
        }),
    }
}

/// Serializes lines onto the channel. Writers on several operation threads
/// never interleave within a line.
pub(crate) struct JsonLines {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLines {
    pub(crate) fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub(crate) fn send(&self, message: &Outbound) {
        let mut out = self.out.lock().unwrap_or_else(|err| err.into_inner());
        let written = serde_json::to_writer(&mut *out, message)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                out.write_all(b"\n")?;
                out.flush()?;
                Ok(())
            });
        if let Err(err) = written {
            warn!(error = %format!("{err:#}"), "failed to write to control channel");
        }
    }
}

struct ChannelNotifier {
    operation_id: String,
    lines: Arc<JsonLines>,
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        self.lines.send(&Outbound::Notification {
            operation_id: self.operation_id.clone(),
            notification,
        });
    }
}

/// Reads requests line by line until the input closes, then aborts whatever
/// is still running and waits for every operation to report.
pub(crate) fn serve_session(
    operations: &Arc<Operations>,
    input: impl BufRead,
    lines: &Arc<JsonLines>,
) -> Result<()> {
    let mut waiters = Vec::new();
    for line in input.lines() {
        let line = line.context("failed to read control channel")?;
        if line.trim().is_empty() {
            continue;
        }
        debug!(line = %line, "control request");
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(operations, request, lines, &mut waiters),
            Err(err) => Outbound::error(None, PARSE_ERROR, format!("malformed request: {err}")),
        };
        lines.send(&response);
    }

    let aborted = operations.abort_all();
    if aborted > 0 {
        info!(count = aborted, "control channel closed, aborting live operations");
    }
    for waiter in waiters {
        if waiter.join().is_err() {
            warn!("operation waiter panicked");
        }
    }
    Ok(())
}

fn handle_request(
    operations: &Arc<Operations>,
    request: Request,
    lines: &Arc<JsonLines>,
    waiters: &mut Vec<JoinHandle<()>>,
) -> Outbound {
    match request.method.as_str() {
        METHOD_START => {
            let params: StartParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(err) => {
                    return Outbound::error(
                        request.id,
                        INVALID_PARAMS,
                        format!("invalid start parameters: {err}"),
                    )
                }
            };
            let operation_id = params.id.clone();
            let notifier = Arc::new(ChannelNotifier {
                operation_id: operation_id.clone(),
                lines: Arc::clone(lines),
            });
            if let Err(err) = operations.start(params, notifier) {
                let body = ErrorBody::from_operation(&err);
                return Outbound::Response {
                    id: request.id,
                    result: None,
                    error: Some(body),
                };
            }
            waiters.push(spawn_waiter(operations, operation_id.clone(), lines));
            Outbound::result(request.id, json!({ "started": operation_id }))
        }
        METHOD_CANCEL => match serde_json::from_value::<CancelParams>(request.params) {
            Ok(params) => {
                let cancelled = operations.cancel(&params.id);
                Outbound::result(request.id, json!({ "cancelled": cancelled }))
            }
            Err(err) => Outbound::error(
                request.id,
                INVALID_PARAMS,
                format!("invalid cancel parameters: {err}"),
            ),
        },
        other => Outbound::error(
            request.id,
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        ),
    }
}

fn spawn_waiter(
    operations: &Arc<Operations>,
    operation_id: String,
    lines: &Arc<JsonLines>,
) -> JoinHandle<()> {
    let operations = Arc::clone(operations);
    let lines = Arc::clone(lines);
    thread::spawn(move || {
        if let Some(result) = operations.wait(&operation_id) {
            lines.send(&Outbound::finished(operation_id, result));
        }
    })
}
