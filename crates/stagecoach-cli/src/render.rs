use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use stagecoach_core::{Notification, Receipt, TaskStartedNotification, TaskType};
use stagecoach_installer::{Notifier, UninstallStatus};
use stagecoach_operate::{InstallOutcome, OperationOutcome};

/// Progress bars track fractions in thousandths.
const PROGRESS_SCALE: u64 = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERR]",
        "step" => "[..]",
        _ => "[--]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn task_label(task_type: TaskType) -> &'static str {
    task_type.as_str()
}

fn progress_tick_chars(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Download => ".oO@* ",
        TaskType::Install => "-=~* ",
        TaskType::Update => "<^>v ",
        TaskType::Heal => ".:;* ",
        TaskType::Uninstall => "\\|/- ",
    }
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn format_task_started_line(
    style: OutputStyle,
    started: &TaskStartedNotification,
) -> String {
    let mut message = format!("{} started", task_label(started.task_type));
    if let Some(upload) = &started.upload {
        message.push_str(&format!(" for {}", upload.label()));
    }
    if let Some(build) = &started.build {
        message.push_str(&format!(" ({})", build.label()));
    }
    if started.total_size > 0 {
        message.push_str(&format!(", {}", HumanBytes(started.total_size)));
    }
    render_status_line(style, "step", &message)
}

pub(crate) fn format_receipt_lines(receipt: &Receipt, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(game) = &receipt.game {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("game: {} (#{})", game.title, game.id),
        ));
    }
    let upload = receipt
        .upload
        .as_ref()
        .map(|upload| upload.label())
        .unwrap_or_else(|| "unknown".to_string());
    lines.push(render_status_line(style, "step", &format!("upload: {upload}")));
    let build = receipt
        .build
        .as_ref()
        .map(|build| build.label())
        .unwrap_or_else(|| "none".to_string());
    lines.push(render_status_line(style, "step", &format!("build: {build}")));
    lines.push(render_status_line(
        style,
        "step",
        &format!("installer: {}", receipt.installer_name),
    ));
    lines.push(render_status_line(
        style,
        "step",
        &format!("files: {}", receipt.files.len()),
    ));
    lines
}

fn format_install_outcome_lines(outcome: &InstallOutcome, style: OutputStyle) -> Vec<String> {
    let how = if outcome.patched {
        "patched".to_string()
    } else {
        outcome.strategy.as_str().to_string()
    };
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "installed {} file(s) via {how}",
            outcome.receipt.files.len()
        ),
    )];
    if !outcome.removed_ghosts.is_empty() {
        lines.push(render_status_line(
            style,
            "step",
            &format!("removed {} stale file(s)", outcome.removed_ghosts.len()),
        ));
    }
    lines
}

pub(crate) fn format_outcome_lines(outcome: &OperationOutcome, style: OutputStyle) -> Vec<String> {
    match outcome {
        OperationOutcome::Installed(installed) => format_install_outcome_lines(installed, style),
        OperationOutcome::Uninstalled(result) => match result.status {
            UninstallStatus::Uninstalled => vec![render_status_line(
                style,
                "ok",
                &format!("uninstalled {} file(s)", result.removed_files.len()),
            )],
            UninstallStatus::NotInstalled => vec![render_status_line(
                style,
                "warn",
                "nothing installed there, nothing removed",
            )],
        },
    }
}

/// Renders task notifications on the terminal while a one-shot operation
/// runs. Rich output gets one progress bar per task.
pub(crate) struct TerminalNotifier {
    style: OutputStyle,
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalNotifier {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self {
            style,
            bar: Mutex::new(None),
        }
    }

    fn start_bar(&self, task_type: TaskType) -> Option<ProgressBar> {
        if self.style != OutputStyle::Rich {
            return None;
        }
        let bar = ProgressBar::new(PROGRESS_SCALE);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<10} [{bar:24.cyan/blue}] {percent:>3}% {elapsed_precise}",
        ) {
            bar.set_style(
                style
                    .tick_chars(progress_tick_chars(task_type))
                    .progress_chars("=>-"),
            );
        }
        bar.set_message(colorize(label_style(), task_label(task_type)));
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    }

    fn clear_bar(&self) {
        let mut slot = self.bar.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(bar) = slot.take() {
            bar.finish_and_clear();
        }
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::TaskStarted(started) => {
                self.clear_bar();
                println!("{}", format_task_started_line(self.style, &started));
                let bar = self.start_bar(started.task_type);
                *self.bar.lock().unwrap_or_else(|err| err.into_inner()) = bar;
            }
            Notification::Progress(progress) => {
                let slot = self.bar.lock().unwrap_or_else(|err| err.into_inner());
                if let Some(bar) = slot.as_ref() {
                    let fraction = progress.progress.clamp(0.0, 1.0);
                    bar.set_position((fraction * PROGRESS_SCALE as f64) as u64);
                }
            }
            Notification::TaskSucceeded(succeeded) => {
                self.clear_bar();
                println!(
                    "{}",
                    render_status_line(
                        self.style,
                        "ok",
                        &format!("{} done", task_label(succeeded.task_type)),
                    )
                );
            }
        }
    }
}

impl Drop for TerminalNotifier {
    fn drop(&mut self) {
        self.clear_bar();
    }
}
