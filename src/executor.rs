use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::model::{CheckDefinition, CheckId, CheckResult, KillSignal, LogStream, TimeoutOutcome};
use crate::sanitize::sanitize_chunk;
use crate::spawn::{ProcessEvent, ProcessKiller, Spawner};
use crate::state::SuiteStore;
use crate::terminal::OutputManager;

const FALLBACK_COLUMNS: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Passed,
    Failed,
    Aborted,
}

// Runs exactly one check to a terminal status. The run-wide token aborts the
// check optimistically: state flips to aborted as soon as the signal fires,
// the kill itself is best-effort.
pub fn run_check(
    store: &SuiteStore,
    spawner: &dyn Spawner,
    id: CheckId,
    definition: &CheckDefinition,
    cancel: &CancelToken,
) -> TerminalStatus {
    if cancel.is_canceled() {
        store.mark_aborted(id);
        return TerminalStatus::Aborted;
    }

    let aborted = Arc::new(AtomicBool::new(false));
    let killer_slot: Arc<Mutex<Option<Arc<ProcessKiller>>>> = Arc::new(Mutex::new(None));
    let listener = {
        let aborted = aborted.clone();
        let killer_slot = killer_slot.clone();
        let store = store.clone();
        cancel.on_cancel(move || {
            aborted.store(true, Ordering::SeqCst);
            if let Some(killer) = killer_slot.lock().expect("killer lock").as_ref() {
                killer.kill(KillSignal::Term);
            }
            store.mark_aborted(id);
        })
    };

    store.mark_running(id);

    let handle = match spawner.spawn(&definition.command, &definition.cwd) {
        Ok(handle) => handle,
        Err(error) => {
            let message = error.message().to_owned();
            debug!(check = %definition.name, %message, "spawn failed");
            store.append_stderr(id, &format!("{message}\n"));
            store.mark_failed(id, None, Some(message));
            cancel.remove_listener(listener);
            return TerminalStatus::Failed;
        }
    };

    let killer = handle.killer();
    {
        let mut slot = killer_slot.lock().expect("killer lock");
        *slot = Some(killer.clone());
    }
    // the token may have fired between registration and spawn completion
    if aborted.load(Ordering::SeqCst) {
        killer.kill(KillSignal::Term);
    }

    let mut output = handle.merged_output().then(|| {
        OutputManager::new(
            handle
                .size()
                .map(|(cols, _)| cols)
                .unwrap_or(FALLBACK_COLUMNS),
        )
    });

    let timeout = definition.timeout;
    let mut deadline = timeout.map(|spec| Instant::now() + Duration::from_millis(spec.ms));
    let mut timed_out = false;

    loop {
        let event = match deadline {
            Some(at) => match handle.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(spec) = timeout {
                        if !timed_out {
                            timed_out = true;
                            let signal = spec.signal.unwrap_or(KillSignal::Term);
                            debug!(
                                check = %definition.name,
                                ms = spec.ms,
                                signal = signal.name(),
                                "check timed out, signaling"
                            );
                            killer.kill(signal);
                            deadline = spec
                                .kill_after_ms
                                .map(|after| Instant::now() + Duration::from_millis(after));
                        } else {
                            killer.kill(KillSignal::Kill);
                            deadline = None;
                        }
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    fail_without_close(store, id);
                    break;
                }
            },
            None => match handle.recv() {
                Some(event) => event,
                None => {
                    fail_without_close(store, id);
                    break;
                }
            },
        };

        match event {
            ProcessEvent::Output { stream, chunk } => match output.as_mut() {
                Some(manager) => {
                    if let Some(rendered) = manager.append_chunk(chunk.as_bytes()) {
                        store.set_output(id, &rendered);
                    }
                }
                None => {
                    let text = sanitize_chunk(&chunk);
                    if text.is_empty() {
                        continue;
                    }
                    match stream {
                        LogStream::Stdout => store.append_stdout(id, &text),
                        LogStream::Stderr => store.append_stderr(id, &text),
                    };
                }
            },
            ProcessEvent::Error { message } => {
                store.append_stderr(id, &format!("{message}\n"));
                store.mark_failed(id, None, Some(message));
            }
            ProcessEvent::Exit { code, signal } => {
                if aborted.load(Ordering::SeqCst) || cancel.is_canceled() {
                    store.mark_aborted(id);
                } else if timed_out {
                    match timeout
                        .and_then(|spec| spec.on_timeout)
                        .unwrap_or(TimeoutOutcome::Failed)
                    {
                        TimeoutOutcome::Failed => {
                            let ms = timeout.map(|spec| spec.ms).unwrap_or_default();
                            let message = format!("timed out after {ms}ms");
                            store.append_stderr(id, &format!("{message}\n"));
                            store.mark_failed(id, code, Some(message));
                        }
                        TimeoutOutcome::Aborted => {
                            store.mark_aborted(id);
                        }
                    }
                } else if signal.is_some() {
                    store.mark_aborted(id);
                } else if code == Some(0) {
                    store.mark_passed(id, 0);
                } else {
                    store.mark_failed(id, code, None);
                }
                break;
            }
        }
    }

    if let Some(manager) = output.as_mut() {
        manager.dispose();
    }
    cancel.remove_listener(listener);

    match store.result(id) {
        Some(CheckResult::Passed { .. }) => TerminalStatus::Passed,
        Some(CheckResult::Aborted { .. }) => TerminalStatus::Aborted,
        _ => TerminalStatus::Failed,
    }
}

// The event channel closed before an exit event arrived. Failure paths keep
// the log attributable: the reason lands on stderr as well as in the result.
fn fail_without_close(store: &SuiteStore, id: CheckId) {
    let message = "process exited without a close event";
    store.append_stderr(id, &format!("{message}\n"));
    store.mark_failed(id, None, Some(message.to_owned()));
}

#[cfg(test)]
#[path = "tests/executor_tests.rs"]
mod tests;
