use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::model::{
    combine_summaries, CheckDefinition, CheckId, CheckResult, LogEntry, LogStream,
    ProjectDefinition, Summary,
};

type ChangeListener = Arc<dyn Fn() + Send + Sync>;

// The one structure mutated from many check executors at once. Mutators
// return whether they applied; everything is a no-op once a check reaches a
// terminal result. Listeners fire synchronously after each applied mutation,
// outside the state lock.
#[derive(Clone)]
pub struct SuiteStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    started_at_ms: u64,
    state: Mutex<SuiteData>,
    completion: Condvar,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_listener_id: AtomicU64,
}

struct SuiteData {
    projects: Vec<ProjectData>,
}

struct ProjectData {
    project: String,
    path: PathBuf,
    color: String,
    checks: Vec<CheckData>,
}

struct CheckData {
    definition: CheckDefinition,
    started_at_ms: Option<u64>,
    result: CheckResult,
    log: Vec<LogEntry>,
    rendered: Option<String>,
}

pub struct Subscription {
    store: SuiteStore,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.store
            .inner
            .listeners
            .lock()
            .expect("listener lock")
            .retain(|(id, _)| *id != self.id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSnapshot {
    pub projects: Vec<ProjectSnapshot>,
    pub summary: Summary,
    #[serde(rename = "isComplete")]
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSnapshot {
    pub project: String,
    pub path: PathBuf,
    pub color: String,
    pub checks: Vec<CheckSnapshot>,
    pub summary: Summary,
    #[serde(rename = "isComplete")]
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSnapshot {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    #[serde(rename = "startedAt")]
    pub started_at: Option<u64>,
    pub log: Vec<LogEntry>,
    pub result: CheckResult,
}

impl SuiteStore {
    pub fn new(projects: Vec<ProjectDefinition>) -> Self {
        let projects = projects
            .into_iter()
            .map(|project| ProjectData {
                project: project.project,
                path: project.path,
                color: project.color,
                checks: project
                    .checks
                    .into_iter()
                    .map(|definition| CheckData {
                        definition,
                        started_at_ms: None,
                        result: CheckResult::Pending,
                        log: Vec::new(),
                        rendered: None,
                    })
                    .collect(),
            })
            .collect();
        Self {
            inner: Arc::new(StoreInner {
                started_at_ms: now_ms(),
                state: Mutex::new(SuiteData { projects }),
                completion: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn started_at_ms(&self) -> u64 {
        self.inner.started_at_ms
    }

    pub fn definitions(&self) -> Vec<(CheckId, CheckDefinition)> {
        let state = self.inner.state.lock().expect("state lock");
        let mut out = Vec::new();
        for (project, data) in state.projects.iter().enumerate() {
            for (check, check_data) in data.checks.iter().enumerate() {
                out.push((CheckId { project, check }, check_data.definition.clone()));
            }
        }
        out
    }

    pub fn result(&self, id: CheckId) -> Option<CheckResult> {
        let state = self.inner.state.lock().expect("state lock");
        state.check(id).map(|check| check.result.clone())
    }

    pub fn mark_running(&self, id: CheckId) -> bool {
        self.mutate(id, |check, now| {
            if !matches!(check.result, CheckResult::Pending) {
                return false;
            }
            check.started_at_ms = Some(now);
            check.result = CheckResult::Running;
            true
        })
    }

    pub fn mark_passed(&self, id: CheckId, exit_code: i32) -> bool {
        self.mutate(id, |check, now| {
            if check.result.is_terminal() {
                return false;
            }
            check.result = CheckResult::Passed {
                finished_at_ms: now,
                exit_code,
            };
            true
        })
    }

    pub fn mark_failed(
        &self,
        id: CheckId,
        exit_code: Option<i32>,
        error_message: Option<String>,
    ) -> bool {
        self.mutate(id, |check, now| {
            if check.result.is_terminal() {
                return false;
            }
            check.result = CheckResult::Failed {
                finished_at_ms: now,
                exit_code,
                error_message,
            };
            true
        })
    }

    pub fn mark_aborted(&self, id: CheckId) -> bool {
        self.mutate(id, |check, now| {
            if check.result.is_terminal() {
                return false;
            }
            check.result = CheckResult::Aborted {
                finished_at_ms: now,
            };
            true
        })
    }

    pub fn append_stdout(&self, id: CheckId, text: &str) -> bool {
        self.append_log(id, LogStream::Stdout, text)
    }

    pub fn append_stderr(&self, id: CheckId, text: &str) -> bool {
        self.append_log(id, LogStream::Stderr, text)
    }

    fn append_log(&self, id: CheckId, stream: LogStream, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let text = text.to_owned();
        self.mutate(id, move |check, _| {
            if check.result.is_terminal() {
                return false;
            }
            check.log.push(LogEntry { stream, text });
            true
        })
    }

    // Full-screen replacement used by PTY-backed checks; identical renders
    // are dropped so subscribers do not churn on no-op redraws.
    pub fn set_output(&self, id: CheckId, rendered: &str) -> bool {
        self.mutate(id, |check, _| {
            if check.result.is_terminal() {
                return false;
            }
            if check.rendered.as_deref() == Some(rendered) {
                return false;
            }
            check.rendered = Some(rendered.to_owned());
            true
        })
    }

    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .push((id, Arc::new(listener)));
        Subscription {
            store: self.clone(),
            id,
        }
    }

    pub fn summary(&self) -> Summary {
        let state = self.inner.state.lock().expect("state lock");
        let summaries = state
            .projects
            .iter()
            .map(|project| project_summary(project, self.inner.started_at_ms))
            .collect::<Vec<Summary>>();
        combine_summaries(&summaries)
    }

    pub fn project_summary(&self, project: usize) -> Option<Summary> {
        let state = self.inner.state.lock().expect("state lock");
        state
            .projects
            .get(project)
            .map(|project| project_summary(project, self.inner.started_at_ms))
    }

    pub fn is_complete(&self) -> bool {
        let state = self.inner.state.lock().expect("state lock");
        state.all_terminal()
    }

    pub fn snapshot(&self) -> SuiteSnapshot {
        let state = self.inner.state.lock().expect("state lock");
        let projects = state
            .projects
            .iter()
            .map(|project| ProjectSnapshot {
                project: project.project.clone(),
                path: project.path.clone(),
                color: project.color.clone(),
                checks: project.checks.iter().map(check_snapshot).collect(),
                summary: project_summary(project, self.inner.started_at_ms),
                is_complete: project
                    .checks
                    .iter()
                    .all(|check| check.result.is_terminal()),
            })
            .collect::<Vec<ProjectSnapshot>>();
        let summaries = projects
            .iter()
            .map(|project| project.summary)
            .collect::<Vec<Summary>>();
        SuiteSnapshot {
            summary: combine_summaries(&summaries),
            is_complete: state.all_terminal(),
            projects,
        }
    }

    pub fn wait_for_completion(&self) {
        let mut state = self.inner.state.lock().expect("state lock");
        while !state.all_terminal() {
            state = self.inner.completion.wait(state).expect("state lock");
        }
    }

    pub fn wait_for_project(&self, project: usize) {
        let mut state = self.inner.state.lock().expect("state lock");
        loop {
            let complete = state
                .projects
                .get(project)
                .map(|data| data.checks.iter().all(|check| check.result.is_terminal()))
                .unwrap_or(true);
            if complete {
                return;
            }
            state = self.inner.completion.wait(state).expect("state lock");
        }
    }

    pub fn wait_for_check(&self, id: CheckId) {
        let mut state = self.inner.state.lock().expect("state lock");
        loop {
            let terminal = state
                .check(id)
                .map(|check| check.result.is_terminal())
                .unwrap_or(true);
            if terminal {
                return;
            }
            state = self.inner.completion.wait(state).expect("state lock");
        }
    }

    fn mutate<F>(&self, id: CheckId, apply: F) -> bool
    where
        F: FnOnce(&mut CheckData, u64) -> bool,
    {
        let applied = {
            let mut state = self.inner.state.lock().expect("state lock");
            let Some(check) = state.check_mut(id) else {
                return false;
            };
            apply(check, now_ms())
        };
        if applied {
            self.inner.completion.notify_all();
            self.notify();
        }
        applied
    }

    fn notify(&self) {
        let listeners = {
            self.inner
                .listeners
                .lock()
                .expect("listener lock")
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect::<Vec<ChangeListener>>()
        };
        for listener in listeners {
            listener();
        }
    }
}

impl SuiteData {
    fn check(&self, id: CheckId) -> Option<&CheckData> {
        self.projects.get(id.project)?.checks.get(id.check)
    }

    fn check_mut(&mut self, id: CheckId) -> Option<&mut CheckData> {
        self.projects.get_mut(id.project)?.checks.get_mut(id.check)
    }

    fn all_terminal(&self) -> bool {
        self.projects
            .iter()
            .all(|project| project.checks.iter().all(|check| check.result.is_terminal()))
    }
}

fn project_summary(project: &ProjectData, suite_started_at_ms: u64) -> Summary {
    let mut summary = Summary {
        total: project.checks.len(),
        ..Summary::default()
    };
    for check in &project.checks {
        match &check.result {
            CheckResult::Passed { .. } => summary.passed += 1,
            CheckResult::Failed { .. } => summary.failed += 1,
            CheckResult::Aborted { .. } => summary.aborted += 1,
            CheckResult::Pending | CheckResult::Running => {}
        }
        if let Some(finished) = check.result.finished_at_ms() {
            summary.duration_ms = summary
                .duration_ms
                .max(finished.saturating_sub(suite_started_at_ms));
        }
    }
    summary
}

fn check_snapshot(check: &CheckData) -> CheckSnapshot {
    let log = match check.rendered.as_ref() {
        Some(rendered) => vec![LogEntry {
            stream: LogStream::Stdout,
            text: rendered.clone(),
        }],
        None => check.log.clone(),
    };
    CheckSnapshot {
        name: check.definition.name.clone(),
        command: check.definition.command.clone(),
        cwd: check.definition.cwd.clone(),
        started_at: check.started_at_ms,
        log,
        result: check.result.clone(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
