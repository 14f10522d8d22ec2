use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use vigil::{
    CancelToken, CheckDefinition, CheckResult, Concurrency, PipeSpawner, ProjectDefinition,
    RunOutcome, Scheduler, SchedulerConfig, SuiteStore,
};

fn temp_workspace(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("vigil-sched-{name}-{ts}"));
    fs::create_dir_all(&root).expect("mkdir workspace");
    root
}

fn project(root: &PathBuf, checks: &[(&str, &str)]) -> ProjectDefinition {
    ProjectDefinition {
        project: "demo".to_owned(),
        path: root.clone(),
        color: "cyan".to_owned(),
        checks: checks
            .iter()
            .map(|(name, command)| CheckDefinition {
                name: (*name).to_owned(),
                command: (*command).to_owned(),
                cwd: root.clone(),
                timeout: None,
            })
            .collect(),
    }
}

fn run_suite(
    store: &SuiteStore,
    concurrency: Concurrency,
    fail_fast: bool,
    parent: Option<&CancelToken>,
) -> RunOutcome {
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(PipeSpawner),
        SchedulerConfig {
            concurrency,
            fail_fast,
        },
        parent,
    );
    scheduler.run()
}

fn result_of(store: &SuiteStore, check: usize) -> CheckResult {
    store.snapshot().projects[0].checks[check].result.clone()
}

#[test]
fn all_passing_checks_yield_exit_code_zero() {
    let root = temp_workspace("passing");
    let store = SuiteStore::new(vec![project(
        &root,
        &[("a", "printf a-ok"), ("b", "printf b-ok")],
    )]);
    let outcome = run_suite(&store, Concurrency::Unbounded, false, None);
    assert_eq!(outcome, RunOutcome::Passed);
    assert_eq!(outcome.exit_code(), 0);
    assert!(store.is_complete());
    let summary = store.summary();
    assert_eq!((summary.total, summary.passed), (2, 2));
    store.wait_for_completion();
}

#[test]
fn failing_check_yields_exit_code_two_and_keeps_stderr() {
    let root = temp_workspace("failing");
    let store = SuiteStore::new(vec![project(
        &root,
        &[("bad", "printf broken 1>&2; exit 4")],
    )]);
    let outcome = run_suite(&store, Concurrency::default(), false, None);
    assert_eq!(outcome, RunOutcome::Failed);
    assert_eq!(outcome.exit_code(), 2);
    match result_of(&store, 0) {
        CheckResult::Failed {
            exit_code,
            error_message,
            ..
        } => {
            assert_eq!(exit_code, Some(4));
            assert_eq!(error_message, None);
        }
        other => panic!("expected failed result, got {other:?}"),
    }
    let log = &store.snapshot().projects[0].checks[0].log;
    assert!(log.iter().any(|entry| entry.text.contains("broken")));
}

#[test]
fn fail_fast_aborts_running_sibling() {
    let root = temp_workspace("fail-fast");
    let store = SuiteStore::new(vec![project(
        &root,
        &[("fails", "sleep 0.1; exit 1"), ("slow", "sleep 30")],
    )]);
    let started = Instant::now();
    let outcome = run_suite(&store, Concurrency::Bounded(2), true, None);
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "fail-fast did not cut the slow sibling short"
    );
    assert_eq!(outcome, RunOutcome::Failed);
    assert!(matches!(result_of(&store, 0), CheckResult::Failed { .. }));
    assert!(matches!(result_of(&store, 1), CheckResult::Aborted { .. }));
}

#[test]
fn failed_check_is_not_downgraded_by_the_cascade() {
    let root = temp_workspace("no-downgrade");
    let store = SuiteStore::new(vec![project(
        &root,
        &[("first", "exit 1"), ("second", "exit 1")],
    )]);
    let outcome = run_suite(&store, Concurrency::Bounded(1), true, None);
    assert_eq!(outcome, RunOutcome::Failed);
    assert!(matches!(result_of(&store, 0), CheckResult::Failed { .. }));
    // queued after the cascade fired: aborted without spawning
    assert!(matches!(result_of(&store, 1), CheckResult::Aborted { .. }));
}

#[test]
fn concurrency_bound_holds_under_load() {
    let root = temp_workspace("bounded");
    let log = root.join("events.log");
    let command = format!(
        "printf 'start\\n' >> {log}; sleep 0.3; printf 'end\\n' >> {log}",
        log = log.display()
    );
    let checks = (0..4)
        .map(|i| (format!("c{i}"), command.clone()))
        .collect::<Vec<(String, String)>>();
    let store = SuiteStore::new(vec![ProjectDefinition {
        project: "demo".to_owned(),
        path: root.clone(),
        color: "cyan".to_owned(),
        checks: checks
            .iter()
            .map(|(name, command)| CheckDefinition {
                name: name.clone(),
                command: command.clone(),
                cwd: root.clone(),
                timeout: None,
            })
            .collect(),
    }]);

    let outcome = run_suite(&store, Concurrency::Bounded(2), false, None);
    assert_eq!(outcome, RunOutcome::Passed);

    let events = fs::read_to_string(&log).expect("read event log");
    let mut running = 0i32;
    let mut max_running = 0i32;
    for line in events.lines() {
        match line {
            "start" => {
                running += 1;
                max_running = max_running.max(running);
            }
            "end" => running -= 1,
            other => panic!("unexpected event line: {other}"),
        }
    }
    assert!(
        max_running <= 2,
        "observed {max_running} concurrent checks with a bound of 2"
    );
}

#[test]
fn pre_aborted_parent_aborts_everything_without_spawning() {
    let root = temp_workspace("pre-aborted");
    let marker = root.join("ran.marker");
    let command = format!("touch {}", marker.display());
    let store = SuiteStore::new(vec![project(&root, &[("never", command.as_str())])]);

    let parent = CancelToken::new();
    parent.cancel();
    let outcome = run_suite(&store, Concurrency::default(), false, Some(&parent));

    assert_eq!(outcome, RunOutcome::Aborted);
    assert_eq!(outcome.exit_code(), 3);
    assert!(matches!(result_of(&store, 0), CheckResult::Aborted { .. }));
    assert!(!marker.exists(), "aborted check must never spawn");
}

#[test]
fn completed_run_detaches_from_parent_token() {
    let root = temp_workspace("detach");
    let store = SuiteStore::new(vec![project(&root, &[("ok", "true")])]);
    let parent = CancelToken::new();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(PipeSpawner),
        SchedulerConfig::default(),
        Some(&parent),
    );
    assert_eq!(scheduler.run(), RunOutcome::Passed);

    // the run is over; canceling the parent must not reach its token
    parent.cancel();
    assert!(!scheduler.cancel_token().is_canceled());
}

#[test]
fn external_cancel_mid_run_aborts_remaining_checks() {
    let root = temp_workspace("mid-cancel");
    let store = SuiteStore::new(vec![project(&root, &[("slow", "sleep 30")])]);
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(PipeSpawner),
        SchedulerConfig::default(),
        None,
    );
    let cancel = scheduler.cancel_token();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });
    let started = Instant::now();
    let outcome = scheduler.run();
    canceller.join().expect("canceller join");
    assert_eq!(outcome, RunOutcome::Aborted);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(matches!(result_of(&store, 0), CheckResult::Aborted { .. }));
}

#[test]
fn subscribers_observe_progress_during_a_run() {
    let root = temp_workspace("subscribe");
    let store = SuiteStore::new(vec![project(&root, &[("noisy", "printf chunk")])]);
    let notified = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let notified = notified.clone();
        store.subscribe(move || {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };
    run_suite(&store, Concurrency::default(), false, None);
    assert!(notified.load(Ordering::SeqCst) >= 2, "running + output + terminal");
    subscription.unsubscribe();
}

#[test]
fn summaries_aggregate_across_projects() {
    let root = temp_workspace("multi-project");
    let store = SuiteStore::new(vec![
        project(&root, &[("ok", "true")]),
        ProjectDefinition {
            project: "other".to_owned(),
            path: root.clone(),
            color: "magenta".to_owned(),
            checks: vec![CheckDefinition {
                name: "bad".to_owned(),
                command: "exit 1".to_owned(),
                cwd: root.clone(),
                timeout: None,
            }],
        },
    ]);
    let outcome = run_suite(&store, Concurrency::Unbounded, false, None);
    assert_eq!(outcome, RunOutcome::Failed);
    let snapshot = store.snapshot();
    assert!(snapshot.is_complete);
    assert_eq!(snapshot.summary.total, 2);
    assert_eq!(snapshot.summary.passed, 1);
    assert_eq!(snapshot.summary.failed, 1);
    assert!(snapshot.projects.iter().all(|project| project.is_complete));
}
