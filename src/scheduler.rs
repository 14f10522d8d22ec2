use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::executor::{run_check, TerminalStatus};
use crate::model::{CheckDefinition, CheckId};
use crate::spawn::Spawner;
use crate::state::SuiteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Bounded(usize),
    Unbounded,
}

impl Concurrency {
    pub fn default_bound() -> usize {
        let cores = thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1);
        (cores * 3 / 4).max(1)
    }

    fn slots(self, queued: usize) -> usize {
        match self {
            Concurrency::Bounded(limit) => limit.max(1).min(queued.max(1)),
            Concurrency::Unbounded => queued.max(1),
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Bounded(Self::default_bound())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Passed => 0,
            RunOutcome::Failed => 2,
            RunOutcome::Aborted => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub concurrency: Concurrency,
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::default(),
            fail_fast: false,
        }
    }
}

// Drains the suite's checks through a bounded worker pool. Workers pull from
// a FIFO queue, so checks become eligible in definition order; a fail-fast
// failure cancels the internal token, which queued checks observe before
// they ever spawn.
pub struct Scheduler {
    store: SuiteStore,
    spawner: Arc<dyn Spawner>,
    config: SchedulerConfig,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(
        store: SuiteStore,
        spawner: Arc<dyn Spawner>,
        config: SchedulerConfig,
        parent: Option<&CancelToken>,
    ) -> Self {
        let cancel = match parent {
            Some(parent) => parent.child(),
            None => CancelToken::new(),
        };
        Self {
            store,
            spawner,
            config,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> RunOutcome {
        let queue: VecDeque<(CheckId, CheckDefinition)> = self.store.definitions().into();
        let total = queue.len();
        let workers = self.config.concurrency.slots(total);
        info!(
            total,
            workers,
            fail_fast = self.config.fail_fast,
            "starting check run"
        );

        let queue = Arc::new(Mutex::new(queue));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = queue.clone();
            let store = self.store.clone();
            let spawner = self.spawner.clone();
            let cancel = self.cancel.clone();
            let fail_fast = self.config.fail_fast;
            handles.push(thread::spawn(move || loop {
                let next = queue.lock().expect("queue lock").pop_front();
                let Some((id, definition)) = next else {
                    break;
                };
                let status = run_check(&store, spawner.as_ref(), id, &definition, &cancel);
                if status == TerminalStatus::Failed && fail_fast && !cancel.is_canceled() {
                    debug!(check = %definition.name, "check failed, aborting remaining checks");
                    cancel.cancel();
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
        // release the registration on any parent token so repeated runs do
        // not accumulate listeners there
        self.cancel.detach();

        let summary = self.store.summary();
        if summary.failed > 0 {
            RunOutcome::Failed
        } else if summary.aborted > 0 {
            RunOutcome::Aborted
        } else {
            RunOutcome::Passed
        }
    }
}
