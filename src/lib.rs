pub mod cancel;
pub mod executor;
pub mod model;
pub mod sanitize;
pub mod scheduler;
pub mod spawn;
pub mod state;
pub mod terminal;

pub use cancel::CancelToken;
pub use executor::{run_check, TerminalStatus};
pub use model::{
    combine_summaries, CheckDefinition, CheckId, CheckResult, DefinitionError, KillSignal,
    LogEntry, LogStream, ProjectDefinition, Summary, TimeoutOutcome, TimeoutSpec,
};
pub use sanitize::sanitize_chunk;
pub use scheduler::{Concurrency, RunOutcome, Scheduler, SchedulerConfig};
pub use spawn::{
    PipeSpawner, ProcessEvent, ProcessHandle, ProcessKiller, PtySpawner, SpawnError, Spawner,
};
pub use state::{CheckSnapshot, ProjectSnapshot, SuiteSnapshot, SuiteStore, Subscription};
pub use terminal::{OutputManager, TerminalBuffer};
