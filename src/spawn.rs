use std::collections::HashMap;
use std::io::{ErrorKind, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::{setpgid, Pid};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tracing::debug;

use crate::model::{KillSignal, LogStream};

const CHUNK_BYTES: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(40);
const RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);
pub const PTY_MIN_COLUMNS: u16 = 80;
pub const PTY_UI_INSET: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: LogStream, chunk: String },
    Error { message: String },
    Exit { code: Option<i32>, signal: Option<String> },
}

#[derive(Debug, Default)]
pub struct SpawnError {
    pub message: Option<String>,
}

impl SpawnError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("Spawn failed")
    }
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for SpawnError {}

pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &str, cwd: &Path) -> Result<ProcessHandle, SpawnError>;
}

enum ChildHandle {
    Pipe(Child),
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

struct ChildExit {
    code: Option<i32>,
    raw_signal: Option<i32>,
}

pub struct ProcessKiller {
    pid: Option<i32>,
    child: Mutex<Option<ChildHandle>>,
    requested: Mutex<Option<KillSignal>>,
}

impl ProcessKiller {
    fn new(pid: Option<u32>, child: ChildHandle) -> Arc<Self> {
        Arc::new(Self {
            pid: pid.map(|pid| pid as i32),
            child: Mutex::new(Some(child)),
            requested: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Self> {
        Arc::new(Self {
            pid: None,
            child: Mutex::new(None),
            requested: Mutex::new(None),
        })
    }

    // Best-effort and idempotent: the process group first so shell wrappers
    // and grandchildren go down together, then the direct child.
    pub fn kill(&self, signal: KillSignal) {
        {
            let mut requested = self.requested.lock().expect("requested lock");
            requested.get_or_insert(signal);
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if pid > 0 && kill(Pid::from_raw(-pid), to_nix_signal(signal)).is_ok() {
                debug!(pid, signal = signal.name(), "signaled process group");
                return;
            }
            if pid > 0 && kill(Pid::from_raw(pid), to_nix_signal(signal)).is_ok() {
                debug!(pid, signal = signal.name(), "signaled direct child");
                return;
            }
        }
        let mut child = self.child.lock().expect("child lock");
        if let Some(child) = child.as_mut() {
            let _ = match child {
                ChildHandle::Pipe(child) => child.kill(),
                ChildHandle::Pty(child) => child.kill(),
            };
        }
    }

    pub fn requested_signal(&self) -> Option<KillSignal> {
        *self.requested.lock().expect("requested lock")
    }

    fn try_wait(&self) -> std::io::Result<Option<ChildExit>> {
        let mut child = self.child.lock().expect("child lock");
        match child.as_mut() {
            None => Ok(Some(ChildExit {
                code: None,
                raw_signal: None,
            })),
            Some(ChildHandle::Pipe(child)) => Ok(child.try_wait()?.map(|status| ChildExit {
                code: status.code(),
                raw_signal: status_signal(&status),
            })),
            Some(ChildHandle::Pty(child)) => Ok(child.try_wait()?.map(|status| ChildExit {
                code: Some(status.exit_code() as i32),
                raw_signal: None,
            })),
        }
    }
}

pub struct ProcessHandle {
    pid: Option<u32>,
    merged: bool,
    size: Option<(u16, u16)>,
    events: Receiver<ProcessEvent>,
    killer: Arc<ProcessKiller>,
    resize_tx: Option<Sender<(u16, u16)>>,
}

impl ProcessHandle {
    pub(crate) fn from_parts(
        pid: Option<u32>,
        merged: bool,
        size: Option<(u16, u16)>,
        events: Receiver<ProcessEvent>,
        killer: Arc<ProcessKiller>,
        resize_tx: Option<Sender<(u16, u16)>>,
    ) -> Self {
        Self {
            pid,
            merged,
            size,
            events,
            killer,
            resize_tx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn merged_output(&self) -> bool {
        self.merged
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    pub fn killer(&self) -> Arc<ProcessKiller> {
        self.killer.clone()
    }

    pub fn recv(&self) -> Option<ProcessEvent> {
        self.events.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<ProcessEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    // Debounced for PTY-backed processes, silently ignored for pipes.
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Some(tx) = self.resize_tx.as_ref() {
            let _ = tx.send((cols, rows));
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipeSpawner;

impl Spawner for PipeSpawner {
    fn spawn(&self, command: &str, cwd: &Path) -> Result<ProcessHandle, SpawnError> {
        let mut process = ProcessCommand::new("sh");
        process
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if std::env::var_os("FORCE_COLOR").is_none() {
            process.env("FORCE_COLOR", "1");
        }
        #[cfg(unix)]
        unsafe {
            process.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|error| std::io::Error::new(ErrorKind::Other, error.to_string()))
            });
        }

        let mut child = process
            .spawn()
            .map_err(|error| SpawnError::new(format!("failed to spawn `{command}`: {error}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::new(format!("process for `{command}` missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::new(format!("process for `{command}` missing stderr pipe")))?;
        let pid = child.id();
        debug!(command, pid, "spawned pipe-backed check process");

        let killer = ProcessKiller::new(Some(pid), ChildHandle::Pipe(child));
        let (events_tx, events_rx) = mpsc::channel::<ProcessEvent>();
        let readers = vec![
            spawn_reader(stdout, LogStream::Stdout, events_tx.clone()),
            spawn_reader(stderr, LogStream::Stderr, events_tx.clone()),
        ];
        {
            let killer = killer.clone();
            thread::spawn(move || watch_exit(killer, readers, events_tx));
        }

        Ok(ProcessHandle::from_parts(
            Some(pid),
            false,
            None,
            events_rx,
            killer,
            None,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PtySpawner {
    pub inset_columns: u16,
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self {
            inset_columns: PTY_UI_INSET,
        }
    }
}

impl PtySpawner {
    fn pty_size(&self) -> PtySize {
        let (host_cols, host_rows) = crossterm::terminal::size().unwrap_or((PTY_MIN_COLUMNS, 24));
        PtySize {
            rows: host_rows.max(1),
            cols: host_cols
                .saturating_sub(self.inset_columns)
                .max(PTY_MIN_COLUMNS),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, command: &str, cwd: &Path) -> Result<ProcessHandle, SpawnError> {
        let size = self.pty_size();
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|error| SpawnError::new(format!("failed to open pty: {error}")))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.arg("-c");
        cmd.arg(command);
        cmd.cwd(cwd);
        if std::env::var_os("FORCE_COLOR").is_none() {
            cmd.env("FORCE_COLOR", "1");
        }

        let child = pair.slave.spawn_command(cmd).map_err(|error| {
            SpawnError::new(format!("failed to spawn `{command}` in pty: {error}"))
        })?;
        drop(pair.slave);
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|error| SpawnError::new(format!("failed to read pty output: {error}")))?;

        let pid = child.process_id();
        debug!(
            command,
            ?pid,
            cols = size.cols as u32,
            rows = size.rows as u32,
            "spawned pty-backed check process"
        );

        let killer = ProcessKiller::new(pid, ChildHandle::Pty(child));
        let (events_tx, events_rx) = mpsc::channel::<ProcessEvent>();
        let readers = vec![spawn_reader(reader, LogStream::Stdout, events_tx.clone())];
        {
            let killer = killer.clone();
            thread::spawn(move || watch_exit(killer, readers, events_tx));
        }
        let resize_tx = spawn_resize_debouncer(pair.master, size);

        Ok(ProcessHandle::from_parts(
            pid,
            true,
            Some((size.cols, size.rows)),
            events_rx,
            killer,
            Some(resize_tx),
        ))
    }
}

fn spawn_reader<R>(reader: R, stream: LogStream, events: Sender<ProcessEvent>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if events.send(ProcessEvent::Output { stream, chunk }).is_err() {
                        break;
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn watch_exit(killer: Arc<ProcessKiller>, readers: Vec<JoinHandle<()>>, events: Sender<ProcessEvent>) {
    loop {
        match killer.try_wait() {
            Ok(Some(exit)) => {
                // readers hit EOF once the child is gone; draining them first
                // keeps the exit event after the last output chunk
                for reader in readers {
                    let _ = reader.join();
                }
                // a signal this component sent beats whatever numeric code
                // the OS reports asynchronously
                let signal = killer
                    .requested_signal()
                    .map(|signal| signal.name().to_owned())
                    .or_else(|| {
                        exit.raw_signal
                            .and_then(signal_name)
                            .map(str::to_owned)
                    });
                let _ = events.send(ProcessEvent::Exit {
                    code: exit.code,
                    signal,
                });
                break;
            }
            Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
            Err(error) => {
                let _ = events.send(ProcessEvent::Error {
                    message: format!("failed to wait for process exit: {error}"),
                });
                let _ = events.send(ProcessEvent::Exit {
                    code: None,
                    signal: None,
                });
                break;
            }
        }
    }
}

fn spawn_resize_debouncer(master: Box<dyn MasterPty + Send>, initial: PtySize) -> Sender<(u16, u16)> {
    let (tx, rx) = mpsc::channel::<(u16, u16)>();
    thread::spawn(move || {
        let mut size = initial;
        let mut disconnected = false;
        while !disconnected {
            let Ok(mut next) = rx.recv() else { break };
            // coalesce bursts so rapid host resizes apply once
            loop {
                match rx.recv_timeout(RESIZE_DEBOUNCE) {
                    Ok(newer) => next = newer,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            size.cols = next.0.max(1);
            size.rows = next.1.max(1);
            if master.resize(size).is_err() {
                break;
            }
        }
    });
    tx
}

fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

#[cfg(unix)]
fn to_nix_signal(signal: KillSignal) -> Signal {
    match signal {
        KillSignal::Term => Signal::SIGTERM,
        KillSignal::Int => Signal::SIGINT,
        KillSignal::Quit => Signal::SIGQUIT,
        KillSignal::Hup => Signal::SIGHUP,
        KillSignal::Kill => Signal::SIGKILL,
    }
}

#[cfg(unix)]
pub fn signal_name(code: i32) -> Option<&'static str> {
    static TABLE: OnceLock<HashMap<i32, &'static str>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            Signal::iterator()
                .map(|signal| (signal as i32, signal.as_str()))
                .collect()
        })
        .get(&code)
        .copied()
}

#[cfg(not(unix))]
pub fn signal_name(_code: i32) -> Option<&'static str> {
    None
}
