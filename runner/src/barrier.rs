use crate::{
    config::BarrierConfig,
    executors::{Executor, ExecutorError},
    jobs::{JobCommand, JobHandle, WorkItem},
    submit::{SubmissionError, Submitter},
};
use std::{
    fs::{self, OpenOptions},
    io,
    os::unix::{ffi::OsStrExt, fs::PermissionsExt},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// file the sentinel job creates once all dependencies terminated
pub const MARKER_FILE: &str = "safety_check.txt";
/// output capture of the sentinel job itself
pub const SENTINEL_OUTPUT: &str = "safety_check.out";
/// batch script wrapping this binary's `sentinel` subcommand
pub const SENTINEL_SCRIPT: &str = "safety_check.sh";
pub const SENTINEL_JOB_NAME: &str = "barrier";

// longest uninterrupted sleep, keeps cancellation responsive with long poll intervals
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("Failed to submit the sentinel job: {0}")]
    Submission(#[from] SubmissionError),
    #[error("Failed to write the sentinel script {path:?}: {source}")]
    SentinelScript { path: PathBuf, source: io::Error },
    #[error("Marker {0:?} already exists before the sentinel job was submitted")]
    StaleMarker(PathBuf),
    #[error("Jobs did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Waiting for jobs was cancelled")]
    Cancelled,
    #[error("Failed to cancel outstanding jobs: {0}")]
    Cancel(#[from] ExecutorError),
}

/// Shared flag to abort a barrier wait, cloning yields a handle to the same flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Program run by the sentinel job, the marker path is always the last argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    /// configured program with its leading arguments
    Command(JobCommand),
    /// `sentinel` subcommand of the given binary, submitted through a generated
    /// `#!/bin/sh` script since `sbatch` only accepts scripts
    Binary(PathBuf),
}

impl Sentinel {
    /// Command of the sentinel job writing `marker`, generates the wrapper script in
    /// `poll_dir` if needed
    pub fn job_command(&self, poll_dir: &Path, marker: &Path) -> Result<JobCommand, BarrierError> {
        match self {
            Self::Command(command) => Ok(command.clone().arg(marker)),
            Self::Binary(exe) => {
                let script = poll_dir.join(SENTINEL_SCRIPT);
                write_sentinel_script(&script, exe).map_err(|source| {
                    BarrierError::SentinelScript {
                        path: script.clone(),
                        source,
                    }
                })?;

                Ok(JobCommand::new(script).arg(marker))
            }
        }
    }
}

/// The configured sentinel program or this binary's `sentinel` subcommand
pub fn sentinel_command(config: &BarrierConfig) -> io::Result<Sentinel> {
    match config.sentinel {
        Some(ref sentinel) => Ok(Sentinel::Command(
            JobCommand::new(&sentinel.exec).args(&sentinel.params),
        )),
        None => Ok(Sentinel::Binary(std::env::current_exe()?)),
    }
}

// single quotes for sh, an embedded quote becomes '\''
fn shell_quote(raw: &[u8]) -> Vec<u8> {
    let mut quoted = Vec::with_capacity(raw.len() + 2);
    quoted.push(b'\'');
    for &byte in raw {
        if byte == b'\'' {
            quoted.extend_from_slice(b"'\\''");
        } else {
            quoted.push(byte);
        }
    }
    quoted.push(b'\'');

    quoted
}

fn write_sentinel_script(path: &Path, exe: &Path) -> io::Result<()> {
    let mut content = b"#!/bin/sh\nexec ".to_vec();
    content.extend(shell_quote(exe.as_os_str().as_bytes()));
    content.extend_from_slice(b" sentinel \"$1\"\n");

    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

/// Create the zero-byte marker, existing markers are left untouched
pub fn write_marker(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map(|_| ())
}

/// Blocks until a set of scheduler jobs has terminated.
///
/// A sentinel job depending (`afterany`) on every job is submitted, the barrier then polls for
/// the marker the sentinel writes. The scheduler's own dependency tracking is the only
/// synchronization between this process and the jobs. The sentinel always uses the shared
/// resource profile.
#[derive(Debug)]
pub struct Barrier<'a, E> {
    submitter: &'a Submitter<E>,
    sentinel: Sentinel,
    poll_interval: Duration,
    timeout: Option<Duration>,
    time_limit: u64,
    cancel: CancelToken,
}

impl<'a, E: Executor> Barrier<'a, E> {
    pub fn new(
        submitter: &'a Submitter<E>,
        config: &BarrierConfig,
        sentinel: Sentinel,
        cancel: CancelToken,
    ) -> Self {
        Self {
            submitter,
            sentinel,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            time_limit: config.time_limit,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel `outstanding` with a single request and report the cancellation
    pub fn abort(&self, outstanding: &[JobHandle]) -> BarrierError {
        warn!("Cancelling {} outstanding jobs", outstanding.len());

        if outstanding.is_empty() {
            return BarrierError::Cancelled;
        }

        match self.submitter.executor().cancel(outstanding) {
            Ok(()) => BarrierError::Cancelled,
            Err(e) => BarrierError::Cancel(e),
        }
    }

    /// Wait until every job in `handles` reached a terminal state, failed jobs included.
    #[instrument(skip_all, fields(jobs = handles.len(), dir = ?poll_dir), level = "info")]
    pub fn await_all(&self, handles: &[JobHandle], poll_dir: &Path) -> Result<(), BarrierError> {
        let marker = poll_dir.join(MARKER_FILE);

        if marker.exists() {
            return Err(BarrierError::StaleMarker(marker));
        }

        let item = WorkItem::new(
            SENTINEL_JOB_NAME,
            self.sentinel.job_command(poll_dir, &marker)?,
            self.time_limit,
            self.submitter.shared_memory(),
            poll_dir.join(SENTINEL_OUTPUT),
        );
        let sentinel = self.submitter.submit_shared(item, handles.iter().collect())?;

        info!(sentinel = sentinel.id(), "Waiting for jobs to finish");
        let start = Instant::now();

        loop {
            self.sleep();

            if self.cancel.is_cancelled() {
                let mut outstanding = handles.to_vec();
                outstanding.push(sentinel);

                return Err(self.abort(&outstanding));
            }

            if marker.exists() {
                info!("All jobs finished after {} s", start.elapsed().as_secs());

                return Ok(());
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    warn!(sentinel = sentinel.id(), "Jobs are still outstanding after {timeout:?}");

                    return Err(BarrierError::Timeout(timeout));
                }
            }

            debug!("Marker not found yet, waited {} s", start.elapsed().as_secs());
        }
    }

    fn sleep(&self) {
        // unreachable deadlines only end through cancellation
        let deadline = Instant::now().checked_add(self.poll_interval);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let slice = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => left.min(MAX_SLEEP_SLICE),
                    _ => return,
                },
                None => MAX_SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}
