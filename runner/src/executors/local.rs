use super::{Executor, ExecutorError};
use crate::{
    config::SchedulerConfig,
    jobs::{expand_output_path, JobHandle, SubmitRequest, ACKNOWLEDGMENT_TOKEN},
};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

// granularity in which running jobs check for cancellation
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// How a local job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed { success: bool },
    TimedOut,
    Cancelled,
    FailedToStart,
}

/// Scheduler-side state of a local job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// waiting for its dependencies
    Pending,
    Running,
    /// `order` counts terminations, starting at 1
    Finished { order: u64, termination: Termination },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

#[derive(Debug)]
struct Slot {
    state: JobState,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    finished: u64,
    jobs: BTreeMap<JobHandle, Slot>,
    // submitted jobs whose dependencies are not yet terminal, in submission order
    waiting: Vec<(JobHandle, SubmitRequest)>,
}

impl State {
    fn is_ready(&self, request: &SubmitRequest) -> bool {
        request.dependencies.iter().all(|dependency| {
            self.jobs
                .get(dependency)
                .map_or(true, |slot| slot.state.is_terminal())
        })
    }

    fn finish(&mut self, handle: JobHandle, termination: Termination) {
        self.finished += 1;
        let order = self.finished;

        if let Some(slot) = self.jobs.get_mut(&handle) {
            slot.state = JobState::Finished { order, termination };
        }
    }

    /// remove all waiting jobs that may start now
    fn take_ready(&mut self) -> Vec<(JobHandle, SubmitRequest)> {
        let waiting = std::mem::take(&mut self.waiting);
        let (ready, waiting): (Vec<_>, Vec<_>) = waiting
            .into_iter()
            .partition(|(_, request)| self.is_ready(request));
        self.waiting = waiting;

        ready
    }
}

#[derive(Debug)]
struct Shared {
    pool: ThreadPool,
    state: Mutex<State>,
}

/// Executor emulating a batch scheduler on the local machine.
///
/// Jobs run on a fixed-size thread pool and are only handed to the pool once every dependency
/// has terminated (`afterany`), so pool threads never block on other jobs. Stdout and stderr
/// of a job go to its output path with `%j` replaced by the job id.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    shared: Arc<Shared>,
}

impl LocalExecutor {
    pub fn load(config: &SchedulerConfig) -> Result<Self, ExecutorError> {
        Self::with_threads(config.threads.unwrap_or_else(num_cpus::get))
    }

    pub fn with_threads(threads: usize) -> Result<Self, ExecutorError> {
        debug!("Starting local executor with {threads} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("local-job-{index}"))
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                state: Mutex::new(State {
                    next_id: 1,
                    ..State::default()
                }),
            }),
        })
    }

    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        self.shared
            .state
            .lock()
            .jobs
            .get(&handle)
            .map(|slot| slot.state)
    }

    fn start(shared: &Arc<Shared>, state: &mut State, handle: JobHandle, request: SubmitRequest) {
        let Some(slot) = state.jobs.get_mut(&handle) else {
            return;
        };
        slot.state = JobState::Running;
        let cancelled = slot.cancelled.clone();

        let task_shared = shared.clone();
        shared.pool.spawn(move || {
            let termination = run_job(handle, &request, &cancelled);

            let mut state = task_shared.state.lock();
            state.finish(handle, termination);
            for (ready, request) in state.take_ready() {
                Self::start(&task_shared, &mut state, ready, request);
            }
        });
    }
}

impl Executor for LocalExecutor {
    fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
        let mut state = self.shared.state.lock();

        if let Some(unknown) = request
            .dependencies
            .iter()
            .find(|dependency| !state.jobs.contains_key(dependency))
        {
            return Err(ExecutorError::Rejected {
                status: String::from("dependency"),
                stderr: format!("Job dependency problem: unknown job {unknown}"),
            });
        }

        let handle = JobHandle::new(state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            handle,
            Slot {
                state: JobState::Pending,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );

        debug!(
            job = request.item.name(),
            id = handle.id(),
            dependencies = request.dependencies.len(),
            "Accepted local job"
        );

        if state.is_ready(request) {
            Self::start(&self.shared, &mut state, handle, request.clone());
        } else {
            state.waiting.push((handle, request.clone()));
        }

        Ok(format!("{ACKNOWLEDGMENT_TOKEN} {handle}\n"))
    }

    fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError> {
        let mut state = self.shared.state.lock();

        for handle in handles {
            let Some((current, cancelled)) = state
                .jobs
                .get(handle)
                .map(|slot| (slot.state, slot.cancelled.clone()))
            else {
                continue;
            };

            match current {
                JobState::Pending => {
                    state.waiting.retain(|(waiting, _)| waiting != handle);
                    state.finish(*handle, Termination::Cancelled);
                }
                JobState::Running => cancelled.store(true, Ordering::SeqCst),
                JobState::Finished { .. } => {}
            }
        }

        for (ready, request) in state.take_ready() {
            Self::start(&self.shared, &mut state, ready, request);
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(job = request.item.name(), id = handle.id()), level = "debug")]
fn run_job(handle: JobHandle, request: &SubmitRequest, cancelled: &AtomicBool) -> Termination {
    let item = &request.item;
    let output_path = expand_output_path(item.output(), handle);

    let (stdout, stderr) = match File::create(&output_path)
        .and_then(|file| file.try_clone().map(|clone| (file, clone)))
    {
        Ok((stdout, stderr)) => (Stdio::from(stdout), Stdio::from(stderr)),
        Err(error) => {
            warn!(path = ?output_path, "Failed to create output file: {error}");
            (Stdio::null(), Stdio::null())
        }
    };

    let start = Instant::now();
    let mut child = match Command::new(&item.command().program)
        .args(&item.command().args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            warn!("Failed to start job: {error}");
            append(&output_path, &format!("failed to start job: {error}\n"));

            return Termination::FailedToStart;
        }
    };

    // a time limit of 0 means no limit
    let limit = (item.time_limit() > 0).then(|| Duration::from_secs(item.time_limit()));

    loop {
        match child.wait_timeout(WAIT_SLICE) {
            Ok(Some(status)) => {
                debug!(
                    "Finished in {} ms | status: {}",
                    start.elapsed().as_millis(),
                    status
                );

                return completed(status);
            }
            Ok(None) => {
                let timed_out = limit.map_or(false, |limit| start.elapsed() >= limit);

                if timed_out || cancelled.load(Ordering::SeqCst) {
                    if let Err(error) = child.kill() {
                        warn!("Failed to kill job: {error}");
                    }
                    let _ = child.wait();

                    return if timed_out {
                        info!("Job hit its time limit");
                        append(&output_path, "job cancelled due to time limit\n");
                        Termination::TimedOut
                    } else {
                        info!("Job cancelled");
                        append(&output_path, "job cancelled\n");
                        Termination::Cancelled
                    };
                }
            }
            Err(error) => {
                warn!("Failed to wait for job: {error}");

                return Termination::Completed { success: false };
            }
        }
    }
}

fn completed(status: ExitStatus) -> Termination {
    Termination::Completed {
        success: status.success(),
    }
}

fn append(path: &std::path::Path, message: &str) {
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = file.write_all(message.as_bytes());
    }
}
