pub mod local;
pub mod slurm;

use crate::{
    config::{ConfigErrors, SchedulerConfig},
    jobs::{JobHandle, SubmitRequest},
};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Scheduler rejected the request ({status}): {stderr}")]
    Rejected { status: String, stderr: String },
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A batch scheduler the controller can hand jobs to.
///
/// Implementations only transport requests, validation happens in `Submitter`.
pub trait Executor {
    /// Submit a job and return the scheduler's raw acknowledgment,
    /// `Submitted batch job <id>` on the first line.
    fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError>;

    /// Cancel all given jobs, jobs that already terminated are ignored
    fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError>;
}

/// All supported executors, selected by `scheduler.name`
#[derive(Debug)]
pub enum Executors {
    Slurm(slurm::SlurmExecutor),
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(config: &SchedulerConfig) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "slurm" => Ok(Self::Slurm(slurm::SlurmExecutor::load(config))),
            "local" => Ok(Self::Local(local::LocalExecutor::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }
}

impl Executor for Executors {
    fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
        match self {
            Self::Slurm(executor) => executor.dispatch(request),
            Self::Local(executor) => executor.dispatch(request),
        }
    }

    fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError> {
        match self {
            Self::Slurm(executor) => executor.cancel(handles),
            Self::Local(executor) => executor.cancel(handles),
        }
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
        (**self).dispatch(request)
    }

    fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError> {
        (**self).cancel(handles)
    }
}
