use crate::{
    config::{check_executable, SchedulerConfig},
    executors::{Executor, ExecutorError},
    jobs::{parse_acknowledgment, DependencySet, JobHandle, Resources, SubmitRequest, WorkItem},
};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, instrument};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("{0:?} is not an executable file")]
    NotExecutable(PathBuf),
    #[error("Output file {0:?} already exists")]
    OutputExists(PathBuf),
    #[error("Output directory of {0:?} does not exist")]
    MissingOutputDirectory(PathBuf),
    #[error("Time limit of {time_limit}s is outside of [0, {max}]")]
    TimeLimitOutOfRange { time_limit: u64, max: u64 },
    #[error("Scheduler failed to accept the job: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Unable to parse scheduler acknowledgment {0:?}")]
    UnparsableAcknowledgment(String),
}

/// Validates work items and hands them to an executor.
///
/// Every check runs before the executor is contacted, a failed submission has no side effect.
/// There is no retry, a failure is fatal for the caller.
#[derive(Debug)]
pub struct Submitter<E> {
    executor: E,
    // profile of the work items
    selected: (Resources, Option<u64>),
    // profile of bookkeeping jobs like the barrier sentinel, never exclusive
    shared: (Resources, Option<u64>),
    max_time_limit: u64,
}

impl<E: Executor> Submitter<E> {
    pub fn new(executor: E, config: &SchedulerConfig, exclusive: bool) -> Self {
        Self {
            executor,
            selected: config.resources(exclusive),
            shared: config.resources(false),
            max_time_limit: config.max_time_limit,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// memory ceiling of the selected resource profile
    pub fn memory(&self) -> Option<u64> {
        self.selected.1
    }

    /// memory ceiling of the shared resource profile
    pub fn shared_memory(&self) -> Option<u64> {
        self.shared.1
    }

    /// Submit with the selected resource profile
    pub fn submit(
        &self,
        item: WorkItem,
        dependencies: DependencySet,
    ) -> Result<JobHandle, SubmissionError> {
        self.submit_with(item, &self.selected.0, dependencies)
    }

    /// Submit with the shared resource profile, regardless of the selected one
    pub fn submit_shared(
        &self,
        item: WorkItem,
        dependencies: DependencySet,
    ) -> Result<JobHandle, SubmissionError> {
        self.submit_with(item, &self.shared.0, dependencies)
    }

    #[instrument(skip_all, fields(job = item.name(), exclusive = resources.exclusive), level = "debug")]
    fn submit_with(
        &self,
        item: WorkItem,
        resources: &Resources,
        dependencies: DependencySet,
    ) -> Result<JobHandle, SubmissionError> {
        self.validate(&item)?;

        let request = SubmitRequest {
            item,
            resources: resources.clone(),
            dependencies,
        };
        let acknowledgment = self.executor.dispatch(&request)?;

        match parse_acknowledgment(&acknowledgment) {
            Some(handle) => {
                debug!(id = handle.id(), "Submitted job");

                Ok(handle)
            }
            None => {
                error!("Scheduler answered with {acknowledgment:?}, unable to determine the job id");

                Err(SubmissionError::UnparsableAcknowledgment(acknowledgment))
            }
        }
    }

    fn validate(&self, item: &WorkItem) -> Result<(), SubmissionError> {
        let program = &item.command().program;
        if !matches!(check_executable(program), Ok(true)) {
            return Err(SubmissionError::NotExecutable(program.clone()));
        }

        let output = item.output();
        if output.exists() {
            return Err(SubmissionError::OutputExists(output.to_path_buf()));
        }

        match output.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            _ => return Err(SubmissionError::MissingOutputDirectory(output.to_path_buf())),
        }

        if item.time_limit() > self.max_time_limit {
            return Err(SubmissionError::TimeLimitOutOfRange {
                time_limit: item.time_limit(),
                max: self.max_time_limit,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobCommand;
    use parking_lot::Mutex;
    use std::path::Path;

    #[derive(Debug)]
    struct ScriptedExecutor {
        answer: String,
        requests: Mutex<Vec<SubmitRequest>>,
    }

    impl ScriptedExecutor {
        fn answering(answer: &str) -> Self {
            Self {
                answer: answer.to_owned(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Executor for ScriptedExecutor {
        fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
            self.requests.lock().push(request.clone());

            Ok(self.answer.clone())
        }

        fn cancel(&self, _handles: &[JobHandle]) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn item(output: &Path, time_limit: u64) -> WorkItem {
        WorkItem::new(
            "air03--0--0",
            JobCommand::new("/bin/sh").args(["-c", "true"]),
            time_limit,
            Some(2000),
            output,
        )
    }

    fn submitter(answer: &str) -> Submitter<ScriptedExecutor> {
        Submitter::new(
            ScriptedExecutor::answering(answer),
            &SchedulerConfig::with_name("slurm"),
            false,
        )
    }

    #[test]
    fn accepted_submission() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = submitter("Submitted batch job 77\n");

        let handle = submitter
            .submit(item(&dir.path().join("%j.out"), 240), DependencySet::none())
            .unwrap();

        assert_eq!(handle, JobHandle::new(77));
        let requests = submitter.executor().requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resources.cpus_per_task, 1);
        assert!(requests[0].dependencies.is_empty());
    }

    #[test]
    fn existing_output_fails_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("safety_check.out");
        std::fs::write(&output, "").unwrap();
        let submitter = submitter("Submitted batch job 77\n");

        assert!(matches!(
            submitter.submit(item(&output, 10), DependencySet::none()),
            Err(SubmissionError::OutputExists(_))
        ));
        assert!(submitter.executor().requests.lock().is_empty());
    }

    #[test]
    fn missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = submitter("Submitted batch job 77\n");

        assert!(matches!(
            submitter.submit(
                item(&dir.path().join("missing").join("job.out"), 10),
                DependencySet::none()
            ),
            Err(SubmissionError::MissingOutputDirectory(_))
        ));
        assert!(submitter.executor().requests.lock().is_empty());
    }

    #[test]
    fn non_executable_program() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = submitter("Submitted batch job 77\n");
        let item = WorkItem::new(
            "missing",
            JobCommand::new(dir.path().join("solve_instance.py")),
            10,
            None,
            dir.path().join("job.out"),
        );

        assert!(matches!(
            submitter.submit(item, DependencySet::none()),
            Err(SubmissionError::NotExecutable(_))
        ));
    }

    #[test]
    fn time_limit_above_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = submitter("Submitted batch job 77\n");

        assert!(matches!(
            submitter.submit(
                item(&dir.path().join("job.out"), 100_000_001),
                DependencySet::none()
            ),
            Err(SubmissionError::TimeLimitOutOfRange { .. })
        ));
    }

    #[test]
    fn shared_submission_ignores_exclusive_profile() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = Submitter::new(
            ScriptedExecutor::answering("Submitted batch job 5\n"),
            &SchedulerConfig::with_name("slurm"),
            true,
        );

        submitter
            .submit(item(&dir.path().join("work.out"), 10), DependencySet::none())
            .unwrap();
        submitter
            .submit_shared(item(&dir.path().join("marker.out"), 10), DependencySet::none())
            .unwrap();

        let requests = submitter.executor().requests.lock();
        assert!(requests[0].resources.exclusive);
        assert!(!requests[1].resources.exclusive);
        assert_eq!(submitter.memory(), Some(90000));
        assert_eq!(submitter.shared_memory(), Some(2000));
    }

    #[test]
    fn garbage_acknowledgment_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = submitter("sbatch: error: Batch job submission failed\n");

        assert!(matches!(
            submitter.submit(item(&dir.path().join("job.out"), 10), DependencySet::none()),
            Err(SubmissionError::UnparsableAcknowledgment(_))
        ));
    }
}
