use super::{Executor, ExecutorError};
use crate::{
    config::SchedulerConfig,
    jobs::{JobHandle, SubmitRequest},
};
use itertools::Itertools;
use std::{
    ffi::OsString,
    path::PathBuf,
    process::{Command, Output, Stdio},
};
use tracing::{debug, instrument, trace};

/// Executor submitting every job through `sbatch`
#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    sbatch: PathBuf,
    scancel: PathBuf,
}

impl SlurmExecutor {
    pub fn load(config: &SchedulerConfig) -> Self {
        Self {
            sbatch: config.sbatch.clone(),
            scancel: config.scancel.clone(),
        }
    }
}

/// Build the `sbatch` argument vector for a request
pub fn sbatch_args(request: &SubmitRequest) -> Vec<OsString> {
    let item = &request.item;
    let resources = &request.resources;

    let mut args: Vec<OsString> = vec![
        format!("--job-name={}", item.name()).into(),
        format!("--time=0-00:00:{}", item.time_limit()).into(),
        format!("--cpus-per-task={}", resources.cpus_per_task).into(),
    ];

    if resources.exclusive {
        args.push("--exclusive".into());
    } else {
        args.push("--ntasks=1".into());
    }

    if let Some(memory) = item.memory() {
        args.push(format!("--mem={memory}").into());
    }

    if let Some(clause) = request.dependencies.afterany_clause() {
        args.push(format!("--dependency={clause}").into());
    }

    if let Some(ref constraint) = resources.constraint {
        args.push(format!("--constraint={constraint}").into());
    }

    args.push("--output".into());
    args.push(item.output().as_os_str().to_owned());
    args.push("--error".into());
    args.push(item.output().as_os_str().to_owned());

    if let Some(ref account) = resources.account {
        args.push("-A".into());
        args.push(account.into());
    }

    if let Some(ref partition) = resources.partition {
        args.push(format!("--partition={partition}").into());
    }

    args.push(item.command().program.as_os_str().to_owned());
    args.extend(item.command().args.iter().cloned());

    args
}

fn check_output(output: Output) -> Result<String, ExecutorError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ExecutorError::Rejected {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

impl Executor for SlurmExecutor {
    #[instrument(skip_all, fields(job = request.item.name()), level = "debug")]
    fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
        let args = sbatch_args(request);
        trace!("sbatch {args:?}");

        let output = Command::new(&self.sbatch)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ExecutorError::Spawn {
                program: self.sbatch.clone(),
                source,
            })?;

        let acknowledgment = check_output(output)?;
        debug!("sbatch answered: {}", acknowledgment.trim());

        Ok(acknowledgment)
    }

    fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError> {
        if handles.is_empty() {
            return Ok(());
        }

        debug!("Cancelling jobs {}", handles.iter().join(" "));

        let output = Command::new(&self.scancel)
            .args(handles.iter().map(JobHandle::to_string))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ExecutorError::Spawn {
                program: self.scancel.clone(),
                source,
            })?;

        check_output(output).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DependencySet, JobCommand, Resources, WorkItem};
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    fn request(exclusive: bool, dependencies: DependencySet) -> SubmitRequest {
        SubmitRequest {
            item: WorkItem::new(
                "air03--0--0",
                JobCommand::new("/opt/solve_instance.py").args(["results", "air03.mps", "air03"]),
                240,
                Some(2000),
                "/out/%j__air03__0__0.out",
            ),
            resources: Resources {
                cpus_per_task: 1,
                exclusive,
                constraint: Some(String::from("Xeon&Gold6342")),
                account: Some(String::from("group")),
                partition: Some(String::from("short")),
            },
            dependencies,
        }
    }

    #[test]
    fn shared_job_arguments() {
        let args = sbatch_args(&request(false, DependencySet::none()));

        assert_eq!(
            args,
            [
                "--job-name=air03--0--0",
                "--time=0-00:00:240",
                "--cpus-per-task=1",
                "--ntasks=1",
                "--mem=2000",
                "--constraint=Xeon&Gold6342",
                "--output",
                "/out/%j__air03__0__0.out",
                "--error",
                "/out/%j__air03__0__0.out",
                "-A",
                "group",
                "--partition=short",
                "/opt/solve_instance.py",
                "results",
                "air03.mps",
                "air03",
            ]
            .map(OsString::from)
        );
    }

    #[test]
    fn no_dependencies_no_wait_clause() {
        let args = sbatch_args(&request(false, DependencySet::none()));

        assert!(!args
            .iter()
            .any(|arg| arg.to_string_lossy().starts_with("--dependency")));
    }

    #[test]
    fn exclusive_job_with_dependencies() {
        let deps = [JobHandle::new(5), JobHandle::new(7)].into_iter().collect();
        let args = sbatch_args(&request(true, deps));

        assert!(args.contains(&OsString::from("--exclusive")));
        assert!(!args.contains(&OsString::from("--ntasks=1")));
        assert!(args.contains(&OsString::from("--dependency=afterany:5:7")));
    }

    fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn dispatch_returns_sbatch_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::with_name("slurm");
        config.sbatch = fake_tool(dir.path(), "sbatch", "echo \"Submitted batch job 31337\"");
        let executor = SlurmExecutor::load(&config);

        let acknowledgment = executor
            .dispatch(&request(false, DependencySet::none()))
            .unwrap();

        assert_eq!(acknowledgment.trim(), "Submitted batch job 31337");
    }

    #[test]
    fn failing_sbatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::with_name("slurm");
        config.sbatch = fake_tool(dir.path(), "sbatch", "echo 'invalid account' >&2; exit 1");
        let executor = SlurmExecutor::load(&config);

        assert!(matches!(
            executor.dispatch(&request(false, DependencySet::none())),
            Err(ExecutorError::Rejected { .. })
        ));
    }

    #[test]
    fn cancel_passes_all_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("scancel.log");
        let mut config = SchedulerConfig::with_name("slurm");
        config.scancel = fake_tool(
            dir.path(),
            "scancel",
            &format!("echo \"$@\" > {}", log.display()),
        );
        let executor = SlurmExecutor::load(&config);

        executor
            .cancel(&[JobHandle::new(3), JobHandle::new(4)])
            .unwrap();

        assert_eq!(fs::read_to_string(log).unwrap().trim(), "3 4");
    }
}
