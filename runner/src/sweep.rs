use crate::{
    barrier::{Barrier, BarrierError},
    config::{ConfigErrors, PipelineConfig},
    executors::Executor,
    instances::{collect_instances, Candidate},
    jobs::JobHandle,
    records::{RecordStore, SolveStatus},
    submit::{SubmissionError, Submitter},
    worker::WorkerRun,
    workspace::{clear_dir, WorkspaceError},
};
use itertools::{iproduct, Itertools};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Tuning parameters of the worker, in the order it expects them
pub const HYPERPARAMETERS: [&str; 17] = [
    "isp",
    "obp",
    "eff",
    "exp",
    "psc",
    "loc",
    "sparsity_bonus",
    "end_sparsity_bonus",
    "root_budget",
    "tree_budget",
    "max_parallel",
    "parallel_penalty",
    "max_density",
    "filter_dense_cuts",
    "filter_parallel_cuts",
    "penalise_locks",
    "penalise_obp",
];

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Failed to read {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Hyperparameter {0} is missing from the configuration file")]
    MissingHyperparameter(&'static str),
    #[error("Hyperparameter {name} has an invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Failed to collect instances: {0}")]
    Instances(#[from] ConfigErrors),
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("Failed to submit job: {0}")]
    Submission(#[from] SubmissionError),
    #[error("Failed to wait for jobs: {0}")]
    Barrier(#[from] BarrierError),
}

fn normalize(name: &'static str, value: &str) -> Result<String, SweepError> {
    match value {
        "True" | "False" => Ok(value.to_owned()),
        value => value
            .parse::<f64>()
            .map(|number| format!("{number:?}"))
            .map_err(|_| SweepError::InvalidValue {
                name,
                value: value.to_owned(),
            }),
    }
}

/// Parse `name: value` lines into the worker's positional tuning parameters.
/// Unknown lines are ignored, a later line overrides an earlier one.
pub fn parse_hyperparameters(content: &str) -> Result<Vec<String>, SweepError> {
    let mut values = BTreeMap::new();

    for line in content.lines() {
        for name in HYPERPARAMETERS {
            if let Some(value) = line
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(": "))
            {
                values.insert(name, normalize(name, value.trim_end())?);
            }
        }
    }

    HYPERPARAMETERS
        .into_iter()
        .map(|name| {
            values
                .remove(name)
                .ok_or(SweepError::MissingHyperparameter(name))
        })
        .collect()
}

pub fn read_hyperparameters(path: &Path) -> Result<Vec<String>, SweepError> {
    let content = fs::read_to_string(path).map_err(|source| SweepError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_hyperparameters(&content)
}

#[derive(Debug, Clone)]
pub struct SweepDirs {
    pub instances: PathBuf,
    pub solutions: Option<PathBuf>,
    pub results: PathBuf,
    pub outfiles: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub submitted: usize,
    pub missing: usize,
    pub statuses: BTreeMap<String, usize>,
}

/// Run every instance of `dirs.instances` with the given tuning parameters for all
/// permutation and random seeds and wait for all runs.
#[instrument(skip_all, level = "info")]
pub fn run_sweep<E: Executor>(
    config: &PipelineConfig,
    submitter: &Submitter<E>,
    barrier: &Barrier<'_, E>,
    dirs: &SweepDirs,
    params: &[String],
) -> Result<SweepReport, SweepError> {
    for dir in [&dirs.outfiles, &dirs.results] {
        if dir.is_dir() {
            clear_dir(dir)?;
        } else {
            fs::create_dir(dir).map_err(|source| SweepError::Io {
                path: dir.clone(),
                source,
            })?;
        }
    }

    let instances = collect_instances(&dirs.instances, &config.sweep.instance_glob)?;

    let solution = |candidate: &Candidate| {
        dirs.solutions.as_ref().map(|dir| {
            dir.join(format!(
                "{}.{}",
                candidate.instance, config.sweep.solution_extension
            ))
        })
    };

    let sweep = &config.sweep;
    let runs = iproduct!(
        sweep.permutation_seeds.iter(),
        sweep.random_seeds.iter(),
        instances.iter()
    )
    .map(|(&permutation, &seed, candidate)| WorkerRun {
        candidate,
        seed,
        permutation,
        time_limit: sweep.time_limit,
        print_stats: true,
        write_solution: None,
        load_solution: solution(candidate),
        default_configuration: false,
        params,
    })
    .collect_vec();

    let mut handles: Vec<JobHandle> = Vec::with_capacity(runs.len());
    for run in runs.iter() {
        if barrier.is_cancelled() {
            return Err(barrier.abort(&handles).into());
        }

        let item = run.work_item(
            &config.worker.exec,
            &dirs.results,
            &dirs.outfiles,
            submitter.memory(),
        );
        handles.push(submitter.submit(item, Default::default())?);
    }
    info!(
        "Submitted {} runs ({} instances)",
        handles.len(),
        instances.len()
    );

    if !handles.is_empty() {
        barrier.await_all(&handles, &dirs.outfiles)?;
    }

    let store = RecordStore::new(&dirs.results);
    let mut report = SweepReport {
        submitted: handles.len(),
        ..SweepReport::default()
    };

    for run in runs.iter() {
        match store.load(&run.key()) {
            Ok(Some(record)) => {
                *report.statuses.entry(record.status.to_string()).or_default() += 1;
            }
            Ok(None) => report.missing += 1,
            Err(e) => {
                warn!("Treating unreadable record as missing: {e}");
                report.missing += 1;
            }
        }
    }

    info!(
        "{} of {} runs solved to optimality, {} without result",
        report
            .statuses
            .get(&SolveStatus::Optimal.to_string())
            .copied()
            .unwrap_or(0),
        report.submitted,
        report.missing
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        barrier::{sentinel_command, CancelToken, SENTINEL_JOB_NAME},
        executors::ExecutorError,
        jobs::SubmitRequest,
    };
    use parking_lot::Mutex;

    /// Never runs a worker, but lets every sentinel write its marker right away
    #[derive(Debug, Default)]
    struct InstantBarrier {
        dispatched: Mutex<u64>,
        workers: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<JobHandle>>,
    }

    impl Executor for InstantBarrier {
        fn dispatch(&self, request: &SubmitRequest) -> Result<String, ExecutorError> {
            let mut dispatched = self.dispatched.lock();
            *dispatched += 1;

            if request.item.name() == SENTINEL_JOB_NAME {
                let marker = request.item.command().args.last().unwrap();
                fs::write(marker, "").unwrap();
            } else {
                self.workers.lock().push(request.item.name().to_owned());
            }

            Ok(format!("Submitted batch job {}\n", *dispatched))
        }

        fn cancel(&self, handles: &[JobHandle]) -> Result<(), ExecutorError> {
            self.cancelled.lock().extend_from_slice(handles);

            Ok(())
        }
    }

    fn sweep_setup(instances: &[&str]) -> (tempfile::TempDir, SweepDirs, PipelineConfig) {
        let root = tempfile::tempdir().unwrap();
        let dirs = SweepDirs {
            instances: root.path().join("instances"),
            solutions: None,
            results: root.path().join("results"),
            outfiles: root.path().join("outfiles"),
        };
        fs::create_dir(&dirs.instances).unwrap();
        for name in instances {
            fs::write(dirs.instances.join(name), "NAME").unwrap();
        }

        let config = serde_yaml::from_str(
            "scheduler: {}\n\
             worker:\n  exec: /bin/sh\n\
             barrier:\n  poll_interval: 0\n  sentinel:\n    exec: /bin/sh\n\
             sweep:\n  random_seeds: [1, 2]\n",
        )
        .unwrap();

        (root, dirs, config)
    }

    const CONFIG: &str = "isp: 0.1\nobp: 0.2\neff: 1\nexp: 0.0\npsc: 0.0\nloc: 0.3\n\
        sparsity_bonus: 0.2\nend_sparsity_bonus: 0.4\nroot_budget: 2\ntree_budget: 2\n\
        max_parallel: 0.9\nparallel_penalty: 0.2\nmax_density: 0.4\nfilter_dense_cuts: False\n\
        filter_parallel_cuts: True\npenalise_locks: False\npenalise_obp: True\n";

    #[test]
    fn parses_in_worker_order() {
        let params = parse_hyperparameters(CONFIG).unwrap();

        assert_eq!(params.len(), HYPERPARAMETERS.len());
        assert_eq!(params[0], "0.1");
        assert_eq!(params[2], "1.0");
        assert_eq!(params[8], "2.0");
        assert_eq!(params[13], "False");
        assert_eq!(params[16], "True");
    }

    #[test]
    fn prefixes_do_not_collide() {
        // `sparsity_bonus` must not pick up `end_sparsity_bonus` and vice versa
        let params = parse_hyperparameters(CONFIG).unwrap();

        assert_eq!(params[6], "0.2");
        assert_eq!(params[7], "0.4");
    }

    #[test]
    fn missing_hyperparameter() {
        let content = CONFIG.replace("penalise_obp: True\n", "");

        assert!(matches!(
            parse_hyperparameters(&content),
            Err(SweepError::MissingHyperparameter("penalise_obp"))
        ));
    }

    #[test]
    fn invalid_value() {
        let content = CONFIG.replace("isp: 0.1", "isp: yes");

        assert!(matches!(
            parse_hyperparameters(&content),
            Err(SweepError::InvalidValue { name: "isp", .. })
        ));
    }

    #[test]
    fn sweep_runs_matching_instances_only() {
        let (_root, dirs, config) = sweep_setup(&["b.mps.gz", "a.mps", "README.txt"]);
        fs::create_dir(dirs.instances.join("nested")).unwrap();
        let executor = InstantBarrier::default();
        let submitter = Submitter::new(&executor, &config.scheduler, false);
        let barrier = Barrier::new(
            &submitter,
            &config.barrier,
            sentinel_command(&config.barrier).unwrap(),
            CancelToken::new(),
        );

        let report = run_sweep(&config, &submitter, &barrier, &dirs, &[]).unwrap();

        assert_eq!(report.submitted, 4);
        assert_eq!(report.missing, 4);
        assert_eq!(
            *executor.workers.lock(),
            vec!["a--1--0", "b--1--0", "a--2--0", "b--2--0"]
        );
        assert!(dirs.results.is_dir());
    }

    #[test]
    fn interrupted_sweep_submits_nothing() {
        let (_root, dirs, config) = sweep_setup(&["a.mps"]);
        let executor = InstantBarrier::default();
        let submitter = Submitter::new(&executor, &config.scheduler, false);
        let cancel = CancelToken::new();
        cancel.cancel();
        let barrier = Barrier::new(
            &submitter,
            &config.barrier,
            sentinel_command(&config.barrier).unwrap(),
            cancel,
        );

        assert!(matches!(
            run_sweep(&config, &submitter, &barrier, &dirs, &[]),
            Err(SweepError::Barrier(BarrierError::Cancelled))
        ));
        assert!(executor.workers.lock().is_empty());
    }
}
