use crate::jobs::Resources;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// Upper bound for job time limits accepted by the submitter, in seconds
pub const MAX_TIME_LIMIT: u64 = 100_000_000;
/// Longest accepted barrier poll interval, in seconds
pub const MAX_POLL_INTERVAL: u64 = 86_400;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file: {0}")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse config file: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Failed to load executor: {0}")]
    FailedLoadExecutor(#[from] crate::executors::ExecutorError),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Preflight checks failed")]
    PreflightFailed,
}

/// Complete configuration of a screening run, loaded once and passed by reference
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub barrier: BarrierConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub screening: ScreeningConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // Name of the selected executor, see `Executors::load` for the selection process
    #[serde(default = "default_executor")]
    pub name: String,
    #[serde(default = "default_sbatch")]
    pub sbatch: PathBuf,
    #[serde(default = "default_scancel")]
    pub scancel: PathBuf,
    // only used by the local executor, defaults to the number of cpus
    pub threads: Option<usize>,
    #[serde(default = "default_max_time_limit")]
    pub max_time_limit: u64,
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    // node list constraint, e.g. `Xeon&Gold6342`
    pub constraint: Option<String>,
    #[serde(default = "default_shared_profile")]
    pub shared: ResourceProfile,
    #[serde(default = "default_exclusive_profile")]
    pub exclusive: ResourceProfile,
}

/// Account, partition and memory ceiling (MB) of one class of jobs
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfile {
    pub memory: Option<u64>,
    pub account: Option<String>,
    pub partition: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BarrierConfig {
    // seconds between two checks for the marker file
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    // hard ceiling in seconds, wait forever if unset
    #[serde(default)]
    pub timeout: Option<u64>,
    // time limit of the sentinel job in seconds
    #[serde(default = "default_sentinel_time_limit")]
    pub time_limit: u64,
    // program writing the marker, defaults to this binary's `sentinel` subcommand
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    pub exec: PathBuf,
    // leading arguments, the marker path is appended
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub exec: PathBuf,
    // tuning parameters appended after the fixed positional arguments
    #[serde(default = "default_worker_params")]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScreeningConfig {
    #[serde(default = "default_instance_glob")]
    pub instance_glob: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub permutation: u64,
    #[serde(default = "default_screening_time_limit")]
    pub time_limit_without_solution: u64,
    #[serde(default = "default_screening_time_limit")]
    pub time_limit_with_solution: u64,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: u64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u64,
    #[serde(default = "default_min_solve_time")]
    pub min_solve_time: f64,
    #[serde(default = "default_max_presolve_time")]
    pub max_presolve_time: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    // instance files of the sweep directory
    #[serde(default = "default_instance_glob")]
    pub instance_glob: String,
    #[serde(default = "default_sweep_time_limit")]
    pub time_limit: u64,
    #[serde(default = "default_random_seeds")]
    pub random_seeds: Vec<u64>,
    #[serde(default = "default_permutation_seeds")]
    pub permutation_seeds: Vec<u64>,
    #[serde(default = "default_solution_extension")]
    pub solution_extension: String,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: None,
            time_limit: default_sentinel_time_limit(),
            sentinel: None,
        }
    }
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            instance_glob: default_instance_glob(),
            seed: 0,
            permutation: 0,
            time_limit_without_solution: default_screening_time_limit(),
            time_limit_with_solution: default_screening_time_limit(),
            min_nodes: default_min_nodes(),
            max_nodes: default_max_nodes(),
            min_solve_time: default_min_solve_time(),
            max_presolve_time: default_max_presolve_time(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            instance_glob: default_instance_glob(),
            time_limit: default_sweep_time_limit(),
            random_seeds: default_random_seeds(),
            permutation_seeds: default_permutation_seeds(),
            solution_extension: default_solution_extension(),
        }
    }
}

impl SchedulerConfig {
    /// default settings for the given executor
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sbatch: default_sbatch(),
            scancel: default_scancel(),
            threads: None,
            max_time_limit: default_max_time_limit(),
            cpus_per_task: default_cpus_per_task(),
            constraint: None,
            shared: default_shared_profile(),
            exclusive: default_exclusive_profile(),
        }
    }

    /// resources of a job in the shared (`--ntasks=1`) or exclusive class
    pub fn resources(&self, exclusive: bool) -> (Resources, Option<u64>) {
        let profile = if exclusive {
            &self.exclusive
        } else {
            &self.shared
        };

        (
            Resources {
                cpus_per_task: self.cpus_per_task,
                exclusive,
                constraint: self.constraint.clone(),
                account: profile.account.clone(),
                partition: profile.partition.clone(),
            },
            profile.memory,
        )
    }
}

impl BarrierConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::ReadConfig)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the whole configuration and log every problem found.
    /// Returns `true` if the configuration contains an error.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.scheduler.name = self.scheduler.name.to_lowercase();

        match self.scheduler.name.as_str() {
            "slurm" | "local" => {}
            name => {
                error!("scheduler.name ({name}) is not supported, please use `slurm` or `local`");
                contains_error = true;
            }
        }

        if self.scheduler.threads == Some(0) {
            error!("scheduler.threads cannot be 0");
            contains_error = true;
        }

        if self.scheduler.cpus_per_task == 0 {
            error!("scheduler.cpus_per_task cannot be 0");
            contains_error = true;
        }

        contains_error |= !executable_or_log("worker.exec", &self.worker.exec);

        if let Some(ref sentinel) = self.barrier.sentinel {
            contains_error |= !executable_or_log("barrier.sentinel.exec", &sentinel.exec);
        }

        if self.barrier.poll_interval > MAX_POLL_INTERVAL {
            error!(
                "barrier.poll_interval ({}s) exceeds {MAX_POLL_INTERVAL}s",
                self.barrier.poll_interval
            );
            contains_error = true;
        }

        if self.barrier.poll_interval == 0 {
            warn!("barrier.poll_interval is 0, the barrier will busy-poll the file system");
        }

        if let Some(timeout) = self.barrier.timeout {
            if timeout < self.barrier.poll_interval {
                warn!("barrier.timeout ({timeout}s) is shorter than barrier.poll_interval, every barrier will time out");
            }
        }

        for (name, limit) in [
            ("barrier.time_limit", self.barrier.time_limit),
            ("sweep.time_limit", self.sweep.time_limit.saturating_mul(2)),
            (
                "screening.time_limit_without_solution",
                self.screening.time_limit_without_solution.saturating_mul(2),
            ),
            (
                "screening.time_limit_with_solution",
                self.screening.time_limit_with_solution.saturating_mul(2),
            ),
        ] {
            if limit > self.scheduler.max_time_limit {
                error!(
                    "{name} leads to a job time limit of {limit}s which exceeds scheduler.max_time_limit ({}s)",
                    self.scheduler.max_time_limit
                );
                contains_error = true;
            }
        }

        if self.screening.time_limit_without_solution == 0
            || self.screening.time_limit_with_solution == 0
        {
            error!("screening time limits cannot be 0");
            contains_error = true;
        }

        if self.screening.min_nodes > self.screening.max_nodes {
            error!(
                "screening.min_nodes ({}) is larger than screening.max_nodes ({})",
                self.screening.min_nodes, self.screening.max_nodes
            );
            contains_error = true;
        }

        for (name, glob) in [
            ("screening.instance_glob", &self.screening.instance_glob),
            ("sweep.instance_glob", &self.sweep.instance_glob),
        ] {
            if let Err(e) = globset::Glob::new(glob) {
                error!("{name} is invalid: {e}");
                contains_error = true;
            }
        }

        if self.sweep.random_seeds.is_empty() || self.sweep.permutation_seeds.is_empty() {
            warn!("sweep has no random or permutation seeds, a sweep will not submit any job");
        }

        contains_error
    }
}

fn executable_or_log(name: &str, path: &Path) -> bool {
    match check_executable(path) {
        Ok(true) => true,
        Ok(false) => {
            error!(
                "{name} target {} is not executable",
                path.to_string_lossy()
            );
            false
        }
        Err(e) => {
            error!(
                "Failed to determine if {name} ({}) is an executable: {e}",
                path.to_string_lossy()
            );
            false
        }
    }
}

fn default_executor() -> String {
    String::from("slurm")
}

fn default_sbatch() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_scancel() -> PathBuf {
    PathBuf::from("scancel")
}

fn default_max_time_limit() -> u64 {
    MAX_TIME_LIMIT
}

fn default_cpus_per_task() -> u32 {
    1
}

fn default_shared_profile() -> ResourceProfile {
    ResourceProfile {
        memory: Some(2000),
        account: None,
        partition: None,
    }
}

fn default_exclusive_profile() -> ResourceProfile {
    ResourceProfile {
        memory: Some(90000),
        account: None,
        partition: None,
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_sentinel_time_limit() -> u64 {
    10
}

/// tuning parameters of the worker when screening with its default configuration
pub fn default_worker_params() -> Vec<String> {
    [
        "0.0", "0.0", "0.0", "0.0", "0.0", "0.0", "0.0", "1.0", "1", "1", "1.0", "0.2", "0.4",
        "False", "True", "False", "False",
    ]
    .map(String::from)
    .to_vec()
}

fn default_instance_glob() -> String {
    String::from("*.mps*")
}

fn default_screening_time_limit() -> u64 {
    120
}

fn default_min_nodes() -> u64 {
    50
}

fn default_max_nodes() -> u64 {
    20000
}

fn default_min_solve_time() -> f64 {
    5.0
}

fn default_max_presolve_time() -> f64 {
    10.0
}

fn default_sweep_time_limit() -> u64 {
    7200
}

fn default_random_seeds() -> Vec<u64> {
    vec![1, 2, 3, 4, 5]
}

fn default_permutation_seeds() -> Vec<u64> {
    vec![0]
}

fn default_solution_extension() -> String {
    String::from("sol.gz")
}
