
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

/// extension of the result records written by the worker
pub const RECORD_EXTENSION: &str = "yml";
/// extension of solution files written/read by the worker
pub const SOLUTION_EXTENSION: &str = "sol";

const SEED_SEPARATOR: &str = "__seed__";
const PERMUTE_SEPARATOR: &str = "__permute__";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to access result record {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse result record {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Result record {0:?} already exists")]
    AlreadyExists(PathBuf),
}

/// Composite key of a single solver run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub instance: String,
    pub seed: u64,
    pub permutation: u64,
}

impl RecordKey {
    pub fn new(instance: impl Into<String>, seed: u64, permutation: u64) -> Self {
        Self {
            instance: instance.into(),
            seed,
            permutation,
        }
    }

    /// file name of this key for the given extension, e.g. `air03__seed__1__permute__0.yml`
    pub fn file_name(&self, extension: &str) -> String {
        format!(
            "{}{SEED_SEPARATOR}{}{PERMUTE_SEPARATOR}{}.{extension}",
            self.instance, self.seed, self.permutation
        )
    }

    pub fn path(&self, parent: &Path, extension: &str) -> PathBuf {
        parent.join(self.file_name(extension))
    }

    /// Inverse of `file_name`, returns `None` for names not produced by it.
    ///
    /// The separators are searched from the right, so instance names may themselves contain
    /// `__seed__` without breaking the round trip.
    pub fn from_file_name(name: &str, extension: &str) -> Option<Self> {
        let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
        let (rest, permutation) = stem.rsplit_once(PERMUTE_SEPARATOR)?;
        let (instance, seed) = rest.rsplit_once(SEED_SEPARATOR)?;

        if instance.is_empty() || !is_decimal(seed) || !is_decimal(permutation) {
            return None;
        }

        Some(Self {
            instance: instance.to_owned(),
            seed: seed.parse().ok()?,
            permutation: permutation.parse().ok()?,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}--{}", self.instance, self.seed, self.permutation)
    }
}

// only canonical decimals, so "01" and "1" can never name the same key
fn is_decimal(value: &str) -> bool {
    !value.is_empty()
        && value.bytes().all(|byte| byte.is_ascii_digit())
        && (value == "0" || !value.starts_with('0'))
}

/// Termination status reported by the solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveStatus {
    Optimal,
    #[serde(alias = "time-limit")]
    TimeLimit,
    #[serde(alias = "node-limit")]
    NodeLimit,
    #[serde(alias = "memory-limit", alias = "memorylimit")]
    MemLimit,
    Infeasible,
    #[serde(other)]
    Other,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Optimal => "optimal",
            Self::TimeLimit => "timelimit",
            Self::NodeLimit => "nodelimit",
            Self::MemLimit => "memlimit",
            Self::Infeasible => "infeasible",
            Self::Other => "other",
        };

        f.write_str(name)
    }
}

/// Result of a single worker run, as written by the worker into the results directory.
/// Fields the worker did not write are `None`, unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: SolveStatus,
    #[serde(default)]
    pub num_nodes: Option<u64>,
    #[serde(default)]
    pub solve_time: Option<f64>,
    #[serde(default)]
    pub presolve_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cuts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primal_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dual_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primal_dual_difference: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primal_dual_integral: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_lp_iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_total_lp_iterations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sepa_rounds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<f64>,
}

impl ResultRecord {
    /// record with only the fields relevant for screening set
    pub fn screening(
        status: SolveStatus,
        num_nodes: u64,
        solve_time: f64,
        presolve_time: f64,
    ) -> Self {
        Self {
            status,
            num_nodes: Some(num_nodes),
            solve_time: Some(solve_time),
            presolve_time: Some(presolve_time),
            num_cuts: None,
            primal_bound: None,
            dual_bound: None,
            gap: None,
            primal_dual_difference: None,
            primal_dual_integral: None,
            num_lp_iterations: None,
            num_total_lp_iterations: None,
            num_sepa_rounds: None,
            num_runs: None,
        }
    }
}

/// Directory of result records addressed by `RecordKey`
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &RecordKey) -> PathBuf {
        key.path(&self.dir, RECORD_EXTENSION)
    }

    /// Load the record for `key`, `Ok(None)` if the worker never wrote one
    pub fn load(&self, key: &RecordKey) -> Result<Option<ResultRecord>, RecordError> {
        let path = self.path(key);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                trace!(key = %key, "No result record found");

                return Ok(None);
            }
            Err(source) => return Err(RecordError::Io { path, source }),
        };

        serde_yaml::from_reader(file)
            .map(Some)
            .map_err(|source| RecordError::Parse { path, source })
    }

    /// Write the record for `key`. Records are written exactly once, an existing record is
    /// never overwritten.
    ///
    /// This is the worker side of the store: the controller itself only reads records, the
    /// write path serves in-process workers such as the scheduler doubles of the tests.
    pub fn store(&self, key: &RecordKey, record: &ResultRecord) -> Result<PathBuf, RecordError> {
        let path = self.path(key);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(RecordError::AlreadyExists(path));
            }
            Err(source) => return Err(RecordError::Io { path, source }),
        };

        let content = serde_yaml::to_string(record).map_err(|source| RecordError::Parse {
            path: path.clone(),
            source,
        })?;

        file.write_all(content.as_bytes())
            .map_err(|source| RecordError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(key = %key, path = ?path, "Stored result record");

        Ok(path)
    }
}

/// path of the solution file belonging to `instance` in `dir`
pub fn solution_path(dir: &Path, instance: &str) -> PathBuf {
    dir.join(format!("{instance}.{SOLUTION_EXTENSION}"))
}
