use crate::{
    instances::Candidate,
    jobs::{JobCommand, WorkItem},
    records::RecordKey,
};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Positional value the worker reads as "no path"
const NO_PATH: &str = "None";

fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// One invocation of the solve-and-record worker
#[derive(Debug, Clone)]
pub struct WorkerRun<'a> {
    pub candidate: &'a Candidate,
    pub seed: u64,
    pub permutation: u64,
    /// solver time limit in seconds, the job itself gets twice as much
    pub time_limit: u64,
    pub print_stats: bool,
    pub write_solution: Option<PathBuf>,
    pub load_solution: Option<PathBuf>,
    pub default_configuration: bool,
    pub params: &'a [String],
}

impl<'a> WorkerRun<'a> {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.candidate.instance, self.seed, self.permutation)
    }

    /// `results_dir instance_path instance seed permutation time_limit print_stats
    /// write_solution load_solution default_configuration params...`
    pub fn args(&self, results_dir: &Path) -> Vec<OsString> {
        let path_or_none = |path: &Option<PathBuf>| {
            path.as_ref()
                .map_or_else(|| OsString::from(NO_PATH), |path| path.as_os_str().to_owned())
        };

        let mut args: Vec<OsString> = vec![
            results_dir.as_os_str().to_owned(),
            self.candidate.path.as_os_str().to_owned(),
            OsString::from(&self.candidate.instance),
            self.seed.to_string().into(),
            self.permutation.to_string().into(),
            self.time_limit.to_string().into(),
            python_bool(self.print_stats).into(),
            path_or_none(&self.write_solution),
            path_or_none(&self.load_solution),
            python_bool(self.default_configuration).into(),
        ];
        args.extend(self.params.iter().map(OsString::from));

        args
    }

    /// Work item named `{instance}--{seed}--{permutation}` with its output in
    /// `{outfiles_dir}/%j__{instance}__{seed}__{permutation}.out`
    pub fn work_item(
        &self,
        exec: &Path,
        results_dir: &Path,
        outfiles_dir: &Path,
        memory: Option<u64>,
    ) -> WorkItem {
        let key = self.key();
        let output = outfiles_dir.join(format!(
            "%j__{}__{}__{}.out",
            key.instance, key.seed, key.permutation
        ));

        WorkItem::new(
            key.to_string(),
            JobCommand::new(exec).args(self.args(results_dir)),
            self.time_limit.saturating_mul(2),
            memory,
            output,
        )
    }
}
