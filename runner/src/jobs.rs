use itertools::Itertools;
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

/// Token the scheduler prints in front of the id of a freshly submitted job
pub const ACKNOWLEDGMENT_TOKEN: &str = "Submitted batch job";

/// Placeholder in output paths that the scheduler replaces with the job id
pub const JOB_ID_PLACEHOLDER: &str = "%j";

/// Opaque id of a job accepted by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recover the job handle from the first line of the scheduler acknowledgment.
/// Anything but `Submitted batch job <id>` on the first line is rejected.
pub fn parse_acknowledgment(output: &str) -> Option<JobHandle> {
    let line = output.lines().next()?.trim();
    let (_, id) = line.split_once(ACKNOWLEDGMENT_TOKEN)?;
    let id = id.trim();

    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    id.parse().ok().map(JobHandle)
}

/// Jobs that have to reach a terminal state (successful or not) before a dependent job runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet(BTreeSet<JobHandle>);

impl DependencySet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobHandle> {
        self.0.iter()
    }

    /// `afterany:1:2:3`, `None` if there is nothing to wait for
    pub fn afterany_clause(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(format!("afterany:{}", self.0.iter().map(JobHandle::id).join(":")))
        }
    }
}

impl FromIterator<JobHandle> for DependencySet {
    fn from_iter<T: IntoIterator<Item = JobHandle>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a JobHandle> for DependencySet {
    fn from_iter<T: IntoIterator<Item = &'a JobHandle>>(iter: T) -> Self {
        Self(iter.into_iter().copied().collect())
    }
}

/// Program and ordered argument vector of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl JobCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A single unit of work handed to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    name: String,
    command: JobCommand,
    time_limit: u64,
    memory: Option<u64>,
    output: PathBuf,
}

impl WorkItem {
    /// `time_limit` is the wall-clock budget in seconds, `memory` the ceiling in MB
    pub fn new(
        name: impl Into<String>,
        command: JobCommand,
        time_limit: u64,
        memory: Option<u64>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            time_limit,
            memory,
            output: output.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    pub fn time_limit(&self) -> u64 {
        self.time_limit
    }

    pub fn memory(&self) -> Option<u64> {
        self.memory
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

/// Resource settings passed through to the scheduler untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpus_per_task: u32,
    pub exclusive: bool,
    pub constraint: Option<String>,
    pub account: Option<String>,
    pub partition: Option<String>,
}

/// Everything the scheduler needs to accept a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub item: WorkItem,
    pub resources: Resources,
    pub dependencies: DependencySet,
}

/// Expand the job id placeholder of an output path
pub fn expand_output_path(path: &Path, handle: JobHandle) -> PathBuf {
    let raw = path.to_string_lossy();

    if raw.contains(JOB_ID_PLACEHOLDER) {
        PathBuf::from(raw.replace(JOB_ID_PLACEHOLDER, &handle.to_string()))
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledgment_is_parsed() {
        assert_eq!(
            parse_acknowledgment("Submitted batch job 4242\n"),
            Some(JobHandle::new(4242))
        );
        assert_eq!(
            parse_acknowledgment("Submitted batch job 17 on cluster main\n"),
            None
        );
    }

    #[test]
    fn only_first_line_counts() {
        assert_eq!(
            parse_acknowledgment("sbatch: warning: foo\nSubmitted batch job 1\n"),
            None
        );
        assert_eq!(parse_acknowledgment(""), None);
        assert_eq!(parse_acknowledgment("Submitted batch job \n"), None);
    }

    #[test]
    fn empty_dependencies_have_no_clause() {
        assert_eq!(DependencySet::none().afterany_clause(), None);
    }

    #[test]
    fn dependencies_are_joined() {
        let deps: DependencySet = [JobHandle::new(12), JobHandle::new(3), JobHandle::new(12)]
            .into_iter()
            .collect();

        assert_eq!(deps.len(), 2);
        assert_eq!(deps.afterany_clause().as_deref(), Some("afterany:3:12"));
    }

    #[test]
    fn output_placeholder_expansion() {
        assert_eq!(
            expand_output_path(Path::new("/out/%j__air03__0__0.out"), JobHandle::new(99)),
            Path::new("/out/99__air03__0__0.out")
        );
        assert_eq!(
            expand_output_path(Path::new("/out/barrier.out"), JobHandle::new(99)),
            Path::new("/out/barrier.out")
        );
    }
}
