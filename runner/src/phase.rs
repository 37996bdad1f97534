use crate::{
    barrier::{Barrier, BarrierError},
    config::PipelineConfig,
    executors::Executor,
    filter::{self, Exclusion, Predicate},
    instances::Candidate,
    jobs::JobHandle,
    records::{solution_path, RecordStore},
    submit::{SubmissionError, Submitter},
    worker::WorkerRun,
    workspace::{clear_dir, WorkspaceError},
};
use std::{fmt, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("Failed to submit job: {0}")]
    Submission(#[from] SubmissionError),
    #[error("Failed to wait for jobs: {0}")]
    Barrier(#[from] BarrierError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Submitting,
    BarrierWait,
    Collecting,
    Filtering,
    Done,
}

/// The three screening phases, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// solve without any known solution and filter
    Probe,
    /// solve again and let the worker write its best solution, nothing is filtered
    RecordSolution,
    /// solve with the recorded solution loaded and filter
    ProbeWithSolution,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [Self::Probe, Self::RecordSolution, Self::ProbeWithSolution];

    pub fn filters(&self) -> bool {
        !matches!(self, Self::RecordSolution)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Probe => "probe",
            Self::RecordSolution => "record-solution",
            Self::ProbeWithSolution => "probe-with-solution",
        })
    }
}

/// Directories a phase works in, owned by a single pipeline run
#[derive(Debug, Clone)]
pub struct PhaseDirs {
    pub results: PathBuf,
    pub outfiles: PathBuf,
    pub solutions: PathBuf,
}

/// Everything shared between the phases of a pipeline run
#[derive(Debug)]
pub struct PhaseContext<'a, E> {
    pub config: &'a PipelineConfig,
    pub submitter: &'a Submitter<E>,
    pub barrier: &'a Barrier<'a, E>,
    pub dirs: &'a PhaseDirs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub kind: PhaseKind,
    pub submitted: usize,
    pub survivors: usize,
    /// candidates without a (readable) result record
    pub missing: usize,
    /// candidates whose record failed the predicate
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub survivors: Vec<Candidate>,
    pub excluded: Vec<(Candidate, Exclusion)>,
    pub report: PhaseReport,
}

/// One submit → barrier → collect → filter cycle over a candidate set
#[derive(Debug)]
pub struct Phase<'a, E> {
    kind: PhaseKind,
    context: &'a PhaseContext<'a, E>,
    state: PhaseState,
}

impl<'a, E: Executor> Phase<'a, E> {
    pub fn new(kind: PhaseKind, context: &'a PhaseContext<'a, E>) -> Self {
        Self {
            kind,
            context,
            state: PhaseState::Idle,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    fn transition(&mut self, next: PhaseState) {
        debug!(phase = %self.kind, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn predicate(&self) -> Option<Predicate> {
        self.kind
            .filters()
            .then(|| Predicate::screening(&self.context.config.screening))
    }

    fn worker_run<'c>(&self, candidate: &'c Candidate) -> WorkerRun<'c>
    where
        'a: 'c,
    {
        let screening = &self.context.config.screening;
        let solution = || solution_path(&self.context.dirs.solutions, &candidate.instance);

        let (time_limit, write_solution, load_solution) = match self.kind {
            PhaseKind::Probe => (screening.time_limit_without_solution, None, None),
            PhaseKind::RecordSolution => {
                (screening.time_limit_without_solution, Some(solution()), None)
            }
            PhaseKind::ProbeWithSolution => {
                (screening.time_limit_with_solution, None, Some(solution()))
            }
        };

        WorkerRun {
            candidate,
            seed: screening.seed,
            permutation: screening.permutation,
            time_limit,
            print_stats: true,
            write_solution,
            load_solution,
            default_configuration: true,
            params: &self.context.config.worker.params,
        }
    }

    /// Run the phase to completion. Missing or failing records only shrink the returned
    /// candidate set, errors are reserved for submission and barrier failures.
    #[instrument(skip_all, fields(phase = %self.kind, candidates = candidates.len()), level = "info")]
    pub fn run(&mut self, candidates: &[Candidate]) -> Result<PhaseOutcome, PhaseError> {
        let dirs = self.context.dirs;

        if self.context.barrier.is_cancelled() {
            return Err(self.context.barrier.abort(&[]).into());
        }

        // stale records of an earlier run must never be read as fresh results
        clear_dir(&dirs.results)?;
        clear_dir(&dirs.outfiles)?;
        self.transition(PhaseState::Submitting);

        let memory = self.context.submitter.memory();
        let mut handles: Vec<JobHandle> = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            // an interrupt must not wait for the remaining submissions
            if self.context.barrier.is_cancelled() {
                return Err(self.context.barrier.abort(&handles).into());
            }

            let item = self.worker_run(candidate).work_item(
                &self.context.config.worker.exec,
                &dirs.results,
                &dirs.outfiles,
                memory,
            );
            handles.push(self.context.submitter.submit(item, Default::default())?);
        }
        info!("Submitted {} jobs", handles.len());

        self.transition(PhaseState::BarrierWait);
        if handles.is_empty() {
            info!("Nothing to wait for");
        } else {
            self.context.barrier.await_all(&handles, &dirs.outfiles)?;
        }

        self.transition(PhaseState::Collecting);
        let store = RecordStore::new(&dirs.results);
        let collected = candidates
            .iter()
            .map(|candidate| {
                let key = self.worker_run(candidate).key();
                let record = match store.load(&key) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(key = %key, "Treating unreadable record as missing: {e}");
                        None
                    }
                };

                (candidate.clone(), record)
            })
            .collect::<Vec<_>>();

        self.transition(PhaseState::Filtering);
        let missing = collected
            .iter()
            .filter(|(_, record)| record.is_none())
            .count();
        let (survivors, excluded) = match self.predicate() {
            Some(predicate) => filter::apply(&predicate, &collected),
            None => {
                if missing > 0 {
                    warn!("{missing} runs did not produce a result record, passing all candidates on");
                }

                (candidates.to_vec(), Vec::new())
            }
        };

        for (candidate, exclusion) in excluded.iter() {
            debug!(instance = %candidate.instance, "Excluded: {exclusion:?}");
        }

        let report = PhaseReport {
            kind: self.kind,
            submitted: handles.len(),
            survivors: survivors.len(),
            missing,
            rejected: excluded.len().saturating_sub(missing),
        };

        info!(
            "Selected {} from {} instances ({} without result, {} rejected)",
            report.survivors,
            candidates.len(),
            report.missing,
            report.rejected
        );

        self.transition(PhaseState::Done);

        Ok(PhaseOutcome {
            survivors,
            excluded,
            report,
        })
    }
}
