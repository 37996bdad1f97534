use crate::{
    executors::Executor,
    instances::Candidate,
    phase::{Phase, PhaseContext, PhaseError, PhaseKind, PhaseReport},
    workspace::{clear_dir, copy_into, WorkspaceError},
};
use itertools::Itertools;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase {kind} failed: {source}")]
    Phase { kind: PhaseKind, source: PhaseError },
    #[error("Failed to update the instance subset: {0}")]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone)]
pub struct ScreeningReport {
    pub selected: Vec<Candidate>,
    pub phases: Vec<PhaseReport>,
}

/// Chains the screening phases, feeding the survivors of one phase into the next
#[derive(Debug)]
pub struct Pipeline<'a, E> {
    context: &'a PhaseContext<'a, E>,
    subset_dir: PathBuf,
}

impl<'a, E: Executor> Pipeline<'a, E> {
    pub fn new(context: &'a PhaseContext<'a, E>, subset_dir: impl Into<PathBuf>) -> Self {
        Self {
            context,
            subset_dir: subset_dir.into(),
        }
    }

    #[instrument(skip_all, fields(instances = instances.len()), level = "info")]
    pub fn run(&self, instances: Vec<Candidate>) -> Result<ScreeningReport, PipelineError> {
        // solutions are generated by the pipeline itself
        clear_dir(&self.context.dirs.solutions)?;

        let total = instances.len();
        let mut candidates = instances;
        let mut phases = Vec::with_capacity(PhaseKind::ALL.len());

        for kind in PhaseKind::ALL {
            let mut phase = Phase::new(kind, self.context);
            let outcome = phase
                .run(&candidates)
                .map_err(|source| PipelineError::Phase { kind, source })?;

            if kind.filters() {
                self.publish(&outcome.survivors)?;
            }

            candidates = outcome.survivors;
            phases.push(outcome.report);
        }

        info!(
            "Selected {} of {} instances: {}",
            candidates.len(),
            total,
            candidates.iter().map(|candidate| &candidate.instance).join(", ")
        );

        Ok(ScreeningReport {
            selected: candidates,
            phases,
        })
    }

    /// replace the content of the subset directory by the given candidates
    fn publish(&self, candidates: &[Candidate]) -> Result<(), WorkspaceError> {
        clear_dir(&self.subset_dir)?;

        let paths = candidates
            .iter()
            .map(|candidate| candidate.path.clone())
            .collect_vec();

        copy_into(&paths, &self.subset_dir)
    }
}
