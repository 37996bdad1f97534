use crate::{
    config::ScreeningConfig,
    records::{ResultRecord, SolveStatus},
};
use std::fmt;

/// A single threshold check on a result record
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    StatusIs(SolveStatus),
    NodesWithin { min: u64, max: u64 },
    SolveTimeAtLeast(f64),
    PresolveTimeAtMost(f64),
}

impl Check {
    /// a missing field never passes
    pub fn passes(&self, record: &ResultRecord) -> bool {
        match *self {
            Self::StatusIs(status) => record.status == status,
            Self::NodesWithin { min, max } => record
                .num_nodes
                .map_or(false, |nodes| (min..=max).contains(&nodes)),
            Self::SolveTimeAtLeast(min) => record.solve_time.map_or(false, |time| time >= min),
            Self::PresolveTimeAtMost(max) => {
                record.presolve_time.map_or(false, |time| time <= max)
            }
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusIs(status) => write!(f, "status == {status}"),
            Self::NodesWithin { min, max } => write!(f, "{min} <= num_nodes <= {max}"),
            Self::SolveTimeAtLeast(min) => write!(f, "solve_time >= {min}"),
            Self::PresolveTimeAtMost(max) => write!(f, "presolve_time <= {max}"),
        }
    }
}

/// Conjunction of checks, the empty predicate accepts every record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    checks: Vec<Check>,
}

impl Predicate {
    pub fn new(checks: Vec<Check>) -> Self {
        Self { checks }
    }

    /// instances solved to optimality with a reasonable tree size and solve time
    pub fn screening(config: &ScreeningConfig) -> Self {
        Self::new(vec![
            Check::StatusIs(SolveStatus::Optimal),
            Check::NodesWithin {
                min: config.min_nodes,
                max: config.max_nodes,
            },
            Check::SolveTimeAtLeast(config.min_solve_time),
            Check::PresolveTimeAtMost(config.max_presolve_time),
        ])
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// all checks the record fails
    pub fn violations(&self, record: &ResultRecord) -> Vec<Check> {
        self.checks
            .iter()
            .filter(|check| !check.passes(record))
            .cloned()
            .collect()
    }

    pub fn verdict(&self, record: Option<&ResultRecord>) -> Verdict {
        match record {
            None => Verdict::Excluded(Exclusion::MissingResult),
            Some(record) => {
                let violations = self.violations(record);

                if violations.is_empty() {
                    Verdict::Survives
                } else {
                    Verdict::Excluded(Exclusion::FilterViolation(violations))
                }
            }
        }
    }
}

/// Why a candidate did not survive a phase. Neither is an error of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    /// the worker never produced a readable record (crash, hard time limit, ...)
    MissingResult,
    FilterViolation(Vec<Check>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Survives,
    Excluded(Exclusion),
}

/// Split `candidates` by the verdict on their record, keeping the original order.
/// Pure function of its inputs.
pub fn apply<T: Clone>(
    predicate: &Predicate,
    candidates: &[(T, Option<ResultRecord>)],
) -> (Vec<T>, Vec<(T, Exclusion)>) {
    let mut survivors = Vec::new();
    let mut excluded = Vec::new();

    for (candidate, record) in candidates {
        match predicate.verdict(record.as_ref()) {
            Verdict::Survives => survivors.push(candidate.clone()),
            Verdict::Excluded(exclusion) => excluded.push((candidate.clone(), exclusion)),
        }
    }

    (survivors, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SolveStatus, nodes: u64, solve_time: f64, presolve_time: f64) -> ResultRecord {
        ResultRecord::screening(status, nodes, solve_time, presolve_time)
    }

    #[test]
    fn screening_boundaries_are_inclusive() {
        let predicate = Predicate::screening(&ScreeningConfig::default());

        assert_eq!(
            predicate.verdict(Some(&record(SolveStatus::Optimal, 50, 5.0, 10.0))),
            Verdict::Survives
        );
        assert_eq!(
            predicate.verdict(Some(&record(SolveStatus::Optimal, 20000, 119.0, 0.0))),
            Verdict::Survives
        );
    }

    #[test]
    fn every_violation_is_reported() {
        let predicate = Predicate::screening(&ScreeningConfig::default());

        assert_eq!(
            predicate.verdict(Some(&record(SolveStatus::TimeLimit, 20001, 4.9, 10.5))),
            Verdict::Excluded(Exclusion::FilterViolation(predicate.checks().to_vec()))
        );
    }

    #[test]
    fn missing_fields_fail_their_check() {
        let predicate = Predicate::screening(&ScreeningConfig::default());
        let mut incomplete = record(SolveStatus::Optimal, 100, 6.0, 1.0);
        incomplete.num_nodes = None;

        assert_eq!(
            predicate.violations(&incomplete),
            vec![Check::NodesWithin {
                min: 50,
                max: 20000
            }]
        );
    }

    #[test]
    fn missing_record_is_excluded() {
        assert_eq!(
            Predicate::default().verdict(None),
            Verdict::Excluded(Exclusion::MissingResult)
        );
    }

    #[test]
    fn apply_keeps_order_and_is_deterministic() {
        let predicate = Predicate::screening(&ScreeningConfig::default());
        let candidates = vec![
            ("e", Some(record(SolveStatus::Optimal, 60, 6.0, 0.1))),
            ("d", Some(record(SolveStatus::TimeLimit, 60, 120.0, 0.1))),
            ("c", None),
            ("b", Some(record(SolveStatus::Optimal, 15000, 30.0, 2.0))),
            ("a", Some(record(SolveStatus::Optimal, 10, 30.0, 2.0))),
        ];

        let (survivors, excluded) = apply(&predicate, &candidates);

        assert_eq!(survivors, vec!["e", "b"]);
        assert_eq!(
            excluded.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            vec!["d", "c", "a"]
        );
        assert_eq!(apply(&predicate, &candidates).0, survivors);
    }
}
