//! Screening of optimization instances through an external batch scheduler.
//!
//! Work is handed to the scheduler as independent jobs, a sentinel job depending on all of
//! them signals completion through a marker file and the result records written by the
//! workers decide which instances survive into the next phase.

pub mod barrier;
pub mod config;
pub mod executors;
pub mod filter;
pub mod instances;
pub mod jobs;
pub mod phase;
pub mod pipeline;
pub mod records;
pub mod submit;
pub mod sweep;
pub mod worker;
pub mod workspace;
