//! Conversion pipeline: strategies, the fallback chain, progress reporting
//! and the job controller that ties them to a caller's upload.

pub mod chain;
pub mod controller;
pub mod progress;
pub mod strategy;

pub use chain::{ChainSuccess, StrategyChain};
pub use controller::{
    start_sweep_task, ConversionJob, JobController, JobHandle, JobOutcome, SubmitRequest,
    SweepSummary,
};
pub use progress::{AttemptSink, ProgressReporter, ProgressSnapshot};
pub use strategy::{canonical_chain, chain_from_config, TranscodeStrategy};
