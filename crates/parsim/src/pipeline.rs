//! Pipeline execution: a homogeneous ordered list of stages sharing one
//! borrowed store, run to the first failure.

use crate::{db::EventStore, error::PipelineError};
use thiserror::Error as ThisError;
use tracing::{debug, error};

///
/// Transformer
///
/// One pipeline stage. Stages never catch or retry internally; every
/// failure propagates to the driver, the only layer allowed to decide
/// between aborting and continuing the batch.
///

pub trait Transformer {
    /// Stage name used in failure reports.
    fn name(&self) -> &str;

    /// Run the stage against the borrowed store.
    fn execute(&mut self, store: &EventStore) -> Result<(), PipelineError>;
}

///
/// StageFailure
/// Which stage failed, and with which error class.
///

#[derive(Debug, ThisError)]
#[error("pipeline stage {index} ({stage}) failed: {source}")]
pub struct StageFailure {
    pub index: usize,
    pub stage: String,
    pub source: PipelineError,
}

/// Execute `stages` in order against `store`, stopping at the first
/// failure. No partial-step retry.
pub fn run_pipeline(
    store: &EventStore,
    stages: &mut [Box<dyn Transformer>],
) -> Result<(), StageFailure> {
    for (index, stage) in stages.iter_mut().enumerate() {
        debug!(index, stage = stage.name(), "pipeline stage starting");
        if let Err(source) = stage.execute(store) {
            error!(
                index,
                stage = stage.name(),
                class = %source.class(),
                "pipeline stage failed"
            );
            return Err(StageFailure {
                index,
                stage: stage.name().to_owned(),
                source,
            });
        }
    }

    Ok(())
}

///
/// TESTS
///
