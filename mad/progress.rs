use core::ops::ControlFlow;
use ndarray::ArrayView1;
use std::fmt;

use super::fit::FitState;

/// Stages reported while fitting the IR-MAD transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitProgressStage {
    Statistics,
    CanonicalSolve,
}

impl FitProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Statistics => "weighted statistics pass",
            Self::CanonicalSolve => "canonical correlation solve",
        }
    }
}

impl fmt::Display for FitProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Per-cycle summary handed to [`FitProgressObserver::on_iteration`].
#[derive(Clone, Debug)]
pub struct IterationReport<'a> {
    /// Zero-based cycle index.
    pub iteration: usize,
    pub rho: ArrayView1<'a, f64>,
    pub delta: f64,
    pub pixels: usize,
    pub weight_sum: f64,
}

/// Observer for reporting incremental progress while fitting.
///
/// Returning [`ControlFlow::Break`] from `on_iteration` aborts the run at the
/// cycle boundary.
pub trait FitProgressObserver {
    fn on_stage_start(&mut self, stage: FitProgressStage, total_pixels: usize) {
        let _ = (stage, total_pixels);
    }
    fn on_stage_advance(&mut self, stage: FitProgressStage, processed_pixels: usize) {
        let _ = (stage, processed_pixels);
    }
    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        let _ = stage;
    }
    fn on_state(&mut self, state: FitState) {
        let _ = state;
    }
    fn on_iteration(&mut self, report: &IterationReport<'_>) -> ControlFlow<()> {
        let _ = report;
        ControlFlow::Continue(())
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}

/// Stages reported during the output pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformProgressStage {
    Transform,
}

impl TransformProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Transform => "MAD variate computation",
        }
    }
}

impl fmt::Display for TransformProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress during the output pass.
pub trait TransformProgressObserver {
    fn on_stage_start(&mut self, stage: TransformProgressStage, total_pixels: usize) {
        let _ = (stage, total_pixels);
    }
    fn on_stage_advance(&mut self, stage: TransformProgressStage, processed_pixels: usize) {
        let _ = (stage, processed_pixels);
    }
    fn on_stage_finish(&mut self, stage: TransformProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopTransformProgress;

impl TransformProgressObserver for NoopTransformProgress {}
