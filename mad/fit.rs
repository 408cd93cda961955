//! The IR-MAD iteration controller.
//!
//! Every cycle streams the whole window through a fresh [`WeightedCovariance`],
//! solves the canonical problem on the resulting covariance and compares the
//! new canonical correlations with those of the previous cycle. From the
//! second cycle on, each pixel enters the statistics with its no-change
//! probability under the previous cycle's transform, which pulls the
//! estimate toward radiometrically invariant pixels.
//!
//! ```text
//! Initializing -> Accumulating -> Solving -> CheckConvergence
//!                      ^                           |
//!                      +---------------------------+--> Converged
//!                                                  +--> MaxIterExceeded
//! ```

use core::fmt;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, ShapeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use super::accumulate::{AccumulatorError, WeightedCovariance};
use super::canonical::{CanonicalError, CanonicalPair};
use super::progress::{FitProgressObserver, FitProgressStage, IterationReport, NoopFitProgress};
use super::source::{DEFAULT_BLOCK_PIXELS, PixelBlockSource, is_valid_pixel};
use super::transform::{MadTransform, NoChangeProbability};

pub const DEFAULT_MAX_ITERATIONS: usize = 50;
pub const DEFAULT_TOLERANCE: f64 = 1.0e-3;
/// Pixels per rayon task when reducing one block into partial statistics.
pub const DEFAULT_CHUNK_PIXELS: usize = 1_024;
const IDENTICAL_HALVES_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Error)]
pub enum MadError {
    #[error("reference image has {reference} selected bands but target image has {target}")]
    BandCountMismatch { reference: usize, target: usize },

    #[error(
        "iteration {iteration}: total weight {weight_sum:.6} from {pixels} valid pixels is too small to estimate the covariance"
    )]
    EmptyAccumulator {
        iteration: usize,
        weight_sum: f64,
        pixels: usize,
    },

    #[error("iteration {iteration}: {source}")]
    SingularCovariance {
        iteration: usize,
        #[source]
        source: CanonicalError,
    },

    #[error("iteration {iteration}: canonical solve failed: {source}")]
    Canonical {
        iteration: usize,
        #[source]
        source: CanonicalError,
    },

    #[error("statistics accumulation failed: {0}")]
    Accumulator(#[from] AccumulatorError),

    #[error("pixel block has an inconsistent shape: {0}")]
    Shape(#[from] ShapeError),

    #[error("pixel source error: {0}")]
    Source(Box<dyn Error + Send + Sync + 'static>),

    #[error("{0}")]
    InvalidInput(String),

    #[error("run aborted by the caller after iteration {iteration}")]
    Aborted { iteration: usize },
}

/// Tuning for [`IrMadModel::fit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IrMadOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub block_pixels: usize,
    pub chunk_pixels: usize,
}

impl Default for IrMadOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            block_pixels: DEFAULT_BLOCK_PIXELS,
            chunk_pixels: DEFAULT_CHUNK_PIXELS,
        }
    }
}

impl IrMadOptions {
    pub fn validate(&self) -> Result<(), MadError> {
        if self.max_iterations == 0 {
            return Err(MadError::InvalidInput(
                "max_iterations must be at least one".into(),
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(MadError::InvalidInput(format!(
                "tolerance must be a finite non-negative number, got {}",
                self.tolerance
            )));
        }
        if self.block_pixels == 0 || self.chunk_pixels == 0 {
            return Err(MadError::InvalidInput(
                "block_pixels and chunk_pixels must be at least one".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitState {
    Initializing,
    Accumulating,
    Solving,
    CheckConvergence,
    Converged,
    MaxIterExceeded,
}

impl fmt::Display for FitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Accumulating => "accumulating",
            Self::Solving => "solving",
            Self::CheckConvergence => "checking convergence",
            Self::Converged => "converged",
            Self::MaxIterExceeded => "iteration cap reached",
        };
        f.write_str(name)
    }
}

/// How a successful run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    MaxIterExceeded,
}

/// Fixed-point bookkeeping across cycles.
#[derive(Clone, Debug)]
pub struct ConvergenceState {
    iteration: usize,
    previous_rho: Array1<f64>,
    delta: f64,
    tolerance: f64,
    max_iterations: usize,
}

impl ConvergenceState {
    pub fn new(bands: usize, tolerance: f64, max_iterations: usize) -> Self {
        Self {
            iteration: 0,
            previous_rho: Array1::zeros(bands),
            delta: f64::INFINITY,
            tolerance,
            max_iterations,
        }
    }

    /// Records one cycle's correlations and returns `max_k |rho_k - rho_k,prev|`.
    pub fn record(&mut self, rho: ArrayView1<'_, f64>) -> f64 {
        self.delta = rho
            .iter()
            .zip(self.previous_rho.iter())
            .map(|(r, p)| (r - p).abs())
            .fold(0.0, f64::max);
        self.previous_rho.assign(&rho);
        self.iteration += 1;
        self.delta
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn is_converged(&self) -> bool {
        self.delta <= self.tolerance
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

/// Result of a completed IR-MAD run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrMadModel {
    bands: usize,
    iterations: usize,
    status: FitStatus,
    delta: f64,
    pixels: usize,
    rho_history: Vec<Vec<f64>>,
    delta_history: Vec<f64>,
    canonical: CanonicalPair,
    means: Array1<f64>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize model to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("failed to write correlation history: {0}")]
    Csv(#[from] csv::Error),
    #[error("model file is inconsistent: {0}")]
    Inconsistent(String),
}

impl IrMadModel {
    pub fn fit<S>(source: &mut S, options: &IrMadOptions) -> Result<Self, MadError>
    where
        S: PixelBlockSource,
        S::Error: Error + Send + Sync + 'static,
    {
        let mut progress = NoopFitProgress;
        Self::fit_with_progress(source, options, &mut progress)
    }

    pub fn fit_with_progress<S, P>(
        source: &mut S,
        options: &IrMadOptions,
        progress: &mut P,
    ) -> Result<Self, MadError>
    where
        S: PixelBlockSource,
        S::Error: Error + Send + Sync + 'static,
        P: FitProgressObserver,
    {
        progress.on_state(FitState::Initializing);
        options.validate()?;

        let bands = source.n_bands();
        if bands == 0 {
            return Err(MadError::InvalidInput(
                "IR-MAD requires at least one band per image".into(),
            ));
        }
        let no_change = NoChangeProbability::new(bands)?;
        let mut storage = vec![0.0f64; block_storage_len(options.block_pixels, bands)?];
        let mut convergence =
            ConvergenceState::new(bands, options.tolerance, options.max_iterations);
        let mut rho_history = Vec::new();
        let mut delta_history = Vec::new();
        let mut previous: Option<MadTransform> = None;

        log::info!(
            "Starting IR-MAD on {} pixels with {} bands per image",
            source.n_pixels(),
            bands
        );

        loop {
            let iteration = convergence.iterations();

            progress.on_state(FitState::Accumulating);
            let weighting = previous.as_ref().map(|transform| Weighting {
                transform,
                no_change: &no_change,
            });
            let stats = accumulate_pass(source, &mut storage, bands, weighting, options, progress)?;

            progress.on_state(FitState::Solving);
            progress.on_stage_start(FitProgressStage::CanonicalSolve, 1);
            let cov = stats.covariance().map_err(|err| match err {
                AccumulatorError::Empty { weight_sum, pixels } => MadError::EmptyAccumulator {
                    iteration,
                    weight_sum,
                    pixels,
                },
                other => MadError::Accumulator(other),
            })?;
            let means = stats.means().to_owned();
            let pair = solve_canonical(cov.view(), means.view(), bands, iteration)?;
            progress.on_stage_finish(FitProgressStage::CanonicalSolve);

            for k in pair.degenerate_bands() {
                log::warn!(
                    "Canonical correlation {} is exactly one at iteration {}; its chi-square contribution is set to zero",
                    k + 1,
                    iteration
                );
            }

            progress.on_state(FitState::CheckConvergence);
            let delta = convergence.record(pair.rho.view());
            log::info!(
                "Iteration {}: rho = {:?}, delta = {:.6}",
                iteration + 1,
                pair.rho.as_slice().unwrap_or(&[]),
                delta
            );
            rho_history.push(pair.rho.to_vec());
            delta_history.push(delta);

            let report = IterationReport {
                iteration,
                rho: pair.rho.view(),
                delta,
                pixels: stats.pixels(),
                weight_sum: stats.weight_sum(),
            };
            if progress.on_iteration(&report).is_break() {
                log::info!("IR-MAD run aborted after iteration {}", iteration + 1);
                return Err(MadError::Aborted { iteration });
            }

            let transform = MadTransform::new(&pair, means.view())?;
            let status = if convergence.is_converged() {
                Some(FitStatus::Converged)
            } else if convergence.is_exhausted() {
                Some(FitStatus::MaxIterExceeded)
            } else {
                None
            };

            if let Some(status) = status {
                match status {
                    FitStatus::Converged => {
                        progress.on_state(FitState::Converged);
                        log::info!(
                            "IR-MAD converged after {} iterations (delta = {:.6})",
                            convergence.iterations(),
                            delta
                        );
                    }
                    FitStatus::MaxIterExceeded => {
                        progress.on_state(FitState::MaxIterExceeded);
                        log::warn!(
                            "IR-MAD stopped at the iteration cap of {} with delta = {:.6}; using the last transform",
                            options.max_iterations,
                            delta
                        );
                    }
                }
                return Ok(Self {
                    bands,
                    iterations: convergence.iterations(),
                    status,
                    delta,
                    pixels: stats.pixels(),
                    rho_history,
                    delta_history,
                    canonical: pair,
                    means,
                });
            }
            previous = Some(transform);
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Valid pixels that contributed to the final cycle.
    pub fn pixels(&self) -> usize {
        self.pixels
    }

    pub fn canonical(&self) -> &CanonicalPair {
        &self.canonical
    }

    pub fn rho(&self) -> ArrayView1<'_, f64> {
        self.canonical.rho.view()
    }

    pub fn means(&self) -> ArrayView1<'_, f64> {
        self.means.view()
    }

    /// Canonical correlations of every cycle, oldest first.
    pub fn rho_history(&self) -> &[Vec<f64>] {
        &self.rho_history
    }

    pub fn delta_history(&self) -> &[f64] {
        &self.delta_history
    }

    pub fn transform(&self) -> Result<MadTransform, MadError> {
        MadTransform::new(&self.canonical, self.means.view())
    }

    /// Saves the model in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.check_consistency()?;
        Ok(model)
    }

    /// Writes one tab-separated row per cycle: iteration, `rho_1..rho_p`, delta.
    pub fn write_rho_history(&self, path: &Path) -> Result<(), ModelError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let mut header = vec!["iteration".to_string()];
        header.extend((1..=self.bands).map(|k| format!("rho_{k}")));
        header.push("delta".to_string());
        writer.write_record(&header)?;

        for (index, (rho, delta)) in self.rho_history.iter().zip(&self.delta_history).enumerate() {
            let mut record = vec![(index + 1).to_string()];
            record.extend(rho.iter().map(|r| r.to_string()));
            record.push(delta.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn check_consistency(&self) -> Result<(), ModelError> {
        let p = self.bands;
        let pair = &self.canonical;
        if pair.a.dim() != (p, p)
            || pair.b.dim() != (p, p)
            || pair.rho.len() != p
            || pair.sigma.len() != p
            || self.means.len() != 2 * p
        {
            return Err(ModelError::Inconsistent(format!(
                "arrays do not match the declared band count {p}"
            )));
        }
        if self.rho_history.len() != self.delta_history.len()
            || self.rho_history.iter().any(|rho| rho.len() != p)
        {
            return Err(ModelError::Inconsistent(
                "correlation history is malformed".into(),
            ));
        }
        Ok(())
    }
}

/// Samples held by one block buffer of `block_pixels` pixel vectors.
pub(crate) fn block_storage_len(block_pixels: usize, bands: usize) -> Result<usize, MadError> {
    bands
        .checked_mul(2)
        .and_then(|dim| dim.checked_mul(block_pixels))
        .ok_or_else(|| {
            MadError::InvalidInput(format!(
                "a block of {block_pixels} pixels with {bands} bands per image is too large"
            ))
        })
}

struct Weighting<'a> {
    transform: &'a MadTransform,
    no_change: &'a NoChangeProbability,
}

fn accumulate_pass<S, P>(
    source: &mut S,
    storage: &mut [f64],
    bands: usize,
    weighting: Option<Weighting<'_>>,
    options: &IrMadOptions,
    progress: &mut P,
) -> Result<WeightedCovariance, MadError>
where
    S: PixelBlockSource,
    S::Error: Error + Send + Sync + 'static,
    P: FitProgressObserver,
{
    let dim = 2 * bands;
    let n_pixels = source.n_pixels();
    let mut stats = WeightedCovariance::new(dim);
    let mut processed = 0usize;

    source.reset().map_err(|e| MadError::Source(Box::new(e)))?;
    progress.on_stage_start(FitProgressStage::Statistics, n_pixels);
    loop {
        let filled = source
            .next_block_into(options.block_pixels, storage)
            .map_err(|e| MadError::Source(Box::new(e)))?;
        if filled == 0 {
            break;
        }
        if filled > options.block_pixels {
            return Err(MadError::InvalidInput(format!(
                "pixel source returned {filled} pixels for a block of {}",
                options.block_pixels
            )));
        }
        let block = ArrayView2::from_shape((filled, dim), &storage[..filled * dim])?;
        let partial = accumulate_block(block, bands, weighting.as_ref(), options.chunk_pixels)?;
        stats = stats.combine(partial);
        processed += filled;
        progress.on_stage_advance(FitProgressStage::Statistics, processed);
    }
    progress.on_stage_finish(FitProgressStage::Statistics);

    log::debug!(
        "Statistics pass: {} of {} pixels valid, total weight {:.3}",
        stats.pixels(),
        processed,
        stats.weight_sum()
    );
    Ok(stats)
}

/// Reduces one block into partial statistics: rayon chunks each fill their own
/// accumulator and the partials are merged pairwise.
fn accumulate_block(
    block: ArrayView2<'_, f64>,
    bands: usize,
    weighting: Option<&Weighting<'_>>,
    chunk_pixels: usize,
) -> Result<WeightedCovariance, MadError> {
    let dim = 2 * bands;
    block
        .axis_chunks_iter(Axis(0), chunk_pixels)
        .into_par_iter()
        .map(|chunk| accumulate_chunk(chunk, bands, weighting))
        .try_reduce(|| WeightedCovariance::new(dim), |left, right| Ok(left.combine(right)))
}

fn accumulate_chunk(
    chunk: ArrayView2<'_, f64>,
    bands: usize,
    weighting: Option<&Weighting<'_>>,
) -> Result<WeightedCovariance, MadError> {
    let dim = 2 * bands;
    let mut values = Vec::with_capacity(chunk.len());
    let mut weights = Vec::with_capacity(chunk.nrows());
    let mut mads = Array1::<f64>::zeros(bands);

    for pixel in chunk.rows() {
        if !is_valid_pixel(pixel, bands) {
            continue;
        }
        let weight = match weighting {
            Some(w) => {
                let chi_square = w.transform.project_pixel(pixel, mads.view_mut());
                w.no_change.evaluate(chi_square)
            }
            None => 1.0,
        };
        values.extend(pixel.iter().copied());
        weights.push(weight);
    }

    let mut stats = WeightedCovariance::new(dim);
    if weights.is_empty() {
        return Ok(stats);
    }
    let batch = Array2::from_shape_vec((weights.len(), dim), values)?;
    let weights = Array1::from_vec(weights);
    stats.update(batch.view(), Some(weights.view()))?;
    Ok(stats)
}

fn solve_canonical(
    cov: ArrayView2<'_, f64>,
    means: ArrayView1<'_, f64>,
    bands: usize,
    iteration: usize,
) -> Result<CanonicalPair, MadError> {
    match CanonicalPair::from_covariance(cov, bands) {
        Ok(pair) => Ok(pair),
        Err(CanonicalError::Singular { .. }) if halves_identical(cov, means, bands) => {
            log::warn!(
                "Iteration {}: reference and target statistics are identical with singular covariance; treating every band as unchanged",
                iteration + 1
            );
            Ok(CanonicalPair::degenerate_identity(bands))
        }
        Err(source @ CanonicalError::Singular { .. }) => {
            Err(MadError::SingularCovariance { iteration, source })
        }
        Err(source) => Err(MadError::Canonical { iteration, source }),
    }
}

/// True when `S11 = S22 = S12` and both halves share the same means.
fn halves_identical(cov: ArrayView2<'_, f64>, means: ArrayView1<'_, f64>, bands: usize) -> bool {
    let scale = 1.0 + cov.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let mean_scale = 1.0 + means.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    for i in 0..bands {
        if (means[i] - means[bands + i]).abs() > IDENTICAL_HALVES_TOLERANCE * mean_scale {
            return false;
        }
        for j in 0..bands {
            let s11 = cov[[i, j]];
            let s22 = cov[[bands + i, bands + j]];
            let s12 = cov[[i, bands + j]];
            let tol = IDENTICAL_HALVES_TOLERANCE * scale;
            if (s11 - s22).abs() > tol || (s11 - s12).abs() > tol {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::source::DenseImagePair;
    use core::ops::ControlFlow;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn noisy_image(bands: usize, rows: usize, cols: usize, seed: u64) -> Array3<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 10.0).unwrap();
        Array3::from_shape_fn((bands, rows, cols), |(b, _, _)| {
            100.0 + 20.0 * b as f64 + normal.sample(&mut rng)
        })
    }

    #[test]
    fn convergence_state_tracks_largest_change() {
        let mut state = ConvergenceState::new(2, 1e-3, 3);
        assert_abs_diff_eq!(state.record(array![0.5, 0.9].view()), 0.9, epsilon = 1e-15);
        assert!(!state.is_converged());
        assert_abs_diff_eq!(
            state.record(array![0.5004, 0.9002].view()),
            0.0004,
            epsilon = 1e-12
        );
        assert!(state.is_converged());
        assert_eq!(state.iterations(), 2);
        assert!(!state.is_exhausted());
        state.record(array![0.6, 0.9].view());
        assert!(state.is_exhausted());
        assert_abs_diff_eq!(state.delta(), 0.0996, epsilon = 1e-12);
    }

    #[test]
    fn options_are_validated() {
        let mut options = IrMadOptions::default();
        assert!(options.validate().is_ok());
        options.max_iterations = 0;
        assert!(options.validate().is_err());
        options.max_iterations = 5;
        options.tolerance = f64::NAN;
        assert!(options.validate().is_err());
        options.tolerance = 0.01;
        options.block_pixels = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn chunked_accumulation_matches_a_single_update() {
        let bands = 2;
        let reference = noisy_image(bands, 9, 7, 1);
        let target = noisy_image(bands, 9, 7, 2);
        let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
        let mut storage = vec![0.0; 63 * 4];
        let filled = source.next_block_into(63, &mut storage).unwrap();
        assert_eq!(filled, 63);
        let block = ArrayView2::from_shape((63, 4), &storage[..]).unwrap();

        let chunked = accumulate_block(block, bands, None, 5).unwrap();
        let mut single = WeightedCovariance::new(4);
        single.update(block, None).unwrap();

        assert_eq!(chunked.pixels(), 63);
        let a = chunked.covariance().unwrap();
        let b = single.covariance().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-9);
        }
    }

    #[test]
    fn identical_images_converge_to_unit_correlation() {
        let image = noisy_image(2, 12, 12, 5);
        let mut source = DenseImagePair::new(image.view(), image.view()).unwrap();
        let model = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap();

        assert_eq!(model.status(), FitStatus::Converged);
        assert!(model.iterations() <= 5);
        for &rho in model.rho().iter() {
            assert_abs_diff_eq!(rho, 1.0, epsilon = 1e-6);
        }
        let result = model.transform().unwrap().apply(&mut source, 50).unwrap();
        for &mad in result.mads().iter() {
            assert_abs_diff_eq!(mad, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn iteration_cap_returns_last_transform() {
        let reference = noisy_image(3, 10, 10, 8);
        let target = noisy_image(3, 10, 10, 9);
        let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
        let options = IrMadOptions {
            max_iterations: 1,
            tolerance: 0.0,
            ..IrMadOptions::default()
        };
        let model = IrMadModel::fit(&mut source, &options).unwrap();
        assert_eq!(model.status(), FitStatus::MaxIterExceeded);
        assert_eq!(model.iterations(), 1);
        assert_eq!(model.rho_history().len(), 1);
    }

    #[test]
    fn observer_can_abort_between_cycles() {
        struct StopAfterFirst {
            states: Vec<FitState>,
        }
        impl FitProgressObserver for StopAfterFirst {
            fn on_state(&mut self, state: FitState) {
                self.states.push(state);
            }
            fn on_iteration(&mut self, report: &IterationReport<'_>) -> ControlFlow<()> {
                assert_eq!(report.iteration, 0);
                ControlFlow::Break(())
            }
        }

        let reference = noisy_image(2, 6, 6, 3);
        let target = noisy_image(2, 6, 6, 4);
        let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
        let mut observer = StopAfterFirst { states: Vec::new() };
        let result =
            IrMadModel::fit_with_progress(&mut source, &IrMadOptions::default(), &mut observer);

        assert!(matches!(result, Err(MadError::Aborted { iteration: 0 })));
        assert_eq!(
            observer.states,
            vec![
                FitState::Initializing,
                FitState::Accumulating,
                FitState::Solving,
                FitState::CheckConvergence
            ]
        );
    }

    #[test]
    fn later_cycles_weight_pixels_by_no_change_probability() {
        struct WeightLog {
            weight_sums: Vec<f64>,
            pixels: Vec<usize>,
        }
        impl FitProgressObserver for WeightLog {
            fn on_iteration(&mut self, report: &IterationReport<'_>) -> ControlFlow<()> {
                self.weight_sums.push(report.weight_sum);
                self.pixels.push(report.pixels);
                ControlFlow::Continue(())
            }
        }

        let reference = noisy_image(2, 10, 10, 31);
        let target = noisy_image(2, 10, 10, 32);
        let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
        let mut log = WeightLog {
            weight_sums: Vec::new(),
            pixels: Vec::new(),
        };
        let two_cycles = IrMadOptions {
            max_iterations: 2,
            tolerance: 0.0,
            ..IrMadOptions::default()
        };
        IrMadModel::fit_with_progress(&mut source, &two_cycles, &mut log).unwrap();

        assert_eq!(log.pixels, vec![100, 100]);
        assert_abs_diff_eq!(log.weight_sums[0], 100.0, epsilon = 1e-9);

        let one_cycle = IrMadOptions {
            max_iterations: 1,
            ..two_cycles
        };
        let first = IrMadModel::fit(&mut source, &one_cycle).unwrap();
        let transform = first.transform().unwrap();
        let no_change = NoChangeProbability::new(2).unwrap();
        let expected: f64 = (0..10)
            .flat_map(|row| (0..10).map(move |col| (row, col)))
            .map(|(row, col)| {
                let pixel = array![
                    reference[[0, row, col]],
                    reference[[1, row, col]],
                    target[[0, row, col]],
                    target[[1, row, col]]
                ];
                no_change.evaluate(transform.chi_square(pixel.view()))
            })
            .sum();

        assert!(expected < 99.0, "weights should drop below one, sum {expected}");
        assert_abs_diff_eq!(log.weight_sums[1], expected, epsilon = 1e-6);
    }

    #[test]
    fn oversized_blocks_are_rejected_before_allocation() {
        let image = noisy_image(2, 4, 4, 13);
        let mut source = DenseImagePair::new(image.view(), image.view()).unwrap();
        let options = IrMadOptions {
            block_pixels: usize::MAX,
            ..IrMadOptions::default()
        };
        assert!(matches!(
            IrMadModel::fit(&mut source, &options),
            Err(MadError::InvalidInput(_))
        ));
        assert!(block_storage_len(usize::MAX / 2, 2).is_err());
        assert_eq!(block_storage_len(16, 3).unwrap(), 96);
    }

    #[test]
    fn all_no_data_is_an_empty_accumulator() {
        let zeros = Array3::<f64>::zeros((2, 4, 4));
        let mut source = DenseImagePair::new(zeros.view(), zeros.view()).unwrap();
        assert!(matches!(
            IrMadModel::fit(&mut source, &IrMadOptions::default()),
            Err(MadError::EmptyAccumulator {
                iteration: 0,
                pixels: 0,
                ..
            })
        ));
    }

    #[test]
    fn model_round_trips_through_toml() {
        let reference = noisy_image(2, 8, 8, 21);
        let target = noisy_image(2, 8, 8, 22);
        let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
        let model = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        model.save(&path).unwrap();
        let loaded = IrMadModel::load(&path).unwrap();

        assert_eq!(loaded.bands(), model.bands());
        assert_eq!(loaded.iterations(), model.iterations());
        assert_eq!(loaded.status(), model.status());
        assert_eq!(loaded.canonical(), model.canonical());
        assert_eq!(loaded.rho_history(), model.rho_history());

        let history = dir.path().join("rho.tsv");
        model.write_rho_history(&history).unwrap();
        let text = fs::read_to_string(&history).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("iteration\trho_1\trho_2\tdelta"));
        assert_eq!(lines.count(), model.iterations());
    }
}
