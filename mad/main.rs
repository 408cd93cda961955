use std::path::{Path, PathBuf};
use thiserror::Error;

use super::fit::{FitStatus, IrMadModel, IrMadOptions, MadError, ModelError};
use super::io::RasterPairSource;
use super::progress::{FitProgressObserver, TransformProgressObserver};
use super::transform::MadResult;
use crate::raster::{
    BandSelection, DataType, Raster, RasterError, RasterHeader, RasterWriter, Window,
};

/// Inputs for one `detect` run.
#[derive(Clone, Debug)]
pub struct DetectRequest {
    pub reference_path: PathBuf,
    pub target_path: PathBuf,
    /// One-based band positions; `None` selects every band.
    pub bands: Option<Vec<usize>>,
    /// Target band positions when they differ from the reference's.
    pub target_bands: Option<Vec<usize>>,
    pub window: Option<Window>,
    pub target_origin: Option<(usize, usize)>,
    pub options: IrMadOptions,
    pub output_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub rho_history_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct DetectSummary {
    pub output_path: PathBuf,
    pub status: FitStatus,
    pub iterations: usize,
    pub rho: Vec<f64>,
    pub valid_pixels: usize,
}

#[derive(Debug, Error)]
pub enum MadDriverError {
    #[error(transparent)]
    Mad(#[from] MadError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// `MAD(<reference stem>-<target stem>)<reference extension>`, next to the
/// reference image.
pub fn default_output_path(reference: &Path, target: &Path) -> PathBuf {
    let stem = |path: &Path| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let mut name = format!("MAD({}-{})", stem(reference), stem(target));
    if let Some(ext) = reference.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    reference.with_file_name(name)
}

pub fn run_detect<P>(
    request: &DetectRequest,
    progress: &mut P,
) -> Result<DetectSummary, MadDriverError>
where
    P: FitProgressObserver + TransformProgressObserver,
{
    let reference = Raster::open(&request.reference_path)?;
    let target = Raster::open(&request.target_path)?;

    let reference_bands =
        BandSelection::resolve(request.bands.as_deref(), reference.header().bands)?;
    let target_positions = request.target_bands.as_deref().or(request.bands.as_deref());
    let target_bands = BandSelection::resolve(target_positions, target.header().bands)?;
    let window = request
        .window
        .unwrap_or_else(|| Window::full(reference.header()));

    let mut source = RasterPairSource::new(
        &reference,
        reference_bands,
        &target,
        target_bands,
        window,
        request.target_origin,
    )?;

    log::info!(
        "IR-MAD: reference {}, target {}",
        request.reference_path.display(),
        request.target_path.display()
    );
    let model = IrMadModel::fit_with_progress(&mut source, &request.options, progress)?;
    let result = model.transform()?.apply_with_progress(
        &mut source,
        request.options.block_pixels,
        progress,
    )?;

    let output_path = request.output_path.clone().unwrap_or_else(|| {
        default_output_path(&request.reference_path, &request.target_path)
    });
    let geotransform = window.geotransform(reference.header().geotransform);
    write_mad_image(&output_path, &window, geotransform, &result)?;
    log::info!("MAD image written to {}", output_path.display());

    if let Some(path) = &request.model_path {
        model.save(path)?;
        log::info!("Model saved to {}", path.display());
    }
    if let Some(path) = &request.rho_history_path {
        model.write_rho_history(path)?;
        log::info!("Correlation history written to {}", path.display());
    }

    Ok(DetectSummary {
        output_path,
        status: model.status(),
        iterations: model.iterations(),
        rho: model.rho().to_vec(),
        valid_pixels: result.valid_pixels(),
    })
}

/// Writes the `p` MAD variates followed by the chi-square band as f32.
pub fn write_mad_image(
    path: &Path,
    window: &Window,
    geotransform: Option<[f64; 6]>,
    result: &MadResult,
) -> Result<(), RasterError> {
    let mut writer = RasterWriter::create(
        path,
        RasterHeader {
            cols: window.cols,
            rows: window.rows,
            bands: result.bands() + 1,
            data_type: DataType::F32,
            geotransform,
        },
    )?;
    for (band, values) in result.output_bands().enumerate() {
        writer.write_band(band, values.iter().copied())?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_name_joins_both_stems() {
        assert_eq!(
            default_output_path(Path::new("/data/t1.bsq"), Path::new("/other/t2.img")),
            PathBuf::from("/data/MAD(t1-t2).bsq")
        );
        assert_eq!(
            default_output_path(Path::new("a"), Path::new("b")),
            PathBuf::from("MAD(a-b)")
        );
    }
}
