use ndarray::{Array1, Array2, ArrayView1};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::normalize::{
    NormalizationOptions, OrthogonalFit, RadcalError, RadiometricNormalization,
};
use crate::raster::{
    BandSelection, DataType, Raster, RasterError, RasterHeader, RasterWriter, Window,
};

/// Inputs for one `normalize` run.
#[derive(Clone, Debug)]
pub struct NormalizeRequest {
    pub mad_path: PathBuf,
    pub reference_path: PathBuf,
    pub target_path: PathBuf,
    /// One-based band positions; `None` selects every band.
    pub bands: Option<Vec<usize>>,
    /// Window the MAD image was computed over; must match its extent.
    pub window: Option<Window>,
    pub options: NormalizationOptions,
    pub output_path: Option<PathBuf>,
    /// Whole scene to normalize with the fitted lines.
    pub full_scene_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct NormalizeSummary {
    pub output_path: PathBuf,
    pub full_scene_output: Option<PathBuf>,
    pub invariant_pixels: usize,
    pub fits: Vec<OrthogonalFit>,
}

#[derive(Debug, Error)]
pub enum RadcalDriverError {
    #[error(transparent)]
    Radcal(#[from] RadcalError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error("{0}")]
    InvalidRequest(String),
}

/// `<target stem>_norm<.ext>` next to the target.
pub fn default_output_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!("{stem}_norm.{}", ext.to_string_lossy()),
        None => format!("{stem}_norm"),
    };
    target.with_file_name(name)
}

pub fn run_normalize(request: &NormalizeRequest) -> Result<NormalizeSummary, RadcalDriverError> {
    let mad = Raster::open(&request.mad_path)?;
    let reference = Raster::open(&request.reference_path)?;
    let target = Raster::open(&request.target_path)?;

    let mad_header = mad.header();
    if mad_header.bands < 2 {
        return Err(RadcalDriverError::InvalidRequest(format!(
            "{} has {} bands; a MAD image holds at least one variate and the chi-square band",
            request.mad_path.display(),
            mad_header.bands
        )));
    }
    let window = match request.window {
        Some(window) => window,
        None => locate_mad_window(mad_header, reference.header())?,
    };
    check_alignment(&window, mad_header, reference.header())?;

    let bands = BandSelection::resolve(request.bands.as_deref(), reference.header().bands)?;
    let degrees_of_freedom = mad_header.bands - 1;
    if degrees_of_freedom != bands.len() {
        log::warn!(
            "MAD image carries {} variates but {} bands are being normalized",
            degrees_of_freedom,
            bands.len()
        );
    }

    let chi_square = mad.read_window(mad_header.bands - 1, &Window::full(mad_header))?;
    let reference_values = read_bands(&reference, &bands, &window)?;
    let target_values = read_bands(&target, &bands, &window)?;

    log::info!(
        "Normalizing {} onto {} ({} bands, threshold {})",
        request.target_path.display(),
        request.reference_path.display(),
        bands.len(),
        request.options.no_change_threshold
    );
    let normalization = RadiometricNormalization::fit(
        reference_values.view(),
        target_values.view(),
        ArrayView1::from(chi_square.as_slice()),
        degrees_of_freedom,
        &request.options,
    )?;

    let output_path = request
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(&request.target_path));
    let normalized = normalization.apply(target_values.view())?;
    let mut writer = RasterWriter::create(
        &output_path,
        RasterHeader {
            cols: window.cols,
            rows: window.rows,
            bands: bands.len(),
            data_type: DataType::F32,
            geotransform: mad_header.geotransform,
        },
    )?;
    for (band, values) in normalized.rows().into_iter().enumerate() {
        writer.write_band(band, values.iter().copied())?;
    }
    writer.finish()?;
    log::info!("Normalized image written to {}", output_path.display());

    let full_scene_output = match &request.full_scene_path {
        Some(path) => Some(normalize_full_scene(path, &bands, &normalization)?),
        None => None,
    };

    Ok(NormalizeSummary {
        output_path,
        full_scene_output,
        invariant_pixels: normalization.invariant_pixels().len(),
        fits: normalization.fits().to_vec(),
    })
}

/// Relative tolerance when comparing georeferencing of two grids.
const GRID_TOLERANCE: f64 = 1.0e-6;

/// Places the MAD image inside the reference through their geotransforms.
/// Without georeferencing the two must cover the same pixels.
pub fn locate_mad_window(
    mad: &RasterHeader,
    reference: &RasterHeader,
) -> Result<Window, RadcalDriverError> {
    let extent = Window::full(mad);
    let (Some(mad_gt), Some(reference_gt)) = (mad.geotransform, reference.geotransform) else {
        if (mad.cols, mad.rows) == (reference.cols, reference.rows) {
            return Ok(extent);
        }
        return Err(RadcalDriverError::InvalidRequest(format!(
            "the MAD image is {}x{} but the reference is {}x{} and there is no georeferencing to place it; pass --window",
            mad.cols, mad.rows, reference.cols, reference.rows
        )));
    };
    let (pixel_width, pixel_height) = (reference_gt[1], reference_gt[5]);
    let offset = |delta: f64, pixel: f64| {
        let steps = delta / pixel;
        let rounded = steps.round();
        (steps.is_finite() && rounded >= 0.0 && (steps - rounded).abs() <= GRID_TOLERANCE)
            .then_some(rounded as usize)
    };
    match (
        offset(mad_gt[0] - reference_gt[0], pixel_width),
        offset(mad_gt[3] - reference_gt[3], pixel_height),
    ) {
        (Some(x0), Some(y0)) => Ok(extent.at(x0, y0)),
        _ => Err(RadcalDriverError::InvalidRequest(
            "the MAD image origin does not fall on the reference pixel grid; pass --window".into(),
        )),
    }
}

/// Rejects a window whose extent or georeferencing disagrees with the MAD
/// image.
fn check_alignment(
    window: &Window,
    mad: &RasterHeader,
    reference: &RasterHeader,
) -> Result<(), RadcalDriverError> {
    if (window.cols, window.rows) != (mad.cols, mad.rows) {
        return Err(RadcalDriverError::InvalidRequest(format!(
            "window is {}x{} but the MAD image is {}x{}",
            window.cols, window.rows, mad.cols, mad.rows
        )));
    }
    window.check_within(reference)?;
    if let (Some(expected), Some(found)) =
        (window.geotransform(reference.geotransform), mad.geotransform)
    {
        let scale = expected[1].abs().max(expected[5].abs()).max(1.0);
        let aligned = expected
            .iter()
            .zip(found.iter())
            .all(|(e, f)| (e - f).abs() <= GRID_TOLERANCE * scale);
        if !aligned {
            return Err(RadcalDriverError::InvalidRequest(format!(
                "window at ({}, {}) does not match the MAD image georeferencing",
                window.x0, window.y0
            )));
        }
    }
    Ok(())
}

/// Reads the selected bands over `window` as a `bands x pixels` array.
fn read_bands(
    raster: &Raster,
    bands: &BandSelection,
    window: &Window,
) -> Result<Array2<f64>, RadcalDriverError> {
    let mut values = Array2::<f64>::zeros((bands.len(), window.pixels()?));
    for (mut row, &band) in values.rows_mut().into_iter().zip(bands.indices()) {
        row.assign(&Array1::from_vec(raster.read_window(band, window)?));
    }
    Ok(values)
}

fn normalize_full_scene(
    path: &Path,
    bands: &BandSelection,
    normalization: &RadiometricNormalization,
) -> Result<PathBuf, RadcalDriverError> {
    let scene = Raster::open(path)?;
    let full = Window::full(scene.header());
    let output_path = default_output_path(path);
    let mut writer = RasterWriter::create(
        &output_path,
        RasterHeader {
            cols: full.cols,
            rows: full.rows,
            bands: bands.len(),
            data_type: DataType::F32,
            geotransform: scene.header().geotransform,
        },
    )?;

    log::info!("Normalizing full scene {}", path.display());
    for (slot, &band) in bands.indices().iter().enumerate() {
        let values = scene.read_window(band, &full)?;
        let normalized = normalization.apply_band(slot, ArrayView1::from(values.as_slice()))?;
        writer.write_band(slot, normalized.iter().copied())?;
    }
    writer.finish()?;
    log::info!("Normalized full scene written to {}", output_path.display());
    Ok(output_path)
}
