use approx::assert_abs_diff_eq;
use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

use irmad::mad::canonical::CanonicalError;
use irmad::mad::main::{DetectRequest, run_detect};
use irmad::mad::progress::{FitProgressObserver, TransformProgressObserver};
use irmad::mad::{DenseImagePair, FitStatus, IrMadModel, IrMadOptions, MadError};
use irmad::radcal::main::RadcalDriverError;
use irmad::radcal::{NormalizationOptions, NormalizeRequest, run_normalize};
use irmad::raster::{DataType, Raster, RasterHeader, RasterWriter, Window};

const GEOTRANSFORM: [f64; 6] = [500_000.0, 30.0, 0.0, 4_000_000.0, 0.0, -30.0];

struct Silent;
impl FitProgressObserver for Silent {}
impl TransformProgressObserver for Silent {}

/// Reference image and a target that is a linear recalibration of it plus
/// noise, with a changed square patch in the first band.
fn scene_pair(bands: usize, rows: usize, cols: usize, seed: u64) -> (Array3<f64>, Array3<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let signal = Normal::new(0.0, 15.0).unwrap();
    let noise = Normal::new(0.0, 1.0).unwrap();
    let reference = Array3::from_shape_fn((bands, rows, cols), |(b, _, _)| {
        120.0 + 10.0 * b as f64 + signal.sample(&mut rng)
    });
    let mut target = reference.mapv(|v| 0.9 * v + 5.0);
    target.mapv_inplace(|v| v + noise.sample(&mut rng));
    for row in 2..7 {
        for col in 3..8 {
            target[[0, row, col]] += 80.0;
        }
    }
    (reference, target)
}

fn write_raster(path: &Path, image: &Array3<f64>) {
    let (bands, rows, cols) = image.dim();
    let header = RasterHeader {
        cols,
        rows,
        bands,
        data_type: DataType::F32,
        geotransform: Some(GEOTRANSFORM),
    };
    let mut writer = RasterWriter::create(path, header).unwrap();
    for (band, plane) in image.axis_iter(Axis(0)).enumerate() {
        writer.write_band(band, plane.iter().copied()).unwrap();
    }
    writer.finish().unwrap();
}

#[test]
fn unchanged_constant_images_produce_zero_mads() {
    let image = Array3::from_elem((1, 4, 4), 100.0);
    let mut source = DenseImagePair::new(image.view(), image.view()).unwrap();
    let model = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap();

    assert_eq!(model.status(), FitStatus::Converged);
    assert_abs_diff_eq!(model.rho()[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(model.canonical().sigma[0], 0.0, epsilon = 1e-12);
    assert_eq!(model.canonical().degenerate_bands(), vec![0]);

    let result = model.transform().unwrap().apply(&mut source, 5).unwrap();
    assert_eq!(result.valid_pixels(), 16);
    assert!(result.mads().iter().all(|&m| m == 0.0));
    assert!(result.chi_square().iter().all(|&c| c == 0.0));
}

#[test]
fn uniform_shift_without_variance_is_singular() {
    let reference = Array3::from_elem((1, 4, 4), 100.0);
    let target = Array3::from_elem((1, 4, 4), 110.0);
    let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
    let err = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        MadError::SingularCovariance {
            iteration: 0,
            source: CanonicalError::Singular { .. }
        }
    ));
}

#[test]
fn band_count_mismatch_is_rejected_before_accumulation() {
    let reference = Array3::from_elem((3, 4, 4), 100.0);
    let target = Array3::from_elem((4, 4, 4), 100.0);
    assert!(matches!(
        DenseImagePair::new(reference.view(), target.view()),
        Err(MadError::BandCountMismatch {
            reference: 3,
            target: 4
        })
    ));
}

#[test]
fn changed_patch_stands_out_in_chi_square() {
    let (reference, target) = scene_pair(3, 24, 24, 17);
    let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
    let model = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap();

    for window in model.rho().as_slice().unwrap().windows(2) {
        assert!(window[0] <= window[1]);
    }
    assert_eq!(model.rho_history().len(), model.iterations());

    let result = model.transform().unwrap().apply(&mut source, 100).unwrap();
    let chi = result.chi_square();
    let patch_min = (2..7)
        .flat_map(|row| (3..8).map(move |col| row * 24 + col))
        .map(|i| chi[i])
        .fold(f64::INFINITY, f64::min);
    let mut background: Vec<f64> = (0..24 * 24)
        .filter(|i| !(2..7).contains(&(i / 24)) || !(3..8).contains(&(i % 24)))
        .map(|i| chi[i])
        .collect();
    background.sort_by(|a, b| a.total_cmp(b));
    let median = background[background.len() / 2];
    assert!(
        patch_min > 10.0 * median,
        "patch minimum {patch_min} vs background median {median}"
    );
}

#[test]
fn saved_model_reproduces_the_output_pass() {
    let (reference, target) = scene_pair(2, 16, 16, 5);
    let mut source = DenseImagePair::new(reference.view(), target.view()).unwrap();
    let model = IrMadModel::fit(&mut source, &IrMadOptions::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let loaded = IrMadModel::load(&path).unwrap();

    let original = model.transform().unwrap().apply(&mut source, 64).unwrap();
    let restored = loaded.transform().unwrap().apply(&mut source, 64).unwrap();
    for (a, b) in original.chi_square().iter().zip(restored.chi_square().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
}

#[test]
fn detect_then_normalize_recovers_the_recalibration() {
    let dir = tempfile::tempdir().unwrap();
    let reference_path = dir.path().join("t1.tif");
    let target_path = dir.path().join("t2.tif");
    let (reference, target) = scene_pair(3, 30, 30, 99);
    write_raster(&reference_path, &reference);
    write_raster(&target_path, &target);

    let window = Window {
        x0: 0,
        y0: 0,
        cols: 30,
        rows: 30,
    };
    let request = DetectRequest {
        reference_path: reference_path.clone(),
        target_path: target_path.clone(),
        bands: None,
        target_bands: None,
        window: Some(window),
        target_origin: None,
        options: IrMadOptions::default(),
        output_path: None,
        model_path: Some(dir.path().join("model.toml")),
        rho_history_path: Some(dir.path().join("rho.tsv")),
    };
    let summary = run_detect(&request, &mut Silent).unwrap();
    assert_eq!(summary.output_path, dir.path().join("MAD(t1-t2).tif"));
    assert_eq!(summary.valid_pixels, 900);
    assert!(dir.path().join("model.toml").exists());
    assert!(dir.path().join("rho.tsv").exists());

    let mad = Raster::open(&summary.output_path).unwrap();
    assert_eq!(mad.header().bands, 4);
    assert_eq!(mad.header().geotransform, Some(GEOTRANSFORM));

    let normalized = run_normalize(&NormalizeRequest {
        mad_path: summary.output_path.clone(),
        reference_path,
        target_path,
        bands: None,
        window: None,
        options: NormalizationOptions::default(),
        output_path: None,
        full_scene_path: None,
    })
    .unwrap();

    assert_eq!(normalized.output_path, dir.path().join("t2_norm.tif"));
    assert!(normalized.invariant_pixels >= 2);
    // The target was produced as 0.9 * reference + 5, so the inverse line
    // maps it back with slope 1/0.9.
    for band in 1..3 {
        let fit = normalized.fits[band];
        assert_abs_diff_eq!(fit.slope, 1.0 / 0.9, epsilon = 0.1);
        assert!(fit.correlation > 0.95);
    }

    let output = Raster::open(&normalized.output_path).unwrap();
    assert_eq!(output.header().bands, 3);
    let values = output.read_window(2, &Window::full(output.header())).unwrap();
    let restored_mean = values.iter().sum::<f64>() / values.len() as f64;
    let reference_mean = reference.index_axis(Axis(0), 2).mean().unwrap();
    assert_abs_diff_eq!(restored_mean, reference_mean, epsilon = 2.0);
}

#[test]
fn windowed_detect_shifts_the_geotransform() {
    let dir = tempfile::tempdir().unwrap();
    let reference_path = dir.path().join("a.bsq");
    let target_path = dir.path().join("b.bsq");
    let (reference, target) = scene_pair(2, 20, 20, 3);
    write_raster(&reference_path, &reference);
    write_raster(&target_path, &target);

    let request = DetectRequest {
        reference_path,
        target_path,
        bands: Some(vec![2, 1]),
        target_bands: None,
        window: Some(Window {
            x0: 4,
            y0: 2,
            cols: 12,
            rows: 10,
        }),
        target_origin: None,
        options: IrMadOptions {
            max_iterations: 3,
            ..IrMadOptions::default()
        },
        output_path: Some(dir.path().join("out.bsq")),
        model_path: None,
        rho_history_path: None,
    };
    let summary = run_detect(&request, &mut Silent).unwrap();
    assert!(summary.iterations <= 3);

    let mad = Raster::open(&summary.output_path).unwrap();
    assert_eq!((mad.header().cols, mad.header().rows), (12, 10));
    assert_eq!(
        mad.header().geotransform,
        Some([500_120.0, 30.0, 0.0, 3_999_940.0, 0.0, -30.0])
    );
}

#[test]
fn normalize_finds_an_offset_mad_window_from_its_georeferencing() {
    let dir = tempfile::tempdir().unwrap();
    let reference_path = dir.path().join("r.img");
    let target_path = dir.path().join("t.img");
    let (reference, target) = scene_pair(3, 30, 30, 41);
    write_raster(&reference_path, &reference);
    write_raster(&target_path, &target);

    let window = Window {
        x0: 5,
        y0: 6,
        cols: 20,
        rows: 16,
    };
    let summary = run_detect(
        &DetectRequest {
            reference_path: reference_path.clone(),
            target_path: target_path.clone(),
            bands: None,
            target_bands: None,
            window: Some(window),
            target_origin: None,
            options: IrMadOptions::default(),
            output_path: None,
            model_path: None,
            rho_history_path: None,
        },
        &mut Silent,
    )
    .unwrap();

    let request = |window: Option<Window>, name: &str| NormalizeRequest {
        mad_path: summary.output_path.clone(),
        reference_path: reference_path.clone(),
        target_path: target_path.clone(),
        bands: None,
        window,
        options: NormalizationOptions::default(),
        output_path: Some(dir.path().join(name)),
        full_scene_path: None,
    };
    let located = run_normalize(&request(None, "located.img")).unwrap();
    let explicit = run_normalize(&request(Some(window), "explicit.img")).unwrap();
    assert_eq!(located.invariant_pixels, explicit.invariant_pixels);
    for (a, b) in located.fits.iter().zip(&explicit.fits) {
        assert_abs_diff_eq!(a.slope, b.slope, epsilon = 1e-12);
        assert_abs_diff_eq!(a.intercept, b.intercept, epsilon = 1e-9);
    }

    let misplaced = run_normalize(&request(Some(window.at(0, 0)), "misplaced.img"));
    assert!(matches!(misplaced, Err(RadcalDriverError::InvalidRequest(_))));
}
