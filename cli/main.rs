#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use core::ops::ControlFlow;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use irmad::config::RunConfig;
use irmad::mad::fit::FitStatus;
use irmad::mad::main::{DetectRequest, run_detect};
use irmad::mad::progress::{
    FitProgressObserver, FitProgressStage, IterationReport, TransformProgressObserver,
    TransformProgressStage,
};
use irmad::radcal::main::{NormalizeRequest, run_normalize};
use irmad::raster::Window;

#[derive(Parser)]
#[command(
    name = "irmad",
    about = "Iteratively reweighted MAD change detection for multispectral image pairs",
    long_about = "Detects change between two co-registered multispectral images with the \
                 IR-MAD transformation and radiometrically normalizes the target image \
                 onto the reference using the no-change pixels it identifies."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run IR-MAD on a reference/target image pair
    Detect(DetectArgs),
    /// Normalize the target image onto the reference using a MAD image
    Normalize(NormalizeArgs),
}

#[derive(Args)]
struct DetectArgs {
    /// Reference (first acquisition) raster
    reference: PathBuf,

    /// Target (second acquisition) raster
    target: PathBuf,

    /// Comma-separated one-based band positions, e.g. 1,2,3
    #[arg(long, value_parser = parse_band_list)]
    bands: Option<BandList>,

    /// Target band positions when they differ from --bands
    #[arg(long, value_parser = parse_band_list)]
    target_bands: Option<BandList>,

    /// Spatial subset as x0,y0,cols,rows
    #[arg(long, value_parser = parse_window)]
    window: Option<Window>,

    /// Origin of the window in the target image as x,y
    #[arg(long, value_parser = parse_origin)]
    target_origin: Option<(usize, usize)>,

    /// Maximum number of reweighting cycles
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Stop when no canonical correlation moves by more than this
    #[arg(long)]
    tolerance: Option<f64>,

    /// TOML file with [imad] and [radcal] sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output MAD raster (default: MAD(<reference>-<target>) next to the reference)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Save the fitted transform as TOML
    #[arg(long)]
    model: Option<PathBuf>,

    /// Write the per-cycle canonical correlations as TSV
    #[arg(long)]
    rho_history: Option<PathBuf>,
}

#[derive(Args)]
struct NormalizeArgs {
    /// MAD raster produced by `detect`
    mad: PathBuf,

    /// Reference raster used for the MAD run
    reference: PathBuf,

    /// Target raster used for the MAD run
    target: PathBuf,

    /// Comma-separated one-based band positions, e.g. 1,2,3
    #[arg(long, value_parser = parse_band_list)]
    bands: Option<BandList>,

    /// Spatial subset the MAD image was computed over, as x0,y0,cols,rows
    #[arg(long, value_parser = parse_window)]
    window: Option<Window>,

    /// No-change probability above which a pixel is invariant
    #[arg(long)]
    threshold: Option<f64>,

    /// TOML file with [imad] and [radcal] sections
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output raster (default: <target>_norm next to the target)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Also normalize this whole scene with the fitted lines
    #[arg(long)]
    full_scene: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Detect(args)) => detect(args),
        Some(Commands::Normalize(args)) => normalize(args),
        None => Cli::command()
            .print_help()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn detect(args: DetectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = RunConfig::load_or_default(args.config.as_deref())?.imad;
    if let Some(max_iterations) = args.max_iterations {
        options.max_iterations = max_iterations;
    }
    if let Some(tolerance) = args.tolerance {
        options.tolerance = tolerance;
    }

    let request = DetectRequest {
        reference_path: args.reference,
        target_path: args.target,
        bands: args.bands.map(|list| list.0),
        target_bands: args.target_bands.map(|list| list.0),
        window: args.window,
        target_origin: args.target_origin,
        options,
        output_path: args.output,
        model_path: args.model,
        rho_history_path: args.rho_history,
    };
    let mut progress = ConsoleProgress::default();
    let summary = run_detect(&request, &mut progress)?;

    let rho = summary
        .rho
        .iter()
        .map(|r| format!("{r:.6}"))
        .collect::<Vec<_>>()
        .join(", ");
    match summary.status {
        FitStatus::Converged => println!("Converged after {} iterations", summary.iterations),
        FitStatus::MaxIterExceeded => println!(
            "Stopped at the iteration cap ({} iterations) without converging",
            summary.iterations
        ),
    }
    println!("rho: [{rho}]");
    println!(
        "{} valid pixels; result written to {}",
        summary.valid_pixels,
        summary.output_path.display()
    );
    Ok(())
}

fn normalize(args: NormalizeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = RunConfig::load_or_default(args.config.as_deref())?.radcal;
    if let Some(threshold) = args.threshold {
        options.no_change_threshold = threshold;
    }

    let request = NormalizeRequest {
        mad_path: args.mad,
        reference_path: args.reference,
        target_path: args.target,
        bands: args.bands.map(|list| list.0),
        window: args.window,
        options,
        output_path: args.output,
        full_scene_path: args.full_scene,
    };
    let summary = run_normalize(&request)?;

    println!("no-change pixels: {}", summary.invariant_pixels);
    println!("band  slope         intercept     correlation");
    for (band, fit) in summary.fits.iter().enumerate() {
        println!(
            "{:<5} {:<13.6} {:<13.6} {:.6}",
            band + 1,
            fit.slope,
            fit.intercept,
            fit.correlation
        );
    }
    println!("result written to {}", summary.output_path.display());
    if let Some(path) = summary.full_scene_output {
        println!("full scene written to {}", path.display());
    }
    Ok(())
}

/// One-based band positions given on the command line.
#[derive(Clone, Debug)]
struct BandList(Vec<usize>);

fn parse_band_list(value: &str) -> Result<BandList, String> {
    let bands = value
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid band position '{item}': {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if bands.iter().any(|&b| b == 0) {
        return Err("band positions start at 1".to_string());
    }
    Ok(BandList(bands))
}

fn parse_numbers<const N: usize>(value: &str, what: &str) -> Result<[usize; N], String> {
    let numbers = value
        .split(',')
        .map(|item| item.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid {what} '{value}': {e}"))?;
    numbers
        .try_into()
        .map_err(|_| format!("{what} needs {N} comma-separated values, got '{value}'"))
}

fn parse_window(value: &str) -> Result<Window, String> {
    let [x0, y0, cols, rows] = parse_numbers::<4>(value, "window")?;
    if cols == 0 || rows == 0 {
        return Err("window must have at least one column and row".to_string());
    }
    Ok(Window { x0, y0, cols, rows })
}

fn parse_origin(value: &str) -> Result<(usize, usize), String> {
    let [x, y] = parse_numbers::<2>(value, "origin")?;
    Ok((x, y))
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Renders fit and transform progress as terminal progress bars.
#[derive(Default)]
struct ConsoleProgress {
    bar: Option<ProgressBar>,
    cycle: usize,
}

impl ConsoleProgress {
    fn start(&mut self, total: usize, message: String) {
        self.finish();
        self.bar = Some(create_progress_bar(total as u64, &message));
    }

    fn advance(&self, processed: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl FitProgressObserver for ConsoleProgress {
    fn on_stage_start(&mut self, stage: FitProgressStage, total_pixels: usize) {
        if stage == FitProgressStage::Statistics {
            self.start(total_pixels, format!("cycle {}: {stage}", self.cycle + 1));
        }
    }

    fn on_stage_advance(&mut self, stage: FitProgressStage, processed_pixels: usize) {
        if stage == FitProgressStage::Statistics {
            self.advance(processed_pixels);
        }
    }

    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        if stage == FitProgressStage::Statistics {
            self.finish();
        }
    }

    fn on_iteration(&mut self, report: &IterationReport<'_>) -> ControlFlow<()> {
        self.cycle = report.iteration + 1;
        ControlFlow::Continue(())
    }
}

impl TransformProgressObserver for ConsoleProgress {
    fn on_stage_start(&mut self, stage: TransformProgressStage, total_pixels: usize) {
        self.start(total_pixels, stage.to_string());
    }

    fn on_stage_advance(&mut self, _: TransformProgressStage, processed_pixels: usize) {
        self.advance(processed_pixels);
    }

    fn on_stage_finish(&mut self, _: TransformProgressStage) {
        self.finish();
    }
}
