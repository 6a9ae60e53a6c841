use std::error::Error;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use robot_tracker::calib::{
    CalibrationParams, CalibrationSet, CalibrationStore, CancelToken, ExtrinsicView,
    IntrinsicView,
};
use robot_tracker::core::CameraId;
use robot_tracker::pipeline::{
    FrameSource, Pipeline, PoseSink, PoseUpdate, SinkClosed, TrackerConfig,
};
use robot_tracker::replay::ImageSequenceSource;

/// Multi-camera fiducial tracking: configuration checks, calibration and replay.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines (requires the `tracing` feature).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a tracker configuration file.
    CheckConfig {
        /// Path to a JSON TrackerConfig.
        #[arg(long)]
        config: PathBuf,
    },
    /// Solve one camera's lens model from planar pattern views.
    CalibrateIntrinsics {
        #[arg(long)]
        camera: u32,
        /// JSON array of IntrinsicView.
        #[arg(long)]
        views: PathBuf,
        #[command(flatten)]
        files: CalibrationIo,
    },
    /// Solve camera-to-robot transforms from views of a reference target.
    CalibrateExtrinsics {
        /// JSON array of ExtrinsicView.
        #[arg(long)]
        views: PathBuf,
        #[command(flatten)]
        files: CalibrationIo,
    },
    /// Run the tracking pipeline over recorded image sequences.
    Replay {
        /// Path to a JSON TrackerConfig. Defaults to one entry per --camera.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Active calibration set (JSON).
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Image directory of one camera, as `ID=DIR`. Repeat per camera.
        #[arg(long = "camera", value_parser = parse_camera_dir, required = true)]
        cameras: Vec<(CameraId, PathBuf)>,
        /// Recording frame rate.
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
        /// Write pose updates as JSON lines here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct CalibrationIo {
    /// Existing calibration set to start from (JSON).
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Optional JSON CalibrationParams. Defaults are used if omitted.
    #[arg(long)]
    params: Option<PathBuf>,
    /// Where to write the resulting set. Printed to stdout if omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_camera_dir(s: &str) -> Result<(CameraId, PathBuf), String> {
    let (id, dir) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=DIR, got `{s}`"))?;
    let id: u32 = id
        .trim()
        .parse()
        .map_err(|e| format!("invalid camera id `{id}`: {e}"))?;
    Ok((CameraId(id), PathBuf::from(dir)))
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn Error>> {
    let data = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let value = serde_json::from_str(&data)
        .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))?;
    Ok(value)
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(
    path: Option<&Path>,
) -> Result<T, Box<dyn Error>> {
    match path {
        Some(p) => load_json_file(p),
        None => Ok(T::default()),
    }
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, json + "\n")?,
        None => println!("{json}"),
    }
    Ok(())
}

/// Pose updates as JSON lines.
struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> PoseSink for JsonLinesSink<W> {
    fn publish(&mut self, update: PoseUpdate) -> Result<(), SinkClosed> {
        serde_json::to_writer(&mut self.out, &update).map_err(|_| SinkClosed)?;
        self.out.write_all(b"\n").map_err(|_| SinkClosed)
    }
}

fn check_config(path: &Path) -> Result<(), Box<dyn Error>> {
    let config: TrackerConfig = load_json_file(path)?;
    config.validate()?;
    println!(
        "config ok: {} camera(s), {} enabled",
        config.cameras.len(),
        config.enabled_cameras().count()
    );
    Ok(())
}

fn calibrate_intrinsics(
    camera: u32,
    views: &Path,
    files: &CalibrationIo,
) -> Result<(), Box<dyn Error>> {
    let views: Vec<IntrinsicView> = load_json_file(views)?;
    let params: CalibrationParams = load_or_default(files.params.as_deref())?;
    let store = CalibrationStore::new(load_or_default(files.calibration.as_deref())?);
    let set = store.run_intrinsic(CameraId(camera), &views, &params, &CancelToken::new())?;
    if let Some(c) = set.camera(CameraId(camera)) {
        eprintln!(
            "cam{camera}: fx={:.2} fy={:.2} cx={:.2} cy={:.2} rms={:.4} px",
            c.model.intrinsics.fx,
            c.model.intrinsics.fy,
            c.model.intrinsics.cx,
            c.model.intrinsics.cy,
            c.intrinsic_residual_px
        );
    }
    write_json(&*set, files.output.as_deref())
}

fn calibrate_extrinsics(views: &Path, files: &CalibrationIo) -> Result<(), Box<dyn Error>> {
    let views: Vec<ExtrinsicView> = load_json_file(views)?;
    let params: CalibrationParams = load_or_default(files.params.as_deref())?;
    let store = CalibrationStore::new(load_or_default(files.calibration.as_deref())?);
    let set = store.run_extrinsic(&views, &params, &CancelToken::new())?;
    for (id, c) in &set.cameras {
        if let Some(rfc) = c.robot_from_camera {
            let t = rfc.translation.vector;
            eprintln!(
                "{id}: t=({:.4}, {:.4}, {:.4}) m rms={:.4} px",
                t.x,
                t.y,
                t.z,
                c.extrinsic_residual_px.unwrap_or(f64::NAN)
            );
        }
    }
    write_json(&*set, files.output.as_deref())
}

fn replay(
    config: Option<&Path>,
    calibration: Option<&Path>,
    cameras: &[(CameraId, PathBuf)],
    fps: f64,
    output: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let mut config = match config {
        Some(p) => load_json_file(p)?,
        None => TrackerConfig::with_cameras(cameras.iter().map(|(id, _)| *id)),
    };
    config.pipeline.pace = false;
    let set: CalibrationSet = load_or_default(calibration)?;

    let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(cameras.len());
    for (id, dir) in cameras {
        sources.push(Box::new(ImageSequenceSource::from_dir(*id, dir, fps)?));
    }

    let out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(fs::File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let mut pipeline = Pipeline::new(
        config,
        sources,
        CalibrationStore::new(set),
        JsonLinesSink { out },
    )?;
    let summary = pipeline.run(&AtomicBool::new(false));
    pipeline.into_sink().out.flush()?;
    eprintln!(
        "{} cycle(s), {} skipped, {} observation(s), {} pose(s), health {}",
        summary.cycles, summary.skipped, summary.observations, summary.poses, summary.health
    );
    Ok(())
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    #[cfg(feature = "tracing")]
    {
        let _ = tracing_log::LogTracer::builder().with_max_level(level).init();
        robot_tracker::core::init_tracing(json);
    }
    #[cfg(not(feature = "tracing"))]
    {
        if json {
            eprintln!("warning: --log-json needs the `tracing` feature; using plain logs");
        }
        let _ = robot_tracker::core::init_with_level(level);
    }
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);
    match &cli.command {
        Command::CheckConfig { config } => check_config(config),
        Command::CalibrateIntrinsics {
            camera,
            views,
            files,
        } => calibrate_intrinsics(*camera, views, files),
        Command::CalibrateExtrinsics { views, files } => calibrate_extrinsics(views, files),
        Command::Replay {
            config,
            calibration,
            cameras,
            fps,
            output,
        } => replay(
            config.as_deref(),
            calibration.as_deref(),
            cameras,
            *fps,
            output.as_deref(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_dir_argument_parses() {
        assert_eq!(
            parse_camera_dir("3=/data/cam3"),
            Ok((CameraId(3), PathBuf::from("/data/cam3")))
        );
        assert!(parse_camera_dir("/data/cam3").is_err());
        assert!(parse_camera_dir("x=/data").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
