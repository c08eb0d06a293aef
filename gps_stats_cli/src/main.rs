use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use gps_stats::{
    calculate_stats, clean_up, kts_to_ms, ms_to_units, read_points, save_points_gpx, version,
    AnalyzeParams, Points, StatKind, TurnKind, Unit,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Default speed-outlier cleanup threshold, in knots.
const DEFAULT_CLEANUP_DELTA_KTS: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(
    name = "gps-stats",
    version = version_line(),
    about = "Speed statistics for windsurfing / kiteboarding GPS tracks (SBN or GPX)",
    long_about = None
)]
struct Cli {
    /// SBN/GPX track files to analyze
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Statistic to print
    #[arg(short = 't', long = "stat", value_enum, default_value_t = StatOpt::All)]
    stat: StatOpt,

    /// Speed units
    #[arg(short = 'u', long = "units", alias = "su", value_enum, default_value_t = UnitOpt::Kts)]
    units: UnitOpt,

    /// Explicit wind direction in degrees (0-360)
    #[arg(
        short = 'w',
        long = "wind-dir",
        alias = "wd",
        value_parser = parse_wind_dir,
        conflicts_with = "auto_wind"
    )]
    wind_dir: Option<f64>,

    /// Auto-detect the wind direction, preferring the given maneuver
    #[arg(short = 'a', long = "auto-wind", alias = "awd", value_enum)]
    auto_wind: Option<TurnOpt>,

    /// Speed-outlier cleanup threshold in the selected units (default: 5 kts converted)
    #[arg(short = 'c', long = "cleanup-speed", alias = "cs")]
    cleanup_speed: Option<f64>,

    /// Save the cleaned track next to each input as <input>.filtered.gpx
    #[arg(short = 'f', long = "save-filtered", alias = "sf", action = ArgAction::SetTrue)]
    save_filtered: bool,

    /// Debug logging
    #[arg(short = 'd', long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Print the statistics aggregate as JSON instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StatOpt {
    All,
    Distance,
    Duration,
    #[value(name = "2s")]
    Speed2s,
    #[value(name = "10sAvg")]
    Speed10sAvg,
    #[value(name = "10s1")]
    Speed10s1,
    #[value(name = "10s2")]
    Speed10s2,
    #[value(name = "10s3")]
    Speed10s3,
    #[value(name = "10s4")]
    Speed10s4,
    #[value(name = "10s5")]
    Speed10s5,
    #[value(name = "15m")]
    Speed15m,
    #[value(name = "1h")]
    Speed1h,
    #[value(name = "100m")]
    Speed100m,
    #[value(name = "1nm")]
    Speed1nm,
    Alpha,
}

impl From<StatOpt> for StatKind {
    fn from(value: StatOpt) -> Self {
        match value {
            StatOpt::All => StatKind::All,
            StatOpt::Distance => StatKind::Distance,
            StatOpt::Duration => StatKind::Duration,
            StatOpt::Speed2s => StatKind::Speed2s,
            StatOpt::Speed10sAvg => StatKind::Speed10sAvg,
            StatOpt::Speed10s1 => StatKind::Speed10s1,
            StatOpt::Speed10s2 => StatKind::Speed10s2,
            StatOpt::Speed10s3 => StatKind::Speed10s3,
            StatOpt::Speed10s4 => StatKind::Speed10s4,
            StatOpt::Speed10s5 => StatKind::Speed10s5,
            StatOpt::Speed15m => StatKind::Speed15m,
            StatOpt::Speed1h => StatKind::Speed1h,
            StatOpt::Speed100m => StatKind::Speed100m,
            StatOpt::Speed1nm => StatKind::Speed1nm,
            StatOpt::Alpha => StatKind::Alpha,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum UnitOpt {
    Kts,
    Kmh,
    Ms,
}

impl From<UnitOpt> for Unit {
    fn from(value: UnitOpt) -> Self {
        match value {
            UnitOpt::Kts => Unit::Kts,
            UnitOpt::Kmh => Unit::Kmh,
            UnitOpt::Ms => Unit::Ms,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TurnOpt {
    Jibe,
    Tack,
}

impl From<TurnOpt> for TurnKind {
    fn from(value: TurnOpt) -> Self {
        match value {
            TurnOpt::Jibe => TurnKind::Jibe,
            TurnOpt::Tack => TurnKind::Tack,
        }
    }
}

fn version_line() -> String {
    format!(
        "{} {} {}",
        version::VERSION,
        version::PLATFORM,
        version::BUILD_TIME
    )
}

fn parse_wind_dir(value: &str) -> Result<f64, String> {
    let degrees: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if !(0.0..=360.0).contains(&degrees) {
        return Err(format!("wind direction {} is outside 0-360", degrees));
    }
    Ok(degrees)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let units = Unit::from(cli.units);
    let delta_speed_max = cli
        .cleanup_speed
        .unwrap_or_else(|| ms_to_units(kts_to_ms(DEFAULT_CLEANUP_DELTA_KTS), units));
    let params = AnalyzeParams {
        stat: cli.stat.into(),
        units,
        prefer: cli.auto_wind.map(Into::into),
        wind_dir: cli.wind_dir,
        debug: cli.debug,
    };

    for path in &cli.inputs {
        print_stats_for_file(path, &cli, delta_speed_max, &params)?;
    }
    Ok(())
}

/// Analyzes one track file and prints its statistics. Decode and export
/// problems are reported and skip the file; the remaining files continue.
fn print_stats_for_file(
    path: &Path,
    cli: &Cli,
    delta_speed_max: f64,
    params: &AnalyzeParams,
) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let print_all = matches!(cli.stat, StatOpt::All);

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            warn!("cannot read '{}': {}", path.display(), err);
            println!("Error reading track points from '{}': {}", file_name, err);
            if print_all {
                println!();
            }
            return Ok(());
        }
    };

    let points = match read_points(&data) {
        Ok(points) => points,
        Err(err) => {
            println!("Error reading track points from '{}': {}", file_name, err);
            if print_all {
                println!();
            }
            return Ok(());
        }
    };

    let points_no = points.ps.len();
    let cleaned = clean_up(&points, delta_speed_max, params.units);
    let points_cleaned_no = cleaned.ps.len();

    if cli.save_filtered {
        let out_path = format!("{}.filtered.gpx", path.display());
        if let Err(err) = write_filtered_gpx(&cleaned, &out_path) {
            println!("Error saving file '{}' for GPX export: {}", out_path, err);
            if print_all {
                println!();
            }
            return Ok(());
        }
        println!("Filtered GPX file '{}' saved.", out_path);
        if print_all {
            println!();
        }
    }

    let mut ps = cleaned.ps;
    let stats = calculate_stats(&mut ps, params);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    match StatKind::from(cli.stat) {
        StatKind::All => {
            println!(
                "Found {} track points in '{}', after cleanup {} points left.",
                points_no, file_name, points_cleaned_no
            );
            print!("{}", stats.txt_stats());
        }
        kind => print!("{} ({})", stats.txt_single_stat(kind), file_name),
    }
    println!();
    Ok(())
}

fn write_filtered_gpx(points: &Points, out_path: &str) -> Result<()> {
    let mut out = Vec::new();
    save_points_gpx(points, &mut out)?;
    fs::write(out_path, out)?;
    Ok(())
}
