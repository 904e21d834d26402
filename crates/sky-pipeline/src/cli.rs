//! Command-line dispatch: four integer `--mode`s plus their flags, parsed
//! with `clap`'s derive API.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Enumerate connected cameras and exit.
    EnumerateCameras = 1,
    /// Load and echo the configuration file; exit non-zero if invalid.
    CheckConfig = 2,
    /// Run the continuous acquisition/detection pipeline.
    Run = 3,
    /// One-shot capture test.
    CaptureTest = 4,
}

#[derive(Debug, Parser)]
#[command(name = "sky-pipeline", version, about = "Sky-monitoring acquisition and detection pipeline")]
pub struct Cli {
    /// Operating mode: 1=enumerate cameras, 2=check config, 3=run, 4=capture test.
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Path to the configuration file.
    #[arg(long, default_value = "configuration.toml")]
    pub config: PathBuf,

    /// Seconds to run mode 3 before stopping automatically (unbounded if absent).
    #[arg(long)]
    pub time: Option<u64>,

    /// Camera vendor tag to enumerate, for mode 1.
    #[arg(long)]
    pub camtype: Option<String>,

    /// Gain override, for mode 4.
    #[arg(long)]
    pub gain: Option<f32>,

    /// Exposure override (ms), for mode 4.
    #[arg(long)]
    pub exposure: Option<f32>,

    /// Bit depth override (8 or 12), for mode 4.
    #[arg(long)]
    pub bitdepth: Option<u8>,

    /// Also write a BMP preview, for mode 4.
    #[arg(long)]
    pub bmp: bool,

    /// Also write a FITS-equivalent artifact, for mode 4.
    #[arg(long)]
    pub fits: bool,

    /// Unused placeholder for an interactive preview (out of scope).
    #[arg(long)]
    pub display: bool,

    /// Identifier tag embedded in the mode-4 output filenames.
    #[arg(long, default_value = "capture")]
    pub id: String,

    /// Directory mode 4 writes its artifacts into.
    #[arg(long)]
    pub savepath: Option<PathBuf>,

    /// Verbose (debug-level) logging.
    #[arg(long)]
    pub verbose: bool,
}
