// Commandline argument parser using clap for TrialLogger

use crate::config::LoggerSettings;
use crate::error::LoggerError;
use crate::session::{FixedSide, PositionMode, RewardColor, SessionConfig, SinkFormat, TaskConfig};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct LoggerArgs {
    // log a session, simulate one, fix up a log, or manage subjects
    #[command(subcommand)]
    pub command: CommandTask,

    /// Settings file in ron format; defaults are used if omitted
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Directory holding one sub-directory of logs per subject
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,
}

impl LoggerArgs {
    /// The settings file, if any, with command line overrides applied.
    pub fn load_settings(&self) -> Result<LoggerSettings, LoggerError> {
        let mut settings = match &self.settings {
            Some(path) => LoggerSettings::from_path(path)?,
            None => LoggerSettings::default(),
        };
        if let Some(data_dir) = &self.data_dir {
            settings.data_dir = data_dir.clone();
        }
        if let CommandTask::Log(log) = &self.command {
            if let Some(port) = &log.port {
                settings.port = Some(port.clone());
            }
            if let Some(baud) = log.baud {
                settings.baud_rate = baud;
            }
        }
        Ok(settings)
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Log a session from a behaviour box on a serial port
    #[command(about)]
    Log(LogCommand),

    /// Log a session from the built-in simulated behaviour box
    #[command(about)]
    Simulate(SimulateCommand),

    /// Validate a notes-format log and rewrite it with recomputed durations
    #[command(about)]
    Resave(ResaveCommand),

    /// List known subjects, or add one
    #[command(about)]
    Subjects(SubjectsCommand),
}

/// Parameters shared by everything that runs a session.
#[derive(Debug, Args, Clone)]
pub struct SessionArgs {
    /// Subject id; logs go to <data-dir>/<subject>/
    #[arg(short, long)]
    pub subject: String,

    /// Stop once this many trials have been seen
    #[arg(short, long)]
    pub trials: Option<u32>,

    /// Reward cue colour sent to the device (G or P)
    #[arg(long, value_enum, requires = "mode")]
    pub color: Option<RewardColor>,

    /// Target position mode sent to the device (F or X)
    #[arg(long, value_enum, requires = "color")]
    pub mode: Option<PositionMode>,

    /// Direction for fixed mode (P for push, U for pull)
    #[arg(long, value_enum, default_value_t = FixedSide::Push)]
    pub side: FixedSide,

    /// Log layout
    #[arg(short, long, value_enum, default_value_t = SinkFormat::Flat)]
    pub format: SinkFormat,

    /// Subject weight, recorded in notes-format logs
    #[arg(short, long, default_value = "")]
    pub weight: String,

    /// Free-form notes, recorded in notes-format logs
    #[arg(short, long, default_value = "")]
    pub notes: String,
}

impl SessionArgs {
    pub fn to_config(&self) -> SessionConfig {
        let task = match (self.color, self.mode) {
            (Some(color), Some(mode)) => Some(TaskConfig {
                color,
                mode,
                side: self.side,
            }),
            _ => None,
        };
        SessionConfig {
            subject_id: self.subject.clone(),
            target_trials: self.trials,
            task,
            format: self.format,
            weight_grams: self.weight.clone(),
            session_notes: self.notes.clone(),
        }
    }
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct LogCommand {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Serial port of the behaviour box; a picker is shown if omitted
    #[arg(short, long)]
    pub port: Option<PathBuf>,

    /// Baud rate, if not the firmware's default
    #[arg(short, long)]
    pub baud: Option<u32>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SimulateCommand {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Chance that a simulated trial is correct
    #[arg(long, default_value_t = 0.7)]
    pub success_rate: f64,

    /// Milliseconds between simulated trials
    #[arg(long, default_value_t = 1000)]
    pub trial_period_ms: u64,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ResaveCommand {
    /// The notes-format log to rewrite
    pub path: PathBuf,

    /// Session end time as HH:MM:SS, if the log does not have one
    #[arg(short, long)]
    pub end_time: Option<String>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SubjectsCommand {
    /// Register a new subject instead of listing
    #[arg(short, long)]
    pub add: Option<String>,
}
