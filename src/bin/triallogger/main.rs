//! Command line entry point: logs a behaviour box session from a serial port
//! or from the simulator, re-saves notes-format logs, and manages subjects.

use clap::Parser;
use triallogger::{
    args::{
        CommandTask::{Log, Resave, Simulate, Subjects},
        LoggerArgs, ResaveCommand, SessionArgs, SubjectsCommand,
    },
    config::LoggerSettings,
    device::{LineDevice, SerialDevice},
    dummy_device::SimulatedDevice,
    error::LoggerError,
    event_logger::EventLogger,
    gui::{monitor_session, port_selector},
    log_sink::{load_notes_log, resave_notes_log},
    subjects::{DirectoryRegistry, SubjectRegistry},
};

use chrono::NaiveTime;
use log::{error, info};
use std::{error::Error, process::ExitCode, time::Duration};

// Example:
// cargo run --bin triallogger -- log
//                                --port    /dev/ttyACM0
//                                --subject m7
//                                --trials  20
//                                --color   G
//                                --mode    F
//                                --side    P
//                                --format  notes

fn main() -> ExitCode {
    env_logger::init();
    let args = LoggerArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("triallogger: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: LoggerArgs) -> Result<(), Box<dyn Error>> {
    let settings = args.load_settings()?;

    match args.command {
        Log(cmd) => {
            let port = match settings.port.clone() {
                Some(port) => port,
                None => {
                    let ports = SerialDevice::available_ports()?;
                    if ports.is_empty() {
                        println!("No serial ports found; is the behaviour box plugged in?");
                        return Ok(());
                    }
                    match port_selector(ports)? {
                        Some(port) => port,
                        None => {
                            println!("No serial port selected.");
                            return Ok(());
                        }
                    }
                }
            };
            let device =
                SerialDevice::open(&port, settings.baud_rate, settings.read_timeout())
                    .map_err(LoggerError::from)?;
            info!("Opened {}", port.display());
            run_session(settings, &cmd.session, Box::new(device))
        }

        Simulate(cmd) => {
            let device = SimulatedDevice::builder()
                .success_rate(cmd.success_rate)
                .trial_period(Duration::from_millis(cmd.trial_period_ms))
                .read_timeout(settings.read_timeout())
                .build();
            run_session(settings, &cmd.session, Box::new(device))
        }

        Resave(cmd) => resave(&settings, &cmd),

        Subjects(cmd) => subjects(&settings, &cmd),
    }
}

fn run_session(
    settings: LoggerSettings,
    session: &SessionArgs,
    device: Box<dyn LineDevice>,
) -> Result<(), Box<dyn Error>> {
    let mut logger = EventLogger::new(settings);
    logger.start(session.to_config(), device)?;

    let snapshot = monitor_session(&mut logger)?;

    println!("Session for {}: {}", snapshot.subject_id, snapshot.status);
    println!(
        "  {} trials, {} correct, elapsed {}",
        snapshot.trial_counter,
        snapshot.correct_count,
        snapshot.elapsed_hms()
    );
    if let Some(rate) = snapshot.success_rate {
        println!("  success rate {:.1}%", rate);
    }
    if snapshot.malformed_count > 0 {
        println!("  {} malformed lines ignored", snapshot.malformed_count);
    }
    if let Some(path) = &snapshot.log_path {
        println!("  log written to {}", path.display());
    }
    Ok(())
}

fn resave(settings: &LoggerSettings, cmd: &ResaveCommand) -> Result<(), Box<dyn Error>> {
    let end_time = match &cmd.end_time {
        Some(raw) => Some(NaiveTime::parse_from_str(raw, "%H:%M:%S").map_err(|_| {
            LoggerError::InvalidConfig(format!("end time {:?} is not HH:MM:SS", raw))
        })?),
        None => None,
    };

    let mut loaded = load_notes_log(&cmd.path, settings.rolling_window)?;
    if loaded.skipped_rows > 0 {
        println!("Skipped {} unreadable rows.", loaded.skipped_rows);
    }
    for warning in resave_notes_log(&mut loaded, end_time)? {
        println!("warning: {}", warning);
    }
    println!(
        "Re-saved {}: {} events, {} trials, {} correct.",
        loaded.path.display(),
        loaded.rows.len(),
        loaded.state.trial_counter(),
        loaded.state.correct_count()
    );
    Ok(())
}

fn subjects(settings: &LoggerSettings, cmd: &SubjectsCommand) -> Result<(), Box<dyn Error>> {
    let mut registry = DirectoryRegistry::new(&settings.data_dir);
    match &cmd.add {
        Some(subject_id) => {
            registry.add(subject_id)?;
            println!("Added {}.", subject_id);
        }
        None => {
            for subject_id in registry.subjects()? {
                println!("{}", subject_id);
            }
        }
    }
    Ok(())
}
