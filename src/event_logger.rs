//! The consumer side of the pipeline and the session state machine.
//!
//! ```text
//!            start()                 stop(reason)
//!   Idle ─────────────► Active ─────────────────► Stopping ──► Idle
//!                         │  target reached: Completed
//!                         │  device silent:  Timeout
//!                         │  fatal I/O:      Fatal
//!                         └─ operator:       StoppedByUser
//! ```
//!
//! An [`EventLogger`] owns the [`SessionState`], the open [`LogSink`] and the
//! [`SerialReader`] for the current session. The caller drives it by calling
//! [`EventLogger::poll`] in a loop, which waits up to one poll interval for
//! records, folds them into the session, writes them out, and applies the
//! completion and silence policies.

use crate::config::LoggerSettings;
use crate::device::LineDevice;
use crate::error::{DeviceError, LoggerError};
use crate::line_protocol::Record;
use crate::log_sink::{open_sink, LogSink, SessionClose};
use crate::serial_reader::{Handoff, SerialReader};
use crate::session::{
    Applied, LoggerStatus, SessionConfig, SessionSnapshot, SessionState, StopReason,
};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    time::Instant,
};

/// How many diagnostics are kept for the operator.
const DIAGNOSTIC_HISTORY: usize = 50;

/// Most records handled in one [`EventLogger::poll`] call, so a busy device
/// cannot starve the caller's refresh tick.
const MAX_BATCH: usize = 256;

/// Where the state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    Stopping,
}

struct ActiveSession {
    reader: SerialReader,
    rx: Receiver<Handoff>,
    sink: Box<dyn LogSink>,
    last_activity: Instant,
}

/// Runs one session at a time; reusable across sessions.
pub struct EventLogger {
    settings: LoggerSettings,
    phase: Phase,
    status: LoggerStatus,
    state: SessionState,
    target_trials: Option<u32>,
    session: Option<ActiveSession>,
    log_path: Option<PathBuf>,
    diagnostics: VecDeque<String>,
}

impl EventLogger {
    pub fn new(settings: LoggerSettings) -> Self {
        let state = SessionState::new("", settings.rolling_window);
        Self {
            settings,
            phase: Phase::Idle,
            status: LoggerStatus::Idle,
            state,
            target_trials: None,
            session: None,
            log_path: None,
            diagnostics: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> &LoggerStatus {
        &self.status
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// The log file of the current or most recent session.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Recent operator-facing diagnostics, oldest first.
    pub fn diagnostics(&self) -> impl Iterator<Item = &str> + '_ {
        self.diagnostics.iter().map(String::as_str)
    }

    /// Starts a session reading from `device`. Only valid while idle.
    ///
    /// The configuration is checked, the task configuration line (if any) is
    /// sent, and the log is created before anything about the logger
    /// changes. If any of that fails the device is closed and the logger is
    /// left exactly as it was.
    pub fn start(
        &mut self,
        config: SessionConfig,
        mut device: Box<dyn LineDevice>,
    ) -> Result<(), LoggerError> {
        if self.phase != Phase::Idle {
            device.close();
            return Err(LoggerError::InvalidConfig(
                "a session is already running".to_owned(),
            ));
        }
        if let Err(e) = config.validate() {
            device.close();
            return Err(e);
        }

        if let Some(line) = config.command_line() {
            info!("Configuring device: {}", line);
            if let Err(e) = device.write_line(&line) {
                device.close();
                return Err(e.into());
            }
        }

        let started_at = Local::now();
        let sink = match open_sink(&self.settings.data_dir, &config, started_at) {
            Ok(sink) => sink,
            Err(e) => {
                device.close();
                return Err(e.into());
            }
        };

        let (reader, rx) = SerialReader::spawn(device, self.settings.channel_capacity);

        self.state = SessionState::new(&config.subject_id, self.settings.rolling_window);
        self.state.begin(started_at);
        self.target_trials = config.target_trials;
        self.log_path = Some(sink.path().to_owned());
        self.diagnostics.clear();
        self.session = Some(ActiveSession {
            reader,
            rx,
            sink,
            last_activity: Instant::now(),
        });
        self.phase = Phase::Active;
        self.status = LoggerStatus::Active { since: started_at };
        info!(
            "Session for {} started, logging to {}",
            config.subject_id,
            self.log_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Waits up to one poll interval for records and handles them, then
    /// applies the silence timeout. Does nothing unless a session is active.
    ///
    /// An `Err` means the session was forced down by an I/O failure; the
    /// logger is idle again by the time it is returned.
    pub fn poll(&mut self) -> Result<(), LoggerError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        let first = match session.rx.recv_timeout(self.settings.poll_interval()) {
            Ok(handoff) => Some(handoff),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return self.reader_vanished(),
        };

        if let Some(handoff) = first {
            self.handle(handoff)?;
            for _ in 1..MAX_BATCH {
                let Some(session) = self.session.as_ref() else {
                    break;
                };
                match session.rx.try_recv() {
                    Ok(handoff) => self.handle(handoff)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.reader_vanished(),
                }
            }
        }

        let silent_for = self.session.as_ref().map(|s| s.last_activity.elapsed());
        if silent_for.is_some_and(|quiet| quiet >= self.settings.silence_timeout()) {
            warn!(
                "No device output for {:?}, ending session",
                self.settings.silence_timeout()
            );
            self.stop(StopReason::Timeout)?;
        }
        Ok(())
    }

    fn handle(&mut self, handoff: Handoff) -> Result<(), LoggerError> {
        match handoff {
            Handoff::Record(record) => self.on_record(record, Local::now()),
            Handoff::Fault(fault) => self.on_fault(fault),
        }
    }

    fn reader_vanished(&mut self) -> Result<(), LoggerError> {
        let detail = "reader thread exited unexpectedly".to_owned();
        error!("{}", detail);
        self.stop(StopReason::Fatal(detail.clone()))?;
        Err(LoggerError::Io(crate::error::IoFailure::Fatal(detail)))
    }

    /// Folds one record received at `received_at` into the session and
    /// writes it out. Ignored unless a session is active.
    pub fn on_record(
        &mut self,
        record: Record,
        received_at: DateTime<Local>,
    ) -> Result<(), LoggerError> {
        if self.phase != Phase::Active {
            return Ok(());
        }
        if let Some(session) = self.session.as_mut() {
            session.last_activity = Instant::now();
        }

        self.accept(record, received_at)?;

        if let Some(target) = self.target_trials {
            if self.state.trial_counter() >= target {
                info!("Reached {} trials", target);
                self.stop(StopReason::Completed)?;
            }
        }
        Ok(())
    }

    fn accept(&mut self, record: Record, received_at: DateTime<Local>) -> Result<(), LoggerError> {
        if let Record::Malformed { raw_text, reason } = &record {
            warn!("Malformed line {:?}: {}", raw_text, reason);
            self.diagnose(format!("malformed line {:?}: {}", raw_text, reason));
        }

        match self.state.apply(record, received_at) {
            Applied::Malformed => Ok(()),
            Applied::Logged { new_trial } => {
                let Some(entry) = self.state.last_event() else {
                    return Ok(());
                };
                debug!("Accepted #{} {:?}", entry.number, entry.record);
                if new_trial {
                    debug!("Trial {} began", entry.trial_number.unwrap_or_default());
                }
                if let Some(warning) = entry.warning.clone() {
                    warn!("{}", warning);
                    self.diagnose(warning);
                }

                let Some(entry) = self.state.last_event() else {
                    return Ok(());
                };
                let appended = match self.session.as_mut() {
                    Some(session) => session.sink.append(entry),
                    None => Ok(()),
                };
                if let Err(e) = appended {
                    let detail = format!("could not write log: {}", e);
                    error!("{}", detail);
                    if self.phase == Phase::Active {
                        self.stop(StopReason::Fatal(detail))?;
                    }
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    fn on_fault(&mut self, fault: DeviceError) -> Result<(), LoggerError> {
        self.diagnose(fault.to_string());
        if !fault.is_fatal() {
            return Ok(());
        }
        error!("Device lost: {}", fault);
        self.stop(StopReason::Fatal(fault.to_string()))?;
        Err(fault.into())
    }

    fn diagnose(&mut self, message: String) {
        if self.diagnostics.len() == DIAGNOSTIC_HISTORY {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(message);
    }

    /// Ends the session. The reader is stopped and the device closed before
    /// the log is closed; records already in the channel are written out
    /// first. `STOP` is sent to the device only when the operator asked.
    ///
    /// A session completes as soon as the last target trial is first seen,
    /// normally at its `EVENT,START`. That trial's outcome and `EVENT,END`
    /// are logged only if they are already in the channel at that point, so
    /// the final outcome is usually missing from the log and from
    /// `correct_count`.
    ///
    /// Calling this while idle does nothing. The logger is always idle
    /// afterwards, even when an error is returned.
    pub fn stop(&mut self, reason: StopReason) -> Result<(), LoggerError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.phase = Phase::Stopping;
        info!("Stopping session: {}", reason);

        let ActiveSession {
            reader,
            rx,
            mut sink,
            ..
        } = session;

        let report = reader.shutdown(reason == StopReason::StoppedByUser);
        debug!("Reader report: {:?}", report);

        let mut first_error: Option<LoggerError> = None;
        while let Ok(handoff) = rx.try_recv() {
            let Handoff::Record(record) = handoff else {
                continue;
            };
            if let Record::Malformed { raw_text, reason } = &record {
                self.diagnose(format!("malformed line {:?}: {}", raw_text, reason));
            }
            if let Applied::Logged { .. } = self.state.apply(record, Local::now()) {
                if let Some(entry) = self.state.last_event() {
                    if let Err(e) = sink.append(entry) {
                        warn!("Could not write trailing record: {}", e);
                        first_error.get_or_insert(e.into());
                        break;
                    }
                }
            }
        }

        let ended_at = Local::now();
        self.state.end(ended_at);
        if let Err(e) = sink.close(&SessionClose {
            reason: reason.clone(),
            ended_at,
        }) {
            error!("Could not close log: {}", e);
            first_error.get_or_insert(e.into());
        }

        info!(
            "Session ended ({}) after {} trials, {} rows in {}",
            reason,
            self.state.trial_counter(),
            sink.rows_written(),
            sink.path().display()
        );
        self.status = LoggerStatus::Stopped(reason);
        self.phase = Phase::Idle;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forgets the last session, as for a fresh start. Only valid while idle.
    pub fn clear(&mut self) -> Result<(), LoggerError> {
        if self.phase != Phase::Idle {
            return Err(LoggerError::InvalidConfig(
                "cannot clear a running session".to_owned(),
            ));
        }
        self.state.clear();
        self.status = LoggerStatus::Idle;
        self.target_trials = None;
        self.log_path = None;
        self.diagnostics.clear();
        Ok(())
    }

    /// A read-only copy of everything a front end would show.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::capture(
            &self.state,
            self.status.clone(),
            self.target_trials,
            self.diagnostics.iter().cloned().collect(),
            self.log_path.clone(),
            Local::now(),
        )
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop(StopReason::StoppedByUser) {
            warn!("Session did not shut down cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_device::{ScriptStep, ScriptedDevice};
    use crate::serial_reader::HALT_COMMAND;
    use crate::session::{FixedSide, PositionMode, RewardColor, TaskConfig};
    use std::{fs, thread, time::Duration};

    fn settings(data_dir: &Path) -> LoggerSettings {
        LoggerSettings {
            data_dir: data_dir.to_owned(),
            poll_interval_ms: 10,
            silence_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn drive(logger: &mut EventLogger, until: impl Fn(&EventLogger) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !until(logger) && Instant::now() < deadline {
            let _ = logger.poll();
        }
    }

    #[test]
    fn rejected_start_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));

        let device = ScriptedDevice::new(["1,1"]);
        let probe = device.probe();
        let mut config = SessionConfig::new("m1");
        config.target_trials = Some(0);

        assert!(matches!(
            logger.start(config, Box::new(device)),
            Err(LoggerError::InvalidConfig(_))
        ));
        assert_eq!(logger.phase(), Phase::Idle);
        assert_eq!(*logger.status(), LoggerStatus::Idle);
        assert!(probe.written().is_empty());
        assert_eq!(probe.close_count(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn only_one_session_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        logger
            .start(SessionConfig::new("m1"), Box::new(ScriptedDevice::new(["1,1"])))
            .unwrap();

        let second = ScriptedDevice::new(["2,2"]);
        let probe = second.probe();
        assert!(logger
            .start(SessionConfig::new("m2"), Box::new(second))
            .is_err());
        assert_eq!(probe.close_count(), 1);
        assert!(logger.is_active());
        assert_eq!(logger.state().subject_id(), "m1");
    }

    #[test]
    fn task_config_goes_out_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let device = ScriptedDevice::new(Vec::<String>::new());
        let probe = device.probe();

        let mut config = SessionConfig::new("m1");
        config.target_trials = Some(5);
        config.task = Some(TaskConfig {
            color: RewardColor::Green,
            mode: PositionMode::Fixed,
            side: FixedSide::Push,
        });
        logger.start(config, Box::new(device)).unwrap();
        assert_eq!(probe.written(), vec!["TRIALS=5;COLOR=G;MODE=F;SIDE=P"]);

        logger.stop(StopReason::StoppedByUser).unwrap();
        assert_eq!(
            probe.written(),
            vec!["TRIALS=5;COLOR=G;MODE=F;SIDE=P", HALT_COMMAND]
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let device = ScriptedDevice::new(["EVENT,START,1,100"]);
        let probe = device.probe();
        logger.start(SessionConfig::new("m1"), Box::new(device)).unwrap();
        drive(&mut logger, |l| l.state().trial_counter() == 1);

        logger.stop(StopReason::StoppedByUser).unwrap();
        let after_first = logger.snapshot();
        logger.stop(StopReason::Timeout).unwrap();
        let after_second = logger.snapshot();

        assert_eq!(after_first.status, after_second.status);
        assert_eq!(
            after_second.status,
            LoggerStatus::Stopped(StopReason::StoppedByUser)
        );
        assert_eq!(probe.close_count(), 1);
        assert_eq!(probe.written(), vec![HALT_COMMAND]);
    }

    #[test]
    fn stopping_without_operator_leaves_the_device_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let device = ScriptedDevice::new(Vec::<String>::new());
        let probe = device.probe();
        logger.start(SessionConfig::new("m1"), Box::new(device)).unwrap();
        logger.stop(StopReason::Completed).unwrap();
        assert!(probe.written().is_empty());
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn transient_faults_keep_the_session_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let device = ScriptedDevice::from_steps([
            ScriptStep::TransientError,
            ScriptStep::Line("EVENT,START,1,100".to_owned()),
        ]);
        logger.start(SessionConfig::new("m1"), Box::new(device)).unwrap();
        drive(&mut logger, |l| l.state().trial_counter() == 1);

        assert!(logger.is_active());
        assert_eq!(logger.diagnostics().count(), 1);
        assert!(logger.diagnostics().any(|d| d.contains("transient")));
    }

    #[test]
    fn fatal_faults_force_a_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let device = ScriptedDevice::from_steps([
            ScriptStep::Line("EVENT,START,1,100".to_owned()),
            ScriptStep::FatalError,
        ]);
        let probe = device.probe();
        logger.start(SessionConfig::new("m1"), Box::new(device)).unwrap();

        let mut failure = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while logger.is_active() && Instant::now() < deadline {
            if let Err(e) = logger.poll() {
                failure = Some(e);
            }
        }

        assert!(matches!(
            failure,
            Some(LoggerError::Io(crate::error::IoFailure::Fatal(_)))
        ));
        assert!(matches!(
            logger.status(),
            LoggerStatus::Stopped(StopReason::Fatal(_))
        ));
        assert!(logger.status().to_string().contains("Fatal: "));
        assert_eq!(logger.state().trial_counter(), 1);
        assert_eq!(probe.close_count(), 1);
    }

    #[test]
    fn records_left_in_the_channel_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        let lines: Vec<String> = (0..20).map(|i| format!("{},{}", i, i)).collect();
        logger
            .start(SessionConfig::new("m1"), Box::new(ScriptedDevice::new(lines)))
            .unwrap();

        // let the reader run ahead without polling
        thread::sleep(Duration::from_millis(100));
        logger.stop(StopReason::StoppedByUser).unwrap();

        assert_eq!(logger.state().events().len(), 20);
        let content = fs::read_to_string(logger.log_path().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 21);
    }

    #[test]
    fn clear_only_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(settings(dir.path()));
        logger
            .start(SessionConfig::new("m1"), Box::new(ScriptedDevice::new(["EVENT,A,1,1"])))
            .unwrap();
        assert!(logger.clear().is_err());
        drive(&mut logger, |l| l.state().trial_counter() == 1);
        logger.stop(StopReason::StoppedByUser).unwrap();

        logger.clear().unwrap();
        assert_eq!(*logger.status(), LoggerStatus::Idle);
        assert_eq!(logger.state().trial_counter(), 0);
        assert_eq!(logger.snapshot().record_count, 0);
    }
}
