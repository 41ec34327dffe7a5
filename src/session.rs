//! Session configuration and the running state of one session.
//!
//! [`SessionState`] is plain data plus transition functions; it does no I/O.
//! The [`EventLogger`](crate::event_logger::EventLogger) owns it exclusively
//! and hands out [`SessionSnapshot`]s to anyone who wants to look.

use crate::error::LoggerError;
use crate::line_protocol::Record;
use crate::rolling_window::{success_rate_series, RollingWindow, DEFAULT_WINDOW};

use chrono::{DateTime, Local};
use std::{collections::BTreeSet, fmt, path::PathBuf, time::Duration};

/// Reward cue colour, sent to the firmware as `COLOR=G|P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RewardColor {
    #[value(alias = "G")]
    Green,
    #[value(alias = "P")]
    Purple,
}

/// How the target position is chosen, sent as `MODE=F|X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PositionMode {
    #[value(alias = "F")]
    Fixed,
    #[value(alias = "X")]
    Random,
}

/// Which way the lever must move in fixed mode, sent as `SIDE=P|U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FixedSide {
    #[value(alias = "P")]
    Push,
    #[value(alias = "U")]
    Pull,
}

impl RewardColor {
    fn code(self) -> char {
        match self {
            Self::Green => 'G',
            Self::Purple => 'P',
        }
    }
}

impl PositionMode {
    fn code(self) -> char {
        match self {
            Self::Fixed => 'F',
            Self::Random => 'X',
        }
    }
}

impl FixedSide {
    fn code(self) -> char {
        match self {
            Self::Push => 'P',
            Self::Pull => 'U',
        }
    }
}

/// The task parameters the firmware needs before it starts a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    pub color: RewardColor,
    pub mode: PositionMode,
    /// Only meaningful, and only sent, in [`PositionMode::Fixed`].
    pub side: FixedSide,
}

impl TaskConfig {
    /// The configuration line, without its trailing newline, e.g.
    /// `TRIALS=5;COLOR=G;MODE=F;SIDE=P`.
    pub fn command_line(&self, trials: u32) -> String {
        let mut line = format!(
            "TRIALS={};COLOR={};MODE={}",
            trials,
            self.color.code(),
            self.mode.code()
        );
        if self.mode == PositionMode::Fixed {
            line.push_str(&format!(";SIDE={}", self.side.code()));
        }
        line
    }

    /// Key/value pairs describing the task, for log file preambles.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("color", format!("{:?}", self.color)),
            ("mode", format!("{:?}", self.mode)),
            (
                "side",
                match self.mode {
                    PositionMode::Fixed => format!("{:?}", self.side),
                    PositionMode::Random => "N/A".to_owned(),
                },
            ),
        ]
    }
}

/// Which of the two log layouts a session writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SinkFormat {
    /// `line_type,timestamp_ms,encoder_value,event_type,trial_number`
    Flat,
    /// A `key,value` preamble, a blank line, then an event table.
    Notes,
}

/// Everything needed to start one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub subject_id: String,
    /// When set, the session completes once this many trials are seen.
    pub target_trials: Option<u32>,
    /// When set, a configuration line is sent to the device on start.
    pub task: Option<TaskConfig>,
    pub format: SinkFormat,
    pub weight_grams: String,
    pub session_notes: String,
}

impl SessionConfig {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            target_trials: None,
            task: None,
            format: SinkFormat::Flat,
            weight_grams: String::new(),
            session_notes: String::new(),
        }
    }

    /// Checks the configuration without touching anything.
    pub fn validate(&self) -> Result<(), LoggerError> {
        validate_subject_id(&self.subject_id)?;

        if self.target_trials == Some(0) {
            return Err(LoggerError::InvalidConfig(
                "trial target must be a positive number".to_owned(),
            ));
        }
        if self.task.is_some() && self.target_trials.is_none() {
            return Err(LoggerError::InvalidConfig(
                "a task configuration needs a trial target".to_owned(),
            ));
        }
        Ok(())
    }

    /// The line to send to the device on start, if any.
    pub fn command_line(&self) -> Option<String> {
        match (self.task, self.target_trials) {
            (Some(task), Some(trials)) => Some(task.command_line(trials)),
            _ => None,
        }
    }
}

/// Subject ids double as directory names, so they must be non-empty and
/// must not escape the data directory.
pub fn validate_subject_id(subject_id: &str) -> Result<(), LoggerError> {
    let trimmed = subject_id.trim();
    if trimmed.is_empty() {
        return Err(LoggerError::InvalidConfig("subject id is empty".to_owned()));
    }
    if trimmed != subject_id
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', ':'])
    {
        return Err(LoggerError::InvalidConfig(format!(
            "subject id {:?} is not a valid directory name",
            subject_id
        )));
    }
    Ok(())
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The configured trial target was reached.
    Completed,
    /// The device went quiet for longer than the silence timeout.
    Timeout,
    /// An I/O failure forced the session down.
    Fatal(String),
    /// The operator pressed stop.
    StoppedByUser,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Fatal(detail) => write!(f, "Fatal: {}", detail),
            Self::StoppedByUser => write!(f, "StoppedByUser"),
        }
    }
}

/// What the operator sees: either logging is running, or it is not and here
/// is why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerStatus {
    /// No session has run yet.
    Idle,
    Active { since: DateTime<Local> },
    Stopped(StopReason),
}

impl fmt::Display for LoggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Active { since } => {
                write!(f, "logging active since {}", since.format("%H:%M:%S"))
            }
            Self::Stopped(reason) => write!(f, "stopped: {}", reason),
        }
    }
}

/// One accepted record together with what the session derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRecord {
    /// 1-based position in the session.
    pub number: usize,
    pub received_at: DateTime<Local>,
    pub record: Record,
    /// The trial this record was attributed to, if any.
    pub trial_number: Option<u32>,
    /// Seconds since the previous record; `None` for the first one.
    pub duration_sec: Option<f64>,
    pub warning: Option<String>,
}

/// What [`SessionState::apply`] did with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The record was appended; the flag says whether it opened a new trial.
    Logged { new_trial: bool },
    /// The record was malformed and only counted.
    Malformed,
}

/// The signed number of seconds between two records. Device timestamps are
/// used when both records carry one, the host clock difference otherwise.
pub fn signed_duration(
    prev_device_us: Option<u64>,
    device_us: Option<u64>,
    host_elapsed: chrono::Duration,
) -> f64 {
    match (prev_device_us, device_us) {
        (Some(prev), Some(cur)) => (cur as i128 - prev as i128) as f64 / 1_000_000.0,
        _ => host_elapsed.num_milliseconds() as f64 / 1000.0,
    }
}

/// Counters, timestamps and the in-memory mirror of the log for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    subject_id: String,
    session_start: Option<DateTime<Local>>,
    session_end: Option<DateTime<Local>>,
    trial_counter: u32,
    correct_count: u32,
    seen_trials: BTreeSet<u32>,
    /// A trial whose events have arrived but whose outcome has not.
    open_trial: Option<u32>,
    last_trial_number: Option<u32>,
    events: Vec<LoggedRecord>,
    outcomes: Vec<bool>,
    window: RollingWindow,
    malformed_count: u64,
}

impl SessionState {
    pub fn new(subject_id: impl Into<String>, window: usize) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_start: None,
            session_end: None,
            trial_counter: 0,
            correct_count: 0,
            seen_trials: BTreeSet::new(),
            open_trial: None,
            last_trial_number: None,
            events: Vec::new(),
            outcomes: Vec::new(),
            window: RollingWindow::new(window),
            malformed_count: 0,
        }
    }

    /// Marks the session as started at `at`.
    pub fn begin(&mut self, at: DateTime<Local>) {
        self.session_start = Some(at);
        self.session_end = None;
    }

    /// Freezes the clock at `at`.
    pub fn end(&mut self, at: DateTime<Local>) {
        self.session_end = Some(at);
    }

    /// Forgets everything but the subject, as for a new session.
    pub fn clear(&mut self) {
        *self = Self::new(std::mem::take(&mut self.subject_id), self.window.size());
    }

    /// Folds one record received at `received_at` into the session.
    pub fn apply(&mut self, record: Record, received_at: DateTime<Local>) -> Applied {
        if let Record::Malformed { .. } = record {
            self.malformed_count += 1;
            return Applied::Malformed;
        }
        if self.session_start.is_none() {
            self.session_start = Some(received_at);
        }

        let (duration_sec, warning) = match self.events.last() {
            Some(prev) => {
                let duration = signed_duration(
                    prev.record.device_time_us(),
                    record.device_time_us(),
                    received_at - prev.received_at,
                );
                let warning = (duration < 0.0).then(|| {
                    format!(
                        "negative duration {:.3}s since record {}",
                        duration, prev.number
                    )
                });
                (Some(duration), warning)
            }
            None => (None, None),
        };

        let (trial_number, new_trial) = match &record {
            Record::Event { trial_number, .. } => {
                let new_trial = self.seen_trials.insert(*trial_number);
                if new_trial {
                    self.open_trial = Some(*trial_number);
                }
                (Some(*trial_number), new_trial)
            }
            Record::TrialOutcome { outcome, .. } => {
                let (trial, new_trial) = match self.open_trial.take() {
                    Some(trial) => (trial, false),
                    None => self.implicit_trial(),
                };
                let correct = outcome.is_correct();
                if correct {
                    self.correct_count += 1;
                }
                self.outcomes.push(correct);
                self.window.push(correct);
                (Some(trial), new_trial)
            }
            _ => (None, false),
        };

        if trial_number.is_some() {
            self.last_trial_number = trial_number;
        }
        self.trial_counter = self.seen_trials.len() as u32;

        self.events.push(LoggedRecord {
            number: self.events.len() + 1,
            received_at,
            record,
            trial_number,
            duration_sec,
            warning,
        });

        Applied::Logged { new_trial }
    }

    /// Numbers an outcome that arrived with no trial open: one past the
    /// highest trial seen, or the lowest unused number once that would wrap.
    fn implicit_trial(&mut self) -> (u32, bool) {
        let next = match self.seen_trials.last() {
            None => Some(1),
            Some(&last) => last
                .checked_add(1)
                .or_else(|| (1..=u32::MAX).find(|n| !self.seen_trials.contains(n))),
        };
        match next {
            Some(trial) => (trial, self.seen_trials.insert(trial)),
            None => (u32::MAX, false),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn session_start(&self) -> Option<DateTime<Local>> {
        self.session_start
    }

    pub fn session_end(&self) -> Option<DateTime<Local>> {
        self.session_end
    }

    pub fn trial_counter(&self) -> u32 {
        self.trial_counter
    }

    pub fn correct_count(&self) -> u32 {
        self.correct_count
    }

    pub fn last_trial_number(&self) -> Option<u32> {
        self.last_trial_number
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    /// Every accepted record, in order.
    pub fn events(&self) -> &[LoggedRecord] {
        &self.events
    }

    /// The most recently accepted record.
    pub fn last_event(&self) -> Option<&LoggedRecord> {
        self.events.last()
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    /// Correct trials as a percentage of all trials; `None` before the first.
    pub fn success_rate(&self) -> Option<f64> {
        (self.trial_counter > 0)
            .then(|| self.correct_count as f64 / self.trial_counter as f64 * 100.0)
    }

    /// Time since the session started, frozen once it has ended.
    pub fn elapsed(&self, now: DateTime<Local>) -> Duration {
        match self.session_start {
            Some(start) => (self.session_end.unwrap_or(now) - start)
                .to_std()
                .unwrap_or_default(),
            None => Duration::ZERO,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new("", DEFAULT_WINDOW)
    }
}

/// A read-only copy of the session, taken after each change, for whatever
/// front end is watching.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub subject_id: String,
    pub status: LoggerStatus,
    pub trial_counter: u32,
    pub correct_count: u32,
    pub target_trials: Option<u32>,
    pub last_trial_number: Option<u32>,
    pub success_rate: Option<f64>,
    pub rolling_success_rate: Option<f64>,
    /// `(trial, percent)` points for a rolling success rate plot.
    pub rolling_series: Vec<(usize, f64)>,
    pub elapsed: Duration,
    pub record_count: usize,
    pub malformed_count: u64,
    pub diagnostics: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl SessionSnapshot {
    pub fn capture(
        state: &SessionState,
        status: LoggerStatus,
        target_trials: Option<u32>,
        diagnostics: Vec<String>,
        log_path: Option<PathBuf>,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            subject_id: state.subject_id.clone(),
            status,
            trial_counter: state.trial_counter,
            correct_count: state.correct_count,
            target_trials,
            last_trial_number: state.last_trial_number,
            success_rate: state.success_rate(),
            rolling_success_rate: state.window.success_rate(),
            rolling_series: success_rate_series(&state.outcomes, state.window.size()),
            elapsed: state.elapsed(now),
            record_count: state.events.len(),
            malformed_count: state.malformed_count,
            diagnostics,
            log_path,
        }
    }

    /// Progress toward the trial target, in percent, capped at 100.
    pub fn progress(&self) -> Option<f64> {
        self.target_trials
            .map(|target| (self.trial_counter as f64 / target.max(1) as f64 * 100.0).min(100.0))
    }

    /// Elapsed session time as `HH:MM:SS`.
    pub fn elapsed_hms(&self) -> String {
        let secs = self.elapsed.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn feed(state: &mut SessionState, lines: &[&str]) {
        for (i, line) in lines.iter().enumerate() {
            state.apply(Record::parse(line), at(i as i64));
        }
    }

    #[test]
    fn trial_numbers_are_deduplicated() {
        let mut state = SessionState::new("m1", 10);
        feed(
            &mut state,
            &[
                "EVENT,REWARD,1,1000000",
                "EVENT,REWARD,1,1005000",
                "EVENT,REWARD,2,2000000",
            ],
        );
        assert_eq!(state.trial_counter(), 2);
        assert_eq!(state.events().len(), 3);
    }

    #[test]
    fn counter_is_distinct_trial_numbers_not_lines() {
        let mut state = SessionState::new("m1", 10);
        feed(
            &mut state,
            &[
                "EVENT,START,3,10",
                "EVENT,START,1,20",
                "EVENT,END,3,30",
                "10,4",
                "EVENT,START,1,40",
                "EVENT,START,7,50",
            ],
        );
        assert_eq!(state.trial_counter(), 3);
        assert_eq!(state.last_trial_number(), Some(7));
    }

    #[test]
    fn outcomes_count_as_trials() {
        let mut state = SessionState::new("m1", 10);
        feed(&mut state, &["TRIAL,CORRECT,350,120", "TRIAL,INCORRECT,410,80"]);
        assert_eq!(state.correct_count(), 1);
        assert_eq!(state.trial_counter(), 2);
        assert_eq!(state.success_rate(), Some(50.0));
        assert_eq!(state.window().success_rate(), Some(50.0));
    }

    #[test]
    fn outcome_closes_the_open_trial() {
        let mut state = SessionState::new("m1", 10);
        feed(
            &mut state,
            &[
                "EVENT,START,1,100",
                "12,5",
                "TRIAL,CORRECT,300,5",
                "EVENT,END,1,900",
                "EVENT,START,2,1000",
                "TRIAL,TIMEOUT,900,0",
                "TRIAL,CORRECT,200,3",
            ],
        );
        // the last outcome had no open trial, so it is trial 3
        assert_eq!(state.trial_counter(), 3);
        assert_eq!(state.correct_count(), 2);
        assert_eq!(state.events()[2].trial_number, Some(1));
        assert_eq!(state.events()[6].trial_number, Some(3));
        assert_eq!(state.events()[1].trial_number, None);
    }

    #[test]
    fn outcome_after_the_highest_trial_number_takes_a_free_one() {
        let mut state = SessionState::new("m1", 10);
        feed(
            &mut state,
            &[
                "EVENT,END,4294967295,10",
                "TRIAL,CORRECT,350,120",
                "TRIAL,CORRECT,350,120",
                "TRIAL,INCORRECT,350,120",
            ],
        );
        assert_eq!(state.events()[1].trial_number, Some(u32::MAX));
        assert_eq!(state.events()[2].trial_number, Some(1));
        assert_eq!(state.events()[3].trial_number, Some(2));
        assert_eq!(state.trial_counter(), 3);
        assert_eq!(state.correct_count(), 2);
    }

    #[test]
    fn malformed_lines_are_only_counted() {
        let mut state = SessionState::new("m1", 10);
        assert_eq!(
            state.apply(Record::parse("garbage-line"), at(0)),
            Applied::Malformed
        );
        assert_eq!(state.malformed_count(), 1);
        assert_eq!(state.trial_counter(), 0);
        assert!(state.events().is_empty());
    }

    #[test]
    fn durations_prefer_the_device_clock() {
        let mut state = SessionState::new("m1", 10);
        feed(
            &mut state,
            &["EVENT,START,1,1000000", "EVENT,END,1,3500000", "TRIAL,CORRECT,1,1"],
        );
        let events = state.events();
        assert_eq!(events[0].duration_sec, None);
        assert_eq!(events[1].duration_sec, Some(2.5));
        // no device clock on TRIAL lines, so host receive times are used
        assert_eq!(events[2].duration_sec, Some(1.0));
    }

    #[test]
    fn negative_durations_are_kept_with_a_warning() {
        let mut state = SessionState::new("m1", 10);
        feed(&mut state, &["EVENT,START,1,5000000", "EVENT,END,1,4000000"]);
        let last = state.last_event().unwrap();
        assert_eq!(last.duration_sec, Some(-1.0));
        assert!(last.warning.as_deref().unwrap().contains("negative"));
    }

    #[test]
    fn elapsed_freezes_at_end() {
        let mut state = SessionState::new("m1", 10);
        state.begin(at(0));
        assert_eq!(state.elapsed(at(90)), Duration::from_secs(90));
        state.end(at(100));
        assert_eq!(state.elapsed(at(5000)), Duration::from_secs(100));
    }

    #[test]
    fn config_validation() {
        assert!(SessionConfig::new("m1").validate().is_ok());
        assert!(SessionConfig::new("").validate().is_err());
        assert!(SessionConfig::new("  ").validate().is_err());
        assert!(SessionConfig::new("../etc").validate().is_err());
        assert!(SessionConfig::new("a/b").validate().is_err());

        let mut config = SessionConfig::new("m1");
        config.target_trials = Some(0);
        assert!(matches!(
            config.validate(),
            Err(LoggerError::InvalidConfig(_))
        ));

        config.target_trials = None;
        config.task = Some(TaskConfig {
            color: RewardColor::Green,
            mode: PositionMode::Random,
            side: FixedSide::Push,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn command_lines() {
        let fixed = TaskConfig {
            color: RewardColor::Green,
            mode: PositionMode::Fixed,
            side: FixedSide::Pull,
        };
        assert_eq!(fixed.command_line(5), "TRIALS=5;COLOR=G;MODE=F;SIDE=U");

        let random = TaskConfig {
            color: RewardColor::Purple,
            mode: PositionMode::Random,
            side: FixedSide::Push,
        };
        assert_eq!(random.command_line(20), "TRIALS=20;COLOR=P;MODE=X");
    }

    #[test]
    fn snapshot_formatting() {
        let mut state = SessionState::new("m1", 10);
        state.begin(at(0));
        feed(&mut state, &["TRIAL,CORRECT,1,1"]);
        state.end(at(3725));
        let snapshot = SessionSnapshot::capture(
            &state,
            LoggerStatus::Stopped(StopReason::Completed),
            Some(4),
            Vec::new(),
            None,
            at(9999),
        );
        assert_eq!(snapshot.elapsed_hms(), "01:02:05");
        assert_eq!(snapshot.progress(), Some(25.0));
        assert_eq!(snapshot.status.to_string(), "stopped: Completed");
    }
}
