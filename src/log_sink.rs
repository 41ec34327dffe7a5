//! Durable, append-only CSV logs.
//!
//! Two layouts are supported. The flat layout is a single table:
//!
//! ```text
//! line_type,timestamp_ms,encoder_value,event_type,trial_number
//! EVENT,1000,,START,1
//! DATA,1012,15,,
//! TRIAL,3521,120,CORRECT,1
//! ```
//!
//! The notes layout starts with a `key,value` preamble describing the
//! session, then a blank line, then an event table. The last row of a closed
//! notes log is a `SESSION_END` row carrying the stop reason.
//!
//! Every row is flushed and synced to disk before `append` returns, so
//! whatever was acknowledged survives a crash or power loss.

use crate::error::{LoggerError, SinkError};
use crate::line_protocol::Record;
use crate::session::{signed_duration, LoggedRecord, SessionConfig, SessionState, SinkFormat, StopReason};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use log::{debug, info, warn};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Columns of the flat layout.
pub const FLAT_HEADER: [&str; 5] = [
    "line_type",
    "timestamp_ms",
    "encoder_value",
    "event_type",
    "trial_number",
];

/// Columns of the event table in the notes layout.
pub const NOTES_HEADER: [&str; 6] = [
    "event_number",
    "event_time",
    "event_type",
    "description",
    "duration_sec",
    "notes",
];

/// Preamble keys every notes log must carry to be loadable.
pub const REQUIRED_KEYS: [&str; 6] = [
    "subject_id",
    "date",
    "weight_grams",
    "start_time",
    "end_time",
    "session_notes",
];

/// `event_type` of the row that closes a notes log.
pub const SESSION_END: &str = "SESSION_END";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const EVENT_TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// How a session ended, handed to [`LogSink::close`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub reason: StopReason,
    pub ended_at: DateTime<Local>,
}

/// Somewhere accepted records go, durably and in order.
pub trait LogSink: Send {
    /// Writes one row and makes it durable before returning.
    fn append(&mut self, entry: &LoggedRecord) -> Result<(), SinkError>;

    /// Finishes the log. Closing twice is a no-op.
    fn close(&mut self, closing: &SessionClose) -> Result<(), SinkError>;

    fn path(&self) -> &Path;

    /// Record rows appended so far, excluding headers and closing rows.
    fn rows_written(&self) -> usize;
}

/// Creates a new log for the session in `<data_dir>/<subject_id>/`.
pub fn open_sink(
    data_dir: &Path,
    config: &SessionConfig,
    started_at: DateTime<Local>,
) -> Result<Box<dyn LogSink>, SinkError> {
    let dir = data_dir.join(&config.subject_id);
    match config.format {
        SinkFormat::Flat => {
            let (file, path) = create_log_file(&dir, "behavior_log", started_at)?;
            Ok(Box::new(FlatCsvSink::new(file, path, started_at)?))
        }
        SinkFormat::Notes => {
            let (file, path) = create_log_file(&dir, "session", started_at)?;
            let preamble = Preamble::for_session(config, started_at);
            Ok(Box::new(NotesCsvSink::new(file, path, &preamble)?))
        }
    }
}

/// Creates `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`. An existing log is never
/// reopened; a numeric suffix is added instead.
pub fn create_log_file(
    dir: &Path,
    prefix: &str,
    started_at: DateTime<Local>,
) -> Result<(File, PathBuf), SinkError> {
    fs::create_dir_all(dir)?;
    let stamp = started_at.format("%Y%m%d_%H%M%S");

    let mut attempt = 1;
    loop {
        let name = match attempt {
            1 => format!("{}_{}.csv", prefix, stamp),
            n => format!("{}_{}_{}.csv", prefix, stamp, n),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                info!("Logging to {}", path.display());
                return Ok((file, path));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

fn commit(writer: &mut csv::Writer<File>) -> Result<(), SinkError> {
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(())
}

fn closed() -> SinkError {
    SinkError::Io(io::Error::new(io::ErrorKind::Other, "log is already closed"))
}

/// The single-table layout.
pub struct FlatCsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    started_at: DateTime<Local>,
    rows_written: usize,
}

impl FlatCsvSink {
    /// Writes the header into `file`, which must be empty.
    pub fn new(file: File, path: PathBuf, started_at: DateTime<Local>) -> Result<Self, SinkError> {
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(FLAT_HEADER)?;
        commit(&mut writer)?;

        Ok(Self {
            path,
            writer: Some(writer),
            started_at,
            rows_written: 0,
        })
    }

    fn row(&self, entry: &LoggedRecord) -> [String; 5] {
        let trial = entry.trial_number.map(|t| t.to_string()).unwrap_or_default();
        match &entry.record {
            Record::Event {
                timestamp_us,
                event_type,
                ..
            } => [
                "EVENT".to_owned(),
                (timestamp_us / 1000).to_string(),
                String::new(),
                event_type.clone(),
                trial,
            ],
            Record::Sample {
                timestamp_ms,
                value,
            } => [
                "DATA".to_owned(),
                timestamp_ms.to_string(),
                value.to_string(),
                String::new(),
                String::new(),
            ],
            // TRIAL lines carry no device clock, so they are stamped with
            // host time since the session started
            Record::TrialOutcome {
                outcome, position, ..
            } => [
                "TRIAL".to_owned(),
                (entry.received_at - self.started_at)
                    .num_milliseconds()
                    .max(0)
                    .to_string(),
                position.to_string(),
                outcome.to_string(),
                trial,
            ],
            Record::Malformed { raw_text, .. } => [
                "MALFORMED".to_owned(),
                String::new(),
                String::new(),
                raw_text.clone(),
                String::new(),
            ],
        }
    }
}

impl LogSink for FlatCsvSink {
    fn append(&mut self, entry: &LoggedRecord) -> Result<(), SinkError> {
        let row = self.row(entry);
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        writer.write_record(&row)?;
        commit(writer)?;
        self.rows_written += 1;
        Ok(())
    }

    fn close(&mut self, closing: &SessionClose) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            commit(&mut writer)?;
            debug!(
                "Closed {} after {} rows ({})",
                self.path.display(),
                self.rows_written,
                closing.reason
            );
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn rows_written(&self) -> usize {
        self.rows_written
    }
}

/// Ordered `key,value` pairs at the top of a notes log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preamble {
    entries: Vec<(String, String)>,
}

impl Preamble {
    /// The preamble of a live session. `end_time` and `total_events` stay
    /// empty until the log is re-saved.
    pub fn for_session(config: &SessionConfig, started_at: DateTime<Local>) -> Self {
        let mut preamble = Self::default();
        preamble.set("subject_id", &config.subject_id);
        preamble.set("date", started_at.format(DATE_FORMAT).to_string());
        preamble.set("weight_grams", &config.weight_grams);
        preamble.set("start_time", started_at.format(TIME_FORMAT).to_string());
        preamble.set("end_time", "");
        preamble.set("session_notes", &config.session_notes);
        preamble.set("total_events", "");
        if let Some(trials) = config.target_trials {
            preamble.set("trials", trials.to_string());
        }
        if let Some(task) = config.task {
            for (key, value) in task.describe() {
                preamble.set(key, value);
            }
        }
        preamble
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the value of `key`, or appends it if it is new.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    fn missing_keys(&self) -> Vec<&'static str> {
        REQUIRED_KEYS
            .into_iter()
            .filter(|key| self.get(key).is_none())
            .collect()
    }
}

/// One row of the event table in a notes log.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRow {
    pub event_number: usize,
    pub event_time: NaiveTime,
    pub event_type: String,
    /// The wire line, or free text for rows that were not sent by the device.
    pub description: String,
    pub duration_sec: Option<f64>,
    pub notes: String,
}

impl NoteRow {
    pub fn from_logged(entry: &LoggedRecord) -> Self {
        let event_type = match &entry.record {
            Record::Event { event_type, .. } => event_type.clone(),
            other => other.kind().to_owned(),
        };
        Self {
            event_number: entry.number,
            event_time: entry.received_at.time(),
            event_type,
            description: entry.record.to_wire(),
            duration_sec: entry.duration_sec,
            notes: entry.warning.clone().unwrap_or_default(),
        }
    }

    /// The device record this row describes, if its description parses as
    /// one.
    pub fn record(&self) -> Option<Record> {
        match Record::parse(&self.description) {
            Record::Malformed { .. } => None,
            record => Some(record),
        }
    }

    fn closing(reason: &str, at: NaiveTime, duration_sec: Option<f64>, notes: String) -> Self {
        Self {
            event_number: 0,
            event_time: at,
            event_type: SESSION_END.to_owned(),
            description: reason.to_owned(),
            duration_sec,
            notes,
        }
    }

    fn fields(&self) -> [String; 6] {
        let number = match self.event_type.as_str() {
            SESSION_END => String::new(),
            _ => self.event_number.to_string(),
        };
        [
            number,
            self.event_time.format(EVENT_TIME_FORMAT).to_string(),
            self.event_type.clone(),
            self.description.clone(),
            self.duration_sec
                .map(|d| format!("{:.3}", d))
                .unwrap_or_default(),
            self.notes.clone(),
        ]
    }

    fn add_note(&mut self, note: &str) {
        if self.notes.contains(note) {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push_str("; ");
        }
        self.notes.push_str(note);
    }
}

/// The preamble-plus-event-table layout.
pub struct NotesCsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows_written: usize,
    last_at: Option<DateTime<Local>>,
}

impl NotesCsvSink {
    /// Writes the preamble, the blank separator and the table header into
    /// `file`, which must be empty.
    pub fn new(file: File, path: PathBuf, preamble: &Preamble) -> Result<Self, SinkError> {
        let mut file = file;

        let mut head = csv::Writer::from_writer(Vec::new());
        for (key, value) in preamble.entries() {
            head.write_record([key.as_str(), value.as_str()])?;
        }
        let mut bytes = head
            .into_inner()
            .map_err(|e| SinkError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        bytes.push(b'\n');
        file.write_all(&bytes)?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(NOTES_HEADER)?;
        commit(&mut writer)?;

        Ok(Self {
            path,
            writer: Some(writer),
            rows_written: 0,
            last_at: None,
        })
    }

    /// Appends an already built row.
    pub fn append_row(&mut self, row: &NoteRow) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        writer.write_record(&row.fields())?;
        commit(writer)?;
        if row.event_type != SESSION_END {
            self.rows_written += 1;
        }
        Ok(())
    }

    /// Closes the log, optionally writing a closing row first.
    pub fn finish(&mut self, closing: Option<&NoteRow>) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Ok(());
        }
        if let Some(row) = closing {
            self.append_row(row)?;
        }
        if let Some(mut writer) = self.writer.take() {
            commit(&mut writer)?;
        }
        Ok(())
    }
}

impl LogSink for NotesCsvSink {
    fn append(&mut self, entry: &LoggedRecord) -> Result<(), SinkError> {
        self.append_row(&NoteRow::from_logged(entry))?;
        self.last_at = Some(entry.received_at);
        Ok(())
    }

    fn close(&mut self, closing: &SessionClose) -> Result<(), SinkError> {
        let since_last = self
            .last_at
            .map(|last| (closing.ended_at - last).num_milliseconds() as f64 / 1000.0);
        let row = NoteRow::closing(
            &closing.reason.to_string(),
            closing.ended_at.time(),
            since_last,
            String::new(),
        );
        self.finish(Some(&row))?;
        debug!("Closed {} after {} rows", self.path.display(), self.rows_written);
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn rows_written(&self) -> usize {
        self.rows_written
    }
}

/// A notes log read back from disk.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub path: PathBuf,
    pub preamble: Preamble,
    pub rows: Vec<NoteRow>,
    /// The `SESSION_END` row, if the log was closed.
    pub closing: Option<NoteRow>,
    /// Counters rebuilt from the rows that describe device records.
    pub state: SessionState,
    /// Rows that did not fit the table and were left out.
    pub skipped_rows: usize,
}

impl LoadedSession {
    fn date(&self) -> Result<NaiveDate, LoggerError> {
        let raw = self.preamble.get("date").unwrap_or_default();
        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|_| LoggerError::CorruptPersistedState(format!("unreadable date {:?}", raw)))
    }

    /// The end time from the preamble, or failing that from the closing row.
    pub fn end_time(&self) -> Option<NaiveTime> {
        self.preamble
            .get("end_time")
            .and_then(parse_time)
            .or_else(|| self.closing.as_ref().map(|row| row.event_time))
    }
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S%.f").ok()
}

fn to_local(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Local>> {
    Local
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
}

/// Reads a notes log. The preamble must carry every key in
/// [`REQUIRED_KEYS`], otherwise nothing is adopted and
/// [`LoggerError::CorruptPersistedState`] is returned. Table rows that are
/// too short or whose event number is not an integer are skipped.
pub fn load_notes_log(path: &Path, window: usize) -> Result<LoadedSession, LoggerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(SinkError::from)?;

    let mut preamble = Preamble::default();
    let mut in_table = false;
    let mut rows = Vec::new();
    let mut closing = None;
    let mut skipped_rows = 0;

    for result in reader.records() {
        let record = result.map_err(SinkError::from)?;
        let field = |i: usize| record.get(i).unwrap_or_default();

        if !in_table {
            if field(0) == NOTES_HEADER[0] {
                in_table = true;
            } else if record.iter().any(|f| !f.is_empty()) {
                preamble.set(field(0), field(1));
            }
            continue;
        }

        if record.len() < NOTES_HEADER.len() {
            skipped_rows += 1;
            continue;
        }
        let event_time = match parse_time(field(1)) {
            Some(time) => time,
            None => {
                skipped_rows += 1;
                continue;
            }
        };
        let duration_sec = field(4).trim().parse::<f64>().ok();

        if field(2) == SESSION_END {
            closing = Some(NoteRow::closing(field(3), event_time, duration_sec, field(5).to_owned()));
            continue;
        }
        let event_number = match field(0).trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                skipped_rows += 1;
                continue;
            }
        };
        rows.push(NoteRow {
            event_number,
            event_time,
            event_type: field(2).to_owned(),
            description: field(3).to_owned(),
            duration_sec,
            notes: field(5).to_owned(),
        });
    }

    if !in_table {
        return Err(LoggerError::CorruptPersistedState(format!(
            "{} has no event table",
            path.display()
        )));
    }
    let missing = preamble.missing_keys();
    if !missing.is_empty() {
        return Err(LoggerError::CorruptPersistedState(format!(
            "{} is missing {}",
            path.display(),
            missing.join(", ")
        )));
    }
    if skipped_rows > 0 {
        warn!("Skipped {} unreadable rows in {}", skipped_rows, path.display());
    }

    let mut loaded = LoadedSession {
        path: path.to_owned(),
        preamble,
        rows,
        closing,
        state: SessionState::new("", window),
        skipped_rows,
    };
    loaded.state = replay(&loaded, window)?;
    info!(
        "Loaded {} events from {}",
        loaded.rows.len(),
        loaded.path.display()
    );
    Ok(loaded)
}

fn replay(loaded: &LoadedSession, window: usize) -> Result<SessionState, LoggerError> {
    let date = loaded.date()?;
    let at = |time: NaiveTime| {
        to_local(date, time).ok_or_else(|| {
            LoggerError::CorruptPersistedState(format!("{} {} is not a local time", date, time))
        })
    };

    let mut state = SessionState::new(loaded.preamble.get("subject_id").unwrap_or_default(), window);
    if let Some(start) = loaded.preamble.get("start_time").and_then(parse_time) {
        state.begin(at(start)?);
    }
    for row in &loaded.rows {
        if let Some(record) = row.record() {
            state.apply(record, at(row.event_time)?);
        }
    }
    if let Some(end) = loaded.end_time() {
        state.end(at(end)?);
    }
    Ok(state)
}

/// Rewrites a closed notes log in full: events are renumbered, durations are
/// recomputed, and `end_time` and `total_events` are filled in. With
/// `end_time`, the closing row is moved to that time. The new file replaces
/// the old one atomically. Returns the warnings raised along the way.
pub fn resave_notes_log(
    loaded: &mut LoadedSession,
    end_time: Option<NaiveTime>,
) -> Result<Vec<String>, LoggerError> {
    let date = loaded.date()?;
    let mut warnings = Vec::new();

    let mut prev: Option<(Option<u64>, NaiveTime)> = None;
    for (i, row) in loaded.rows.iter_mut().enumerate() {
        row.event_number = i + 1;
        let device_us = row.record().and_then(|r| r.device_time_us());
        row.duration_sec = prev.map(|(prev_us, prev_time)| {
            signed_duration(
                prev_us,
                device_us,
                NaiveDateTime::new(date, row.event_time) - NaiveDateTime::new(date, prev_time),
            )
        });
        if let Some(d) = row.duration_sec.filter(|d| *d < 0.0) {
            let warning = format!("negative duration {:.3}s at event {}", d, row.event_number);
            warn!("{}", warning);
            row.add_note("negative duration");
            warnings.push(warning);
        }
        prev = Some((device_us, row.event_time));
    }

    let end = end_time.or_else(|| loaded.end_time());
    if let Some(end) = end {
        let mut closing = loaded
            .closing
            .take()
            .unwrap_or_else(|| NoteRow::closing("Resaved", end, None, String::new()));
        closing.event_time = end;
        closing.duration_sec = loaded.rows.last().map(|last| {
            (NaiveDateTime::new(date, end) - NaiveDateTime::new(date, last.event_time))
                .num_milliseconds() as f64
                / 1000.0
        });
        if let Some(d) = closing.duration_sec.filter(|d| *d < 0.0) {
            let warning = format!("end time is {:.3}s before the last event", -d);
            warn!("{}", warning);
            closing.add_note("negative duration");
            warnings.push(warning);
        }
        loaded.closing = Some(closing);
        loaded
            .preamble
            .set("end_time", end.format(TIME_FORMAT).to_string());
    }
    loaded
        .preamble
        .set("total_events", loaded.rows.len().to_string());

    write_atomically(loaded)?;
    loaded.state = replay(loaded, loaded.state.window().size())?;
    info!("Re-saved {}", loaded.path.display());
    Ok(warnings)
}

fn write_atomically(loaded: &LoadedSession) -> Result<(), SinkError> {
    let mut tmp = loaded.path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = File::create(&tmp)?;
    let mut sink = NotesCsvSink::new(file, tmp.clone(), &loaded.preamble)?;
    for row in &loaded.rows {
        sink.append_row(row)?;
    }
    sink.finish(loaded.closing.as_ref())?;
    fs::rename(&tmp, &loaded.path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FixedSide, PositionMode, RewardColor, TaskConfig};
    use chrono::Duration;

    fn started() -> DateTime<Local> {
        to_local(
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn feed(config: &SessionConfig, sink: &mut dyn LogSink, lines: &[&str]) -> SessionState {
        let mut state = SessionState::new(&config.subject_id, 10);
        state.begin(started());
        for (i, line) in lines.iter().enumerate() {
            state.apply(Record::parse(line), started() + Duration::seconds(i as i64 + 1));
            if let Some(entry) = state.last_event() {
                if entry.number == sink.rows_written() + 1 {
                    sink.append(entry).unwrap();
                }
            }
        }
        state
    }

    fn stopped(at_secs: i64) -> SessionClose {
        SessionClose {
            reason: StopReason::StoppedByUser,
            ended_at: started() + Duration::seconds(at_secs),
        }
    }

    #[test]
    fn flat_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new("m1");
        let mut sink = open_sink(dir.path(), &config, started()).unwrap();
        feed(
            &config,
            sink.as_mut(),
            &["EVENT,START,1,1000000", "12,5", "TRIAL,CORRECT,350,120"],
        );
        sink.close(&stopped(10)).unwrap();

        let path = sink.path().to_owned();
        assert_eq!(path, dir.path().join("m1").join("behavior_log_20240314_100000.csv"));
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "line_type,timestamp_ms,encoder_value,event_type,trial_number",
                "EVENT,1000,,START,1",
                "DATA,12,5,,",
                "TRIAL,3000,120,CORRECT,1",
            ]
        );
        assert_eq!(sink.rows_written(), 3);
    }

    #[test]
    fn existing_logs_are_never_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let (_, first) = create_log_file(dir.path(), "session", started()).unwrap();
        let (_, second) = create_log_file(dir.path(), "session", started()).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_2.csv"));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new("m1");
        config.format = SinkFormat::Notes;
        let mut sink = open_sink(dir.path(), &config, started()).unwrap();
        sink.close(&stopped(1)).unwrap();
        sink.close(&stopped(2)).unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.matches(SESSION_END).count(), 1);
        assert!(sink.append(&LoggedRecord {
            number: 1,
            received_at: started(),
            record: Record::parse("1,1"),
            trial_number: None,
            duration_sec: None,
            warning: None,
        })
        .is_err());
    }

    fn notes_config() -> SessionConfig {
        let mut config = SessionConfig::new("m7");
        config.format = SinkFormat::Notes;
        config.target_trials = Some(2);
        config.task = Some(TaskConfig {
            color: RewardColor::Green,
            mode: PositionMode::Fixed,
            side: FixedSide::Push,
        });
        config.weight_grams = "25.4".to_owned();
        config.session_notes = "first, with comma".to_owned();
        config
    }

    #[test]
    fn notes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = notes_config();
        let mut sink = open_sink(dir.path(), &config, started()).unwrap();
        feed(&config, sink.as_mut(), &["EVENT,START,1,1000000", "TRIAL,CORRECT,300,4"]);
        sink.close(&stopped(5)).unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "subject_id,m7");
        assert_eq!(lines[1], "date,2024-03-14");
        assert!(lines.contains(&"session_notes,\"first, with comma\""));
        assert!(lines.contains(&"side,Push"));
        let blank = lines.iter().position(|l| l.is_empty()).unwrap();
        assert_eq!(lines[blank + 1], NOTES_HEADER.join(","));
        assert_eq!(lines[blank + 2], "1,10:00:01.000,START,\"EVENT,START,1,1000000\",,");
        assert_eq!(lines[blank + 3], "2,10:00:02.000,TRIAL,\"TRIAL,CORRECT,300,4\",1.000,");
        assert_eq!(lines[blank + 4], ",10:00:05.000,SESSION_END,StoppedByUser,3.000,");
        assert_eq!(sink.rows_written(), 2);
    }

    #[test]
    fn load_rebuilds_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = notes_config();
        let mut sink = open_sink(dir.path(), &config, started()).unwrap();
        feed(
            &config,
            sink.as_mut(),
            &[
                "EVENT,START,1,1000000",
                "TRIAL,CORRECT,300,4",
                "EVENT,START,2,3000000",
                "TRIAL,INCORRECT,300,4",
            ],
        );
        sink.close(&stopped(9)).unwrap();

        let loaded = load_notes_log(sink.path(), 10).unwrap();
        assert_eq!(loaded.rows.len(), 4);
        assert_eq!(loaded.skipped_rows, 0);
        assert_eq!(loaded.preamble.get("session_notes"), Some("first, with comma"));
        assert_eq!(loaded.state.trial_counter(), 2);
        assert_eq!(loaded.state.correct_count(), 1);
        assert_eq!(loaded.end_time(), NaiveTime::from_hms_opt(10, 0, 9));
        assert_eq!(loaded.closing.as_ref().unwrap().description, "StoppedByUser");
    }

    const HAND_WRITTEN: &str = "\
subject_id,m3
date,2024-03-14
weight_grams,22
start_time,09:00:00
end_time,
session_notes,

event_number,event_time,event_type,description,duration_sec,notes
1,09:00:01.000,START,\"EVENT,START,1,1000000\",,
2,09:00:02.500,Observation,groomed,,
x,09:00:03.000,START,\"EVENT,START,2,2000000\",,
3,09:00:04
4,09:00:02.000,TRIAL,\"TRIAL,CORRECT,10,1\",,
";

    #[test]
    fn load_skips_unfit_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        fs::write(&path, HAND_WRITTEN).unwrap();

        let loaded = load_notes_log(&path, 10).unwrap();
        assert_eq!(loaded.skipped_rows, 2);
        assert_eq!(
            loaded.rows.iter().map(|r| r.event_number).collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        // the free text observation is kept but does not count as a trial
        assert_eq!(loaded.state.trial_counter(), 1);
        assert_eq!(loaded.state.correct_count(), 1);
    }

    #[test]
    fn load_rejects_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        fs::write(&path, HAND_WRITTEN.replace("weight_grams,22\n", "")).unwrap();

        match load_notes_log(&path, 10) {
            Err(LoggerError::CorruptPersistedState(detail)) => {
                assert!(detail.contains("weight_grams"))
            }
            other => panic!("expected corrupt state, got {:?}", other.map(|l| l.rows)),
        }
    }

    #[test]
    fn resave_renumbers_and_fills_the_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        fs::write(&path, HAND_WRITTEN).unwrap();

        let mut loaded = load_notes_log(&path, 10).unwrap();
        let warnings =
            resave_notes_log(&mut loaded, NaiveTime::from_hms_opt(9, 0, 10)).unwrap();
        // the last row is stamped half a second before the one ahead of it
        assert_eq!(warnings.len(), 1);

        let reloaded = load_notes_log(&path, 10).unwrap();
        assert_eq!(
            reloaded.rows.iter().map(|r| r.event_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(reloaded.preamble.get("end_time"), Some("09:00:10"));
        assert_eq!(reloaded.preamble.get("total_events"), Some("3"));
        assert_eq!(reloaded.rows[0].duration_sec, None);
        assert_eq!(reloaded.rows[1].duration_sec, Some(1.5));
        assert_eq!(reloaded.rows[2].duration_sec, Some(-0.5));
        assert!(reloaded.rows[2].notes.contains("negative duration"));

        let closing = reloaded.closing.unwrap();
        assert_eq!(closing.duration_sec, Some(8.0));
        assert_eq!(reloaded.state.session_end().map(|e| e.time()), NaiveTime::from_hms_opt(9, 0, 10));
        assert!(!dir.path().join("session.csv.tmp").exists());
    }
}
