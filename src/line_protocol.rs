//! Decodes the line protocol spoken by the behaviour box. Each line read from
//! the device turns into exactly one [`Record`]; a line that matches no known
//! grammar becomes [`Record::Malformed`] with its original text intact.
//!
//! The grammars, tried in order:
//!
//! ```text
//! EVENT,<event_type>,<trial_number>,<timestamp_us>     exactly 4 fields
//! TRIAL,<outcome>,<reaction_time_ms>,<position>[,...]   at least 4 fields
//! <timestamp_ms>,<value>                                exactly 2 fields
//! ```

use nom::{
    bytes::complete::{is_not, tag},
    character::complete::{char, i64, u32, u64},
    combinator::{all_consuming, map, rest},
    sequence::{preceded, tuple},
    Finish, IResult,
};

use std::{convert::Infallible, fmt, str::FromStr};

/// The end-of-trial result reported by `TRIAL` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Correct,
    Incorrect,
    Timeout,
    /// Anything the firmware sent that is not one of the known outcomes,
    /// kept verbatim.
    Other(String),
}

impl Outcome {
    /// The tolerant "was this trial correct" check used for statistics. It
    /// ignores case and surrounding whitespace so that `correct` or
    /// ` CORRECT` still count.
    pub fn is_correct(&self) -> bool {
        match self {
            Self::Correct => true,
            Self::Other(raw) => raw.trim().eq_ignore_ascii_case("correct"),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Correct => "CORRECT",
            Self::Incorrect => "INCORRECT",
            Self::Timeout => "TIMEOUT",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for Outcome {
    fn from(s: &str) -> Self {
        match s {
            "CORRECT" => Self::Correct,
            "INCORRECT" => Self::Incorrect,
            "TIMEOUT" => Self::Timeout,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed line of the device protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A periodic encoder sample, stamped with the device's own clock.
    Sample { timestamp_ms: u64, value: i64 },

    /// A discrete occurrence within a trial (START, END, REWARD, ...).
    Event {
        timestamp_us: u64,
        event_type: String,
        trial_number: u32,
    },

    /// The summary the firmware sends at the end of a trial.
    TrialOutcome {
        outcome: Outcome,
        reaction_time_ms: u64,
        position: i64,
    },

    /// A line that matched no grammar.
    Malformed { raw_text: String, reason: String },
}

impl Record {
    /// Classifies one raw line. This never fails; anything unparseable comes
    /// back as [`Record::Malformed`].
    pub fn parse(raw_line: &str) -> Self {
        let line = raw_line.trim();
        let fields: Vec<&str> = line.split(',').collect();

        let attempt = match (fields[0], fields.len()) {
            ("EVENT", 4) => run(parse_event, line).map_err(|_| "bad field in EVENT line".to_owned()),
            ("EVENT", n) => Err(format!("EVENT line has {} fields, expected 4", n)),
            ("TRIAL", n) if n >= 4 => {
                run(parse_trial, line).map_err(|_| "bad field in TRIAL line".to_owned())
            }
            ("TRIAL", n) => Err(format!("TRIAL line has {} fields, expected at least 4", n)),
            (_, 2) => run(parse_sample, line).map_err(|_| "sample fields are not integers".to_owned()),
            _ => Err("unrecognized line".to_owned()),
        };

        attempt.unwrap_or_else(|reason| Self::Malformed {
            raw_text: raw_line.to_owned(),
            reason,
        })
    }

    /// Re-encodes the record as the line the device would have sent.
    /// Malformed records give back their raw text.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Sample {
                timestamp_ms,
                value,
            } => format!("{},{}", timestamp_ms, value),
            Self::Event {
                timestamp_us,
                event_type,
                trial_number,
            } => format!("EVENT,{},{},{}", event_type, trial_number, timestamp_us),
            Self::TrialOutcome {
                outcome,
                reaction_time_ms,
                position,
            } => format!("TRIAL,{},{},{}", outcome, reaction_time_ms, position),
            Self::Malformed { raw_text, .. } => raw_text.clone(),
        }
    }

    /// Short label for the kind of record, as used in log files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sample { .. } => "DATA",
            Self::Event { .. } => "EVENT",
            Self::TrialOutcome { .. } => "TRIAL",
            Self::Malformed { .. } => "MALFORMED",
        }
    }

    /// The device-clock timestamp in microseconds, if the record carries one.
    pub fn device_time_us(&self) -> Option<u64> {
        match self {
            Self::Sample { timestamp_ms, .. } => Some(timestamp_ms.saturating_mul(1000)),
            Self::Event { timestamp_us, .. } => Some(*timestamp_us),
            _ => None,
        }
    }
}

impl FromStr for Record {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

fn run<'a>(
    parser: fn(&'a str) -> IResult<&'a str, Record>,
    s: &'a str,
) -> Result<Record, nom::error::Error<&'a str>> {
    all_consuming(parser)(s).finish().map(|(_remaining, record)| record)
}

fn parse_field(s: &str) -> IResult<&str, &str> {
    is_not(",")(s)
}

fn parse_event(s: &str) -> IResult<&str, Record> {
    map(
        tuple((
            tag("EVENT"),
            preceded(char(','), parse_field),
            preceded(char(','), u32),
            preceded(char(','), u64),
        )),
        |(_, event_type, trial_number, timestamp_us)| Record::Event {
            timestamp_us,
            event_type: event_type.to_owned(),
            trial_number,
        },
    )(s)
}

fn parse_trial(s: &str) -> IResult<&str, Record> {
    map(
        tuple((
            tag("TRIAL"),
            preceded(char(','), parse_field),
            preceded(char(','), u64),
            preceded(char(','), i64),
            // firmware revisions may append fields we don't know about yet
            rest,
        )),
        |(_, outcome, reaction_time_ms, position, _extra)| Record::TrialOutcome {
            outcome: Outcome::from(outcome),
            reaction_time_ms,
            position,
        },
    )(s)
}

fn parse_sample(s: &str) -> IResult<&str, Record> {
    map(
        tuple((u64, preceded(char(','), i64))),
        |(timestamp_ms, value)| Record::Sample {
            timestamp_ms,
            value,
        },
    )(s)
}
