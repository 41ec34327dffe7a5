//! TrialLogger records behavioural trial sessions from a microcontroller
//! "behaviour box". The box streams newline-delimited text over a serial
//! link: encoder samples, trial events, and trial outcomes. TrialLogger reads
//! that stream without ever stalling the operator's view of it, keeps a
//! running tally of the session (trials, correct answers, rolling success
//! rate, elapsed time), and appends every accepted line to a CSV log that
//! survives a crash.
//!
//! The pieces, in the order data flows through them:
//!
//! - [`device`]: the serial link, behind the [`LineDevice`](device::LineDevice)
//!   trait so a [simulator or test double](dummy_device) can stand in.
//! - [`serial_reader`]: a thread that reads lines, classifies them with
//!   [`line_protocol`], and hands them over a bounded channel.
//! - [`event_logger`]: the consumer, which owns the [`session`] state and the
//!   [`log_sink`], and decides when a session is over.
//! - [`gui`]: a terminal front end that only ever sees snapshots.

pub mod args;
pub mod config;
pub mod device;
pub mod dummy_device;
pub mod error;
pub mod event_logger;
pub mod gui;
pub mod line_protocol;
pub mod log_sink;
pub mod rolling_window;
pub mod serial_reader;
pub mod session;
pub mod subjects;
