//! Stand-ins for the behaviour box.
//!
//! [`ScriptedDevice`] replays a fixed list of lines and records what was
//! written to it, which is what the tests use. [`SimulatedDevice`] runs a
//! small firmware emulator on its own thread so the whole pipeline can be
//! driven without hardware.

use crate::device::LineDevice;
use crate::error::DeviceError;

use log::{debug, info};
use rand::prelude::*;
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// One step of a [`ScriptedDevice`] script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// The device sends this line.
    Line(String),
    /// A read that times out with nothing to show for it.
    Silence,
    /// A read that fails with a transient error.
    TransientError,
    /// A read that fails because the port went away.
    FatalError,
}

/// What a test can observe about a [`ScriptedDevice`] after handing it off.
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    written: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl DeviceProbe {
    /// Every line written to the device so far.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// How many times the device was closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// How many script steps have been consumed.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// A [`LineDevice`] that plays back a script, then goes quiet.
pub struct ScriptedDevice {
    script: VecDeque<ScriptStep>,
    idle_delay: Duration,
    probe: DeviceProbe,
}

impl ScriptedDevice {
    /// A device that sends each of `lines` once, in order.
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_steps(lines.into_iter().map(|l| ScriptStep::Line(l.into())))
    }

    pub fn from_steps(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            idle_delay: Duration::from_millis(10),
            probe: DeviceProbe::default(),
        }
    }

    /// How long a read blocks once the script has run out, standing in for
    /// the serial read timeout.
    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    /// A handle for inspecting the device after it has been moved into a
    /// reader thread.
    pub fn probe(&self) -> DeviceProbe {
        self.probe.clone()
    }
}

impl LineDevice for ScriptedDevice {
    fn read_line(&mut self) -> Result<Option<String>, DeviceError> {
        let Some(step) = self.script.pop_front() else {
            thread::sleep(self.idle_delay);
            return Ok(None);
        };
        self.probe.reads.fetch_add(1, Ordering::SeqCst);

        match step {
            ScriptStep::Line(line) => Ok(Some(line)),
            ScriptStep::Silence => {
                thread::sleep(self.idle_delay);
                Ok(None)
            }
            ScriptStep::TransientError => Err(DeviceError::Transient(io::Error::new(
                io::ErrorKind::Interrupted,
                "scripted hiccup",
            ))),
            ScriptStep::FatalError => Err(DeviceError::Fatal(io::Error::new(
                io::ErrorKind::NotFound,
                "scripted disconnect",
            ))),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        if let Ok(mut written) = self.probe.written.lock() {
            written.push(line.to_owned());
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

enum Signal {
    Configure(u32),
    Stop,
    Shutdown,
}

/// Knobs for the firmware emulator.
#[derive(Debug, Clone)]
pub struct SimulatedDeviceBuilder {
    success_rate: f64,
    trial_period: Duration,
    samples_per_trial: usize,
    noise: f64,
    read_timeout: Duration,
}

impl Default for SimulatedDeviceBuilder {
    fn default() -> Self {
        Self {
            success_rate: 0.7,
            trial_period: Duration::from_millis(800),
            samples_per_trial: 4,
            noise: 0.02,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl SimulatedDeviceBuilder {
    /// Probability that a trial ends `CORRECT`.
    pub fn success_rate(self, success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Wall-clock time one trial takes.
    pub fn trial_period(self, trial_period: Duration) -> Self {
        Self {
            trial_period,
            ..self
        }
    }

    /// Encoder samples emitted during each trial.
    pub fn samples_per_trial(self, samples_per_trial: usize) -> Self {
        Self {
            samples_per_trial,
            ..self
        }
    }

    /// Probability that any given line is replaced by line noise.
    pub fn noise(self, noise: f64) -> Self {
        Self {
            noise: noise.clamp(0.0, 1.0),
            ..self
        }
    }

    /// How long a read waits for a line.
    pub fn read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }

    pub fn build(self) -> SimulatedDevice {
        SimulatedDevice::spawn(self)
    }
}

/// A [`LineDevice`] that emulates the behaviour box firmware. It stays quiet
/// until it receives a `TRIALS=<n>;...` line, runs that many trials, then goes
/// quiet again. A `STOP` line aborts the run.
pub struct SimulatedDevice {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    lines: mpsc::Receiver<String>,
    read_timeout: Duration,
}

impl SimulatedDevice {
    pub fn builder() -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::default()
    }

    fn spawn(settings: SimulatedDeviceBuilder) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();
        let (line_tx, lines) = mpsc::channel::<String>();
        let read_timeout = settings.read_timeout;

        let handle = thread::spawn(move || {
            let mut firmware = Firmware::new(settings, line_tx);
            loop {
                let signal = if firmware.running() {
                    rx.try_recv().ok()
                } else {
                    match rx.recv() {
                        Ok(signal) => Some(signal),
                        Err(_) => break,
                    }
                };
                match signal {
                    Some(Signal::Configure(trials)) => firmware.start(trials),
                    Some(Signal::Stop) => firmware.halt(),
                    Some(Signal::Shutdown) => break,
                    None => {}
                }
                if firmware.running() && !firmware.step() {
                    break;
                }
            }
        });

        SimulatedDevice {
            handle: Some(handle),
            tx,
            lines,
            read_timeout,
        }
    }
}

impl LineDevice for SimulatedDevice {
    fn read_line(&mut self) -> Result<Option<String>, DeviceError> {
        match self.lines.recv_timeout(self.read_timeout) {
            Ok(line) => Ok(Some(line)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Fatal(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated firmware exited",
            ))),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let signal = if line.trim() == "STOP" {
            Signal::Stop
        } else if let Some(trials) = parse_trials(line) {
            Signal::Configure(trials)
        } else {
            debug!("Simulated firmware ignoring {:?}", line);
            return Ok(());
        };
        self.tx.send(signal).map_err(|_| {
            DeviceError::Fatal(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated firmware exited",
            ))
        })
    }

    fn close(mut self: Box<Self>) {
        // The firmware thread may already be gone, in which case there is
        // nobody to tell.
        let _ = self.tx.send(Signal::Shutdown);
        if let Some(thread) = self.handle.take() {
            let _ = thread.join();
        }
    }
}

fn parse_trials(line: &str) -> Option<u32> {
    line.trim()
        .split(';')
        .find_map(|field| field.strip_prefix("TRIALS="))
        .and_then(|n| n.parse().ok())
}

/// The state of one emulated run.
struct Firmware {
    settings: SimulatedDeviceBuilder,
    out: mpsc::Sender<String>,
    booted: Instant,
    rng: ThreadRng,
    trials: u32,
    current: u32,
    encoder: i64,
}

impl Firmware {
    fn new(settings: SimulatedDeviceBuilder, out: mpsc::Sender<String>) -> Self {
        Self {
            settings,
            out,
            booted: Instant::now(),
            rng: thread_rng(),
            trials: 0,
            current: 0,
            encoder: 0,
        }
    }

    fn running(&self) -> bool {
        self.current < self.trials
    }

    fn start(&mut self, trials: u32) {
        info!("Simulated firmware running {} trials", trials);
        self.trials = trials;
        self.current = 0;
    }

    fn halt(&mut self) {
        info!("Simulated firmware halted");
        self.trials = 0;
        self.current = 0;
    }

    fn now_us(&self) -> u64 {
        self.booted.elapsed().as_micros() as u64
    }

    /// Runs one trial. Returns `false` once nobody is listening.
    fn step(&mut self) -> bool {
        self.current += 1;
        let trial = self.current;
        let pause = self.settings.trial_period / (self.settings.samples_per_trial as u32 + 2);

        let mut lines = vec![format!("EVENT,START,{},{}", trial, self.now_us())];
        for _ in 0..self.settings.samples_per_trial {
            thread::sleep(pause);
            self.encoder += self.rng.gen_range(-40..=40);
            lines.push(format!("{},{}", self.now_us() / 1000, self.encoder));
        }
        thread::sleep(pause);

        let outcome = if self.rng.gen_bool(self.settings.success_rate) {
            "CORRECT"
        } else if self.rng.gen_bool(0.5) {
            "INCORRECT"
        } else {
            "TIMEOUT"
        };
        lines.push(format!(
            "TRIAL,{},{},{}",
            outcome,
            self.rng.gen_range(150..900),
            self.encoder
        ));
        lines.push(format!("EVENT,END,{},{}", trial, self.now_us()));

        for line in lines {
            let line = if self.rng.gen_bool(self.settings.noise) {
                "\u{1}#noise#".to_owned()
            } else {
                line
            };
            if self.out.send(line).is_err() {
                return false;
            }
        }
        thread::sleep(pause);
        true
    }
}
