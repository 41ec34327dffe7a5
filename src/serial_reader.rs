//! The reader side of the pipeline. A [`SerialReader`] owns the device on a
//! dedicated thread, classifies every line it reads, and pushes the result
//! onto a bounded channel. It never touches session state or the log file.

use crate::device::LineDevice;
use crate::error::DeviceError;
use crate::line_protocol::Record;

use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Enough headroom that a consumer running a little late never blocks the
/// reader.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 512;

/// Line the host sends to ask the firmware to halt.
pub const HALT_COMMAND: &str = "STOP";

/// How long the reader naps between attempts to push into a full channel.
const BACKPRESSURE_NAP: Duration = Duration::from_millis(5);

/// What travels from the reader to the consumer.
#[derive(Debug)]
pub enum Handoff {
    Record(Record),
    Fault(DeviceError),
}

/// Counters the reader hands back when it is shut down.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReaderReport {
    pub lines_read: u64,
    pub faults: u64,
    pub backpressure_stalls: u64,
}

#[derive(Debug, Default)]
struct Control {
    stop: AtomicBool,
    halt_device: AtomicBool,
}

/// Handle to a running reader thread.
pub struct SerialReader {
    control: Arc<Control>,
    handle: Option<JoinHandle<ReaderReport>>,
}

impl SerialReader {
    /// Moves `device` onto a new reader thread. Records come out of the
    /// returned receiver, which holds at most `capacity` of them.
    pub fn spawn(device: Box<dyn LineDevice>, capacity: usize) -> (Self, Receiver<Handoff>) {
        let (tx, rx) = mpsc::sync_channel::<Handoff>(capacity.max(1));
        let control = Arc::new(Control::default());
        let th_control = Arc::clone(&control);

        let handle = thread::spawn(move || read_loop(device, tx, &th_control));

        (
            SerialReader {
                control,
                handle: Some(handle),
            },
            rx,
        )
    }

    /// Whether the read loop has already exited on its own (fatal fault or
    /// consumer gone).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signals the loop to stop and waits for it. The device is closed by the
    /// time this returns. With `halt_device`, the firmware is sent `STOP`
    /// before the port closes.
    pub fn shutdown(mut self, halt_device: bool) -> ReaderReport {
        self.control.halt_device.store(halt_device, Ordering::SeqCst);
        self.control.stop.store(true, Ordering::SeqCst);

        match self.handle.take().map(|thread| thread.join()) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                warn!("Reader thread panicked");
                ReaderReport::default()
            }
            None => ReaderReport::default(),
        }
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        // A reader that was never shut down explicitly still must not keep the
        // port open behind our back.
        self.control.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.handle.take() {
            let _ = thread.join();
        }
    }
}

fn read_loop(
    mut device: Box<dyn LineDevice>,
    tx: SyncSender<Handoff>,
    control: &Control,
) -> ReaderReport {
    let mut report = ReaderReport::default();

    while !control.stop.load(Ordering::SeqCst) {
        match device.read_line() {
            Ok(Some(line)) => {
                report.lines_read += 1;
                let record = Record::parse(&line);
                debug!("Read {:?}", record);
                if !push(&tx, Handoff::Record(record), control, &mut report) {
                    break;
                }
            }
            // read timed out; the consumer decides what silence means
            Ok(None) => {}
            Err(error) => {
                report.faults += 1;
                let fatal = error.is_fatal();
                warn!("Device read failed: {}", error);
                if !push(&tx, Handoff::Fault(error), control, &mut report) || fatal {
                    break;
                }
            }
        }
    }

    if control.halt_device.load(Ordering::SeqCst) {
        if let Err(error) = device.write_line(HALT_COMMAND) {
            warn!("Could not send {} to device: {}", HALT_COMMAND, error);
        }
    }
    device.close();
    info!("Reader : terminated after {} lines.", report.lines_read);
    report
}

/// Blocks while the channel is full. Returns `false` if the loop should end
/// instead, because the consumer hung up or a stop was requested.
fn push(
    tx: &SyncSender<Handoff>,
    msg: Handoff,
    control: &Control,
    report: &mut ReaderReport,
) -> bool {
    let mut msg = msg;
    let mut stalled = false;
    loop {
        match tx.try_send(msg) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(returned)) => {
                if !stalled {
                    stalled = true;
                    report.backpressure_stalls += 1;
                    warn!("Handoff channel full, reader waiting on consumer");
                }
                if control.stop.load(Ordering::SeqCst) {
                    return false;
                }
                msg = returned;
                thread::sleep(BACKPRESSURE_NAP);
            }
        }
    }
}
