//! Terminal front end: a port picker and a live view of the running session.
//! The logger never depends on any of this; the monitor only reads
//! [`SessionSnapshot`](crate::session::SessionSnapshot)s.

mod error;
mod port_selector;
mod session_monitor;

pub use error::GuiError;
pub use port_selector::port_selector;
pub use session_monitor::{monitor_session, render};
