use std::{io::stdout, path::PathBuf, time::Duration};

use crate::gui::error::GuiError;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Name fragments of the USB serial adapters behaviour boxes show up as.
const USB_SERIAL_HINTS: [&str; 4] = ["ttyACM", "ttyUSB", "usbmodem", "usbserial"];

/// Cursor over the candidate ports.
struct PortPicker {
    ports: Vec<PathBuf>,
    list_state: ListState,
}

impl PortPicker {
    /// Starts on the first port that looks like a USB serial adapter.
    fn new(ports: Vec<PathBuf>) -> Self {
        let first_usb = ports.iter().position(|p| is_usb_serial(p)).unwrap_or(0);
        Self {
            ports,
            list_state: ListState::default().with_selected(Some(first_usb)),
        }
    }

    fn cursor(&self) -> usize {
        self.list_state.selected().unwrap_or(0)
    }

    fn step(&mut self, forward: bool) {
        let n = self.ports.len();
        let next = if forward {
            (self.cursor() + 1) % n
        } else {
            (self.cursor() + n - 1) % n
        };
        self.list_state.select(Some(next));
    }

    fn take(mut self) -> PathBuf {
        let cursor = self.cursor();
        self.ports.swap_remove(cursor)
    }

    fn render(&mut self, frame: &mut Frame) {
        let title = Title::from(" Connect to Behaviour Box ".magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Move ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Connect ".into(),
            "<Enter>".magenta().bold(),
            " Cancel ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);

        let items = self.ports.iter().map(|port| {
            let name = port.to_string_lossy().into_owned();
            if is_usb_serial(port) {
                Line::from(vec![name.into(), "  usb serial".dark_gray()])
            } else {
                Line::from(name)
            }
        });
        let list = List::new(items)
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        frame.render_stateful_widget(list, frame.size(), &mut self.list_state);
    }
}

fn is_usb_serial(port: &std::path::Path) -> bool {
    let name = port.to_string_lossy();
    USB_SERIAL_HINTS.iter().any(|hint| name.contains(hint))
}

/// Lets the operator pick the behaviour box's serial port from a list.
/// Returns `None` if they cancel, or if there is nothing to pick from.
pub fn port_selector(available_ports: Vec<PathBuf>) -> Result<Option<PathBuf>, GuiError> {
    if available_ports.is_empty() {
        return Ok(None);
    }
    let mut picker = PortPicker::new(available_ports);

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut connect = false;
    loop {
        terminal.draw(|frame| picker.render(frame))?;
        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Down => picker.step(true),
                        KeyCode::Up => picker.step(false),
                        KeyCode::Enter => {
                            connect = true;
                            break;
                        }
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        _ => {}
                    }
                }
            }
        }
    }

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(connect.then(|| picker.take()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;

    fn ports() -> Vec<PathBuf> {
        ["/dev/ttyS0", "/dev/ttyS1", "/dev/ttyACM0"]
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    #[test]
    fn cursor_starts_on_the_usb_adapter_and_wraps() {
        let mut picker = PortPicker::new(ports());
        assert_eq!(picker.cursor(), 2);
        picker.step(true);
        assert_eq!(picker.cursor(), 0);
        picker.step(false);
        picker.step(false);
        assert_eq!(picker.take(), PathBuf::from("/dev/ttyS1"));
    }

    #[test]
    fn usb_adapters_are_labelled() {
        let mut picker = PortPicker::new(ports());
        let mut terminal = Terminal::new(TestBackend::new(60, 8)).unwrap();
        terminal.draw(|frame| picker.render(frame)).unwrap();

        let buffer = terminal.backend().buffer();
        let text: String = buffer.content().iter().map(|cell| cell.symbol()).collect();
        assert!(text.contains("Connect to Behaviour Box"));
        assert!(text.contains("/dev/ttyACM0  usb serial"));
        assert!(!text.contains("/dev/ttyS0  usb serial"));
    }
}
