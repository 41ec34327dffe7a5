use std::{io::stdout, time::Duration};

use crate::event_logger::EventLogger;
use crate::gui::error::GuiError;
use crate::session::{SessionSnapshot, StopReason};

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::warn;
use ratatui::{
    prelude::*,
    symbols,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

/// Diagnostics shown at the bottom of the monitor.
const SHOWN_DIAGNOSTICS: usize = 5;

/// Runs the logger's poll loop behind a live view of the session.
///
/// Any key press while the session is running stops it with
/// [`StopReason::StoppedByUser`]. Once the session has ended, for whatever
/// reason, the final state stays on screen until the next key press. Returns
/// the final snapshot.
pub fn monitor_session(logger: &mut EventLogger) -> Result<SessionSnapshot, GuiError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let res = run(&mut terminal, logger);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    res
}

fn run<B: Backend>(
    terminal: &mut Terminal<B>,
    logger: &mut EventLogger,
) -> Result<SessionSnapshot, GuiError> {
    loop {
        // the stop reason ends up in the status line, so the error itself
        // only needs to be logged
        if let Err(e) = logger.poll() {
            warn!("{}", e);
        }
        let snapshot = logger.snapshot();
        terminal.draw(|frame| render(frame, &snapshot, logger.is_active()))?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if !logger.is_active() {
                        return Ok(snapshot);
                    }
                    logger.stop(StopReason::StoppedByUser)?;
                }
            }
        }
    }
}

/// Draws one frame of the monitor.
pub fn render(frame: &mut Frame, snapshot: &SessionSnapshot, active: bool) {
    let [header, gauge, stats, chart, diagnostics] = split(frame.size());

    let hint = if active {
        " Press any key to stop "
    } else {
        " Press any key to exit "
    };
    let title = Title::from(
        Span::from(format!(" Trial Logger: {} ", snapshot.subject_id))
            .magenta()
            .bold(),
    );
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .title(
            Title::from(hint.magenta())
                .alignment(Alignment::Center)
                .position(Position::Bottom),
        )
        .borders(Borders::ALL);
    let status = Paragraph::new(Line::from(snapshot.status.to_string())).block(block);
    frame.render_widget(status, header);

    let (ratio, label) = match (snapshot.progress(), snapshot.target_trials) {
        (Some(progress), Some(target)) => (
            progress / 100.0,
            format!("{} / {} trials ({:.0}%)", snapshot.trial_counter, target, progress),
        ),
        _ => (0.0, format!("{} trials, no target", snapshot.trial_counter)),
    };
    let progress = Gauge::default()
        .block(Block::default().title(" Progress ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(ratio.clamp(0.0, 1.0))
        .label(label);
    frame.render_widget(progress, gauge);

    let percent = |rate: Option<f64>| rate.map_or("-".to_owned(), |r| format!("{:.1}%", r));
    let lines = vec![
        Line::from(format!("Elapsed:        {}", snapshot.elapsed_hms())),
        Line::from(format!(
            "Correct:        {} of {} ({})",
            snapshot.correct_count,
            snapshot.trial_counter,
            percent(snapshot.success_rate)
        )),
        Line::from(format!(
            "Rolling rate:   {}",
            percent(snapshot.rolling_success_rate)
        )),
        Line::from(format!(
            "Last trial:     {}",
            snapshot
                .last_trial_number
                .map_or("-".to_owned(), |t| t.to_string())
        )),
        Line::from(format!(
            "Records:        {} ({} malformed)",
            snapshot.record_count, snapshot.malformed_count
        )),
        Line::from(format!(
            "Log:            {}",
            snapshot
                .log_path
                .as_ref()
                .map_or("-".to_owned(), |p| p.display().to_string())
        )),
    ];
    let stats_block = Block::default().title(" Session ").borders(Borders::ALL);
    frame.render_widget(Paragraph::new(lines).block(stats_block), stats);

    let points: Vec<(f64, f64)> = snapshot
        .rolling_series
        .iter()
        .map(|&(trial, rate)| (trial as f64, rate))
        .collect();
    let last_trial = points.last().map_or(1.0, |&(x, _)| x.max(1.0));
    let rates = Chart::new(vec![Dataset::default()
        .name("Rolling success rate")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(&points)])
    .block(Block::default().title(" Success Rate ").borders(Borders::ALL))
    .x_axis(
        Axis::default()
            .title(Span::styled("Trial", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([0.0, last_trial])
            .labels(vec![Span::from("0"), Span::from(format!("{}", last_trial))]),
    )
    .y_axis(
        Axis::default()
            .title(Span::styled("%", Style::default().fg(Color::Red)))
            .style(Style::default().fg(Color::White))
            .bounds([0.0, 100.0])
            .labels(
                ["0", "50", "100"]
                    .iter()
                    .cloned()
                    .map(Span::from)
                    .collect(),
            ),
    );
    frame.render_widget(rates, chart);

    let recent = snapshot
        .diagnostics
        .iter()
        .rev()
        .take(SHOWN_DIAGNOSTICS)
        .map(|d| ListItem::new(d.as_str()));
    let list = List::new(recent)
        .style(Style::default().fg(Color::Yellow))
        .block(Block::default().title(" Diagnostics ").borders(Borders::ALL));
    frame.render_widget(list, diagnostics);
}

fn split(area: Rect) -> [Rect; 5] {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Min(8),
            Constraint::Length(SHOWN_DIAGNOSTICS as u16 + 2),
        ])
        .split(area);
    [rows[0], rows[1], rows[2], rows[3], rows[4]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoggerStatus;
    use ratatui::backend::TestBackend;
    use std::path::PathBuf;

    fn screen_text(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn shows_the_session_at_a_glance() {
        let snapshot = SessionSnapshot {
            subject_id: "m7".to_owned(),
            status: LoggerStatus::Stopped(StopReason::Completed),
            trial_counter: 4,
            correct_count: 3,
            target_trials: Some(5),
            last_trial_number: Some(4),
            success_rate: Some(75.0),
            rolling_success_rate: Some(75.0),
            rolling_series: vec![(4, 75.0)],
            elapsed: Duration::from_secs(65),
            record_count: 12,
            malformed_count: 1,
            diagnostics: vec!["malformed line \"x\": unrecognized line".to_owned()],
            log_path: Some(PathBuf::from("data/m7/session.csv")),
        };

        let mut terminal = Terminal::new(TestBackend::new(100, 40)).unwrap();
        terminal
            .draw(|frame| render(frame, &snapshot, false))
            .unwrap();
        let text = screen_text(&terminal);

        assert!(text.contains("Trial Logger: m7"));
        assert!(text.contains("stopped: Completed"));
        assert!(text.contains("4 / 5 trials (80%)"));
        assert!(text.contains("00:01:05"));
        assert!(text.contains("3 of 4 (75.0%)"));
        assert!(text.contains("Press any key to exit"));
        assert!(text.contains("unrecognized line"));
    }
}
