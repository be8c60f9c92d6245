//! TUI for a running check with live statistics and operator controls

use crate::proxy::{
    format_duration, CheckManager, CheckStatus, ExportFormat, ProbeOutcome, ProxyParser,
    ProxyResult, ResultSetExt, RunConfiguration, RunStatistics,
};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::Mutex;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Maximum number of recent proxies to keep for display
const MAX_RECENT_PROXIES: usize = 100;

/// Maximum number of log lines kept for the log pane
const MAX_LOG_LINES: usize = 200;

/// Where live and dead endpoints are written when the app exits
#[derive(Debug, Clone, Default)]
pub struct OutputFiles {
    pub live: Option<PathBuf>,
    pub dead: Option<PathBuf>,
    pub format: ExportFormat,
}

/// Proxy checker TUI application state
pub struct ProxyCheckerApp {
    manager: CheckManager,
    config: RunConfiguration,
    outputs: OutputFiles,
    /// Lines pushed by the manager's log callback
    logs: Arc<Mutex<VecDeque<String>>>,
    /// Set by the update callback, cleared when the lists are rebuilt
    dirty: Arc<AtomicBool>,
    stats: RunStatistics,
    status: CheckStatus,
    recent_live: VecDeque<ProxyResult>,
    recent_dead: VecDeque<ProxyResult>,
    /// Selected list (0 = live, 1 = dead)
    selected_list: usize,
    list_state: ListState,
    /// Feedback for the last key press
    message: String,
    should_quit: bool,
}

impl ProxyCheckerApp {
    pub fn new(config: RunConfiguration, outputs: OutputFiles) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            manager: CheckManager::new(),
            config,
            outputs,
            logs: Arc::new(Mutex::new(VecDeque::new())),
            dirty: Arc::new(AtomicBool::new(true)),
            stats: RunStatistics::default(),
            status: CheckStatus::Idle,
            recent_live: VecDeque::new(),
            recent_dead: VecDeque::new(),
            selected_list: 0,
            list_state,
            message: "Starting proxy check...".to_string(),
            should_quit: false,
        }
    }

    /// Run the TUI application
    pub async fn run(&mut self) -> Result<()> {
        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        if self.manager.is_running() {
            let _ = self.manager.force_stop();
        }
        self.save_outputs()?;
        result
    }

    fn start(&mut self) {
        let logs = self.logs.clone();
        let dirty = self.dirty.clone();
        let on_log = move |line: &str| {
            let mut logs = logs.lock();
            logs.push_back(line.to_string());
            if logs.len() > MAX_LOG_LINES {
                logs.pop_front();
            }
        };
        let on_update = move || dirty.store(true, Ordering::Release);

        if let Err(e) = self.manager.start(self.config.clone(), on_log, on_update) {
            self.message = format!("Cannot start: {}", e);
        }
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        self.start();

        loop {
            self.refresh();
            terminal.draw(|f| self.ui(f))?;

            // Handle key events with a short timeout
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Pull fresh state from the manager
    fn refresh(&mut self) {
        self.stats = self.manager.stats();
        self.status = self.manager.status();

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let results = self.manager.results();
        self.recent_live = recent(&results, ProbeOutcome::Live);
        self.recent_dead = recent(&results, ProbeOutcome::Dead);
    }

    fn handle_input(&mut self, key: KeyCode) {
        let outcome = match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
                return;
            }
            KeyCode::Char('p') => self.manager.pause().map(|_| "Pause requested"),
            KeyCode::Char('r') => self.manager.resume().map(|_| "Resumed"),
            KeyCode::Char('s') => self.manager.stop(true).map(|_| "Stopping after in-flight checks"),
            KeyCode::Char('f') => self.manager.force_stop().map(|_| "Force stopped"),
            KeyCode::Char('c') => self.manager.clear_results().map(|_| "Results cleared"),
            KeyCode::Tab => {
                // Switch between live and dead lists
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
                return;
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
                return;
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
                return;
            }
            _ => return,
        };

        self.message = match outcome {
            Ok(message) => message.to_string(),
            Err(e) => format!("Error: {}", e),
        };
        self.dirty.store(true, Ordering::Release);
    }

    fn selected_len(&self) -> usize {
        if self.selected_list == 0 {
            self.recent_live.len()
        } else {
            self.recent_dead.len()
        }
    }

    fn save_outputs(&self) -> Result<()> {
        let results = self.manager.results();
        if let Some(path) = &self.outputs.live {
            ProxyParser::save_to_file(&results, path, self.outputs.format)?;
        }
        if let Some(path) = &self.outputs.dead {
            let dead: Vec<String> = results
                .filter_by_outcome(ProbeOutcome::Dead)
                .into_iter()
                .map(|r| r.endpoint)
                .collect();
            ProxyParser::save_endpoints(&dead, path)?;
        }
        Ok(())
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Length(4), // Statistics
                Constraint::Min(6),    // Proxy lists
                Constraint::Length(8), // Log
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Soxy Check")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let stats = &self.stats;
        let completed = stats.completed();
        let progress = if stats.total > 0 {
            (completed as f64 / stats.total as f64 * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress.min(100))
            .label(format!("{}/{} ({}%)", completed, stats.total, progress));
        f.render_widget(gauge, chunks[1]);

        let kinds = stats
            .kind_counts
            .iter()
            .map(|(kind, count)| format!("{}: {}", kind, count))
            .collect::<Vec<_>>()
            .join("  ");
        let summary = format!(
            "Live: {}  Dead: {}  Errors: {}  Checking: {}  Pending: {}  Success: {:.1}%\n\
             Avg latency: {:.0}ms  Speed: {:.1}/s  Elapsed: {}  ETA: {}  Threads: {}  {}",
            stats.live,
            stats.dead,
            stats.errors,
            stats.checking,
            stats.pending,
            stats.success_rate,
            stats.average_latency_ms,
            stats.checks_per_second,
            format_duration(stats.elapsed),
            format_duration(stats.estimated_remaining),
            stats.thread_count,
            kinds
        );
        let summary = Paragraph::new(summary)
            .block(Block::default().borders(Borders::ALL).title("Statistics"));
        f.render_widget(summary, chunks[2]);

        // Split the main area into two columns for live and dead proxies
        let proxy_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[3]);

        Self::render_proxy_list(
            f,
            proxy_chunks[0],
            "Live Proxies",
            &self.recent_live,
            self.stats.live,
            Color::Green,
            if self.selected_list == 0 { Some(&mut self.list_state) } else { None },
        );
        Self::render_proxy_list(
            f,
            proxy_chunks[1],
            "Dead Proxies",
            &self.recent_dead,
            self.stats.dead,
            Color::Red,
            if self.selected_list == 1 { Some(&mut self.list_state) } else { None },
        );

        let log_height = chunks[4].height.saturating_sub(2) as usize;
        let lines: Vec<ListItem> = {
            let logs = self.logs.lock();
            logs.iter()
                .skip(logs.len().saturating_sub(log_height))
                .map(|line| ListItem::new(line.clone()))
                .collect()
        };
        let log = List::new(lines).block(Block::default().borders(Borders::ALL).title("Log"));
        f.render_widget(log, chunks[4]);

        let status_color = match self.status {
            CheckStatus::Running => Color::Yellow,
            CheckStatus::Pausing { .. } | CheckStatus::Paused => Color::Magenta,
            CheckStatus::Completed => Color::Green,
            CheckStatus::Stopping | CheckStatus::Stopped => Color::Red,
            CheckStatus::Idle => Color::Gray,
        };
        let status = Paragraph::new(format!(
            "{} | {} | [p]ause [r]esume [s]top [f]orce stop [c]lear [Tab] switch [q]uit",
            self.status, self.message
        ))
        .style(Style::default().fg(status_color))
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[5]);
    }

    fn render_proxy_list(
        f: &mut Frame,
        area: Rect,
        title: &str,
        results: &VecDeque<ProxyResult>,
        total_count: usize,
        color: Color,
        list_state: Option<&mut ListState>,
    ) {
        let items: Vec<ListItem> = results
            .iter()
            .rev() // Show newest first
            .map(|result| {
                let content = match (&result.egress_ip, &result.error) {
                    (_, Some(error)) => format!("{} - {}", result.endpoint, error),
                    (Some(ip), None) => format!(
                        "{} [{}] {}ms via {}",
                        result.endpoint, result.kind, result.latency_ms, ip
                    ),
                    (None, None) => format!(
                        "{} [{}] {}ms",
                        result.endpoint, result.kind, result.latency_ms
                    ),
                };
                ListItem::new(content).style(Style::default().fg(color))
            })
            .collect();

        let is_selected = list_state.is_some();
        let border_style = if is_selected {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("{} ({})", title, total_count))
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        if let Some(state) = list_state {
            f.render_stateful_widget(list, area, state);
        } else {
            f.render_widget(list, area);
        }
    }
}

/// The newest results with `outcome`, oldest first
fn recent(results: &[ProxyResult], outcome: ProbeOutcome) -> VecDeque<ProxyResult> {
    let mut matching: VecDeque<ProxyResult> = results
        .iter()
        .rev()
        .filter(|r| r.outcome == outcome)
        .take(MAX_RECENT_PROXIES)
        .cloned()
        .collect();
    matching.make_contiguous().reverse();
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;

    #[test]
    fn test_recent_keeps_newest() {
        let results: Vec<ProxyResult> = (0..150)
            .map(|i| {
                let mut r = ProxyResult::pending(format!("10.0.0.1:{}", i + 1), ProxyKind::Http);
                r.mark_checking().unwrap();
                r.set_dead("refused").unwrap();
                r
            })
            .collect();

        let recent = recent(&results, ProbeOutcome::Dead);
        assert_eq!(recent.len(), MAX_RECENT_PROXIES);
        assert_eq!(recent.front().unwrap().endpoint, "10.0.0.1:51");
        assert_eq!(recent.back().unwrap().endpoint, "10.0.0.1:150");
        assert!(super::recent(&results, ProbeOutcome::Live).is_empty());
    }

    #[test]
    fn test_quit_key() {
        let mut app = ProxyCheckerApp::new(RunConfiguration::default(), OutputFiles::default());
        app.handle_input(KeyCode::Char('p'));
        assert!(app.message.starts_with("Error: "));
        app.handle_input(KeyCode::Char('q'));
        assert!(app.should_quit);
    }
}
