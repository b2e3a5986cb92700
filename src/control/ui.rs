use std::collections::VecDeque;
use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::control::api;
use crate::{LifecycleState, SourceStatus};

const TICK_RATE: Duration = Duration::from_millis(100);
const LOG_LINES: usize = 64;

#[derive(Default)]
struct AppState {
    sources: Vec<SourceStatus>,
    log: VecDeque<String>,
    selected: usize,
    mode: Mode,
    message: Option<String>,
    last_update: Option<Instant>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    BindInput,
}

struct BindEditor {
    buffer: String,
}

/// Run the ratatui-based developer console.
pub fn run() -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    std::thread::spawn(move || {
        loop {
            let update = (api::get_status(), api::drain_log());
            if status_tx.send(update).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();
    let mut bind_editor: Option<BindEditor> = None;

    loop {
        terminal.draw(|frame| draw(frame, &app, bind_editor.as_ref()))?;

        for (sources, lines) in drain(&status_rx) {
            app.sources = sources;
            app.log.extend(lines);
            while app.log.len() > LOG_LINES {
                app.log.pop_front();
            }
            app.last_update = Some(Instant::now());
        }
        app.selected = app.selected.min(app.sources.len().saturating_sub(1));

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, &mut bind_editor, key) {
                    break;
                }
            }
        }
    }

    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
    rx.try_iter().collect()
}

fn handle_key(app: &mut AppState, bind_editor: &mut Option<BindEditor>, key: KeyEvent) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Up => {
                app.selected = app.selected.saturating_sub(1);
            }
            KeyCode::Down => {
                if app.selected + 1 < app.sources.len() {
                    app.selected += 1;
                }
            }
            KeyCode::Char('d') => {
                if let Some(src) = current_source(app) {
                    if api::deactivate(src.id) {
                        app.message = Some(format!("Deactivated {}", src.name));
                    }
                }
            }
            KeyCode::Char('r') => {
                if let Some(src) = current_source(app) {
                    app.message = match api::reactivate(src.id) {
                        Some(Ok(())) => Some(format!("Reactivated {}", src.name)),
                        Some(Err(err)) => Some(format!("{}: {err}", src.name)),
                        None => None,
                    };
                }
            }
            KeyCode::Char('b') => {
                if current_source(app).is_some() {
                    bind_editor.replace(BindEditor {
                        buffer: String::from("1 "),
                    });
                    app.mode = Mode::BindInput;
                }
            }
            _ => {}
        },
        Mode::BindInput => match key.code {
            KeyCode::Esc => {
                bind_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let (Some(editor), Some(src)) = (bind_editor.take(), current_source(app)) {
                    app.message = Some(apply_binding(&src, &editor.buffer));
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = bind_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = bind_editor.as_mut() {
                    editor.buffer.push(c);
                }
            }
            _ => {}
        },
    }
    false
}

/// Parse `"<channel> <port>[,<port>...]"` and bind.
fn apply_binding(src: &SourceStatus, input: &str) -> String {
    let input = input.trim();
    let (channel, ports) = input.split_once(' ').unwrap_or((input, ""));
    let Some(slot) = channel.parse::<usize>().ok().and_then(|c| c.checked_sub(1)) else {
        return format!("Invalid channel '{channel}'");
    };
    let ports: Vec<String> = ports
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    match api::bind(src.id, slot, &ports) {
        Some(Ok(rejected)) if rejected.is_empty() => {
            format!("Channel {} of {} bound", slot + 1, src.name)
        }
        Some(Ok(rejected)) => format!("Unavailable: {}", rejected.join(", ")),
        Some(Err(err)) => err.to_string(),
        None => format!("{} is gone", src.name),
    }
}

fn current_source(app: &AppState) -> Option<SourceStatus> {
    app.sources.get(app.selected).cloned()
}

fn state_style(state: LifecycleState) -> Style {
    match state {
        LifecycleState::Active => Style::default().fg(Color::Green),
        LifecycleState::Error => Style::default().fg(Color::Red),
        _ => Style::default().fg(Color::DarkGray),
    }
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, bind_editor: Option<&BindEditor>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Min(6),
            Constraint::Length(8),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_sources(frame, chunks[1], app);
    draw_channels(frame, chunks[2], app);
    draw_log(frame, chunks[3], app);
    draw_footer(frame, chunks[4], app);

    if let Some(editor) = bind_editor {
        let area = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Bind: <channel> <port>,<port>  (Enter to apply, Esc to cancel)")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("JACK Capture Console")
        .borders(Borders::ALL);

    let content = if app.sources.is_empty() {
        Paragraph::new(Line::from(vec![Span::styled(
            "No live sources",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    } else {
        let active = app
            .sources
            .iter()
            .filter(|s| s.state == LifecycleState::Active)
            .count();
        let faults: u64 = app.sources.iter().map(|s| s.faults).sum();
        Paragraph::new(format!(
            "Sources: {}    Active: {}    Callback faults: {}",
            app.sources.len(),
            active,
            faults
        ))
    };

    frame.render_widget(content.block(block), area);
}

fn draw_sources(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Sources").borders(Borders::ALL);

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Name"),
        Cell::from("State"),
        Cell::from("Client"),
        Cell::from("Rate"),
        Cell::from("Block"),
        Cell::from("Ch"),
        Cell::from("Cycles"),
        Cell::from("Error"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = app.sources.iter().enumerate().map(|(idx, src)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let mut row = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(src.name.clone()),
            Cell::from(src.state.as_str()).style(state_style(src.state)),
            Cell::from(src.client_name.clone().unwrap_or_default()),
            Cell::from(format!("{}", src.sample_rate)),
            Cell::from(format!("{}", src.block_frames)),
            Cell::from(format!("{}", src.channels.len())),
            Cell::from(format!("{}", src.cycles)),
            Cell::from(src.last_error.clone().unwrap_or_default()),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(16),
            Constraint::Length(13),
            Constraint::Length(20),
            Constraint::Length(7),
            Constraint::Length(6),
            Constraint::Length(3),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(1);

    frame.render_widget(table, area);
}

fn draw_channels(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Channels").borders(Borders::ALL);
    let Some(src) = app.sources.get(app.selected) else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let header = Row::new(vec![
        Cell::from("#"),
        Cell::from("Port"),
        Cell::from("Fill %"),
        Cell::from("Overruns"),
        Cell::from("Underruns"),
        Cell::from("Connected"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = src.channels.iter().map(|ch| {
        let connected = if ch.connections.is_empty() {
            "(silent)".to_string()
        } else {
            ch.connections.join(", ")
        };
        Row::new(vec![
            Cell::from(format!("{}", ch.index + 1)),
            Cell::from(ch.port_name.clone().unwrap_or_default()),
            Cell::from(format!("{:.1}", ch.buffer_fill * 100.0)),
            Cell::from(format!("{}", ch.overruns)),
            Cell::from(format!("{}", ch.underruns)),
            Cell::from(connected),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(3),
            Constraint::Length(24),
            Constraint::Length(8),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(1);

    frame.render_widget(table, area);
}

fn draw_log(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .log
        .iter()
        .skip(app.log.len().saturating_sub(visible))
        .map(|line| Line::from(line.clone()))
        .collect();
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  b: Bind ports  •  d: Deactivate  •  r: Reactivate  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
