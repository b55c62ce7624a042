/// dashboard.rs – ratatui live terminal dashboard.
///
/// Layout:
///  ┌─ Header ────────────────────────────────────────────────────────────┐
///  │ TradeDesk │ User │ Equity │ Day P&L │ Total P&L │ Feed state        │
///  ├─ Positions ───────────────────────┬─ Market Quotes ─────────────────┤
///  ├─ Recent Trades ───────────────────┼─ Learning Modules ──────────────┤
///  ├─ Strategies & Backtests ──────────┼─ Logs ──────────────────────────┤
///  └───────────────────────────────────┴─────────────────────────────────┘
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::io::{self, Stdout};

use crate::models::{AppState, ConnectionState};

pub type CrossTerm = Terminal<CrosstermBackend<Stdout>>;

/// What a key press asks the main loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Quit,
    Reconnect,
    None,
}

// ---------------------------------------------------------------------------
// Setup / teardown
// ---------------------------------------------------------------------------

pub fn setup_terminal() -> anyhow::Result<CrossTerm> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

pub fn teardown_terminal(terminal: &mut CrossTerm) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Key event handling
// ---------------------------------------------------------------------------

/// q / Ctrl-C quit, r forces a reconnect (also the way out of OFFLINE).
pub fn handle_event(event: &Event) -> KeyAction {
    let Event::Key(k) = event else {
        return KeyAction::None;
    };
    match k.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => KeyAction::Quit,
        KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::Char('r') | KeyCode::Char('R') => KeyAction::Reconnect,
        _ => KeyAction::None,
    }
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

pub fn render(frame: &mut Frame, state: &AppState) {
    let area = frame.size();

    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    render_header(frame, outer[0], state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(outer[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Percentage(30),
            Constraint::Percentage(30),
        ])
        .split(body[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(35),
            Constraint::Percentage(25),
            Constraint::Percentage(40),
        ])
        .split(body[1]);

    render_positions(frame, left[0], state);
    render_trades(frame, left[1], state);
    render_research(frame, left[2], state);
    render_quotes(frame, right[0], state);
    render_modules(frame, right[1], state);
    render_logs(frame, right[2], state);
}

fn pnl_color(v: f64) -> Color {
    if v >= 0.0 {
        Color::Green
    } else {
        Color::Red
    }
}

fn header_row<'a>(titles: &'a [&'a str]) -> Row<'a> {
    Row::new(
        titles
            .iter()
            .map(|h| Cell::from(*h).style(Style::default().add_modifier(Modifier::BOLD))),
    )
    .style(Style::default().bg(Color::DarkGray))
    .height(1)
}

fn opt_f64(v: Option<f64>, fmt: impl Fn(f64) -> String) -> String {
    v.map(fmt).unwrap_or_else(|| "—".into())
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn connection_span(state: ConnectionState) -> Span<'static> {
    let color = match state {
        ConnectionState::Open => Color::Green,
        ConnectionState::Connecting | ConnectionState::ReconnectScheduled { .. } => Color::Yellow,
        ConnectionState::Offline { .. } => Color::Red,
        _ => Color::DarkGray,
    };
    let dot = if state.is_open() { "●" } else { "○" };
    Span::styled(
        format!("Feed{dot} {state}"),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    )
}

fn render_header(frame: &mut Frame, area: Rect, state: &AppState) {
    let p = &state.portfolio;
    let uptime = state
        .started_at
        .map(|t| {
            let secs = (chrono::Utc::now() - t).num_seconds();
            format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
        })
        .unwrap_or_else(|| "—".into());

    let mut spans = vec![
        Span::styled(
            "  TradeDesk  │ ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "User: {}  │ ",
            state.user_id.as_deref().unwrap_or("anonymous")
        )),
        Span::raw(format!("Up: {uptime}  │ ")),
        Span::raw(format!("Equity: ${:.2}  │ ", p.equity)),
        Span::raw(format!("Cash: ${:.2}  │ ", p.balance)),
        Span::styled(
            format!("Day: {:+.2}  │ ", p.day_pnl),
            Style::default()
                .fg(pnl_color(p.day_pnl))
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("Total: {:+.2}  │ ", p.total_pnl),
            Style::default().fg(pnl_color(p.total_pnl)),
        ),
        connection_span(state.connection),
    ];
    if matches!(state.connection, ConnectionState::Offline { .. }) {
        spans.push(Span::styled(
            "  [r] reconnect",
            Style::default().fg(Color::Yellow),
        ));
    }
    spans.push(Span::styled("  [q] quit", Style::default().fg(Color::DarkGray)));

    let header = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" TradeDesk – {} ", state.feed_url)),
        );
    frame.render_widget(header, area);
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

fn render_positions(frame: &mut Frame, area: Rect, state: &AppState) {
    let rows: Vec<Row> = state
        .portfolio
        .positions
        .iter()
        .map(|pos| {
            // Prefer the live quote over the snapshot's mark when one exists.
            let last = state
                .quotes
                .get(&pos.symbol)
                .map(|q| q.price)
                .filter(|p| *p > 0.0);
            let upnl = last
                .map(|px| pos.quantity * (px - pos.avg_price))
                .unwrap_or(pos.unrealized_pnl);
            let upnl_pct = opt_f64(pos.unrealized_pct(), |p| format!("{:+.1}%", p * 100.0));
            Row::new(vec![
                Cell::from(pos.symbol.clone()),
                Cell::from(format!("{:.2}", pos.quantity)),
                Cell::from(format!("{:.2}", pos.avg_price)),
                Cell::from(opt_f64(last, |p| format!("{p:.2}"))),
                Cell::from(format!("{:.2}", pos.market_value)),
                Cell::from(format!("{upnl:+.2} ({upnl_pct})")).style(
                    Style::default()
                        .fg(pnl_color(upnl))
                        .add_modifier(Modifier::BOLD),
                ),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(11),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Symbol", "Qty", "Avg", "Last", "Value", "Unreal. P&L"]))
    .block(Block::default().borders(Borders::ALL).title(format!(
        " Positions ({}) ",
        state.portfolio.positions.len()
    )));

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Recent trades
// ---------------------------------------------------------------------------

fn render_trades(frame: &mut Frame, area: Rect, state: &AppState) {
    let rows: Vec<Row> = state
        .recent_trades
        .iter()
        .take(20)
        .map(|t| {
            let side_color = if t.side.eq_ignore_ascii_case("buy") {
                Color::Green
            } else {
                Color::Red
            };
            let status_color = match t.status.to_ascii_uppercase().as_str() {
                "FILLED" => Color::Green,
                "REJECTED" | "CANCELLED" | "CANCELED" => Color::Red,
                _ => Color::Yellow,
            };
            Row::new(vec![
                Cell::from(t.executed_at.clone().unwrap_or_else(|| "—".into())),
                Cell::from(t.symbol.clone()),
                Cell::from(t.side.to_uppercase()).style(Style::default().fg(side_color)),
                Cell::from(format!("{:.2}", t.quantity)),
                Cell::from(format!("{:.2}", t.price)),
                Cell::from(t.status.clone()).style(Style::default().fg(status_color)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(20),
            Constraint::Length(8),
            Constraint::Length(5),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Min(8),
        ],
    )
    .header(header_row(&["Time", "Symbol", "Side", "Qty", "Price", "Status"]))
    .block(Block::default().borders(Borders::ALL).title(format!(
        " Recent Trades ({}) ",
        state.recent_trades.len()
    )));

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Strategies & backtests
// ---------------------------------------------------------------------------

fn render_research(frame: &mut Frame, area: Rect, state: &AppState) {
    let mut rows: Vec<Row> = state
        .strategies
        .iter()
        .map(|s| {
            Row::new(vec![
                Cell::from("strategy"),
                Cell::from(s.name.clone()),
                Cell::from(s.status.clone()),
                Cell::from(s.message.clone().unwrap_or_default()),
            ])
        })
        .collect();

    rows.extend(state.backtests.iter().map(|b| {
        let result = match b.total_return {
            Some(r) => format!(
                "ret {:+.1}%  sharpe {}  dd {}",
                r * 100.0,
                opt_f64(b.sharpe_ratio, |s| format!("{s:.2}")),
                opt_f64(b.max_drawdown, |d| format!("{:.1}%", d * 100.0)),
            ),
            None => format!("{:.0}%", b.progress.clamp(0.0, 1.0) * 100.0),
        };
        Row::new(vec![
            Cell::from("backtest"),
            Cell::from(if b.strategy_id.is_empty() {
                b.id.clone()
            } else {
                b.strategy_id.clone()
            }),
            Cell::from(b.status.clone()),
            Cell::from(result),
        ])
    }));

    let table = Table::new(
        rows,
        [
            Constraint::Length(9),
            Constraint::Length(16),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Kind", "Name", "Status", "Detail"]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Strategies & Backtests "),
    );

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Market quotes
// ---------------------------------------------------------------------------

fn render_quotes(frame: &mut Frame, area: Rect, state: &AppState) {
    let rows: Vec<Row> = state
        .quotes
        .values()
        .map(|q| {
            Row::new(vec![
                Cell::from(q.symbol.clone()),
                Cell::from(format!("{:.2}", q.price)),
                Cell::from(format!("{:+.2}%", q.change_percent))
                    .style(Style::default().fg(pnl_color(q.change_percent))),
                Cell::from(opt_f64(q.bid, |p| format!("{p:.2}")))
                    .style(Style::default().fg(Color::Green)),
                Cell::from(opt_f64(q.ask, |p| format!("{p:.2}")))
                    .style(Style::default().fg(Color::Red)),
                Cell::from(opt_f64(q.spread(), |s| format!("{s:.3}"))),
                Cell::from(format!("{:.0}", q.volume)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Min(8),
        ],
    )
    .header(header_row(&["Symbol", "Last", "Chg", "Bid", "Ask", "Sprd", "Volume"]))
    .block(Block::default().borders(Borders::ALL).title(format!(
        " Market Quotes ({} updates) ",
        state.updates_received
    )));

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Learning modules
// ---------------------------------------------------------------------------

fn render_modules(frame: &mut Frame, area: Rect, state: &AppState) {
    let items: Vec<ListItem> = state
        .modules
        .iter()
        .map(|m| {
            let pct = (m.progress.clamp(0.0, 1.0) * 100.0).round();
            let (mark, color) = if m.completed {
                ("✔", Color::Green)
            } else {
                ("…", Color::Gray)
            };
            ListItem::new(Line::from(Span::styled(
                format!("{mark} {:<28} {pct:>3}%", m.title),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list =
        List::new(items).block(Block::default().borders(Borders::ALL).title(" Learning Modules "));
    frame.render_widget(list, area);
}

// ---------------------------------------------------------------------------
// Logs panel
// ---------------------------------------------------------------------------

fn render_logs(frame: &mut Frame, area: Rect, state: &AppState) {
    let items: Vec<ListItem> = state
        .logs
        .iter()
        .take(area.height as usize)
        .map(|line| {
            let color = if line.contains("ERROR") || line.contains("OFFLINE") {
                Color::Red
            } else if line.contains("RECONNECTING") {
                Color::Yellow
            } else if line.contains("OPEN") || line.contains("completed") {
                Color::Green
            } else {
                Color::Gray
            };
            ListItem::new(Line::from(Span::styled(
                line.clone(),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Logs "))
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}
