//! UI rendering module.
//!
//! Contains all the widget rendering logic (View).

use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Padding, Paragraph, Tabs, Wrap},
};
use stationflash_core::FlashStage;

use crate::app::{App, Focus, LogEntry, LogLevel, Tab};

/// Main draw function.
pub fn draw(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header/tabs
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Footer/status bar
        ])
        .split(area);

    draw_header(frame, chunks[0], app);

    match app.current_tab {
        Tab::Main => draw_main_view(frame, chunks[1], app),
        Tab::Logs => draw_logs_view(frame, chunks[1], app),
        Tab::Help => draw_help_view(frame, chunks[1]),
    }

    draw_footer(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let titles = vec!["Main", "Logs (F2)", "Help (F1)"];
    let selected = match app.current_tab {
        Tab::Main => 0,
        Tab::Logs => 1,
        Tab::Help => 2,
    };

    let tabs = Tabs::new(titles)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" StationBoard Flasher ")
                .title_style(
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
        )
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .divider(symbols::DOT);

    frame.render_widget(tabs, area);
}

fn stage_color(stage: FlashStage) -> Color {
    match stage {
        FlashStage::Complete => Color::Green,
        FlashStage::Error => Color::Red,
        FlashStage::Idle => Color::White,
        _ => Color::Cyan,
    }
}

fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let port = match app.selected_port() {
        Some(info) => Span::styled(
            format!(" ● {} ", info.port_name),
            Style::default().fg(Color::Green),
        ),
        None => Span::styled(" ○ No device ", Style::default().fg(Color::Red)),
    };

    let stage = Span::styled(
        format!(" {} ", app.status.stage),
        Style::default().fg(stage_color(app.status.stage)),
    );

    let help = Span::styled(
        " Ctrl+Q: Quit | Tab: Focus | Enter: Flash | r: Reload | p: Ports ",
        Style::default().fg(Color::DarkGray),
    );

    let footer = Paragraph::new(Line::from(vec![port, stage, help])).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );

    frame.render_widget(footer, area);
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(6), Constraint::Length(7)])
        .split(chunks[0]);

    draw_versions(frame, left[0], app);
    draw_ports(frame, left[1], app);
    draw_status_panel(frame, chunks[1], app);
}

fn focus_block(title: &str, focused: bool) -> Block<'_> {
    let color = if focused { Color::Yellow } else { Color::DarkGray };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color))
        .title(title)
        .title_style(Style::default().fg(if focused { Color::Yellow } else { Color::White }))
}

fn draw_versions(frame: &mut Frame, area: Rect, app: &App) {
    let block = focus_block(" Firmware ", app.focus == Focus::Versions);

    let Some(catalog) = &app.catalog else {
        let text = if app.catalog_loading {
            "Loading versions..."
        } else {
            "No versions loaded (r to retry)"
        };
        let placeholder = Paragraph::new(Span::styled(text, Style::default().fg(Color::DarkGray)))
            .block(block.padding(Padding::horizontal(1)));
        frame.render_widget(placeholder, area);
        return;
    };

    let items: Vec<ListItem> = catalog
        .versions()
        .iter()
        .enumerate()
        .map(|(i, version)| {
            let mut header = vec![
                Span::styled(
                    format!("v{}", version.version_id),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("  {}", version.release_date),
                    Style::default().fg(Color::DarkGray),
                ),
            ];
            if i == 0 {
                header.push(Span::styled("  Latest", Style::default().fg(Color::Green)));
            }
            let mut lines = vec![Line::from(header)];
            lines.extend(version.change_notes.iter().map(|note| {
                Line::from(Span::styled(
                    format!("  - {note}"),
                    Style::default().fg(Color::Gray),
                ))
            }));
            ListItem::new(Text::from(lines))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().fg(Color::Yellow))
        .highlight_symbol("▶ ");

    let mut state = ListState::default().with_selected(Some(app.version_index));
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_ports(frame: &mut Frame, area: Rect, app: &App) {
    let block = focus_block(" Serial Port ", app.focus == Focus::Ports);

    if app.ports.is_empty() {
        let placeholder = Paragraph::new(Span::styled(
            "No supported device (p to rescan)",
            Style::default().fg(Color::DarkGray),
        ))
        .block(block.padding(Padding::horizontal(1)));
        frame.render_widget(placeholder, area);
        return;
    }

    let items: Vec<ListItem> = app
        .ports
        .iter()
        .map(|info| ListItem::new(info.to_string()))
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().fg(Color::Yellow))
        .highlight_symbol("▶ ");

    let mut state = ListState::default().with_selected(Some(app.port_index));
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_status_panel(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // Progress
            Constraint::Length(5), // Session
            Constraint::Min(5),    // Recent logs
        ])
        .split(area);

    draw_progress(frame, chunks[0], app);
    draw_session_info(frame, chunks[1], app);
    draw_recent_logs(frame, chunks[2], app);
}

fn draw_progress(frame: &mut Frame, area: Rect, app: &App) {
    let percent = app.status.percent();
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Progress "),
        )
        .gauge_style(Style::default().fg(stage_color(app.status.stage)).bg(Color::Black))
        .percent(u16::from(percent))
        .label(format!("{}: {}%", app.status.stage, percent));

    frame.render_widget(gauge, area);
}

fn draw_session_info(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Session ")
        .padding(Padding::horizontal(1));

    let button_style = if app.is_running() {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default().fg(Color::Black).bg(Color::Green)
    };

    let chip = app.chip.as_deref().unwrap_or("-");
    let content = vec![
        Line::from(Span::styled(
            app.status.message.clone(),
            Style::default().fg(stage_color(app.status.stage)),
        )),
        Line::from(vec![
            Span::styled("Chip: ", Style::default().fg(Color::Cyan)),
            Span::styled(chip.to_string(), Style::default().fg(Color::White)),
        ]),
        Line::from(Span::styled(
            format!(" {} ", app.status.stage.action_label()),
            button_style,
        ))
        .alignment(Alignment::Center),
    ];

    frame.render_widget(Paragraph::new(content).block(block), area);
}

fn draw_recent_logs(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Recent Logs "),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_logs_view(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .logs
        .iter()
        .skip(app.log_scroll)
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| log_to_list_item(entry, area.width))
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(format!(
                    " Logs ({}/{}) ",
                    app.log_scroll + 1,
                    app.logs.len().max(1)
                )),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

fn draw_help_view(frame: &mut Frame, area: Rect) {
    let help_text = vec![
        "",
        "  StationBoard Flasher",
        "",
        "  KEYBOARD SHORTCUTS:",
        "",
        "  Ctrl+Q, Ctrl+C, Esc    Quit application",
        "  F1                     Show this help",
        "  F2                     View full logs",
        "  Tab                    Switch between versions and ports",
        "  Up/Down, j/k           Move the selection",
        "  Enter                  Flash the selected version",
        "  r                      Reload the version list",
        "  p                      Rescan serial ports",
        "",
        "  IN LOGS VIEW:",
        "",
        "  j/k, Up/Down           Scroll logs",
        "  Page Up/Down           Scroll by page",
        "  Home/End               Go to start/end",
        "",
        "  USAGE:",
        "",
        "  1. Plug in the board over USB",
        "  2. Pick a firmware version and a serial port",
        "  3. Press Enter and wait for the board to restart",
        "",
        "  Press any key to return...",
    ];

    let text: Vec<Line> = help_text.iter().map(|s| Line::from(*s)).collect();

    let help = Paragraph::new(Text::from(text))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Help "),
        )
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: false });

    frame.render_widget(help, area);
}

fn log_to_list_item(entry: &LogEntry, width: u16) -> ListItem<'static> {
    let (icon, color) = match entry.level {
        LogLevel::Error => ("✗", Color::Red),
        LogLevel::Warn => ("⚠", Color::Yellow),
        LogLevel::Info => ("●", Color::Green),
    };

    let time_len = entry.timestamp.len() + 1;
    let icon_len = 2;
    let msg_width = (width.saturating_sub((time_len + icon_len + 4) as u16) as usize).max(1);

    let chars: Vec<char> = entry.message.chars().collect();
    let mut chunks = chars.chunks(msg_width).map(|c| c.iter().collect::<String>());

    let mut lines = vec![Line::from(vec![
        Span::styled(
            format!("{} ", entry.timestamp),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(format!("{} ", icon), Style::default().fg(color)),
        Span::styled(chunks.next().unwrap_or_default(), Style::default().fg(Color::White)),
    ])];

    for rest in chunks {
        lines.push(Line::from(vec![
            Span::raw(" ".repeat(time_len + icon_len)),
            Span::styled(rest, Style::default().fg(Color::White)),
        ]));
    }

    ListItem::new(Text::from(lines))
}
