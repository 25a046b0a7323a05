use crate::app::{App, AppView};
use crate::checkin::CheckInField;
use crate::settings::SettingsField;
use crate::speedtest::{Method, Phase};
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph, Wrap},
    Frame,
};

// Color Palette - Elegant & Minimal
const ACCENT: Color = Color::Rgb(100, 149, 237);      // Cornflower blue
const SUCCESS: Color = Color::Rgb(134, 194, 156);     // Soft green
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220);        // Soft blue
const WARN: Color = Color::Rgb(220, 180, 130);        // Soft amber
const ERROR: Color = Color::Rgb(220, 120, 120);       // Muted red
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();

    match app.view {
        AppView::Main => draw_main_view(frame, area, app),
        AppView::Settings => draw_settings_view(frame, area, app),
    }
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    draw_header(frame, chunks[0], app);

    let columns = Layout::horizontal([Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)]).split(chunks[1]);
    draw_speed_panel(frame, columns[0], app);

    let right = Layout::vertical([Constraint::Length(8), Constraint::Min(4)]).split(columns[1]);
    draw_checkin_panel(frame, right[0], app);
    draw_diagnostics_panel(frame, right[1], app);

    draw_help(frame, chunks[2], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(12),
        Constraint::Min(10),
        Constraint::Length(20),
    ])
    .split(inner);

    // Title
    let title = Paragraph::new("cafespeed")
        .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD));
    frame.render_widget(title, chunks[0]);

    // Status
    let (status, color) = match app.phase {
        Phase::Idle => ("Ready", TEXT_MUTED),
        Phase::Locating => ("Finding a server...", WARN),
        Phase::Downloading => ("Measuring download...", SUCCESS),
        Phase::Done => ("Complete", ACCENT),
        Phase::Error => ("Test failed", ERROR),
    };

    let status_text = Paragraph::new(status)
        .style(Style::default().fg(color))
        .alignment(Alignment::Center);
    frame.render_widget(status_text, chunks[1]);

    // Phase indicator
    let phase_text = create_phase_text(app.phase);
    frame.render_widget(
        Paragraph::new(phase_text).alignment(Alignment::Right),
        chunks[2],
    );
}

fn create_phase_text(phase: Phase) -> Line<'static> {
    let phases = [(Phase::Locating, "locate"), (Phase::Downloading, "download")];

    let mut spans = Vec::new();

    for (i, (p, label)) in phases.iter().enumerate() {
        let is_active = phase == *p;
        let is_complete = match phase {
            Phase::Downloading => *p == Phase::Locating,
            Phase::Done => true,
            _ => false,
        };

        let style = if is_active {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if is_complete {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };

        spans.push(Span::styled(*label, style));

        if i < phases.len() - 1 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
    }

    Line::from(spans)
}

// Panels
fn draw_speed_panel(frame: &mut Frame, area: Rect, app: &App) {
    let active = app.is_running();
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if active { BORDER_ACTIVE } else { BORDER }))
        .title(Span::styled(
            " Wi-Fi download ",
            Style::default().fg(if active { SUCCESS } else { TEXT_SECONDARY }),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    // Speed value
    frame.render_widget(
        Paragraph::new(speed_text(app))
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    // Where the figure comes from
    frame.render_widget(
        Paragraph::new(source_text(app))
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    // Progress bar
    draw_progress_bar(frame, chunks[2], app.scale_pct / 100.0, SUCCESS, SUCCESS_DIM);

    // Chart
    if !app.samples.is_empty() {
        draw_sparkline(frame, chunks[3], &app.samples, SUCCESS);
    }
}

fn draw_checkin_panel(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER))
        .title(Span::styled(
            format!(" Check-in · {} ", app.cafe_id),
            Style::default().fg(INFO),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(1),
    ])
    .split(inner);

    let fields = [
        (CheckInField::Crowd, "Crowd"),
        (CheckInField::Outlets, "Power outlets"),
        (CheckInField::Noise, "Noise"),
    ];
    for (row, (field, label)) in rows.iter().zip(fields) {
        draw_setting_row(
            frame,
            *row,
            label,
            app.form.label(field).unwrap_or("—"),
            app.selected_field == field,
        );
    }

    let wifi = match app.form.wifi_speed() {
        Some("0") => "Unknown".to_string(),
        Some(mbps) => format!("{mbps} Mbps"),
        None => "run a test".to_string(),
    };
    draw_setting_row(frame, rows[3], "Wi-Fi", &wifi, false);

    let (footer, color) = match &app.notice {
        Some(notice) => (notice.as_str(), WARN),
        None if app.form.is_valid() => ("ready · c to commit", SUCCESS),
        None => ("", TEXT_MUTED),
    };
    frame.render_widget(
        Paragraph::new(format!(" {footer}")).style(Style::default().fg(color)),
        rows[4],
    );
}

fn draw_diagnostics_panel(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER))
        .title(Span::styled(" Diagnostics ", Style::default().fg(TEXT_SECONDARY)));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    if let Some(error) = &app.error {
        let lines = vec![
            Line::from(Span::styled(
                error.to_string(),
                Style::default().fg(ERROR).add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "enter retry · f HTTP fallback · u set as unknown",
                Style::default().fg(TEXT_SECONDARY),
            )),
        ];
        frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: true }), inner);
        return;
    }

    // Newest lines at the bottom
    let visible = inner.height as usize;
    let lines: Vec<Line> = app
        .log
        .iter()
        .skip(app.log.len().saturating_sub(visible))
        .map(|l| Line::from(Span::styled(l.as_str(), Style::default().fg(TEXT_MUTED))))
        .collect();
    frame.render_widget(Paragraph::new(lines), inner);
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio.clamp(0.0, 1.0) * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    if data.is_empty() || area.width < 4 || area.height < 2 {
        return;
    }

    let (min_val, max_val) = get_data_range(data);
    let range = (max_val - min_val).max(1.0);

    let points: Vec<(f64, f64)> = data
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as f64, v))
        .collect();

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([min_val - range * 0.1, max_val + range * 0.1]));

    frame.render_widget(chart, area);
}

// Settings
fn draw_settings_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    // Header
    let header_block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let header_inner = header_block.inner(chunks[0]);
    frame.render_widget(header_block, chunks[0]);

    frame.render_widget(
        Paragraph::new("Settings")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        header_inner,
    );

    // Settings content
    let content_area = Layout::horizontal([
        Constraint::Length(2),
        Constraint::Min(30),
        Constraint::Length(2),
    ])
    .split(chunks[1])[1];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(content_area);
    frame.render_widget(block, content_area);

    let rows = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Min(0),
    ])
    .split(inner);

    draw_setting_row(
        frame,
        rows[0],
        "Test duration",
        &format!("{} s", app.settings.download_secs),
        app.selected_setting == SettingsField::Duration,
    );

    draw_setting_row(
        frame,
        rows[1],
        "Stall after",
        &format!("{} s", app.settings.stall_ms / 1000),
        app.selected_setting == SettingsField::Stall,
    );

    draw_setting_row(
        frame,
        rows[2],
        "Timeout buffer",
        &format!("{} s", app.settings.timeout_buffer_secs),
        app.selected_setting == SettingsField::TimeoutBuffer,
    );

    // Help
    let help = "↑↓ select · ←→ adjust · enter done";
    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[2],
    );
}

fn draw_setting_row(frame: &mut Frame, area: Rect, label: &str, value: &str, selected: bool) {
    let chunks = Layout::horizontal([
        Constraint::Length(16),
        Constraint::Min(10),
    ])
    .split(area);

    let label_style = if selected {
        Style::default().fg(ACCENT)
    } else {
        Style::default().fg(TEXT_SECONDARY)
    };

    frame.render_widget(
        Paragraph::new(format!(" {}", label)).style(label_style),
        chunks[0],
    );

    let value_text = if selected {
        format!("< {} >", value)
    } else {
        value.to_string()
    };

    let value_style = if selected {
        Style::default().fg(TEXT_PRIMARY)
    } else {
        Style::default().fg(TEXT_MUTED)
    };

    frame.render_widget(Paragraph::new(value_text).style(value_style), chunks[1]);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = match app.phase {
        Phase::Idle => "enter start · ←→ tab edit · c commit · s settings · q quit",
        Phase::Done => "enter re-test · ←→ tab edit · c commit · s settings · q quit",
        Phase::Error => "enter retry · f fallback · u unknown · c commit · q quit",
        Phase::Locating | Phase::Downloading => "←→ tab edit · esc cancel · q quit",
    };

    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

// Helpers
fn speed_text(app: &App) -> String {
    match (app.phase, app.mbps.as_deref()) {
        (Phase::Done, Some("0")) => "Unknown".to_string(),
        (_, Some(mbps)) => format_speed(mbps.parse().unwrap_or(0.0)),
        (_, None) => format_speed(0.0),
    }
}

fn source_text(app: &App) -> String {
    match (app.method, &app.server) {
        (Some(Method::Http), _) => "via HTTP fallback".to_string(),
        (_, Some(server)) => server.host().to_string(),
        (_, None) if app.phase == Phase::Locating => "locating...".to_string(),
        _ => String::new(),
    }
}

fn get_data_range(data: &[f64]) -> (f64, f64) {
    let min = data.iter().cloned().fold(f64::MAX, f64::min);
    let max = data.iter().cloned().fold(f64::MIN, f64::max);
    (if min == f64::MAX { 0.0 } else { min }, if max == f64::MIN { 0.0 } else { max })
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.2} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        "—".to_string()
    }
}
