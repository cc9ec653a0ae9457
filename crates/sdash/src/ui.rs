use crate::app::{App, NoteLevel, Tab};
use chrono::Utc;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Tabs, Wrap},
};
use sdash_core::energy::format_energy;
use sdash_core::{ClusterStats, TableRow};
use sdash_refresh::Source;

const SIDEBAR_WIDTH: u16 = 34;
const MAX_COLUMN_WIDTH: usize = 40;

#[derive(Clone, Copy)]
struct Theme {
    bg: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn theme() -> Theme {
    Theme {
        bg: Color::Rgb(11, 18, 32),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

pub fn render(frame: &mut ratatui::Frame, app: &App) {
    let theme = theme();
    let size = frame.size();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(size);
    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(0), Constraint::Length(SIDEBAR_WIDTH)])
        .split(rows[1]);

    frame.render_widget(render_tabs(app, theme), rows[0]);
    render_body(frame, app, theme, body[0]);
    frame.render_widget(render_sidebar(app, theme), body[1]);
    frame.render_widget(render_notification(app, theme), rows[2]);
    frame.render_widget(render_footer(app, theme), rows[3]);

    if let Some(detail) = &app.detail {
        let area = centered_rect(70, 80, size);
        let lines: Vec<Line> = detail
            .fields
            .iter()
            .map(|(key, value)| {
                Line::from(vec![
                    Span::styled(format!("{key:>16} "), Style::default().fg(theme.muted)),
                    Span::styled(value.clone(), Style::default().fg(theme.text)),
                ])
            })
            .collect();
        let title = format!("Job {} ({:?})", detail.job_id, detail.source);
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(Text::from(lines))
                .wrap(Wrap { trim: false })
                .block(panel(&title, theme)),
            area,
        );
    } else if let Some(node) = &app.node_detail {
        let area = centered_rect(70, 80, size);
        let mut lines = Vec::new();
        for (title, entries) in node.sections() {
            lines.push(Line::from(Span::styled(
                title.to_string(),
                Style::default()
                    .fg(theme.accent)
                    .add_modifier(Modifier::BOLD),
            )));
            for (key, value) in entries {
                lines.push(Line::from(vec![
                    Span::styled(format!("{key:>18} "), Style::default().fg(theme.muted)),
                    Span::styled(value.to_string(), Style::default().fg(theme.text)),
                ]));
            }
        }
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(Text::from(lines))
                .wrap(Wrap { trim: false })
                .block(panel(&format!("Node {}", node.name), theme)),
            area,
        );
    } else if app.help_open {
        let area = centered_rect(50, 50, size);
        frame.render_widget(Clear, area);
        frame.render_widget(
            Paragraph::new(help_lines(theme)).block(panel("Keys", theme)),
            area,
        );
    }
}

fn render_tabs(app: &App, theme: Theme) -> Tabs<'static> {
    let titles: Vec<Line> = Tab::ALL
        .iter()
        .enumerate()
        .map(|(index, tab)| Line::from(format!("{} {}", index + 1, tab.title())))
        .collect();
    let selected = Tab::ALL
        .iter()
        .position(|tab| *tab == app.tab)
        .unwrap_or(0);
    Tabs::new(titles)
        .select(selected)
        .style(Style::default().fg(theme.muted))
        .highlight_style(
            Style::default()
                .fg(theme.accent)
                .add_modifier(Modifier::BOLD),
        )
        .block(panel(&format!("sdash: {}", app.user), theme))
}

fn render_body(frame: &mut ratatui::Frame, app: &App, theme: Theme, area: Rect) {
    match app.tab {
        Tab::Jobs => {
            let mut title = if app.sort_jobs_by_cpus {
                "My Jobs (by CPUs)".to_string()
            } else {
                "My Jobs".to_string()
            };
            let badges = app.job_badges();
            if !badges.is_empty() {
                title = format!("{title}: {badges}");
            }
            render_rows(frame, &app.jobs, &stale_title(app, &title, Source::Jobs), app, theme, area);
        }
        Tab::History => {
            let mut title = format!(
                "History 24h: {} jobs, {} requeues (max {})",
                app.history.total_jobs, app.history.total_requeues, app.history.max_requeues
            );
            if let Some(energy) = app.history_energy() {
                title.push_str(&format!(", ~{}", format_energy(energy.total_energy_wh)));
            }
            render_rows(
                frame,
                &app.history_view(),
                &stale_title(app, &title, Source::History),
                app,
                theme,
                area,
            );
        }
        Tab::Nodes => {
            render_rows(frame, &app.nodes, &stale_title(app, "Nodes", Source::Nodes), app, theme, area)
        }
        Tab::Users => {
            let halves = split_vertical(area, 2);
            render_rows(frame, &app.users, "Running by user", app, theme, halves[0]);
            frame.render_widget(
                row_table(&app.pending_users, "Pending by user", theme),
                halves[1],
            );
        }
        Tab::Priority => {
            let thirds = split_vertical(area, 3);
            let title = stale_title(app, "Fair share by user", Source::Priority);
            render_rows(frame, &app.priority.users, &title, app, theme, thirds[0]);
            frame.render_widget(
                row_table(&app.priority.accounts, "Fair share by account", theme),
                thirds[1],
            );
            frame.render_widget(
                row_table(&app.priority.jobs, "Pending job priority", theme),
                thirds[2],
            );
        }
        Tab::WaitTime => render_rows(
            frame,
            &app.wait_times,
            &stale_title(app, "Queue wait by partition", Source::WaitTime),
            app,
            theme,
            area,
        ),
    }
}

fn stale_title(app: &App, title: &str, source: Source) -> String {
    if let Some(program) = app.unavailable.get(&source) {
        format!("{title} [unavailable: {program}]")
    } else if app.is_stale(source) {
        format!("{title} [stale]")
    } else {
        title.to_string()
    }
}

/// Renders the table the cursor lives in.
fn render_rows<R: TableRow>(
    frame: &mut ratatui::Frame,
    rows: &[R],
    title: &str,
    app: &App,
    theme: Theme,
    area: Rect,
) {
    let mut state = TableState::default();
    if !rows.is_empty() {
        state.select(Some(app.selected.min(rows.len() - 1)));
    }
    frame.render_stateful_widget(row_table(rows, title, theme), area, &mut state);
}

fn row_table<R: TableRow>(rows: &[R], title: &str, theme: Theme) -> Table<'static> {
    let cells: Vec<Vec<String>> = rows.iter().map(TableRow::cells).collect();
    let widths = column_widths(R::COLUMNS, &cells);
    let header = Row::new(R::COLUMNS.iter().map(|name| Cell::from(*name))).style(
        Style::default()
            .fg(theme.title)
            .add_modifier(Modifier::BOLD),
    );
    let body: Vec<Row> = cells.into_iter().map(Row::new).collect();
    Table::new(body, widths)
        .header(header)
        .style(Style::default().fg(theme.text))
        .highlight_style(Style::default().fg(theme.bg).bg(theme.accent))
        .highlight_symbol("> ")
        .block(panel(&format!("{title} ({})", rows.len()), theme))
}

fn column_widths(columns: &[&str], cells: &[Vec<String>]) -> Vec<Constraint> {
    columns
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let widest = cells
                .iter()
                .filter_map(|row| row.get(index))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
                .max(name.chars().count())
                .min(MAX_COLUMN_WIDTH);
            Constraint::Length(widest as u16)
        })
        .collect()
}

fn render_sidebar(app: &App, theme: Theme) -> Paragraph<'static> {
    let mut lines = match &app.cluster {
        Some(stats) => cluster_lines(stats, theme),
        None => vec![Line::from(Span::styled(
            "waiting for cluster data",
            Style::default().fg(theme.muted),
        ))],
    };
    let demand = app.pending_gpu_demand();
    if !demand.is_empty() {
        lines.push(Line::from(Span::styled(
            format!("Pending GPUs: {}", demand.label()),
            Style::default().fg(theme.warn),
        )));
    }
    lines.push(Line::from(""));
    if let Some(cycle) = &app.last_cycle {
        lines.push(Line::from(format!(
            "Cycle {} ({})",
            cycle.cycle,
            cycle.trigger.as_str()
        )));
    }
    if let Some(updated) = app.updated_at.values().max() {
        let age = (Utc::now() - *updated).num_seconds().max(0);
        lines.push(Line::from(format!("Updated {age}s ago")));
    }
    for source in &app.failing {
        lines.push(Line::from(Span::styled(
            format!("{source}: failing"),
            Style::default().fg(theme.critical),
        )));
    }
    Paragraph::new(Text::from(lines)).block(panel("Cluster", theme))
}

fn cluster_lines(stats: &ClusterStats, theme: Theme) -> Vec<Line<'static>> {
    let mut lines = vec![
        usage_line(
            "Nodes free",
            format!("{}/{}", stats.free_nodes, stats.total_nodes),
            stats.free_nodes_pct(),
            theme,
        ),
        usage_line(
            "CPUs free",
            format!(
                "{}/{}",
                stats.total_cpus.saturating_sub(stats.allocated_cpus),
                stats.total_cpus
            ),
            stats.free_cpus_pct(),
            theme,
        ),
        usage_line(
            "Mem free",
            format!(
                "{:.0}/{:.0}G",
                (stats.total_memory_gb - stats.allocated_memory_gb).max(0.0),
                stats.total_memory_gb
            ),
            stats.free_memory_pct(),
            theme,
        ),
    ];
    if stats.total_gpus > 0 {
        lines.push(usage_line(
            "GPUs free",
            format!(
                "{}/{}",
                stats.total_gpus.saturating_sub(stats.allocated_gpus),
                stats.total_gpus
            ),
            stats.free_gpus_pct(),
            theme,
        ));
        for (gpu_type, (total, allocated)) in &stats.gpus_by_type {
            lines.push(Line::from(Span::styled(
                format!("  {gpu_type}: {allocated}/{total} used"),
                Style::default().fg(theme.muted),
            )));
        }
    }
    lines.push(Line::from(format!(
        "Draining {}  Down {}",
        stats.draining_nodes, stats.down_nodes
    )));
    lines.push(Line::from(format!(
        "Running {}  Pending {}",
        stats.running_jobs, stats.pending_jobs
    )));
    lines
}

fn usage_line(label: &str, value: String, free_pct: f64, theme: Theme) -> Line<'static> {
    let color = if free_pct < 10.0 {
        theme.critical
    } else if free_pct < 30.0 {
        theme.warn
    } else {
        theme.ok
    };
    Line::from(vec![
        Span::styled(format!("{label:<11}"), Style::default().fg(theme.muted)),
        Span::styled(format!("{value} "), Style::default().fg(theme.text)),
        Span::styled(format!("{free_pct:.0}%"), Style::default().fg(color)),
    ])
}

fn render_notification(app: &App, theme: Theme) -> Paragraph<'static> {
    match app.notifications.back() {
        Some(note) => {
            let color = match note.level {
                NoteLevel::Info => theme.muted,
                NoteLevel::Warn => theme.warn,
                NoteLevel::Error => theme.critical,
            };
            Paragraph::new(Line::from(Span::styled(
                format!("{} {}", note.at.format("%H:%M:%S"), note.text),
                Style::default().fg(color),
            )))
        }
        None => Paragraph::new(""),
    }
}

fn render_footer(app: &App, theme: Theme) -> Paragraph<'static> {
    let mut keys = String::from("q quit  r refresh  Tab switch  j/k move  ? help");
    match app.tab {
        Tab::Jobs => keys.push_str("  s sort  c cancel  Enter detail"),
        Tab::History => keys.push_str("  c cancel  Enter detail"),
        Tab::Nodes => keys.push_str("  Enter node detail"),
        _ => {}
    }
    Paragraph::new(Line::from(Span::styled(
        keys,
        Style::default().fg(theme.muted),
    )))
}

fn help_lines(theme: Theme) -> Text<'static> {
    let rows = [
        ("1-6, Tab", "switch tab"),
        ("j/k, arrows", "move selection"),
        ("g / G", "first / last row"),
        ("r", "refresh now"),
        ("s", "sort my jobs by CPUs"),
        ("c then y", "cancel selected job"),
        ("Enter", "job or node detail"),
        ("Esc", "close overlay"),
        ("q", "quit"),
    ];
    Text::from(
        rows.iter()
            .map(|(key, what)| {
                Line::from(vec![
                    Span::styled(format!("{key:<12}"), Style::default().fg(theme.accent)),
                    Span::styled(what.to_string(), Style::default().fg(theme.text)),
                ])
            })
            .collect::<Vec<_>>(),
    )
}

fn panel(title: &str, theme: Theme) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn split_vertical(area: Rect, parts: u32) -> Vec<Rect> {
    Layout::default()
        .direction(Direction::Vertical)
        .constraints((0..parts).map(|_| Constraint::Ratio(1, parts)))
        .split(area)
        .to_vec()
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
