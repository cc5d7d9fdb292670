//! Rendering. A pure function of [`App`] state onto a ratatui frame.

use crate::app::App;
use homun_core::Phase;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Frame;
use std::time::Duration;

const BANNER: &str = r" __    __
/  |  /  |
$$ |  $$ |  ______   _____  ____   __    __  _______
$$ |__$$ | /      \ /     \/    \ /  |  /  |/       \
$$    $$ |/$$$$$$  |$$$$$$ $$$$  |$$ |  $$ |$$$$$$$  |
$$$$$$$$ |$$ |  $$ |$$ | $$ | $$ |$$ |  $$ |$$ |  $$ |
$$ |  $$ |$$ \__$$ |$$ | $$ | $$ |$$ \__$$ |$$ |  $$ |
$$ |  $$ |$$    $$/ $$ | $$ | $$ |$$    $$/ $$ |  $$ |
$$/   $$/  $$$$$$/  $$/  $$/  $$/  $$$$$$/  $$/   $$/";

pub const TAGLINE: &str =
    "bhcs/homunculus -- Autonomous Claude Code boxed up and tightly strapped";

/// Fewest log lines shown while running, however small the terminal.
pub const MIN_LOG_LINES: usize = 5;

/// Rows used by the running view outside the log pane: title and status bar.
const RUNNING_TITLE_HEIGHT: u16 = 1;
const STATUS_HEIGHT: u16 = 1;
const BORDER_ROWS: u16 = 2;

const CURSOR: &str = "█";

mod styles {
    use super::{Color, Modifier, Style};

    pub const TITLE: Style = Style::new()
        .fg(Color::Indexed(205))
        .add_modifier(Modifier::BOLD);
    pub const TAGLINE: Style = Style::new()
        .fg(Color::Indexed(241))
        .add_modifier(Modifier::ITALIC);
    pub const ERROR: Style = Style::new()
        .fg(Color::Indexed(196))
        .add_modifier(Modifier::BOLD);
    pub const SUCCESS: Style = Style::new()
        .fg(Color::Indexed(42))
        .add_modifier(Modifier::BOLD);
    pub const PROMPT: Style = Style::new().fg(Color::Indexed(86));
    pub const INFO: Style = Style::new().fg(Color::Indexed(39));
    pub const WARNING: Style = Style::new()
        .fg(Color::Indexed(214))
        .add_modifier(Modifier::BOLD);
    pub const HINT: Style = Style::new().fg(Color::Indexed(240));
    pub const CURSOR_CELL: Style = Style::new().add_modifier(Modifier::REVERSED);
    pub const PLAIN: Style = Style::new();
}

/// Draw the current state.
pub fn render(app: &App, frame: &mut Frame) {
    let area = frame.area();
    if app.phase() == Phase::Running {
        render_running(app, frame, area);
    } else {
        render_screen(app, frame, area);
    }
}

/// Number of log lines the running view shows for a terminal `height` rows tall.
pub fn log_capacity(height: u16) -> usize {
    let reserved = RUNNING_TITLE_HEIGHT + STATUS_HEIGHT + BORDER_ROWS;
    usize::from(height.saturating_sub(reserved)).max(MIN_LOG_LINES)
}

/// `HH:MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn render_running(app: &App, frame: &mut Frame, area: Rect) {
    let [title_area, log_area, status_area] = Layout::vertical([
        Constraint::Length(RUNNING_TITLE_HEIGHT),
        Constraint::Min(0),
        Constraint::Length(STATUS_HEIGHT),
    ])
    .areas(area);

    let params = app.params();
    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled("Running Homunculus", styles::SUCCESS),
            Span::styled(format!("  {} @ {}", params.repo, params.branch), styles::HINT),
        ])),
        title_area,
    );

    let capacity = log_capacity(area.height);
    let lines: Vec<Line> = app
        .logs()
        .tail(capacity)
        .map(|line| Line::raw(line.as_str().to_string()))
        .collect();
    // Keep the newest line visible when the pane is shorter than the minimum.
    let visible = usize::from(log_area.height.saturating_sub(BORDER_ROWS));
    let overflow = u16::try_from(lines.len().saturating_sub(visible)).unwrap_or(u16::MAX);
    let title = format!(" Output ({} lines) ", app.logs().len());
    frame.render_widget(
        Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(title))
            .scroll((overflow, 0)),
        log_area,
    );

    frame.render_widget(
        Paragraph::new(Line::from(vec![
            Span::styled(format!("Elapsed: {}", format_elapsed(app.elapsed())), styles::INFO),
            Span::styled("  |  Press Ctrl+C to cancel", styles::HINT),
        ])),
        status_area,
    );
}

fn render_screen(app: &App, frame: &mut Frame, area: Rect) {
    let mut lines: Vec<Line> = BANNER
        .lines()
        .map(|l| Line::styled(l, styles::TITLE))
        .collect();
    lines.push(Line::styled(TAGLINE, styles::TAGLINE));
    lines.push(Line::default());
    lines.extend(body(app));

    if app.phase() == Phase::EditInstructions {
        let header = u16::try_from(lines.len()).unwrap_or(u16::MAX);
        let [text_area, editor_area, hint_area] = Layout::vertical([
            Constraint::Length(header),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .areas(area);
        frame.render_widget(Paragraph::new(lines), text_area);
        render_editor(app, frame, editor_area);
        frame.render_widget(
            Paragraph::new(Line::styled(
                "Ctrl+S to save and continue | Ctrl+C to quit",
                styles::HINT,
            )),
            hint_area,
        );
        return;
    }

    frame.render_widget(Paragraph::new(lines), area);
}

fn render_editor(app: &App, frame: &mut Frame, area: Rect) {
    let editor = app.editor();
    let (cursor_line, cursor_column) = editor.cursor_position();
    let lines: Vec<Line> = editor
        .text()
        .split('\n')
        .enumerate()
        .map(|(i, l)| {
            if i == cursor_line {
                with_cursor(l, cursor_column)
            } else {
                Line::raw(l.to_string())
            }
        })
        .collect();
    // Scroll just far enough to keep the cursor line in view.
    let visible = usize::from(area.height.saturating_sub(BORDER_ROWS));
    let overflow = u16::try_from((cursor_line + 1).saturating_sub(visible)).unwrap_or(u16::MAX);
    frame.render_widget(
        Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title(" instructions.md "))
            .scroll((overflow, 0)),
        area,
    );
}

/// `text` with the char at `column` highlighted, or a block past its end.
fn with_cursor(text: &str, column: usize) -> Line<'static> {
    let split = text.char_indices().nth(column).map_or(text.len(), |(i, _)| i);
    let (before, rest) = text.split_at(split);
    let mut after = rest.chars();
    let mut spans = vec![Span::raw(before.to_string())];
    match after.next() {
        Some(c) => {
            spans.push(Span::styled(c.to_string(), styles::CURSOR_CELL));
            spans.push(Span::raw(after.as_str().to_string()));
        }
        None => spans.push(Span::styled(CURSOR, styles::HINT)),
    }
    Line::from(spans)
}

fn prompt_line(label: &str, input: &str) -> Line<'static> {
    Line::from(vec![
        Span::styled(label.to_string(), styles::PROMPT),
        Span::styled(input.to_string(), styles::PLAIN),
        Span::styled(CURSOR, styles::HINT),
    ])
}

fn body(app: &App) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    match app.phase() {
        Phase::Validating => {
            lines.push(Line::styled("Validating environment...", styles::INFO));
        }
        Phase::InputRepoUrl => {
            lines.push(Line::styled("HOMUNCULUS_REPO_URL not set.", styles::PROMPT));
            if !app.default_repo_url().is_empty() {
                lines.push(Line::styled(
                    format!("Default: {}", app.default_repo_url()),
                    styles::INFO,
                ));
            }
            push_validation_error(app, &mut lines);
            lines.push(prompt_line(
                "Enter repository URL (or press Enter for default): ",
                app.input(),
            ));
        }
        Phase::InputRepo => {
            lines.push(Line::styled("HOMUNCULUS_REPO not set.", styles::PROMPT));
            let default = app.default_repo();
            if !default.is_empty() {
                lines.push(Line::styled(format!("Default: {default}"), styles::INFO));
            }
            push_validation_error(app, &mut lines);
            lines.push(prompt_line(
                "Enter repository name (or press Enter for default): ",
                app.input(),
            ));
        }
        Phase::InputBranch => {
            push_validation_error(app, &mut lines);
            lines.push(prompt_line(
                "Enter branch name (alphanumeric, hyphen, underscore only): ",
                app.input(),
            ));
        }
        Phase::Provisioning => {
            lines.push(Line::styled("Preparing branch directories...", styles::INFO));
        }
        Phase::EditInstructions => {
            lines.push(Line::styled("Edit Instructions", styles::SUCCESS));
            if let Some(path) = app.instructions_path() {
                lines.push(Line::styled(
                    format!("Editing: {}", path.display()),
                    styles::INFO,
                ));
            }
        }
        Phase::SavingInstructions => {
            lines.push(Line::styled("Saving instructions...", styles::INFO));
        }
        Phase::Confirm => {
            let params = app.params();
            lines.push(Line::styled("Environment validated!", styles::SUCCESS));
            lines.push(Line::default());
            lines.push(Line::styled("Configuration:", styles::INFO));
            lines.push(Line::raw(format!("  Repository URL: {}", params.repo_url)));
            lines.push(Line::raw(format!("  Repository: {}", params.repo)));
            lines.push(Line::raw(format!("  Branch: {}", params.branch)));
            if let Some(dirs) = app.dirs() {
                lines.push(Line::raw(format!(
                    "  Branch Directory: {}",
                    dirs.root.display()
                )));
            }
            lines.push(Line::default());
            lines.push(Line::styled(
                "Ready to summon Homunculus. Continue? (y/n): ",
                styles::WARNING,
            ));
        }
        Phase::Launching => {
            lines.push(Line::styled("Starting container...", styles::INFO));
        }
        // Drawn by `render_running`.
        Phase::Running => {}
        Phase::Done => {
            match app.error() {
                Some(err) => {
                    lines.push(Line::styled("Homunculus exited with error:", styles::ERROR));
                    lines.push(Line::styled(err.to_string(), styles::ERROR));
                }
                None => {
                    lines.push(Line::styled(
                        "Homunculus completed successfully!",
                        styles::SUCCESS,
                    ));
                }
            }
            lines.push(Line::styled(
                format!("Elapsed time: {}", format_elapsed(app.elapsed())),
                styles::INFO,
            ));
            lines.push(Line::default());
            lines.push(Line::styled("Press any key to exit", styles::HINT));
        }
        Phase::Error => {
            lines.push(Line::styled("Error:", styles::ERROR));
            lines.push(Line::styled(
                app.error().unwrap_or("unknown error").to_string(),
                styles::ERROR,
            ));
            lines.push(Line::default());
            lines.push(Line::styled("Press any key to exit", styles::HINT));
        }
    }
    lines
}

fn push_validation_error(app: &App, lines: &mut Vec<Line<'static>>) {
    if let Some(err) = app.validation_error() {
        lines.push(Line::styled(format!("Error: {err}"), styles::ERROR));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Msg, Startup, Workspace};
    use crate::docker::LaunchMode;
    use crate::mux::{self, ExitOutcome, OutputEvent, ProcessControl};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use homun_core::{BranchDirs, Config, OutputLine};
    use ratatui::backend::TestBackend;
    use ratatui::buffer::Cell;
    use ratatui::Terminal;
    use std::path::{Path, PathBuf};
    use tokio_util::sync::CancellationToken;

    fn app() -> App {
        App::new(Startup {
            repo_root: PathBuf::from("/src/widget"),
            folder_name: "widget".to_string(),
            default_repo_url: "git@github.com:owner/widget.git".to_string(),
            config: Config::defaults_for("ghost"),
            issue: None,
            repo_url_override: None,
            repo_override: None,
            launch_mode: LaunchMode::Captured,
        })
    }

    fn press(app: &mut App, code: KeyCode) {
        app.update(Msg::Key(KeyEvent::new(code, KeyModifiers::NONE)));
    }

    fn draw(app: &App, width: u16, height: u16) -> String {
        let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
        terminal.draw(|frame| render(app, frame)).unwrap();
        let buffer = terminal.backend().buffer();
        buffer
            .content
            .chunks(usize::from(buffer.area.width))
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn running_app() -> App {
        let mut app = app();
        app.update(Msg::Validated(Ok(())));
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Char('b'));
        press(&mut app, KeyCode::Enter);
        app.update(Msg::Provisioned(Ok(Workspace {
            dirs: BranchDirs::for_branch(Path::new("/src/widget"), "b"),
            instructions: String::new(),
        })));
        app.update(Msg::Key(KeyEvent::new(
            KeyCode::Char('s'),
            KeyModifiers::CONTROL,
        )));
        app.update(Msg::InstructionsSaved(Ok(())));
        press(&mut app, KeyCode::Char('y'));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (output, supervisor) = mux::spawn(tokio::io::empty(), tokio::io::empty(), async move {
            token.cancelled().await;
            ExitOutcome::Cancelled
        });
        app.update(Msg::Launched(Ok(crate::docker::Launched {
            output,
            control: ProcessControl::new(cancel, supervisor),
        })));
        assert_eq!(app.phase(), Phase::Running);
        app
    }

    /// Feed `count` lines through the app; each needs a live stream to carry.
    fn push_lines(app: &mut App, count: usize) {
        for i in 1..=count {
            let (stream, _supervisor) =
                mux::spawn(tokio::io::empty(), tokio::io::empty(), async {
                    ExitOutcome::Success
                });
            app.update(Msg::Output(OutputEvent::Line(
                OutputLine(format!("line {i}")),
                stream,
            )));
        }
    }

    #[test]
    fn capacity_has_a_floor() {
        assert_eq!(log_capacity(40), 36);
        assert_eq!(log_capacity(9), 5);
        assert_eq!(log_capacity(3), MIN_LOG_LINES);
        assert_eq!(log_capacity(0), MIN_LOG_LINES);
    }

    #[test]
    fn elapsed_is_clock_formatted() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "00:01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3600 * 25 + 1)), "25:00:01");
    }

    #[test]
    fn validating_screen_shows_banner() {
        let screen = draw(&app(), 100, 20);
        assert!(screen.contains(TAGLINE));
        assert!(screen.contains("Validating environment..."));
    }

    #[test]
    fn url_prompt_shows_default() {
        let mut app = app();
        app.update(Msg::Validated(Ok(())));
        press(&mut app, KeyCode::Char('x'));
        let screen = draw(&app, 100, 20);
        assert!(screen.contains("Default: git@github.com:owner/widget.git"));
        assert!(screen.contains("Enter repository URL (or press Enter for default): x"));
    }

    #[test]
    fn branch_error_is_displayed() {
        let mut app = app();
        app.update(Msg::Validated(Ok(())));
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Char('/'));
        press(&mut app, KeyCode::Enter);
        let screen = draw(&app, 120, 20);
        assert!(screen.contains("Error: Branch name must contain only"));
    }

    #[test]
    fn error_screen_shows_message() {
        let mut app = app();
        app.update(Msg::Validated(Err(crate::preflight::PreflightError::MissingEnv(
            "ANTHROPIC_API_KEY",
        )
        .into())));
        let screen = draw(&app, 100, 20);
        assert!(screen.contains("Error:"));
        assert!(screen.contains("ANTHROPIC_API_KEY is not set"));
    }

    fn editing_app(instructions: &str) -> App {
        let mut app = app();
        app.update(Msg::Validated(Ok(())));
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Enter);
        press(&mut app, KeyCode::Char('b'));
        press(&mut app, KeyCode::Enter);
        app.update(Msg::Provisioned(Ok(Workspace {
            dirs: BranchDirs::for_branch(Path::new("/src/widget"), "b"),
            instructions: instructions.to_string(),
        })));
        assert_eq!(app.phase(), Phase::EditInstructions);
        app
    }

    #[test]
    fn editor_highlights_the_char_under_the_cursor() {
        let mut app = editing_app("alpha\nbeta");
        press(&mut app, KeyCode::Up);

        let mut terminal = Terminal::new(TestBackend::new(70, 30)).unwrap();
        terminal.draw(|frame| render(&app, frame)).unwrap();
        let buffer = terminal.backend().buffer();
        let rows: Vec<&[Cell]> = buffer.content.chunks(usize::from(buffer.area.width)).collect();
        let text = |row: &[Cell]| row.iter().map(Cell::symbol).collect::<String>();

        let alpha = *rows.iter().find(|&&row| text(row).contains("alpha")).unwrap();
        let highlighted: Vec<&str> = alpha
            .iter()
            .filter(|cell| cell.modifier.contains(Modifier::REVERSED))
            .map(Cell::symbol)
            .collect();
        assert_eq!(highlighted, ["a"]);
        assert!(text(alpha).contains("│alpha"));
        assert!(!rows.iter().any(|&row| text(row).contains(CURSOR)));
    }

    #[test]
    fn editor_cursor_at_line_end_is_a_block() {
        let app = editing_app("alpha\nbeta");
        let screen = draw(&app, 70, 30);
        assert!(screen.contains(&format!("beta{CURSOR}")));
    }

    #[tokio::test]
    async fn running_view_shows_tail_and_status() {
        let mut app = running_app().await;
        push_lines(&mut app, 50);
        app.update(Msg::Tick);

        // 20 rows: 1 title, 1 status, 2 borders leave 16 log rows.
        let screen = draw(&app, 80, 20);
        assert!(screen.contains("line 50"));
        assert!(screen.contains("line 35"));
        assert!(!screen.contains("line 34 "));
        assert!(screen.contains("Elapsed: 00:00:01"));
        assert!(screen.contains("Press Ctrl+C to cancel"));
    }

    #[tokio::test]
    async fn tiny_terminal_still_shows_newest_line() {
        let mut app = running_app().await;
        push_lines(&mut app, 20);
        let screen = draw(&app, 60, 6);
        assert!(screen.contains("line 20"));
    }

    #[tokio::test]
    async fn done_screen_reports_failure() {
        let mut app = running_app().await;
        app.update(Msg::Output(OutputEvent::Closed(ExitOutcome::Failed {
            code: Some(2),
        })));
        let screen = draw(&app, 100, 24);
        assert!(screen.contains("Homunculus exited with error:"));
        assert!(screen.contains("exit status 2"));
    }
}
