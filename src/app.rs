//! Terminal application shell: key handling and screen layout around the
//! view controller. All engine work happens on the worker pool; this module
//! only reacts to events and draws the last served window.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Paragraph, Widget};
use tracing::debug;

use crate::plan::SortDirection;
use crate::render::{frame_table, RenderOptions};
use crate::view::{SortOutcome, ViewController, ViewEvent, ViewFrame, ViewMode};

/// Events flowing through the main loop.
pub enum AppEvent {
    Key(KeyEvent),
    Resize(u16, u16),
    Exit,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum InputMode {
    #[default]
    Normal,
    Filter,
    ConfirmSort,
}

pub struct App {
    title: PathBuf,
    controller: ViewController,
    engine_events: Receiver<ViewEvent>,
    frame: Option<ViewFrame>,
    render_opts: RenderOptions,
    input_mode: InputMode,
    input_buffer: String,
    pending_sort_key: Option<String>,
}

impl App {
    pub fn new(
        title: PathBuf,
        controller: ViewController,
        engine_events: Receiver<ViewEvent>,
        render_opts: RenderOptions,
    ) -> Self {
        Self {
            title,
            controller,
            engine_events,
            frame: None,
            render_opts,
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            pending_sort_key: None,
        }
    }

    pub fn controller(&self) -> &ViewController {
        &self.controller
    }

    /// Kick off the first window request.
    pub fn start(&mut self) {
        self.controller.request_visible();
    }

    /// Drain engine results. Returns true when the screen needs a redraw.
    pub fn poll_engine(&mut self) -> bool {
        let mut updated = false;
        loop {
            match self.engine_events.try_recv() {
                Ok(ViewEvent::Frame(frame)) => {
                    self.controller.on_frame_delivered(&frame);
                    self.frame = Some(frame);
                    updated = true;
                }
                Ok(ViewEvent::Failed(message)) => {
                    debug!(message, "window request failed");
                    self.controller.on_request_failed(message);
                    updated = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        updated
    }

    /// Handle one event; a returned event is fed back into the main loop.
    pub fn event(&mut self, event: &AppEvent) -> Option<AppEvent> {
        match event {
            AppEvent::Key(key) => self.handle_key(*key),
            AppEvent::Resize(_, rows) => {
                self.controller
                    .set_page_rows((*rows as usize).saturating_sub(HEADER_ROWS));
                self.controller.request_visible();
                None
            }
            AppEvent::Exit => Some(AppEvent::Exit),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Option<AppEvent> {
        match self.input_mode {
            InputMode::Filter => self.handle_filter_key(key),
            InputMode::ConfirmSort => self.handle_confirm_key(key),
            InputMode::Normal => self.handle_normal_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Option<AppEvent> {
        match key.code {
            KeyCode::Char('q') => return Some(AppEvent::Exit),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Some(AppEvent::Exit)
            }
            KeyCode::Down | KeyCode::Char('j') => self.controller.scroll_by(1),
            KeyCode::Up | KeyCode::Char('k') => self.controller.scroll_by(-1),
            KeyCode::PageDown | KeyCode::Char(' ') => self.controller.page_down(),
            KeyCode::PageUp => self.controller.page_up(),
            KeyCode::Home | KeyCode::Char('g') => self.controller.jump_to(0),
            KeyCode::End | KeyCode::Char('G') => {
                if let Some(total) = self.controller.total_rows() {
                    let page = self.controller.visible().len();
                    self.controller.jump_to(total.saturating_sub(page));
                }
            }
            KeyCode::Left | KeyCode::Char('h') => {
                let (_, col) = self.controller.focused();
                self.controller.focus_col(col.saturating_sub(1));
            }
            KeyCode::Right | KeyCode::Char('l') => {
                let (_, col) = self.controller.focused();
                let max = self.controller.display_schema().len().saturating_sub(1);
                self.controller.focus_col((col + 1).min(max));
            }
            KeyCode::Char('/') => {
                self.input_mode = InputMode::Filter;
                self.input_buffer = self
                    .controller
                    .plan()
                    .filter
                    .as_ref()
                    .map(|f| f.text.clone())
                    .unwrap_or_default();
            }
            KeyCode::Char('c') => self.controller.clear_filter(),
            KeyCode::Char('s') => self.request_sort(SortDirection::Ascending),
            KeyCode::Char('S') => self.request_sort(SortDirection::Descending),
            KeyCode::Char('u') => self.controller.clear_sort(),
            KeyCode::Char('r') => self.render_opts.row_numbers = !self.render_opts.row_numbers,
            _ => {}
        }
        None
    }

    fn handle_filter_key(&mut self, key: KeyEvent) -> Option<AppEvent> {
        match key.code {
            KeyCode::Enter => {
                self.input_mode = InputMode::Normal;
                let predicate = std::mem::take(&mut self.input_buffer);
                if predicate.trim().is_empty() {
                    self.controller.clear_filter();
                } else {
                    // On a validation error the controller keeps the current
                    // plan and exposes the message; nothing else to do here.
                    let _ = self.controller.set_filter(&predicate);
                }
            }
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.input_buffer.clear();
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            _ => {}
        }
        None
    }

    fn handle_confirm_key(&mut self, key: KeyEvent) -> Option<AppEvent> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                self.input_mode = InputMode::Normal;
                self.pending_sort_key = None;
                self.controller.confirm_sort();
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.pending_sort_key = None;
                self.controller.cancel_sort();
            }
            _ => {}
        }
        None
    }

    /// Sort by the focused column. A repeated sort on the same key flips the
    /// direction instead of re-sorting the same way.
    fn request_sort(&mut self, direction: SortDirection) {
        let schema = self.controller.display_schema();
        let (_, col) = self.controller.focused();
        let Some((name, _)) = schema.get_at_index(col) else {
            return;
        };
        let key = name.to_string();

        let direction = match &self.controller.plan().sort {
            Some(sort) if sort.key == key && sort.direction == direction => {
                match direction {
                    SortDirection::Ascending => SortDirection::Descending,
                    SortDirection::Descending => SortDirection::Ascending,
                }
            }
            _ => direction,
        };

        match self.controller.set_sort(&key, direction) {
            Ok(SortOutcome::NeedsConfirmation) => {
                self.input_mode = InputMode::ConfirmSort;
                self.pending_sort_key = Some(key);
            }
            Ok(SortOutcome::Applied) | Err(_) => {}
        }
    }

    fn status_line(&self) -> String {
        match self.input_mode {
            InputMode::Filter => format!("filter> {}", self.input_buffer),
            InputMode::ConfirmSort => format!(
                "sort by '{}' requires a full scan of the dataset; proceed? [y/n]",
                self.pending_sort_key.as_deref().unwrap_or("?")
            ),
            InputMode::Normal => {
                if let Some(error) = self.controller.last_error() {
                    return format!("error: {error}");
                }
                let position = self
                    .frame
                    .as_ref()
                    .map(|f| f.range.start)
                    .unwrap_or_default();
                let total = match self.controller.total_rows() {
                    Some(t) => t.to_string(),
                    None => "?".to_string(),
                };
                let mut parts = vec![format!("row {position} of {total}")];
                if let Some(filter) = &self.controller.plan().filter {
                    parts.push(format!("filter: {}", filter.text));
                }
                if let Some(sort) = &self.controller.plan().sort {
                    let arrow = match sort.direction {
                        SortDirection::Ascending => "asc",
                        SortDirection::Descending => "desc",
                    };
                    parts.push(format!("sort: {} {}", sort.key, arrow));
                }
                if self.controller.mode() == ViewMode::Navigating {
                    parts.push("loading...".to_string());
                }
                parts.join("  |  ")
            }
        }
    }
}

/// Rows consumed by chrome around the data table (title, header, status).
const HEADER_ROWS: usize = 4;

impl Widget for &mut App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(area);

        let title = Paragraph::new(self.title.display().to_string())
            .style(Style::default().add_modifier(Modifier::BOLD));
        title.render(chunks[0], buf);

        let table_area = chunks[1];
        self.controller
            .set_page_rows((table_area.height as usize).saturating_sub(2));

        if let Some(frame) = &self.frame {
            match frame_table(frame, &self.render_opts) {
                Ok(table) => {
                    let block = Block::default().borders(Borders::TOP);
                    Widget::render(table.block(block), table_area, buf);
                }
                Err(e) => {
                    Paragraph::new(format!("render error: {e}")).render(table_area, buf);
                }
            }
        } else {
            Paragraph::new("loading...").render(table_area, buf);
        }

        let status_style = if self.controller.mode() == ViewMode::Error {
            Style::default().fg(Color::Red)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        Paragraph::new(self.status_line())
            .style(status_style)
            .render(chunks[2], buf);
    }
}
