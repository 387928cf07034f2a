use super::input::{InputResult, TextInput};
use crate::commands::{self, Command, NameHint};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph};

/// Outcome of a key press routed through the command input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
  /// Command mode is inactive and the key was not for us
  NotHandled,
  /// Key consumed while editing
  Handled,
  /// Command line submitted, command word resolved to its canonical name
  Submitted(String),
  Cancelled,
}

/// Command input component with autocomplete
#[derive(Debug, Clone, Default)]
pub struct CommandInput {
  input: TextInput,
  active: bool,
  selected_suggestion: usize,
  /// Names offered once an `add` line reaches its name
  name_hints: Vec<NameHint>,
  /// Picked name suggestion, if any. Enter submits the typed name otherwise.
  selected_name: Option<usize>,
}

impl CommandInput {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_active(&self) -> bool {
    self.active
  }

  pub fn activate(&mut self) {
    self.active = true;
    self.input.clear();
    self.selected_suggestion = 0;
    self.selected_name = None;
  }

  fn deactivate(&mut self) {
    self.active = false;
    self.input.clear();
    self.selected_suggestion = 0;
    self.selected_name = None;
  }

  pub fn set_name_hints(&mut self, hints: Vec<NameHint>) {
    self.name_hints = hints;
  }

  /// Suggestions for the command word typed so far
  pub fn suggestions(&self) -> Vec<&'static Command> {
    commands::get_suggestions(self.input.value())
  }

  /// Previously used names matching the `add` line, `None` before the name
  pub fn name_suggestions(&self) -> Option<Vec<String>> {
    let query = commands::name_query(self.input.value())?;
    Some(commands::suggest_names(
      &self.name_hints,
      &query.category,
      &query.partial,
    ))
  }

  /// Handle a key event. Handles activation with `:` too.
  pub fn handle_key(&mut self, key: KeyEvent) -> CommandResult {
    if !self.active {
      if key.code == KeyCode::Char(':') {
        self.activate();
        return CommandResult::Handled;
      }
      return CommandResult::NotHandled;
    }

    match key.code {
      KeyCode::Esc => {
        self.deactivate();
        return CommandResult::Cancelled;
      }
      KeyCode::Backspace if self.input.is_empty() => {
        self.deactivate();
        return CommandResult::Cancelled;
      }
      KeyCode::Enter => {
        let line = self.resolve_command();
        self.deactivate();
        return CommandResult::Submitted(line);
      }
      KeyCode::Tab | KeyCode::Down | KeyCode::BackTab | KeyCode::Up
        if self.name_suggestions().is_some() =>
      {
        let count = self.name_suggestions().map_or(0, |names| names.len());
        let forward = matches!(key.code, KeyCode::Tab | KeyCode::Down);
        self.selected_name = cycle(self.selected_name, count, forward);
        return CommandResult::Handled;
      }
      KeyCode::Tab | KeyCode::Down => {
        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
          self.selected_suggestion = (self.selected_suggestion + 1) % suggestions.len();
        }
        return CommandResult::Handled;
      }
      KeyCode::BackTab | KeyCode::Up => {
        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
          self.selected_suggestion = if self.selected_suggestion == 0 {
            suggestions.len() - 1
          } else {
            self.selected_suggestion - 1
          };
        }
        return CommandResult::Handled;
      }
      _ => {}
    }

    if self.input.handle_key(key) == InputResult::Consumed {
      self.selected_suggestion = 0;
      self.selected_name = None;
    }
    CommandResult::Handled
  }

  /// The typed line with a picked name suggestion in place of the typed name
  fn completed_line(&self) -> String {
    let value = self.input.value();
    let picked = self.selected_name.and_then(|i| {
      let query = commands::name_query(value)?;
      let names = self.name_suggestions()?;
      Some(format!("{}{}", &value[..query.start], names.get(i)?))
    });
    picked.unwrap_or_else(|| value.to_string())
  }

  /// Replace the command word with the selected suggestion, keep arguments
  fn resolve_command(&self) -> String {
    let completed = self.completed_line();
    let line = completed.trim();
    let (word, args) = line
      .split_once(char::is_whitespace)
      .map(|(word, args)| (word, args.trim()))
      .unwrap_or((line, ""));

    let name = self
      .suggestions()
      .get(self.selected_suggestion)
      .map(|cmd| cmd.name.to_string())
      .unwrap_or_else(|| word.to_lowercase());

    if args.is_empty() {
      name
    } else {
      format!("{} {}", name, args)
    }
  }

  /// Render the command overlay if active
  pub fn render_overlay(&self, frame: &mut Frame, area: Rect) {
    if !self.active {
      return;
    }

    let items = self.overlay_items();

    let width = (area.width * 60 / 100).clamp(30, 64).min(area.width);
    let suggestion_count = items.len().min(8);
    let height = if items.is_empty() {
      3
    } else {
      3 + suggestion_count as u16
    };
    let overlay_area = Rect::new(area.x + 1, area.y + 1, width, height.min(area.height));

    frame.render_widget(Clear, overlay_area);

    let block = Block::default()
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Yellow))
      .title(" Command ");

    let inner = block.inner(overlay_area);
    frame.render_widget(block, overlay_area);

    if inner.height == 0 {
      return;
    }

    let chunks = Layout::default()
      .direction(Direction::Vertical)
      .constraints([Constraint::Length(1), Constraint::Min(0)])
      .split(inner);

    let value = self.input.value();
    let split = value
      .char_indices()
      .nth(self.input.cursor_position())
      .map_or(value.len(), |(i, _)| i);
    let input_line = Line::from(vec![
      Span::styled(":", Style::default().fg(Color::Yellow)),
      Span::raw(&value[..split]),
      Span::styled("_", Style::default().fg(Color::Yellow)),
      Span::raw(&value[split..]),
    ]);
    frame.render_widget(Paragraph::new(input_line), chunks[0]);

    if !items.is_empty() && chunks[1].height > 0 {
      let selected = match self.name_suggestions() {
        Some(_) => self.selected_name,
        None => Some(self.selected_suggestion),
      };
      let list = List::new(items.into_iter().take(8).collect::<Vec<_>>())
        .highlight_style(Style::default().bg(Color::DarkGray).fg(Color::White));

      let mut state = ListState::default();
      state.select(selected);

      frame.render_stateful_widget(list, chunks[1], &mut state);
    }
  }

  /// Rows under the input line: recent names on an `add` name, else commands
  fn overlay_items(&self) -> Vec<ListItem<'static>> {
    if let Some(names) = self.name_suggestions() {
      return names
        .into_iter()
        .map(|name| {
          ListItem::new(Line::from(vec![
            Span::styled(format!("{:<32}", name), Style::default().fg(Color::Cyan)),
            Span::styled("used before", Style::default().fg(Color::DarkGray)),
          ]))
        })
        .collect();
    }

    self
      .suggestions()
      .into_iter()
      .map(|cmd| {
        ListItem::new(Line::from(vec![
          Span::styled(
            format!("{:<32}", cmd.usage),
            Style::default().fg(Color::Cyan),
          ),
          Span::styled(cmd.description, Style::default().fg(Color::DarkGray)),
        ]))
      })
      .collect()
  }
}

/// Step a selection through `count` items. `None` sits before the first one.
fn cycle(selected: Option<usize>, count: usize, forward: bool) -> Option<usize> {
  if count == 0 {
    return None;
  }
  match (selected, forward) {
    (None, true) => Some(0),
    (None, false) => Some(count - 1),
    (Some(i), true) if i + 1 < count => Some(i + 1),
    (Some(_), true) => None,
    (Some(0), false) => None,
    (Some(i), false) => Some(i - 1),
  }
}
