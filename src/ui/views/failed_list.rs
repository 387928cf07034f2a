use crate::coordinator::SyncCoordinator;
use crate::queue::PendingMutation;
use crate::ui::ensure_valid_selection;
use crate::ui::renderfns::truncate;
use crate::ui::view::{ShortcutInfo, View, ViewAction};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use std::sync::Arc;

/// Writes the server rejected. They stay here until dismissed.
pub struct FailedListView {
  sync: Arc<SyncCoordinator>,
  failed: Vec<PendingMutation>,
  list_state: ListState,
}

impl FailedListView {
  pub fn new(sync: Arc<SyncCoordinator>) -> Self {
    let failed = sync.sync_summary().failed;
    Self {
      sync,
      failed,
      list_state: ListState::default(),
    }
  }

  fn render_list(&mut self, frame: &mut Frame, area: Rect) {
    ensure_valid_selection(&mut self.list_state, self.failed.len());

    let block = Block::default()
      .title(format!(" Failed writes ({}) ", self.failed.len()))
      .title_alignment(Alignment::Center)
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Red));

    if self.failed.is_empty() {
      let paragraph = Paragraph::new("Nothing failed.")
        .block(block)
        .style(Style::default().fg(Color::DarkGray));
      frame.render_widget(paragraph, area);
      return;
    }

    let items: Vec<ListItem> = self
      .failed
      .iter()
      .map(|mutation| {
        let line = Line::from(vec![
          Span::styled(format!("#{:<5}", mutation.id), Style::default().fg(Color::Cyan)),
          Span::styled(
            format!("{:<12}", mutation.created_at.format("%Y-%m-%d")),
            Style::default().fg(Color::DarkGray),
          ),
          Span::raw(format!("{:<28}", truncate(&describe(mutation), 28))),
          Span::styled(
            mutation.last_error.clone().unwrap_or_default(),
            Style::default().fg(Color::Red),
          ),
        ]);
        ListItem::new(line)
      })
      .collect();

    let list = List::new(items)
      .block(block)
      .highlight_style(
        Style::default()
          .bg(Color::DarkGray)
          .add_modifier(Modifier::BOLD),
      )
      .highlight_symbol("> ");

    frame.render_stateful_widget(list, area, &mut self.list_state);
  }
}

/// Short summary of a queued transaction payload
fn describe(mutation: &PendingMutation) -> String {
  let payload = &mutation.payload;
  let name = payload["name"].as_str().unwrap_or(&mutation.name);
  match payload["amount"].as_f64() {
    Some(amount) => format!("{} {:.2}", name, amount),
    None => name.to_string(),
  }
}

impl View for FailedListView {
  fn handle_key(&mut self, key: KeyEvent) -> ViewAction {
    match key.code {
      KeyCode::Char('j') | KeyCode::Down => self.list_state.select_next(),
      KeyCode::Char('k') | KeyCode::Up => self.list_state.select_previous(),
      KeyCode::Char('d') => {
        let selected = self
          .list_state
          .selected()
          .and_then(|i| self.failed.get(i));
        if let Some(mutation) = selected {
          return ViewAction::Run(format!("dismiss {}", mutation.id));
        }
      }
      KeyCode::Char('q') | KeyCode::Esc => return ViewAction::Pop,
      _ => {}
    }
    ViewAction::None
  }

  fn render(&mut self, frame: &mut Frame, area: Rect) {
    self.render_list(frame, area);
  }

  fn breadcrumb_label(&self) -> String {
    "Failed".to_string()
  }

  fn tick(&mut self) {
    self.failed = self.sync.sync_summary().failed;
  }

  fn shortcuts(&self) -> Vec<ShortcutInfo> {
    vec![
      ShortcutInfo::new("d", "dismiss").with_priority(10),
      ShortcutInfo::new("q", "back").with_priority(30),
    ]
  }
}
