use crate::api;
use crate::api::types::AccountDetail;
use crate::coordinator::SyncCoordinator;
use crate::ui::ensure_valid_selection;
use crate::ui::renderfns::truncate;
use crate::ui::view::{ShortcutInfo, View, ViewAction};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use std::sync::Arc;

/// Accounts available for capture. Enter makes one the capture account.
pub struct AccountListView {
  sync: Arc<SyncCoordinator>,
  enabled: Vec<String>,
  current: Option<String>,
  accounts: Vec<AccountDetail>,
  list_state: ListState,
}

impl AccountListView {
  pub fn new(sync: Arc<SyncCoordinator>, enabled: Vec<String>, current: Option<String>) -> Self {
    let accounts = visible_accounts(
      sync.read_as(&api::accounts_key()).unwrap_or_default(),
      &enabled,
    );
    let mut list_state = ListState::default();
    list_state.select(
      current
        .as_ref()
        .and_then(|id| accounts.iter().position(|a| &a.id == id)),
    );

    Self {
      sync,
      enabled,
      current,
      accounts,
      list_state,
    }
  }

  fn render_list(&mut self, frame: &mut Frame, area: Rect) {
    ensure_valid_selection(&mut self.list_state, self.accounts.len());

    let block = Block::default()
      .title(format!(" Accounts ({}) ", self.accounts.len()))
      .title_alignment(Alignment::Center)
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Blue));

    if self.accounts.is_empty() {
      let paragraph = Paragraph::new("No accounts cached yet.")
        .block(block)
        .style(Style::default().fg(Color::DarkGray));
      frame.render_widget(paragraph, area);
      return;
    }

    let items: Vec<ListItem> = self
      .accounts
      .iter()
      .map(|account| {
        let is_current = self.current.as_deref() == Some(account.id.as_str());
        let marker = if is_current { "● " } else { "  " };
        let line = Line::from(vec![
          Span::styled(marker, Style::default().fg(Color::Green)),
          Span::styled(
            format!("{:<32}", truncate(&account.name, 32)),
            Style::default().fg(Color::White),
          ),
          Span::styled(
            format!("{:>14} {:<3}", account.balance, account.currency),
            Style::default().fg(Color::Cyan),
          ),
          Span::raw("  "),
          Span::styled(&account.account_type, Style::default().fg(Color::DarkGray)),
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

/// Restrict to the enabled accounts, or all of them when none are enabled
pub fn visible_accounts(accounts: Vec<AccountDetail>, enabled: &[String]) -> Vec<AccountDetail> {
  if enabled.is_empty() {
    return accounts;
  }
  accounts
    .into_iter()
    .filter(|a| enabled.contains(&a.id))
    .collect()
}

impl View for AccountListView {
  fn handle_key(&mut self, key: KeyEvent) -> ViewAction {
    match key.code {
      KeyCode::Char('j') | KeyCode::Down => self.list_state.select_next(),
      KeyCode::Char('k') | KeyCode::Up => self.list_state.select_previous(),
      KeyCode::Enter => {
        let selected = self
          .list_state
          .selected()
          .and_then(|i| self.accounts.get(i));
        if let Some(account) = selected {
          return ViewAction::Run(format!("account {}", account.id));
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
    "Accounts".to_string()
  }

  fn tick(&mut self) {
    if let Some(accounts) = self.sync.peek(&api::accounts_key()) {
      let accounts = serde_json::from_value(accounts.value).unwrap_or_default();
      self.accounts = visible_accounts(accounts, &self.enabled);
    }
  }

  fn shortcuts(&self) -> Vec<ShortcutInfo> {
    vec![
      ShortcutInfo::new("Enter", "use").with_priority(10),
      ShortcutInfo::new("q", "back").with_priority(30),
    ]
  }
}
