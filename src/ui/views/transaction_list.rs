use crate::api;
use crate::api::types::Transaction;
use crate::coordinator::SyncCoordinator;
use crate::ui::ensure_valid_selection;
use crate::ui::renderfns::{classification_color, truncate};
use crate::ui::view::{ShortcutInfo, View, ViewAction};
use crate::ui::views::FailedListView;
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the list asks for revalidation while open
const REVALIDATE_EVERY: Duration = Duration::from_secs(30);

/// Recent transactions, including ones not yet confirmed by the server
pub struct TransactionListView {
  sync: Arc<SyncCoordinator>,
  transactions: Vec<Transaction>,
  is_stale: bool,
  loaded: bool,
  last_read: Option<Instant>,
  list_state: ListState,
}

impl TransactionListView {
  pub fn new(sync: Arc<SyncCoordinator>) -> Self {
    let mut view = Self {
      sync,
      transactions: Vec::new(),
      is_stale: false,
      loaded: false,
      last_read: None,
      list_state: ListState::default(),
    };
    view.tick();
    view
  }

  fn load(&mut self) {
    let key = api::transactions_key();
    let due = self
      .last_read
      .map_or(true, |at| at.elapsed() >= REVALIDATE_EVERY);

    let entry = if due {
      self.last_read = Some(Instant::now());
      self.sync.read(&key)
    } else {
      self.sync.peek(&key)
    };

    match entry {
      Some(entry) => {
        self.transactions = parse_transactions(&entry.value);
        self.is_stale = entry.is_stale;
        self.loaded = true;
      }
      None => {
        self.transactions.clear();
        self.loaded = false;
      }
    }
  }

  fn render_list(&mut self, frame: &mut Frame, area: Rect) {
    let len = self.transactions.len();
    ensure_valid_selection(&mut self.list_state, len);

    let fetching = self.sync.is_fetching(&api::transactions_key());
    let suffix = if fetching {
      " (refreshing...)"
    } else if self.is_stale {
      " (stale)"
    } else {
      ""
    };
    let title = format!(" Transactions ({}){} ", len, suffix);

    let block = Block::default()
      .title(title)
      .title_alignment(Alignment::Center)
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Blue));

    if self.transactions.is_empty() {
      let content = if !self.loaded && fetching {
        "Loading transactions..."
      } else if !self.loaded {
        "Nothing cached yet. Transactions appear once the server is reachable."
      } else {
        "No transactions. Capture one with :add <amount> <category> [name]"
      };
      let paragraph = Paragraph::new(content)
        .block(block)
        .style(Style::default().fg(Color::DarkGray));
      frame.render_widget(paragraph, area);
      return;
    }

    let items: Vec<ListItem> = self
      .transactions
      .iter()
      .map(|tx| {
        let pending = self.sync.is_local(&tx.id);
        let marker = if pending {
          Span::styled("⟳ ", Style::default().fg(Color::Yellow))
        } else {
          Span::raw("  ")
        };
        let category = tx
          .category
          .as_ref()
          .map(|c| c.name.as_str())
          .unwrap_or("");
        let name_style = if pending {
          Style::default().fg(Color::Yellow)
        } else {
          Style::default()
        };

        let line = Line::from(vec![
          marker,
          Span::styled(format!("{:<10}", tx.date), Style::default().fg(Color::DarkGray)),
          Span::raw(" "),
          Span::styled(
            format!("{:>12} {:<3}", tx.amount, tx.currency),
            Style::default().fg(classification_color(&tx.classification)),
          ),
          Span::raw("  "),
          Span::styled(format!("{:<32}", truncate(&tx.name, 32)), name_style),
          Span::styled(
            format!("{:<18}", truncate(category, 18)),
            Style::default().fg(Color::Cyan),
          ),
          Span::styled(truncate(&tx.account.name, 20), Style::default().fg(Color::DarkGray)),
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

/// Items that do not look like transactions are skipped
fn parse_transactions(value: &Value) -> Vec<Transaction> {
  value
    .as_array()
    .map(|items| {
      items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
    })
    .unwrap_or_default()
}

impl View for TransactionListView {
  fn handle_key(&mut self, key: KeyEvent) -> ViewAction {
    match key.code {
      KeyCode::Char('j') | KeyCode::Down => {
        self.list_state.select_next();
      }
      KeyCode::Char('k') | KeyCode::Up => {
        self.list_state.select_previous();
      }
      KeyCode::Char('r') => {
        self.last_read = None;
        return ViewAction::Run("refresh".to_string());
      }
      KeyCode::Char('a') => {
        return ViewAction::Notify("Capture with :add <amount> <category> [name]".to_string());
      }
      KeyCode::Char('f') => {
        return ViewAction::Push(Box::new(FailedListView::new(self.sync.clone())));
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
    "Transactions".to_string()
  }

  fn tick(&mut self) {
    self.load();
  }

  fn shortcuts(&self) -> Vec<ShortcutInfo> {
    vec![
      ShortcutInfo::new(":", "command").with_priority(10),
      ShortcutInfo::new("a", "add").with_priority(20),
      ShortcutInfo::new("r", "refresh").with_priority(30),
      ShortcutInfo::new("f", "failed").with_priority(35),
      ShortcutInfo::new("q", "quit").with_priority(40),
    ]
  }
}
