use crate::api;
use crate::api::types::{AccountDetail, Category, CreateTransactionInput, Nature, Tag, Transaction};
use crate::commands::{self, AddArgs, NameHint, ParsedCommand};
use crate::config::{Settings, SettingsHandle, SettingsPatch};
use crate::connectivity::{ConnectivityState, Subscription};
use crate::coordinator::SyncCoordinator;
use crate::event::{Event, EventHandler};
use crate::queue::{MutationHandle, MutationStatus};
use crate::ui;
use crate::ui::components::{CommandInput, CommandResult};
use crate::ui::renderfns::Flash;
use crate::ui::view::{View, ViewAction};
use crate::ui::views::{visible_accounts, AccountListView, FailedListView, TransactionListView};
use chrono::Local;
use color_eyre::Result;
use crossterm::event::{DisableFocusChange, EnableFocusChange, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use parking_lot::Mutex;
use ratatui::prelude::*;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long a footer message stays up
const FLASH_TTL: Duration = Duration::from_secs(4);

/// Main application state
pub struct App {
  /// Navigation stack - root is always at index 0
  view_stack: Vec<Box<dyn View>>,

  /// Command line opened with `:`
  command_input: CommandInput,

  sync: Arc<SyncCoordinator>,
  settings: Arc<SettingsHandle>,

  /// Account chosen with `--account` or `:account`
  account_override: Option<String>,

  flash: Option<(Flash, Instant)>,

  /// Writes reported in the footer once settled
  watched: Vec<MutationHandle>,

  /// Connectivity changes not shown yet
  status_changes: Arc<Mutex<Vec<ConnectivityState>>>,
  _status_subscription: Subscription,

  should_quit: bool,
}

impl App {
  pub fn new(
    sync: Arc<SyncCoordinator>,
    settings: Arc<SettingsHandle>,
    account_override: Option<String>,
  ) -> Self {
    let status_changes = Arc::new(Mutex::new(Vec::new()));
    let changes = status_changes.clone();
    let status_subscription = sync.subscribe_to_status(move |state| changes.lock().push(state));

    Self {
      view_stack: vec![Box::new(TransactionListView::new(sync.clone()))],
      command_input: CommandInput::new(),
      watched: sync.pending_handles(),
      sync,
      settings,
      account_override,
      flash: None,
      status_changes,
      _status_subscription: status_subscription,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    stdout().execute(EnableFocusChange)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut events = EventHandler::new(Duration::from_millis(250));

    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, self))?;

      match events.next().await {
        Some(event) => self.handle_event(event),
        None => break,
      }
    }

    // Cleanup terminal
    stdout().execute(DisableFocusChange)?;
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::Tick => self.tick(),
      Event::Focus(foreground) => self.sync.set_foreground(foreground),
    }
  }

  fn tick(&mut self) {
    for view in self.view_stack.iter_mut() {
      view.tick();
    }

    let mut settled = Vec::new();
    self.watched.retain(|handle| match handle.status() {
      MutationStatus::Succeeded => {
        settled.push(Flash {
          text: "Saved".to_string(),
          is_error: false,
        });
        false
      }
      MutationStatus::Failed => {
        settled.push(Flash {
          text: handle
            .error()
            .unwrap_or_else(|| "Could not save transaction".to_string()),
          is_error: true,
        });
        false
      }
      _ => true,
    });
    if let Some(flash) = settled.pop() {
      self.flash = Some((flash, Instant::now()));
    }

    let latest = self.status_changes.lock().drain(..).last();
    if let Some(state) = latest {
      self.notify(format!("Connection: {}", state.label()), !state.is_online());
    }

    if let Some((_, at)) = &self.flash {
      if at.elapsed() >= FLASH_TTL {
        self.flash = None;
      }
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
      self.should_quit = true;
      return;
    }
    if key.code == KeyCode::Char(':') && !self.command_input.is_active() {
      self.refresh_name_hints();
    }

    match self.command_input.handle_key(key) {
      CommandResult::Submitted(line) => {
        self.run_command(&line);
        return;
      }
      CommandResult::Handled | CommandResult::Cancelled => return,
      CommandResult::NotHandled => {}
    }

    let action = match self.view_stack.last_mut() {
      Some(view) => view.handle_key(key),
      None => return,
    };
    self.apply(action);
  }

  fn apply(&mut self, action: ViewAction) {
    match action {
      ViewAction::None => {}
      ViewAction::Push(view) => self.view_stack.push(view),
      ViewAction::Pop => {
        if self.view_stack.len() > 1 {
          self.view_stack.pop();
        } else {
          self.should_quit = true;
        }
      }
      ViewAction::Run(line) => self.run_command(&line),
      ViewAction::Notify(text) => self.notify(text, false),
    }
  }

  fn run_command(&mut self, line: &str) {
    let command = match commands::parse(line) {
      Ok(command) => command,
      Err(message) => {
        self.notify(message, true);
        return;
      }
    };

    match command {
      ParsedCommand::Add(args) => self.add_transaction(&args),
      ParsedCommand::Account(wanted) => self.switch_account(&wanted),
      ParsedCommand::Accounts => {
        let view = AccountListView::new(
          self.sync.clone(),
          self.settings.settings().enabled_account_ids,
          self.current_account_id(),
        );
        self.view_stack.push(Box::new(view));
      }
      ParsedCommand::Transactions => self.reset_root(),
      ParsedCommand::Failed => {
        self
          .view_stack
          .push(Box::new(FailedListView::new(self.sync.clone())));
      }
      ParsedCommand::Dismiss(Some(id)) => {
        if self.sync.dismiss(id) {
          self.notify(format!("Dismissed #{}", id), false);
        } else {
          self.notify(format!("No failed write #{}", id), true);
        }
      }
      ParsedCommand::Dismiss(None) => {
        let failed = self.sync.sync_summary().failed;
        let dismissed = failed.iter().filter(|m| self.sync.dismiss(m.id)).count();
        self.notify(format!("Dismissed {} failed writes", dismissed), false);
      }
      ParsedCommand::Refresh => {
        self.sync.refresh_all();
        self.notify("Refreshing".to_string(), false);
      }
      ParsedCommand::Quit => self.should_quit = true,
    }
  }

  fn add_transaction(&mut self, args: &AddArgs) {
    let Some(account_id) = self.current_account_id() else {
      self.notify("No account selected. Pick one with :accounts".to_string(), true);
      return;
    };
    let account = self.cached_accounts().into_iter().find(|a| a.id == account_id);

    let categories: Vec<Category> = self
      .sync
      .read_as(&api::expense_categories_key())
      .unwrap_or_default();
    let category = find_category(&categories, &args.category);
    if category.is_none() && !categories.is_empty() {
      self.notify(format!("Unknown category: {}", args.category), true);
      return;
    }

    let tags: Vec<Tag> = self.sync.read_as(&api::tags_key()).unwrap_or_default();
    let resolved = choose_currency(&self.settings.settings(), args, account.as_ref())
      .and_then(|currency| Ok((currency, resolve_tags(&tags, &args.tags)?)));
    let (currency, tag_ids) = match resolved {
      Ok(resolved) => resolved,
      Err(message) => {
        self.notify(message, true);
        return;
      }
    };

    let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
    let input = draft_transaction(&account_id, category, currency, tag_ids, args, today);

    match self.sync.submit(&account_id, &input) {
      Ok(handle) => {
        info!(mutation = handle.id(), account = %account_id, "Transaction queued");
        self.watched.push(handle);
        self.remember_account(&account_id);
        self.notify(format!("Queued {} {:.2}", input.name, input.amount), false);
      }
      Err(e) => {
        warn!(error = %e, "Could not queue transaction");
        self.notify(format!("Could not queue transaction: {}", e), true);
      }
    }
  }

  fn switch_account(&mut self, wanted: &str) {
    let accounts = self.cached_accounts();
    match find_account(&accounts, wanted) {
      Some(account) => {
        let id = account.id.clone();
        self.notify(format!("Capturing into {}", account.name), false);
        self.account_override = Some(id.clone());
        self.remember_account(&id);
        self.view_stack.truncate(1);
      }
      None => self.notify(format!("Unknown account: {}", wanted), true),
    }
  }

  fn remember_account(&mut self, id: &str) {
    let patch = SettingsPatch {
      last_used_account_id: Some(id.to_string()),
      ..Default::default()
    };
    if let Err(e) = self.settings.update(patch) {
      warn!(error = %e, "Could not save settings");
    }
  }

  fn reset_root(&mut self) {
    self.view_stack.clear();
    self
      .view_stack
      .push(Box::new(TransactionListView::new(self.sync.clone())));
  }

  /// Names from cached transactions of the current account, for `add`
  fn refresh_name_hints(&mut self) {
    let transactions: Vec<Transaction> = self
      .sync
      .read_as(&api::transactions_key())
      .unwrap_or_default();
    let account_id = self.current_account_id();
    self
      .command_input
      .set_name_hints(NameHint::from_transactions(&transactions, account_id.as_deref()));
  }

  fn notify(&mut self, text: String, is_error: bool) {
    self.flash = Some((Flash { text, is_error }, Instant::now()));
  }

  fn cached_accounts(&self) -> Vec<AccountDetail> {
    let accounts = self
      .sync
      .read_as(&api::accounts_key())
      .unwrap_or_default();
    visible_accounts(accounts, &self.settings.settings().enabled_account_ids)
  }

  /// Override, then the last used account, then the first available one
  fn current_account_id(&self) -> Option<String> {
    self
      .account_override
      .clone()
      .or_else(|| self.settings.settings().last_used_account_id)
      .or_else(|| self.cached_accounts().first().map(|a| a.id.clone()))
  }

  // Accessors for UI rendering
  pub fn current_view(&self) -> Option<&dyn View> {
    self.view_stack.last().map(|view| view.as_ref())
  }

  pub fn current_view_mut(&mut self) -> Option<&mut Box<dyn View>> {
    self.view_stack.last_mut()
  }

  pub fn command_input(&self) -> &CommandInput {
    &self.command_input
  }

  pub fn sync(&self) -> &SyncCoordinator {
    &self.sync
  }

  pub fn flash(&self) -> Option<&Flash> {
    self.flash.as_ref().map(|(flash, _)| flash)
  }

  pub fn is_configured(&self) -> bool {
    self.settings.settings().is_configured()
  }

  pub fn backend_url(&self) -> String {
    self.settings.settings().backend_url
  }

  pub fn config_path(&self) -> Option<String> {
    self.settings.path().map(|p| p.display().to_string())
  }

  pub fn current_account_name(&self) -> Option<String> {
    let id = self.current_account_id()?;
    let name = self
      .sync
      .peek(&api::accounts_key())
      .and_then(|entry| serde_json::from_value::<Vec<AccountDetail>>(entry.value).ok())
      .and_then(|accounts| accounts.into_iter().find(|a| a.id == id))
      .map(|a| a.name);
    Some(name.unwrap_or(id))
  }

  pub fn breadcrumb(&self) -> Vec<String> {
    self
      .view_stack
      .iter()
      .map(|v| v.breadcrumb_label())
      .collect()
  }
}

/// Match by exact name, then by name prefix, ignoring case
fn find_category<'a>(categories: &'a [Category], query: &str) -> Option<&'a Category> {
  let query = query.to_lowercase();
  categories
    .iter()
    .find(|c| c.name.to_lowercase() == query)
    .or_else(|| {
      categories
        .iter()
        .find(|c| c.name.to_lowercase().starts_with(&query))
    })
}

/// Match by id, then by name ignoring case
fn find_account<'a>(accounts: &'a [AccountDetail], wanted: &str) -> Option<&'a AccountDetail> {
  accounts
    .iter()
    .find(|a| a.id == wanted)
    .or_else(|| accounts.iter().find(|a| a.name.eq_ignore_ascii_case(wanted)))
}

/// The typed currency if it is enabled, otherwise the account's own
fn choose_currency(
  settings: &Settings,
  args: &AddArgs,
  account: Option<&AccountDetail>,
) -> Result<Option<String>, String> {
  match &args.currency {
    Some(code) => settings
      .currency(code)
      .map(|c| Some(c.to_string()))
      .ok_or_else(|| {
        format!(
          "Currency {} is not enabled ({})",
          code,
          settings.currencies.join(", ")
        )
      }),
    None => Ok(
      account
        .map(|a| a.currency.clone())
        .filter(|c| !c.is_empty()),
    ),
  }
}

/// Ids of the named tags, matched ignoring case
fn resolve_tags(tags: &[Tag], wanted: &[String]) -> Result<Vec<String>, String> {
  wanted
    .iter()
    .map(|name| {
      tags
        .iter()
        .find(|tag| tag.name.eq_ignore_ascii_case(name))
        .map(|tag| tag.id.clone())
        .ok_or_else(|| format!("Unknown tag: #{}", name))
    })
    .collect()
}

/// Build the create payload for an expense. Without a name the category
/// name (or the typed category) is used.
fn draft_transaction(
  account_id: &str,
  category: Option<&Category>,
  currency: Option<String>,
  tag_ids: Vec<String>,
  args: &AddArgs,
  date: String,
) -> CreateTransactionInput {
  let name = args
    .name
    .clone()
    .or_else(|| category.map(|c| c.name.clone()))
    .unwrap_or_else(|| args.category.clone());

  CreateTransactionInput {
    account_id: account_id.to_string(),
    date,
    amount: args.amount,
    name,
    nature: Some(Nature::Expense),
    category_id: category.map(|c| c.id.clone()),
    merchant_id: None,
    notes: None,
    currency,
    tag_ids,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn category(id: &str, name: &str) -> Category {
    Category {
      id: id.to_string(),
      name: name.to_string(),
      ..Category::default()
    }
  }

  #[test]
  fn test_find_category() {
    let categories = vec![
      category("c1", "Groceries"),
      category("c2", "Gifts"),
      category("c3", "Gift"),
    ];

    assert_eq!(find_category(&categories, "groceries").unwrap().id, "c1");
    assert_eq!(find_category(&categories, "gro").unwrap().id, "c1");
    // Exact match wins over an earlier prefix match
    assert_eq!(find_category(&categories, "GIFT").unwrap().id, "c3");
    assert!(find_category(&categories, "rent").is_none());
  }

  #[test]
  fn test_find_account() {
    let accounts = vec![
      AccountDetail {
        id: "a1".into(),
        name: "Checking".into(),
        ..AccountDetail::default()
      },
      AccountDetail {
        id: "a2".into(),
        name: "Cash".into(),
        ..AccountDetail::default()
      },
    ];

    assert_eq!(find_account(&accounts, "a2").unwrap().name, "Cash");
    assert_eq!(find_account(&accounts, "checking").unwrap().id, "a1");
    assert!(find_account(&accounts, "savings").is_none());
  }

  #[test]
  fn test_draft_transaction() {
    let groceries = category("c1", "Groceries");
    let args = AddArgs {
      amount: 12.5,
      category: "gro".into(),
      ..AddArgs::default()
    };

    let input = draft_transaction(
      "a1",
      Some(&groceries),
      Some("EUR".into()),
      vec!["tag-1".into()],
      &args,
      "2026-10-17".into(),
    );
    assert_eq!(input.name, "Groceries");
    assert_eq!(input.category_id.as_deref(), Some("c1"));
    assert_eq!(input.currency.as_deref(), Some("EUR"));
    assert_eq!(input.tag_ids, vec!["tag-1"]);
    assert_eq!(input.nature, Some(Nature::Expense));
    assert_eq!(input.date, "2026-10-17");

    // Nothing cached yet
    let args = AddArgs {
      amount: 3.0,
      category: "coffee".into(),
      name: Some("Espresso".into()),
      ..AddArgs::default()
    };
    let input = draft_transaction("a1", None, None, Vec::new(), &args, "2026-10-17".into());
    assert_eq!(input.name, "Espresso");
    assert_eq!(input.category_id, None);
    assert_eq!(input.currency, None);
  }

  #[test]
  fn test_choose_currency() {
    let settings = Settings::default();
    let account = AccountDetail {
      id: "a1".into(),
      currency: "ILS".into(),
      ..AccountDetail::default()
    };
    let typed = |code: &str| AddArgs {
      currency: Some(code.to_string()),
      ..AddArgs::default()
    };

    assert_eq!(
      choose_currency(&settings, &AddArgs::default(), Some(&account)),
      Ok(Some("ILS".to_string()))
    );
    assert_eq!(
      choose_currency(&settings, &typed("EUR"), Some(&account)),
      Ok(Some("EUR".to_string()))
    );
    assert_eq!(
      choose_currency(&settings, &typed("GBP"), Some(&account)),
      Err("Currency GBP is not enabled (USD, EUR, ILS)".to_string())
    );
    assert_eq!(choose_currency(&settings, &AddArgs::default(), None), Ok(None));
  }

  #[test]
  fn test_resolve_tags() {
    let tags = vec![Tag {
      id: "tag-1".into(),
      name: "Work".into(),
      ..Tag::default()
    }];

    assert_eq!(resolve_tags(&tags, &["work".to_string()]), Ok(vec!["tag-1".to_string()]));
    assert_eq!(resolve_tags(&tags, &[]), Ok(Vec::new()));
    assert_eq!(
      resolve_tags(&tags, &["trip".to_string()]),
      Err("Unknown tag: #trip".to_string())
    );
  }
}
