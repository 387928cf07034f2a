//! Available commands, autocomplete and argument parsing

use crate::api::types::Transaction;

/// Most names offered while typing an `add` line
const MAX_NAME_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "add",
    aliases: &["a", "new"],
    usage: "add <amount> [CUR] <category> [name] [#tag]",
    description: "Capture an expense",
  },
  Command {
    name: "account",
    aliases: &["acc", "use"],
    usage: "account <name>",
    description: "Switch the capture account",
  },
  Command {
    name: "accounts",
    aliases: &["ls"],
    usage: "accounts",
    description: "Browse accounts",
  },
  Command {
    name: "transactions",
    aliases: &["t", "tx"],
    usage: "transactions",
    description: "Recent transactions",
  },
  Command {
    name: "failed",
    aliases: &["f", "errors"],
    usage: "failed",
    description: "Writes the server rejected",
  },
  Command {
    name: "dismiss",
    aliases: &["d", "ack"],
    usage: "dismiss [id]",
    description: "Acknowledge failed writes",
  },
  Command {
    name: "refresh",
    aliases: &["r", "reload"],
    usage: "refresh",
    description: "Refetch everything",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit suresnap",
  },
];

/// Get autocomplete suggestions for the command word of `input`
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input
    .split_whitespace()
    .next()
    .unwrap_or("")
    .to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
      continue;
    }

    // Fuzzy match on alias
    if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Arguments of `add`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddArgs {
  pub amount: f64,
  /// Upper-case code typed right after the amount
  pub currency: Option<String>,
  pub category: String,
  pub name: Option<String>,
  /// Tag names, without the leading `#`
  pub tags: Vec<String>,
}

/// A resolved command line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
  Add(AddArgs),
  Account(String),
  Accounts,
  Transactions,
  Failed,
  /// Dismiss one failed write, or all of them
  Dismiss(Option<u64>),
  Refresh,
  Quit,
}

/// Parse `name args...` where `name` is a canonical command name
pub fn parse(line: &str) -> Result<ParsedCommand, String> {
  let line = line.trim();
  let (name, rest) = line
    .split_once(char::is_whitespace)
    .map(|(name, rest)| (name, rest.trim()))
    .unwrap_or((line, ""));

  match name {
    "add" => parse_add(rest).map(ParsedCommand::Add),
    "account" => {
      if rest.is_empty() {
        Err("Usage: account <name>".to_string())
      } else {
        Ok(ParsedCommand::Account(rest.to_string()))
      }
    }
    "accounts" => Ok(ParsedCommand::Accounts),
    "transactions" => Ok(ParsedCommand::Transactions),
    "failed" => Ok(ParsedCommand::Failed),
    "dismiss" => {
      if rest.is_empty() {
        Ok(ParsedCommand::Dismiss(None))
      } else {
        rest
          .parse()
          .map(|id| ParsedCommand::Dismiss(Some(id)))
          .map_err(|_| format!("Not a mutation id: {}", rest))
      }
    }
    "refresh" => Ok(ParsedCommand::Refresh),
    "quit" => Ok(ParsedCommand::Quit),
    "" => Err("Empty command".to_string()),
    other => Err(format!("Unknown command: {}", other)),
  }
}

fn parse_add(args: &str) -> Result<AddArgs, String> {
  const USAGE: &str = "Usage: add <amount> [CUR] <category> [name] [#tag]";

  let mut words = split_words(args)?
    .into_iter()
    .map(|word| word.text)
    .filter(|text| !text.is_empty());
  let amount = words.next().ok_or(USAGE)?;
  let mut rest: Vec<String> = words.collect();

  let amount: f64 = amount
    .replace(',', ".")
    .parse()
    .map_err(|_| format!("Not an amount: {}", amount))?;
  if !amount.is_finite() || amount <= 0.0 {
    return Err("Amount must be greater than zero".to_string());
  }

  let currency = if rest.len() >= 2 && is_currency_code(&rest[0]) {
    Some(rest.remove(0))
  } else {
    None
  };

  let mut rest = rest.into_iter();
  let category = rest.next().ok_or(USAGE)?;

  let mut name = Vec::new();
  let mut tags = Vec::new();
  for word in rest {
    match word.strip_prefix('#').filter(|tag| !tag.is_empty()) {
      Some(tag) => tags.push(tag.to_string()),
      None => name.push(word),
    }
  }
  let name = Some(name.join(" ")).filter(|name| !name.is_empty());

  Ok(AddArgs {
    amount,
    currency,
    category,
    name,
    tags,
  })
}

/// Three upper-case ASCII letters, e.g. `EUR`
fn is_currency_code(word: &str) -> bool {
  word.len() == 3 && word.chars().all(|c| c.is_ascii_uppercase())
}

/// An argument word and the byte offset just past it
#[derive(Debug, Clone, PartialEq)]
struct Word {
  text: String,
  end: usize,
}

/// Split on runs of whitespace. A double-quoted word may contain spaces.
fn split_words(args: &str) -> Result<Vec<Word>, String> {
  let mut words = Vec::new();
  let mut chars = args.char_indices().peekable();

  while let Some(&(start, c)) = chars.peek() {
    if c.is_whitespace() {
      chars.next();
      continue;
    }

    let mut text = String::new();
    let mut end = start;
    if c == '"' {
      chars.next();
      let mut closed = false;
      for (i, c) in chars.by_ref() {
        if c == '"' {
          end = i + 1;
          closed = true;
          break;
        }
        text.push(c);
      }
      if !closed {
        return Err("Unclosed quote".to_string());
      }
    } else {
      while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
          break;
        }
        text.push(c);
        end = i + c.len_utf8();
        chars.next();
      }
    }
    words.push(Word { text, end });
  }

  Ok(words)
}

/// The name being typed on an `add` line, available once the category is
/// complete
#[derive(Debug, Clone, PartialEq)]
pub struct NameQuery {
  pub category: String,
  /// Byte offset of the name within the line
  pub start: usize,
  pub partial: String,
}

pub fn name_query(input: &str) -> Option<NameQuery> {
  let trimmed = input.trim_start();
  let offset = input.len() - trimmed.len();
  let word_end = trimmed.find(char::is_whitespace)?;
  let command = get_suggestions(&trimmed[..word_end]).first()?.name;
  if command != "add" {
    return None;
  }

  let args = &trimmed[word_end..];
  let words = split_words(args).ok()?;
  let category_at = if words.len() >= 3 && is_currency_code(&words[1].text) {
    2
  } else {
    1
  };
  let category = words.get(category_at)?;

  let after = &args[category.end..];
  if !after.starts_with(char::is_whitespace) {
    return None;
  }
  let start = offset + word_end + category.end + (after.len() - after.trim_start().len());

  Some(NameQuery {
    category: category.text.clone(),
    start,
    partial: input[start..].to_string(),
  })
}

/// A name used before, with the category it was filed under
#[derive(Debug, Clone, PartialEq)]
pub struct NameHint {
  pub name: String,
  pub category: Option<String>,
}

impl NameHint {
  /// Hints from cached transactions, newest first, optionally for one account
  pub fn from_transactions(transactions: &[Transaction], account_id: Option<&str>) -> Vec<Self> {
    transactions
      .iter()
      .filter(|tx| account_id.map_or(true, |id| tx.account.id == id))
      .filter(|tx| !tx.name.is_empty())
      .map(|tx| NameHint {
        name: tx.name.clone(),
        category: tx.category.as_ref().map(|c| c.name.clone()),
      })
      .collect()
  }
}

/// Names filed under `category` (by name prefix) that contain `partial`,
/// most frequent first. Ties keep the order of `hints`.
pub fn suggest_names(hints: &[NameHint], category: &str, partial: &str) -> Vec<String> {
  let category = category.to_lowercase();
  let partial = partial.trim().to_lowercase();

  let mut counts: Vec<(&str, usize)> = Vec::new();
  for hint in hints {
    let in_category = hint
      .category
      .as_deref()
      .map_or(false, |c| c.to_lowercase().starts_with(&category));
    if !in_category || !hint.name.to_lowercase().contains(&partial) {
      continue;
    }
    match counts.iter_mut().find(|(name, _)| *name == hint.name) {
      Some((_, count)) => *count += 1,
      None => counts.push((hint.name.as_str(), 1)),
    }
  }

  counts.sort_by(|a, b| b.1.cmp(&a.1));
  counts
    .into_iter()
    .take(MAX_NAME_SUGGESTIONS)
    .map(|(name, _)| name.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_input_returns_all() {
    let suggestions = get_suggestions("");
    assert_eq!(suggestions.len(), COMMANDS.len());
  }

  #[test]
  fn test_exact_match() {
    let suggestions = get_suggestions("account");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "account");
  }

  #[test]
  fn test_alias_match() {
    let suggestions = get_suggestions("q");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "quit");
  }

  #[test]
  fn test_prefix_match() {
    let suggestions = get_suggestions("ref");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "refresh");
  }

  #[test]
  fn test_fuzzy_match() {
    let suggestions = get_suggestions("ile");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "failed");
  }

  #[test]
  fn test_suggestions_ignore_arguments() {
    let suggestions = get_suggestions("add 12 food");
    assert_eq!(suggestions[0].name, "add");
  }

  #[test]
  fn test_parse_add() {
    assert_eq!(
      parse("add 12,50 food lunch with team"),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 12.5,
        category: "food".to_string(),
        name: Some("lunch with team".to_string()),
        ..AddArgs::default()
      }))
    );
    assert_eq!(
      parse("add 3 coffee"),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 3.0,
        category: "coffee".to_string(),
        ..AddArgs::default()
      }))
    );
  }

  #[test]
  fn test_parse_add_collapses_whitespace() {
    assert_eq!(
      parse("add 12  food\t  lunch   with team"),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 12.0,
        category: "food".to_string(),
        name: Some("lunch with team".to_string()),
        ..AddArgs::default()
      }))
    );
  }

  #[test]
  fn test_parse_add_quoted_category() {
    assert_eq!(
      parse(r#"add 12 "Eating Out" Dinner"#),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 12.0,
        category: "Eating Out".to_string(),
        name: Some("Dinner".to_string()),
        ..AddArgs::default()
      }))
    );
    assert_eq!(parse(r#"add 12 "Eating Out"#), Err("Unclosed quote".to_string()));
  }

  #[test]
  fn test_parse_add_currency_and_tags() {
    assert_eq!(
      parse("add 20 EUR travel Train ticket #work #trip"),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 20.0,
        currency: Some("EUR".to_string()),
        category: "travel".to_string(),
        name: Some("Train ticket".to_string()),
        tags: vec!["work".to_string(), "trip".to_string()],
      }))
    );
    // A lone upper-case word is the category
    assert_eq!(
      parse("add 20 ATM"),
      Ok(ParsedCommand::Add(AddArgs {
        amount: 20.0,
        category: "ATM".to_string(),
        ..AddArgs::default()
      }))
    );
  }

  #[test]
  fn test_name_query() {
    assert_eq!(name_query("add 12 food"), None);
    assert_eq!(name_query("quit now "), None);
    assert_eq!(
      name_query("add 12 food "),
      Some(NameQuery {
        category: "food".to_string(),
        start: 12,
        partial: String::new(),
      })
    );
    assert_eq!(
      name_query(r#"a 4 USD "Eating Out"  Pi"#),
      Some(NameQuery {
        category: "Eating Out".to_string(),
        start: 22,
        partial: "Pi".to_string(),
      })
    );
    assert_eq!(name_query(r#"add 4 "Eating "#), None);
  }

  fn hint(name: &str, category: &str) -> NameHint {
    NameHint {
      name: name.to_string(),
      category: Some(category.to_string()),
    }
  }

  #[test]
  fn test_suggest_names_ranks_by_frequency() {
    let hints = vec![
      hint("Bakery", "Food"),
      hint("Lunch", "Food"),
      hint("Lunch", "Food"),
      hint("Taxi", "Transport"),
      hint("Lunch meeting", "Food"),
    ];

    assert_eq!(
      suggest_names(&hints, "fo", ""),
      vec!["Lunch", "Bakery", "Lunch meeting"]
    );
    assert_eq!(suggest_names(&hints, "food", "LUN"), vec!["Lunch", "Lunch meeting"]);
    assert!(suggest_names(&hints, "rent", "").is_empty());
  }

  #[test]
  fn test_parse_add_rejects_bad_amounts() {
    assert!(parse("add").is_err());
    assert!(parse("add 5").is_err());
    assert!(parse("add abc food").is_err());
    assert!(parse("add -4 food").is_err());
    assert!(parse("add 0 food").is_err());
  }

  #[test]
  fn test_parse_dismiss() {
    assert_eq!(parse("dismiss"), Ok(ParsedCommand::Dismiss(None)));
    assert_eq!(parse("dismiss 7"), Ok(ParsedCommand::Dismiss(Some(7))));
    assert!(parse("dismiss seven").is_err());
  }

  #[test]
  fn test_parse_account_requires_name() {
    assert!(parse("account").is_err());
    assert_eq!(
      parse("account Main Checking"),
      Ok(ParsedCommand::Account("Main Checking".to_string()))
    );
  }

  #[test]
  fn test_parse_unknown() {
    assert_eq!(parse("launch"), Err("Unknown command: launch".to_string()));
  }
}
