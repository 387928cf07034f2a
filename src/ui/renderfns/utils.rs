use crate::connectivity::ConnectivityState;
use ratatui::prelude::{Color, Style};

/// Truncate a string to at most `max_len` characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Badge style for a connectivity state
pub fn connectivity_style(state: ConnectivityState) -> Style {
  match state {
    ConnectivityState::Online => Style::default().fg(Color::Green),
    ConnectivityState::Offline => Style::default().fg(Color::Red),
    ConnectivityState::ServerUnreachable => Style::default().fg(Color::Yellow),
  }
}

/// Display color for a transaction classification
pub fn classification_color(classification: &str) -> Color {
  match classification {
    "income" | "inflow" => Color::Green,
    "expense" | "outflow" => Color::White,
    _ => Color::Gray,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_truncate_short_string() {
    assert_eq!(truncate("hello", 10), "hello");
  }

  #[test]
  fn test_truncate_exact_length() {
    assert_eq!(truncate("hello", 5), "hello");
  }

  #[test]
  fn test_truncate_long_string() {
    assert_eq!(truncate("hello world", 8), "hello...");
  }

  #[test]
  fn test_truncate_counts_characters() {
    assert_eq!(truncate("סופרמרקט שכונתי", 8), "סופרמ...");
  }

  #[test]
  fn test_connectivity_style() {
    assert_eq!(
      connectivity_style(ConnectivityState::Offline),
      Style::default().fg(Color::Red)
    );
    assert_ne!(
      connectivity_style(ConnectivityState::Offline),
      connectivity_style(ConnectivityState::ServerUnreachable)
    );
  }

  #[test]
  fn test_classification_color() {
    assert_eq!(classification_color("income"), Color::Green);
    assert_eq!(classification_color("expense"), Color::White);
    assert_eq!(classification_color(""), Color::Gray);
  }
}
