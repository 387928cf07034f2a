use crate::connectivity::ConnectivityState;
use crate::ui::renderfns::connectivity_style;
use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Everything the header shows
pub struct HeaderInfo<'a> {
  pub backend_url: &'a str,
  pub account: Option<&'a str>,
  pub connectivity: ConnectivityState,
  pub pending: usize,
}

/// Draw the header bar with logo, backend, account and sync state
pub fn draw_header(frame: &mut Frame, area: Rect, info: &HeaderInfo) {
  let separator = Span::styled("│", Style::default().fg(Color::DarkGray));
  let domain = extract_domain(info.backend_url);

  let mut spans = vec![
    Span::styled(" suresnap ", Style::default().fg(Color::Cyan).bold()),
    separator.clone(),
    Span::styled(
      format!(" {} ", if domain.is_empty() { "no backend" } else { domain }),
      Style::default().fg(Color::White),
    ),
    separator.clone(),
    Span::styled(
      format!(" {} ", info.account.unwrap_or("no account")),
      Style::default().fg(Color::Yellow).bold(),
    ),
    separator.clone(),
    Span::styled(
      format!(" ● {} ", info.connectivity.label()),
      connectivity_style(info.connectivity),
    ),
  ];

  if info.pending > 0 {
    spans.push(separator);
    spans.push(Span::styled(
      format!(" ⟳ {} pending ", info.pending),
      Style::default().fg(Color::Yellow),
    ));
  }

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));
  frame.render_widget(paragraph, area);
}

/// Draw the one-line banner shown while the backend is not configured
pub fn draw_setup_banner(frame: &mut Frame, area: Rect, config_path: Option<&str>) {
  let text = match config_path {
    Some(path) => format!(" Set backend_url and api_token in {} to start syncing ", path),
    None => " Set backend_url and api_token in the config file to start syncing ".to_string(),
  };
  let paragraph =
    Paragraph::new(text).style(Style::default().bg(Color::Yellow).fg(Color::Black).bold());
  frame.render_widget(paragraph, area);
}

/// Extract the host from a backend URL
fn extract_domain(url: &str) -> &str {
  url
    .strip_prefix("https://")
    .or_else(|| url.strip_prefix("http://"))
    .unwrap_or(url)
    .split('/')
    .next()
    .unwrap_or(url)
}
