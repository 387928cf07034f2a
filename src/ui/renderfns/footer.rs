use crate::ui::view::ShortcutInfo;
use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// A transient message for the footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flash {
  pub text: String,
  pub is_error: bool,
}

/// Draw the footer: breadcrumb, then a message, the failure indicator or
/// the shortcut hints
pub fn draw_footer(
  frame: &mut Frame,
  area: Rect,
  breadcrumb: &[String],
  flash: Option<&Flash>,
  failed: usize,
  shortcuts: &[ShortcutInfo],
) {
  let mut spans = vec![Span::raw(" ")];

  for (i, part) in breadcrumb.iter().enumerate() {
    if i > 0 {
      spans.push(Span::styled(" > ", Style::default().fg(Color::DarkGray)));
    }
    let style = if i == breadcrumb.len() - 1 {
      Style::default().fg(Color::Cyan).bold()
    } else {
      Style::default().fg(Color::White)
    };
    spans.push(Span::styled(part.clone(), style));
  }
  spans.push(Span::raw("   "));

  if failed > 0 {
    spans.push(Span::styled(
      format!(" ✗ {} failed (:failed) ", failed),
      Style::default().bg(Color::Red).fg(Color::White).bold(),
    ));
    spans.push(Span::raw("  "));
  }

  match flash {
    Some(flash) => {
      let color = if flash.is_error { Color::Red } else { Color::Green };
      spans.push(Span::styled(flash.text.clone(), Style::default().fg(color)));
    }
    None => {
      let mut shortcuts = shortcuts.to_vec();
      shortcuts.sort_by_key(|s| s.priority);
      for shortcut in shortcuts {
        spans.push(Span::styled(
          format!("<{}>", shortcut.key),
          Style::default().fg(Color::Cyan),
        ));
        spans.push(Span::styled(
          format!(" {}   ", shortcut.label),
          Style::default().fg(Color::DarkGray),
        ));
      }
    }
  }

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));
  frame.render_widget(paragraph, area);
}
