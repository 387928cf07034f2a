pub mod components;
pub mod renderfns;
pub mod view;
pub mod views;

use crate::app::App;
use ratatui::prelude::*;
use ratatui::widgets::ListState;
use renderfns::{draw_footer, draw_header, draw_setup_banner, HeaderInfo};

/// Main draw function
pub fn draw(frame: &mut Frame, app: &mut App) {
  let configured = app.is_configured();
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1),                                 // Header
      Constraint::Length(if configured { 0 } else { 1 }),    // Setup banner
      Constraint::Min(1),                                    // Main content
      Constraint::Length(1),                                 // Footer
    ])
    .split(frame.area());

  let summary = app.sync().sync_summary();
  let backend_url = app.backend_url();
  let account = app.current_account_name();
  draw_header(
    frame,
    chunks[0],
    &HeaderInfo {
      backend_url: &backend_url,
      account: account.as_deref(),
      connectivity: summary.connectivity,
      pending: summary.pending,
    },
  );

  if !configured {
    let path = app.config_path();
    draw_setup_banner(frame, chunks[1], path.as_deref());
  }

  if let Some(view) = app.current_view_mut() {
    view.render(frame, chunks[2]);
  }

  if app.command_input().is_active() {
    app.command_input().render_overlay(frame, chunks[2]);
  }

  let shortcuts = app
    .current_view()
    .map(|view| view.shortcuts())
    .unwrap_or_default();
  draw_footer(
    frame,
    chunks[3],
    &app.breadcrumb(),
    app.flash(),
    summary.failed.len(),
    &shortcuts,
  );
}

/// Clamp a list selection to `len` items, selecting the first one if none is
pub fn ensure_valid_selection(state: &mut ListState, len: usize) {
  if len == 0 {
    state.select(None);
    return;
  }
  match state.selected() {
    Some(i) if i >= len => state.select(Some(len - 1)),
    None => state.select(Some(0)),
    _ => {}
  }
}
