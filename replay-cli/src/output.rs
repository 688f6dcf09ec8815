// Output formatting helpers for CLI commands

use replay_service::config::models::display_value;
use replay_service::{Cell, CellState};

use std::io::IsTerminal;

/// Longest config value shown in a progress line before it is cut
pub const INFO_MAX_CHARACTERS: usize = 30;

/// Terminal colors used for state words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red = 31,
    Green = 32,
    Yellow = 33,
}

/// Whether stdout is an interactive terminal
pub fn stdout_is_tty() -> bool {
    std::io::stdout().is_terminal()
}

/// Wrap `text` in an ANSI color when `enabled`
pub fn colorize(color: Color, text: &str, enabled: bool) -> String {
    if enabled {
        format!("\x1b[{}m{}\x1b[0m", color as u8, text)
    } else {
        text.to_string()
    }
}

fn state_color(state: CellState) -> Color {
    match state {
        CellState::Start => Color::Yellow,
        CellState::Success => Color::Green,
        _ => Color::Red,
    }
}

/// Cut `value` to `max` characters, marking the cut with `...`
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let kept: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        value.to_string()
    }
}

/// Whether `key` has more than one distinct value across `matrix`
fn values_differ(matrix: &[Cell], key: &str) -> bool {
    let mut seen = Vec::new();
    for cell in matrix {
        let value = cell.get(key);
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen.len() > 1
}

fn shown(cell: &Cell, key: &str) -> String {
    cell.get(key).map(display_value).unwrap_or_default()
}

/// `key: value` pairs of `cell` whose value is not the same in every cell
///
/// Keys are sorted, values are truncated and padded so lines of one matrix
/// line up.
pub fn config_info(matrix: &[Cell], cell: &Cell) -> String {
    let mut keys: Vec<&str> = cell
        .iter()
        .map(|(key, _)| key)
        .filter(|key| values_differ(matrix, key))
        .collect();
    keys.sort_unstable();

    keys.into_iter()
        .map(|key| {
            let widest = matrix
                .iter()
                .map(|other| shown(other, key).chars().count())
                .max()
                .unwrap_or(0);
            let width = widest.min(INFO_MAX_CHARACTERS);
            let value = truncate(&shown(cell, key), INFO_MAX_CHARACTERS);
            format!("{}: {:<width$}", key, value, width = width)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Progress line: colored state word followed by the interesting config
pub fn info_line(state: CellState, cell: &Cell, matrix: &[Cell], color: bool) -> String {
    format!(
        "{} {}",
        colorize(state_color(state), state.label(), color),
        config_info(matrix, cell)
    )
}

/// Line naming the config keys that are not acted upon
pub fn ignoring(keys: &[String]) -> Option<String> {
    if keys.is_empty() {
        None
    } else {
        Some(format!("Ignoring: {}", keys.join(", ")))
    }
}
