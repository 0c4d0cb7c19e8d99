//! Rendering of results for the terminal

use anyhow::Result;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    #[default]
    Json,
    /// Human-readable table
    Table,
}

/// Render an arbitrary call result.
pub fn render(value: &Value, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Table => Ok(value_table(value)),
    }
}

/// Render the `[{"result", "error"}]` pairs of a bulk job.
pub fn render_bulk(results: &Value, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(results)?),
        OutputFormat::Table => Ok(bulk_table(results)),
    }
}

/// Render a `daemon.status` payload.
pub fn render_status(status: &Value, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(status)?),
        OutputFormat::Table => Ok(status_table(status)),
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table
}

/// Strings print bare, everything else as compact JSON.
fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_table(value: &Value) -> String {
    match value {
        Value::Array(rows) if !rows.is_empty() && rows.iter().all(Value::is_object) => {
            let mut columns: Vec<&str> = Vec::new();
            for row in rows.iter().filter_map(Value::as_object) {
                for key in row.keys() {
                    if !columns.contains(&key.as_str()) {
                        columns.push(key);
                    }
                }
            }

            let mut table = new_table();
            table.set_header(columns.iter().map(Cell::new));
            for row in rows {
                table.add_row(
                    columns
                        .iter()
                        .map(|c| Cell::new(cell_text(row.get(*c).unwrap_or(&Value::Null)))),
                );
            }
            table.to_string()
        }
        Value::Array(items) => {
            let mut table = new_table();
            table.set_header(vec!["#", "value"]);
            for (i, item) in items.iter().enumerate() {
                table.add_row(vec![Cell::new(i), Cell::new(cell_text(item))]);
            }
            table.to_string()
        }
        Value::Object(map) => {
            let mut table = new_table();
            table.set_header(vec!["key", "value"]);
            for (key, item) in map {
                table.add_row(vec![Cell::new(key), Cell::new(cell_text(item))]);
            }
            table.to_string()
        }
        scalar => cell_text(scalar),
    }
}

fn error_text(error: &Value) -> String {
    match error.get("message").and_then(Value::as_str) {
        Some(message) => {
            let reason = error
                .get("data")
                .and_then(|d| d.get("reason"))
                .and_then(Value::as_str);
            match reason {
                Some(reason) => format!("{}: {}", message, reason.trim()),
                None => message.to_string(),
            }
        }
        None => cell_text(error),
    }
}

fn bulk_table(results: &Value) -> String {
    let mut table = new_table();
    table.set_header(vec!["#", "result", "error"]);
    for (i, pair) in results.as_array().into_iter().flatten().enumerate() {
        let result = pair.get("result").map(cell_text).unwrap_or_default();
        let error = pair
            .get("error")
            .filter(|e| !e.is_null())
            .map(error_text)
            .unwrap_or_default();
        table.add_row(vec![Cell::new(i), Cell::new(result), Cell::new(error)]);
    }
    table.to_string()
}

fn status_table(status: &Value) -> String {
    let mut daemon = new_table();
    daemon.set_header(vec!["pid", "version", "started", "uptime (s)"]);
    daemon.add_row(vec![
        cell_text(&status["pid"]),
        cell_text(&status["version"]),
        cell_text(&status["started_at"]),
        cell_text(&status["uptime_secs"]),
    ]);

    let sessions = status["sessions"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if sessions.is_empty() {
        return format!("{}\nNo open sessions", daemon);
    }

    let mut table = new_table();
    table.set_header(vec![
        "server",
        "opened",
        "pending calls",
        "operations",
        "tracked jobs",
        "daemon jobs",
        "pending actions",
    ]);
    for session in sessions {
        table.add_row(vec![
            cell_text(&session["server"]),
            cell_text(&session["opened_at"]),
            cell_text(&session["pending_calls"]),
            cell_text(&session["operations"]),
            cell_text(&session["tracked_jobs"]),
            cell_text(&session["daemon_jobs"]),
            cell_text(&session["pending_actions"]),
        ]);
    }
    format!("{}\n{}", daemon, table)
}
