//! CLI presentation: text tables and JSON for inspector views.

use crate::effect::Desired;
use crate::error::EngineError;
use crate::memo::MemoEntry;
use crate::store::{ScopeRecord, TrackedEffect};
use chrono::{DateTime, Utc};
use comfy_table::Table;
use serde::Serialize;
use serde_json::{json, Value};

/// Record counts per keyspace, in display order.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub store: String,
    pub counts: Vec<(String, usize)>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string_pretty(value).map_err(|e| EngineError::Codec {
        context: "cli output".to_string(),
        message: e.to_string(),
    })
}

fn timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(header);
    table
}

fn state_text(state: &Desired<Value>) -> String {
    match state {
        Desired::Exists(value) => value.to_string(),
        Desired::NonExistence => "<absent>".to_string(),
    }
}

pub fn format_status(view: &StatusView, format: &str) -> Result<String, EngineError> {
    if format == "json" {
        let counts: serde_json::Map<String, Value> = view
            .counts
            .iter()
            .map(|(name, n)| (name.clone(), json!(n)))
            .collect();
        return to_json(&json!({ "store": view.store, "counts": counts }));
    }
    let mut table = table(vec!["Keyspace", "Records"]);
    for (name, n) in &view.counts {
        table.add_row(vec![name.clone(), n.to_string()]);
    }
    Ok(format!("Store: {}\n{}", view.store, table))
}

pub fn format_scopes(records: &[ScopeRecord], format: &str) -> Result<String, EngineError> {
    if format == "json" {
        return to_json(&records);
    }
    if records.is_empty() {
        return Ok("No scope records.".to_string());
    }
    let mut table = table(vec!["Path", "Memo Entries", "Effects", "Updated"]);
    for r in records {
        table.add_row(vec![
            r.path.to_string(),
            r.memo_keys.len().to_string(),
            r.effect_keys.len().to_string(),
            timestamp(r.updated_at_ms),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_effects(effects: &[TrackedEffect], format: &str) -> Result<String, EngineError> {
    if format == "json" {
        return to_json(&effects);
    }
    if effects.is_empty() {
        return Ok("No tracked effects.".to_string());
    }
    let mut table = table(vec!["Provider", "Key", "Owner", "State", "Pending"]);
    for e in effects {
        let states: Vec<String> = e.possible_states.iter().map(state_text).collect();
        table.add_row(vec![
            e.key.provider.clone(),
            e.key.instance.clone(),
            e.owner.to_string(),
            states.join(" | "),
            if e.pending { "yes" } else { "no" }.to_string(),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_memo(path: &str, entries: &[MemoEntry], format: &str) -> Result<String, EngineError> {
    if format == "json" {
        return to_json(&entries);
    }
    if entries.is_empty() {
        return Ok(format!("No memo entries for {}.", path));
    }
    let mut table = table(vec!["Function", "Memo Key", "Logic", "Input", "States", "Committed"]);
    for e in entries {
        table.add_row(vec![
            e.function.clone(),
            e.memo_key.short(),
            e.logic_fingerprint.short(),
            e.input_fingerprint.short(),
            e.states.len().to_string(),
            timestamp(e.committed_at_ms),
        ]);
    }
    Ok(table.to_string())
}
