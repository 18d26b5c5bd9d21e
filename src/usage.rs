use crate::datam::Usage;
use crate::error::CoreError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use uuid::Uuid;

/// Everything recorded for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub task_label: String,
    pub model_name: String,
    pub events: Vec<Usage>,
}

/// Day -> Hour -> request id -> entry. `BTreeMap` keeps days and hours sorted.
pub type UsageLedger = BTreeMap<String, BTreeMap<String, BTreeMap<String, LedgerEntry>>>;

fn record(ledger: &mut UsageLedger, at: DateTime<Utc>, id: Uuid, usage: &Usage, label: &str, model_name: &str) {
    let entry = ledger
        .entry(at.format("%Y-%m-%d").to_string())
        .or_default()
        .entry(at.format("%H:00").to_string())
        .or_default()
        .entry(id.to_string())
        .or_default();
    entry.task_label = label.to_string();
    entry.model_name = model_name.to_string();
    entry.events.push(usage.clone());
}

/// Appends one usage event to `<usage_dir>/usage.json`, creating it if needed.
pub fn log_usage_turn(
    usage_dir: &Path,
    id: Uuid,
    turn_usage: &Usage,
    label: &str,
    model_name: &str,
) -> Result<(), CoreError> {
    fs::create_dir_all(usage_dir)?;
    let usage_file_path = usage_dir.join("usage.json");

    let mut ledger: UsageLedger = match fs::read_to_string(&usage_file_path) {
        Ok(contents) => serde_json::from_str(&contents)?,
        Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e.into()),
    };

    record(&mut ledger, Utc::now(), id, turn_usage, label, model_name);

    fs::write(&usage_file_path, serde_json::to_string_pretty(&ledger)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_for_one_request_accumulate_under_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            cost: None,
        };
        log_usage_turn(dir.path(), id, &usage, "numerical", "llama-3.1-8b-instant").unwrap();
        log_usage_turn(dir.path(), id, &usage, "numerical", "llama-3.1-8b-instant").unwrap();

        let raw = fs::read_to_string(dir.path().join("usage.json")).unwrap();
        let ledger: UsageLedger = serde_json::from_str(&raw).unwrap();
        let entries: Vec<&LedgerEntry> = ledger
            .values()
            .flat_map(|hours| hours.values())
            .flat_map(|ids| ids.values())
            .collect();
        assert!(!entries.is_empty());
        let total_events: usize = entries.iter().map(|e| e.events.len()).sum();
        assert_eq!(total_events, 2);
        assert!(entries.iter().all(|e| e.task_label == "numerical"));
    }
}
