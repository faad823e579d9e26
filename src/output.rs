use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::callbacks::GuardEvent;
use crate::error::Result;
use crate::model::{TabMap, TabRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// A registry record as printed by `list`: the record plus its age and
/// whether it still counts as live.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabListing<'a> {
    #[serde(flatten)]
    pub record: &'a TabRecord,
    pub live: bool,
    pub age_ms: i64,
}

impl<'a> TabListing<'a> {
    pub fn new(record: &'a TabRecord, now: DateTime<Utc>, timeout_ms: u64) -> Self {
        Self {
            record,
            live: record.is_live(now, timeout_ms),
            age_ms: record.age_ms(now),
        }
    }
}

pub fn truncate_id(id: &str, max_len: usize) -> String {
    if id.chars().count() > max_len {
        let truncated: String = id.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    } else {
        id.to_string()
    }
}

pub fn print_tab(listing: &TabListing<'_>, format: Format) -> Result<()> {
    let record = listing.record;
    match format {
        Format::Json => println!("{}", serde_json::to_string(listing)?),
        Format::Pretty => {
            let status = if !listing.live {
                "expired".red()
            } else if record.is_active_flag {
                "active".green().bold()
            } else {
                "standby".yellow()
            };
            println!("{} ({})", format!("[{}]", record.id).cyan().bold(), status);
            println!(
                "  {} {} | {} {} | {} {}ms",
                "seq:".dimmed(),
                record.seq,
                "epoch:".dimmed(),
                record.epoch,
                "age:".dimmed(),
                listing.age_ms
            );
            if !record.url.is_empty() {
                println!("  {} {}", "url:".dimmed(), record.url);
            }
            println!(
                "  {} {}",
                "created:".dimmed(),
                record.created_at.format("%Y-%m-%d %H:%M:%S%.3f")
            );
        }
        Format::Minimal => println!("{}", minimal_row(listing)),
    }
    Ok(())
}

fn minimal_row(listing: &TabListing<'_>) -> String {
    let record = listing.record;
    let flag = match (listing.live, record.is_active_flag) {
        (false, _) => "expired",
        (true, true) => "active",
        (true, false) => "standby",
    };
    format!(
        "{:24} {:>4} {:>5} {:8} {:>7}",
        truncate_id(&record.id, 24),
        record.seq,
        record.epoch,
        flag,
        listing.age_ms
    )
}

pub fn print_tabs(tabs: &TabMap, now: DateTime<Utc>, timeout_ms: u64, format: Format) -> Result<()> {
    let listings: Vec<TabListing<'_>> = tabs
        .values()
        .map(|record| TabListing::new(record, now, timeout_ms))
        .collect();
    match format {
        Format::Json => println!("{}", serde_json::to_string(&listings)?),
        Format::Pretty => {
            if listings.is_empty() {
                println!("{}", "No tabs registered.".dimmed());
            }
            for listing in &listings {
                print_tab(listing, Format::Pretty)?;
                println!();
            }
        }
        Format::Minimal => {
            println!(
                "{:24} {:>4} {:>5} {:8} {:>7}",
                "ID", "SEQ", "EPOCH", "STATE", "AGE_MS"
            );
            println!("{}", "-".repeat(52));
            for listing in &listings {
                println!("{}", minimal_row(listing));
            }
        }
    }
    Ok(())
}

/// One event per line; JSON mode emits NDJSON so `run` and `watch` output
/// can be streamed.
pub fn print_event(event: &GuardEvent, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(event)?),
        Format::Pretty => {
            let name = event.name();
            let label = match event {
                GuardEvent::Activated { .. } => name.green().bold(),
                GuardEvent::Conflict { .. } | GuardEvent::Error { .. } => name.red().bold(),
                GuardEvent::Deactivated { .. } => name.yellow().bold(),
                _ => name.cyan(),
            };
            println!("{} {}", label, describe(event).dimmed());
        }
        Format::Minimal => println!("{} {}", event.name(), describe(event)),
    }
    Ok(())
}

fn describe(event: &GuardEvent) -> String {
    match event {
        GuardEvent::Activated { tab_id } | GuardEvent::Deactivated { tab_id } => tab_id.clone(),
        GuardEvent::Conflict { tab_id, winner } => format!("{tab_id} yields to {}", winner.id),
        GuardEvent::TabAdded { id, .. } | GuardEvent::TabRemoved { id } => id.clone(),
        GuardEvent::TabsChanged { tabs } => format!("{} live", tabs.len()),
        GuardEvent::VisibilityChanged { visible: true } => "visible".to_string(),
        GuardEvent::VisibilityChanged { visible: false } => "hidden".to_string(),
        GuardEvent::Error { context, message } => format!("{context}: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TabId;
    use chrono::Duration;

    #[test]
    fn listing_flattens_record() {
        let now = Utc::now();
        let mut record = TabRecord::new(&TabId::from("tab_a"), now, "https://app.test/", "ua");
        record.last_heartbeat = now - Duration::milliseconds(6000);
        let listing = TabListing::new(&record, now, 5000);
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["id"], "tab_a");
        assert_eq!(value["live"], false);
        assert_eq!(value["ageMs"], 6000);
        assert!(value.get("record").is_none());
    }

    #[test]
    fn truncate_long_ids() {
        assert_eq!(truncate_id("short", 24), "short");
        assert_eq!(truncate_id("abcdefghij", 8), "abcde...");
    }
}
