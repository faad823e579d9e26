use chrono::Utc;
use colored::Colorize;

use crate::commands::Context;
use crate::error::Result;
use crate::output::Format;

/// Drop every record whose heartbeat is older than the tab timeout.
pub fn run(ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let pruned = registry.prune_expired(Utc::now(), ctx.config.tab_timeout_ms);
    match ctx.format {
        Format::Json => println!("{}", serde_json::json!({ "pruned": pruned })),
        Format::Pretty => {
            if pruned.is_empty() {
                println!("{}", "Nothing to prune.".dimmed());
            } else {
                println!("Pruned {} expired tab(s):", pruned.len().to_string().bold());
                for id in &pruned {
                    println!("  {}", id.cyan());
                }
            }
        }
        Format::Minimal => {
            for id in &pruned {
                println!("{id}");
            }
        }
    }
    Ok(())
}
