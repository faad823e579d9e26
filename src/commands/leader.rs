use chrono::Utc;
use colored::Colorize;

use crate::commands::Context;
use crate::election;
use crate::error::Result;
use crate::output::Format;

/// Report which live tab every participant would elect right now.
pub fn run(ctx: &Context) -> Result<()> {
    let registry = ctx.registry()?;
    let now = Utc::now();
    let mut live = registry.get_all();
    live.retain(|_, record| record.is_live(now, ctx.config.tab_timeout_ms));
    let leader = election::winner(live.values());
    match ctx.format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "leader": leader, "live": live.len() })
        ),
        Format::Pretty => match leader {
            Some(record) => {
                println!("Leader: {}", record.id.cyan().bold());
                println!(
                    "  {} {} | {} {} | {} {}",
                    "seq:".dimmed(),
                    record.seq,
                    "epoch:".dimmed(),
                    record.epoch,
                    "live tabs:".dimmed(),
                    live.len()
                );
            }
            None => println!("{}", "No live tabs.".dimmed()),
        },
        Format::Minimal => {
            if let Some(record) = leader {
                println!("{}", record.id);
            }
        }
    }
    Ok(())
}
