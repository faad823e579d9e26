use chrono::Utc;

use crate::commands::Context;
use crate::error::Result;
use crate::output;

pub fn run(ctx: &Context, all: bool) -> Result<()> {
    let registry = ctx.registry()?;
    let now = Utc::now();
    let timeout = ctx.config.tab_timeout_ms;
    let mut tabs = registry.get_all();
    if !all {
        tabs.retain(|_, record| record.is_live(now, timeout));
    }
    output::print_tabs(&tabs, now, timeout, ctx.format)
}
