use std::thread;
use std::time::Duration;

use crate::callbacks::Callbacks;
use crate::commands::Context;
use crate::error::Result;
use crate::guard::Ports;
use crate::observer::TabObserver;
use crate::output;
use crate::schedule::ThreadScheduler;

/// Report tabs coming and going for `duration`, without registering a tab.
pub fn run(ctx: &Context, duration: Duration) -> Result<()> {
    let storage = ctx.open_storage()?;
    let scheduler = ThreadScheduler::spawn("solotab-watch")?;
    let observer = TabObserver::new(
        ctx.config.clone(),
        Callbacks::new(),
        Ports::new(storage, scheduler),
    );
    let format = ctx.format;
    observer.add_observer(move |event| {
        if let Err(e) = output::print_event(event, format) {
            log::warn!("could not print event: {e}");
        }
    });
    observer.start()?;
    thread::sleep(duration);
    observer.destroy();
    Ok(())
}
