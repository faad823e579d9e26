use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::callbacks::Callbacks;
use crate::commands::Context;
use crate::error::Result;
use crate::guard::{Ports, TabGuard};
use crate::host::Host;
use crate::identity::TabId;
use crate::output::{self, Format};
use crate::schedule::ThreadScheduler;

/// How often the foreground loop checks whether it should exit.
const IDLE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Tab id to use instead of a generated one.
    pub id: Option<String>,
    /// Leave after this long; run until the host closes otherwise.
    pub duration: Option<Duration>,
    /// Take leadership right after starting.
    pub claim: bool,
}

/// A host for a terminal process. Policy actions are printed; redirect and
/// close both end the run.
struct ConsoleHost {
    url: String,
    format: Format,
    closed: AtomicBool,
}

impl ConsoleHost {
    fn new(url: String, format: Format) -> Self {
        Self {
            url,
            format,
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, action: &str, detail: &str) {
        match self.format {
            Format::Json => println!(
                "{}",
                serde_json::json!({ "host": action, "detail": detail })
            ),
            Format::Pretty => println!("{} {}", format!("{action}:").yellow().bold(), detail),
            Format::Minimal => println!("{action} {detail}"),
        }
    }
}

impl Host for ConsoleHost {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn user_agent(&self) -> String {
        format!("solotab/{}", env!("CARGO_PKG_VERSION"))
    }

    fn alert(&self, message: &str) {
        self.report("alert", message);
    }

    fn redirect(&self, url: &str) {
        self.report("redirect", url);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.report("close", "");
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hold one tab open, printing every transition, then leave cleanly.
pub fn run(ctx: &Context, opts: RunOptions) -> Result<()> {
    let storage = ctx.open_storage()?;
    let scheduler = ThreadScheduler::spawn("solotab-tab")?;
    let url = ctx
        .config
        .url
        .clone()
        .unwrap_or_else(|| format!("file://{}", ctx.dir.display()));
    let host = Arc::new(ConsoleHost::new(url, ctx.format));
    let ports = Ports::new(storage, scheduler).with_host(host.clone());

    let id = opts.id.map(TabId::from).unwrap_or_else(TabId::generate);
    let guard = TabGuard::with_id(id, ctx.config.clone(), Callbacks::new(), ports);
    let format = ctx.format;
    guard.add_observer(move |event| {
        if let Err(e) = output::print_event(event, format) {
            log::warn!("could not print event: {e}");
        }
    });

    guard.start()?;
    if opts.claim {
        guard.force_claim();
    }

    let started = Instant::now();
    while !host.is_closed() {
        if opts.duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(IDLE_TICK);
    }

    let status = guard.status();
    guard.destroy();
    match format {
        Format::Json => println!("{}", serde_json::to_string(&status)?),
        Format::Pretty => println!(
            "{} {} ({})",
            "left".dimmed(),
            status.tab_id.cyan().bold(),
            status.state
        ),
        Format::Minimal => println!("{} {}", status.tab_id, status.state),
    }
    Ok(())
}
