/// Build-time git commit SHA stamped by build.rs when available.
pub fn git_sha() -> Option<&'static str> {
    option_env!("SOLOTAB_BUILD_GIT_SHA")
}

/// Version string shown by `solotab --version`.
pub fn long_version() -> &'static str {
    match git_sha() {
        Some(sha) => {
            // Leaked once per process; clap wants a 'static str.
            let text = format!("{} ({})", env!("CARGO_PKG_VERSION"), &sha[..sha.len().min(12)]);
            Box::leak(text.into_boxed_str())
        }
        None => env!("CARGO_PKG_VERSION"),
    }
}
