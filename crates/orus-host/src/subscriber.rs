//! Optional `tracing` subscriber wiring. Library crates below this one never
//! install global state; a host that wants the `debug`/`trace` spans
//! `orus-vm`/`orus-compiler` emit (module load, call/return, try/catch
//! unwind) routed to stderr calls [`install_default`] once at startup.

use tracing_subscriber::EnvFilter;

/// Installs an `env_filter`-driven subscriber writing to stderr, honoring
/// `RUST_LOG` the way `tracing-subscriber`'s own default does. Returns an
/// error if a global subscriber is already set.
pub fn install_default() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
