use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

/// Console logging for the CLI and the server. Degraded pipeline steps
/// log at warn and are always visible; --verbose adds the debug-level
/// tier transitions.
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let _ = fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .try_init();
    Ok(())
}
