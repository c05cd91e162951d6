//! DualLink desktop capture tool.
//!
//! Captures a screen or window through `duallink-capture-desktop` and logs
//! delivery statistics once per second.
//!
//! ```text
//! duallink-capture [params.json | '{"fps":60,"sourceType":"application"}']
//!
//! DUALLINK_CAPTURE_CONFIG   parameter file or inline JSON (when no argument)
//! DUALLINK_CAPTURE_MODE     raw | encoded                  (default raw)
//! DUALLINK_CAPTURE_DEVICE   synthetic | xshm               (default synthetic)
//! DUALLINK_CAPTURE_SECONDS  stop after this many seconds   (default: Ctrl+C)
//! DUALLINK_CAPTURE_SOURCE   capture the source whose title contains this
//! RUST_LOG                  log filter                     (default info)
//! ```

mod app;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("DualLink capture v{}", env!("CARGO_PKG_VERSION"));

    let options = app::CliOptions::from_env()?;
    if let Err(e) = app::run(options).await {
        error!("Capture failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
