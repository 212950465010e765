//! Print the linux-gpib library version through a device session.
//!
//! Usage:
//! ```bash
//! cargo run --example controller_version --features hardware
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_gpib::logging::{self, LoggingConfig};
use async_gpib::{GpibDriver, GpibSession, LinuxGpib, MockDriver};
use futures::FutureExt;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig::new("info"))?;

    let driver: Arc<dyn GpibDriver> = if std::env::var("GPIB_DEMO_MOCK").is_ok() {
        Arc::new(MockDriver::new())
    } else {
        Arc::new(LinuxGpib)
    };

    let device = GpibSession::device(0, 22).build(driver)?;
    let version = device
        .with_connection(|session| async move { session.version().await }.boxed())
        .await?;
    println!("Controller version: {}", version);
    Ok(())
}
