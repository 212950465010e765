//! Controller board functions: local lockout via REN.
//!
//! Asserts REN on board 0 for five seconds, then releases it so the
//! instruments on the bus return to local control.
//!
//! Usage:
//! ```bash
//! cargo run --example board_functions --features hardware
//! # without a board
//! GPIB_DEMO_MOCK=1 cargo run --example board_functions
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_gpib::logging::{self, LoggingConfig, OutputFormat};
use async_gpib::{GpibDriver, GpibSession, LinuxGpib, MockDriver};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&LoggingConfig::new("debug").with_format(OutputFormat::Compact))?;

    let driver: Arc<dyn GpibDriver> = if std::env::var("GPIB_DEMO_MOCK").is_ok() {
        Arc::new(MockDriver::new())
    } else {
        Arc::new(LinuxGpib)
    };

    // The primary address can be anything; no instrument needs to be present
    let device = GpibSession::device(0, 22).build(driver.clone())?;
    let board = GpibSession::board(0).build(driver)?;

    let result = async {
        board.connect().await.context("open board 0")?;
        board.remote_enable(true).await?;
        info!("REN asserted, front panels locked for 5 s");
        tokio::time::sleep(Duration::from_secs(5)).await;
        board.remote_enable(false).await?;
        info!(lines = ?board.lines().await?, "REN released");
        anyhow::Ok(())
    }
    .await;

    // Disconnecting is safe even if connect never happened or failed
    device.disconnect().await?;
    board.disconnect().await?;
    result
}
