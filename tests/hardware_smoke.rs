#![cfg(feature = "hardware_tests")]

use std::time::Duration;

use anyhow::{Context, Result};
use async_gpib::{GpibSession, Timeout};
use tokio::time::timeout;

/// Real-board smoke test.
///
/// Run with:
/// `GPIB_SMOKE_TEST=1 GPIB_SMOKE_PAD=22 cargo test --test hardware_smoke --features hardware_tests -- --nocapture`
#[tokio::test(flavor = "multi_thread")]
async fn gpib_hardware_smoke() -> Result<()> {
    if std::env::var("GPIB_SMOKE_TEST").unwrap_or_default() != "1" {
        eprintln!("Skipping gpib_hardware_smoke (set GPIB_SMOKE_TEST=1 to enable real board check)");
        return Ok(());
    }
    let pad: u8 = std::env::var("GPIB_SMOKE_PAD")
        .unwrap_or_else(|_| "22".to_string())
        .parse()
        .context("GPIB_SMOKE_PAD must be 0..=30")?;

    let board = GpibSession::board(0).with_timeout(Timeout::T1s).build_linux()?;
    board.connect().await.context("open board 0")?;
    println!("libgpib version: {}", board.version().await?);
    println!("bus lines: {:?}", board.lines().await?);
    println!("listener at {}: {}", pad, board.listener(pad, None).await?);
    board.disconnect().await?;

    let device = GpibSession::device(0, pad)
        .with_timeout(Timeout::T3s)
        .build_linux()?;
    device.connect().await.context("open device")?;
    device.write(b"*IDN?\n").await.context("write *IDN?")?;
    let reply = timeout(Duration::from_secs(5), device.read(256))
        .await
        .context("read did not finish")??;
    println!("*IDN? -> {}", String::from_utf8_lossy(&reply).trim_end());
    device.disconnect().await?;
    Ok(())
}
