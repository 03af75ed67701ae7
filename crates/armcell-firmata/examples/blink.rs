//! Blink the cell's status LED on digital pin 13.
//!
//! Opens the first serial port that looks like the controller, using the
//! classic Uno layout to skip capability discovery.

use std::time::Duration;

use anyhow::Context;
use armcell_firmata::{Board, Layout, PinAddress, PinMode, PinValue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    armcell_core::logging::init().ok();

    let board = Board::builder()
        .with_layout(Layout::uno())
        .open()
        .await
        .context("failed to open the board")?;
    board.start_polling()?;

    let led = board.acquire(PinAddress::digital(13), PinMode::Output)?;
    for _ in 0..10 {
        led.write(PinValue::Digital(true))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        led.write(PinValue::Digital(false))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    led.release();
    board.close().await?;
    Ok(())
}
