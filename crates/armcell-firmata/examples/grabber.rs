//! Sweep a grabber servo while watching the gripper pressure sensor.
//!
//! Board settings come from `armcell.toml` (or `ARMCELL__BOARD__*`
//! environment variables); see the `[board]` section of the configuration.

use std::time::Duration;

use anyhow::Context;
use armcell_core::config::ConfigBuilder;
use armcell_firmata::{BoardBuilder, PinValue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    armcell_core::logging::init().ok();

    let config = ConfigBuilder::new()
        .with_config_file("armcell.toml")
        .with_environment_prefix("armcell")
        .build()?;

    let board = BoardBuilder::from_config(&config.board)?
        .open()
        .await
        .context("failed to open the board")?;
    board.start_polling()?;

    let servo = board.get_pin("d:9:s")?;
    let pressure = board.get_pin("a:0")?;
    pressure.set_callback(|value| {
        if let PinValue::Analog(v) = value {
            println!("pressure: {:.4}", v);
        }
    });

    for angle in [0u16, 45, 90, 45, 0] {
        servo.write(PinValue::Angle(angle))?;
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    board.close().await?;
    Ok(())
}
