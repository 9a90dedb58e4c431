use motionmount::{
    ConnectionState, MotionMount, MountConfig, MountEvent, Permission, Result,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Usage: `monitor <address> [pin]`
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📺 MotionMount Monitor Example");

    let mut args = std::env::args().skip(1);
    let Some(address) = args.next() else {
        error!("❌ Usage: monitor <address> [pin]");
        return Ok(());
    };
    let mut config = MountConfig::new(address);
    if let Some(pin) = args.next().and_then(|p| p.parse().ok()) {
        config = config.with_pin(pin, Permission::ControlOnly);
    }

    let mount = MotionMount::ble(config).await?;
    let mut events = mount.subscribe();

    match mount.connect().await {
        Ok(()) => info!("✅ Connected"),
        Err(e) => warn!("❌ First connection attempt failed, retrying in background: {}", e),
    }

    if mount.is_ready().await {
        let state = mount.state().await;
        println!("\n📺 {}", state.name);
        println!("┌─────────────────────────────────────────┐");
        println!("│ Distance: {:3}%  Rotation: {:4}%        │", state.distance, state.rotation);
        println!("│ TV width: {:3} cm                        │", state.tv_width_cm);
        println!("│ Auto-move: {:28} │", format!("{:?}", state.auto_move));
        println!("│ MCP firmware: {:25} │", state.versions.mcp_firmware);
        println!("└─────────────────────────────────────────┘");

        for preset in mount.presets().await {
            println!(
                "  [{}] {} ({}%, {}%)",
                preset.slot_index, preset.name, preset.distance, preset.rotation
            );
        }
    }

    info!("🔍 Watching for changes, press Ctrl+C to stop");
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };

        match event {
            Ok(MountEvent::PositionChanged { distance, rotation }) => {
                println!("↔️  distance {distance:3}%, rotation {rotation:4}%");
            }
            Ok(MountEvent::ConnectionChanged(snapshot)) => {
                if snapshot.state == ConnectionState::Ready {
                    info!("✅ Ready ({:?})", snapshot.protocol_variant);
                } else if snapshot.state == ConnectionState::Disconnected {
                    warn!("🔌 Disconnected ({:?})", snapshot.last_error);
                }
            }
            Ok(MountEvent::ReconnectScheduled(delay)) => {
                info!("⏳ Reconnecting in {:?}", delay);
            }
            Ok(MountEvent::AuthenticationRejected(level)) => {
                warn!("🔒 {} PIN rejected", level);
            }
            Ok(MountEvent::PresetChanged(preset)) => {
                println!("⭐ preset {} is now {:?}", preset.slot_index, preset.name);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }

    info!("🔌 Disconnecting...");
    mount.disconnect().await?;
    info!("🎉 Monitoring completed!");
    Ok(())
}
