use anyhow::{bail, Context, Result};
use clap::Parser;
use shimmer_link::domain::settings::{DeviceSettings, SettingsService, TransportKind};
use shimmer_link::infrastructure::logging::init_logger;
use shimmer_link::{ChannelFactory, SensorService, SessionEvent};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "shimmer-link",
    version,
    about = "Connect to a Shimmer sensor and stream decoded samples",
    long_about = "Connect to a Shimmer sensor over serial, Bluetooth RFCOMM or a WebSocket relay.\n\
                  Relay sessions stream decoded samples to stdout as JSON lines until Ctrl-C.\n\
                  Serial and Bluetooth links need a firmware driver and are only checked."
)]
struct Cli {
    /// Settings file (default: <config dir>/ShimmerLink/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// serial | bluetooth | relay
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Serial port, Bluetooth MAC or ws://host:port/path
    #[arg(long)]
    target: Option<String>,

    /// Open the link once and report, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = match &args.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Settings: {}", settings.path().display());

    let mut device = settings.get().device.clone();
    if let Some(transport) = args.transport {
        device.transport = transport;
    }
    if let Some(target) = args.target {
        device.target = target;
    }
    if device.target.trim().is_empty() {
        bail!(
            "no target configured; pass --target or set device.target in {}",
            settings.path().display()
        );
    }

    let factory = ChannelFactory::new(tokio::runtime::Handle::current());

    if args.check || device.transport != TransportKind::Relay {
        check_link(factory, device.clone()).await?;
    } else {
        stream(factory, device.clone()).await?;
    }

    if let Err(e) = settings.add_known_device(&device.target) {
        warn!("Could not remember {}: {}", device.target, e);
    }
    Ok(())
}

/// Open the configured channel once and close it again.
async fn check_link(factory: ChannelFactory, device: DeviceSettings) -> Result<()> {
    let target = device.target.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut channel = factory.channel(&device)?;
        channel.open()?;
        info!("Link to {} is up", channel.target());
        channel.close();
        Ok(())
    })
    .await
    .context("link check task failed")?
    .with_context(|| format!("link check for {} failed", target))?;

    println!("{} reachable", target);
    Ok(())
}

async fn stream(factory: ChannelFactory, device: DeviceSettings) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Status(status) => debug!("Status: {:?}", status),
                SessionEvent::Log(message) => {
                    info!("[{:?}] {}", message.severity, message.message)
                }
                SessionEvent::BoardDetected(board) => {
                    info!("Board: {:?} ({:?})", board.kind, board.raw_id)
                }
                SessionEvent::ConfigChanged(cfg) => info!("Relay config: {}", cfg),
            }
        }
    });

    let mut service = SensorService::new(device, factory, events_tx);
    let mut samples = service.subscribe();

    service.connect().await.context("connect failed")?;
    if let Err(e) = service.start_streaming().await {
        service.disconnect().await;
        return Err(e).context("start streaming failed");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            sample = samples.receiver.recv() => match sample {
                Some(sample) => println!("{}", serde_json::to_string(&sample)?),
                None => break,
            }
        }
    }

    service.stop_streaming().await;
    service.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let cli = Cli::try_parse_from([
            "shimmer-link",
            "--transport",
            "ws",
            "--target",
            "ws://10.0.0.2:8765/relay",
            "--check",
        ])
        .unwrap();
        assert_eq!(cli.transport, Some(TransportKind::Relay));
        assert_eq!(cli.target.as_deref(), Some("ws://10.0.0.2:8765/relay"));
        assert!(cli.check);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Cli::try_parse_from(["shimmer-link", "--target"]).is_err());
        assert!(Cli::try_parse_from(["shimmer-link", "--transport", "usb"]).is_err());
        assert!(Cli::try_parse_from(["shimmer-link", "--verbose"]).is_err());

        let bare = Cli::try_parse_from(["shimmer-link"]).unwrap();
        assert!(bare.transport.is_none() && bare.target.is_none() && !bare.check);
    }
}
