use anyhow::{Context, Result};
use atorch_link::domain::codec::{AtorchCodec, FrameCodec};
use atorch_link::domain::models::ConnectionStatus;
use atorch_link::domain::packet::MeterCommand;
use atorch_link::domain::settings::{Settings, SettingsService};
use atorch_link::infrastructure::bluetooth::loopback::LoopbackDevice;
use atorch_link::infrastructure::bluetooth::transport::Scanner;
use atorch_link::infrastructure::bluetooth::Session;
use atorch_link::infrastructure::logging;
use atorch_link::presentation::cli::{Cli, Command, DiscoveryArgs, SendArgs};
use atorch_link::presentation::dump;
use atorch_link::presentation::output::{self, OutputFormat};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_service = match &cli.config {
        Some(path) => SettingsService::load(path.clone())?,
        None => SettingsService::new()?,
    };
    let mut settings = settings_service.get().clone();
    settings.json_output |= cli.json;

    let _logging_guard = logging::init_logger(&settings.log_settings, cli.verbose)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Settings loaded from {}", settings_service.path().display());

    let format = OutputFormat::from_flag(settings.json_output);
    match cli.command {
        Command::Watch(args) => watch(&settings, &args, format).await,
        Command::Send(args) => send(&settings, &args).await,
        Command::Replay { file } => replay(&file, format).await,
        Command::Decode { frame } => decode(&frame, format),
    }
}

fn discovery_timeout(settings: &Settings, args: &DiscoveryArgs) -> Duration {
    Duration::from_millis(args.timeout_ms.unwrap_or(settings.discovery_timeout_ms))
}

/// Discover a meter; a timeout ends the process without rescanning
async fn request_session(settings: &Settings, args: &DiscoveryArgs) -> Result<Session> {
    let mut scanner = platform_scanner().await?;
    let session = Session::request_device(
        scanner.as_mut(),
        discovery_timeout(settings, args),
        AtorchCodec,
    )
    .await
    .context("Discovery failed")?;
    Ok(session)
}

#[cfg(windows)]
async fn platform_scanner() -> Result<Box<dyn Scanner>> {
    Ok(Box::new(
        atorch_link::infrastructure::bluetooth::winrt::WinRtScanner::new(),
    ))
}

#[cfg(all(not(windows), feature = "btleplug"))]
async fn platform_scanner() -> Result<Box<dyn Scanner>> {
    let scanner = atorch_link::infrastructure::bluetooth::btle::BtleScanner::first_adapter().await?;
    Ok(Box::new(scanner))
}

#[cfg(all(not(windows), not(feature = "btleplug")))]
async fn platform_scanner() -> Result<Box<dyn Scanner>> {
    anyhow::bail!("No BLE backend on this platform; rebuild with `--features btleplug`")
}

/// Print every packet and failure until the link drops or Ctrl-C
async fn watch(settings: &Settings, args: &DiscoveryArgs, format: OutputFormat) -> Result<()> {
    let mut session = request_session(settings, args).await?;

    let _packets = session.on_packet(move |packet| {
        println!("{}", output::format_packet(packet, format));
    });
    let _failures = session.on_failed(move |frame| {
        println!("{}", output::format_failure(frame, format));
    });
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let _disconnected = session.on_disconnected(move |_| {
        let _ = done_tx.send(());
    });

    session.connect().await.context("Failed to connect")?;
    info!("Watching {}", session.device().name);

    tokio::select! {
        _ = done_rx.recv() => info!("Meter disconnected"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    if session.status() == ConnectionStatus::Connected {
        session.disconnect().await;
    }
    Ok(())
}

async fn send(settings: &Settings, args: &SendArgs) -> Result<()> {
    let device_type = args.device.map(Into::into).unwrap_or(settings.device_type);
    let frame = MeterCommand::from(args.command).to_frame(device_type);

    let mut session = request_session(settings, &args.discovery).await?;
    session.connect().await.context("Failed to connect")?;

    let result = session.send_command(&frame).await;
    session.disconnect().await;
    result.context("Failed to send command")?;

    info!("Sent {:?} ({})", args.command, hex::encode_upper(&frame));
    Ok(())
}

/// Push a captured fragment dump through a loopback session
async fn replay(file: &Path, format: OutputFormat) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let fragments = dump::parse_dump(&text)?;

    let (device, link) = LoopbackDevice::new("replay");
    let mut session = Session::new(device, AtorchCodec);

    let packets = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&packets);
    let _packets = session.on_packet(move |packet| {
        counter.fetch_add(1, Ordering::Relaxed);
        println!("{}", output::format_packet(packet, format));
    });
    let counter = Arc::clone(&failures);
    let _failures = session.on_failed(move |frame| {
        counter.fetch_add(1, Ordering::Relaxed);
        println!("{}", output::format_failure(frame, format));
    });
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let _disconnected = session.on_disconnected(move |_| {
        let _ = done_tx.send(());
    });

    session.connect().await?;
    for fragment in fragments.iter() {
        link.notify(fragment.clone());
    }
    link.drop_link();
    done_rx.recv().await;

    info!(
        "Replayed {} fragments: {} packets, {} failed frames",
        fragments.len(),
        packets.load(Ordering::Relaxed),
        failures.load(Ordering::Relaxed)
    );
    Ok(())
}

fn decode(frame: &str, format: OutputFormat) -> Result<()> {
    let bytes = hex::decode(frame.trim()).context("Frame is not valid hex")?;
    let packet = AtorchCodec
        .decode(&bytes)
        .with_context(|| format!("Failed to decode {}", hex::encode_upper(&bytes)))?;
    println!("{}", output::format_packet(&packet, format));
    Ok(())
}
