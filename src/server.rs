// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ─── External Crates ────────────────────────────────────────────────────────────
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use vivoh_stream_relay::config::{
    DEFAULT_ADDRESS, DEFAULT_HLS_DIR, DEFAULT_PORT, DEFAULT_SOURCE_URL, DEFAULT_TRANSCODER, DEFAULT_TTL,
};
use vivoh_stream_relay::launcher::transcoder_available;
use vivoh_stream_relay::serve::serve;
use vivoh_stream_relay::{
    classify, ControlService, HlsSettings, LaunchConfig, ProcessSupervisor, StopTimeouts, StreamDefaults,
    StreamLauncher,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "vsr-server", about = "Transcoder control server for UDP and HLS re-streaming")]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Default source when /start omits cdn_url
    #[arg(long, default_value = DEFAULT_SOURCE_URL)]
    pub source_url: String,

    /// Default destination when /start omits multicast_addr
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, default_value_t = DEFAULT_TTL)]
    pub ttl: u8,

    #[arg(long, default_value = DEFAULT_TRANSCODER)]
    pub transcoder: PathBuf,

    /// Also produce an HLS playlist served under /hls/
    #[arg(long)]
    pub hls: bool,

    #[arg(long, default_value = DEFAULT_HLS_DIR)]
    pub hls_dir: PathBuf,

    /// HLS segment length in seconds
    #[arg(long, default_value_t = 2)]
    pub hls_time: u32,

    #[arg(long, default_value_t = 5)]
    pub hls_list_size: u32,

    /// Open the host firewall for multicast (needs passwordless sudo)
    #[arg(long)]
    pub configure_firewall: bool,

    /// Liveness probe window after spawning, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub probe_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse CLI args
    let args = Args::parse();

    if !transcoder_available(&args.transcoder).await {
        error!(
            "{} is not installed. Please install it before running this server.",
            args.transcoder.display()
        );
        std::process::exit(1);
    }

    let hls = args.hls.then(|| HlsSettings {
        dir: args.hls_dir.clone(),
        segment_time: args.hls_time,
        list_size: args.hls_list_size,
    });
    let segment_dir = hls.as_ref().map(|h| h.dir.clone());
    let supervisor = Arc::new(ProcessSupervisor::new(StopTimeouts::default(), segment_dir));
    let launcher = StreamLauncher::new(
        LaunchConfig {
            transcoder: args.transcoder.clone(),
            hls,
            liveness_probe: Duration::from_millis(args.probe_ms),
            configure_firewall: args.configure_firewall,
        },
        supervisor,
    );
    let defaults = StreamDefaults {
        source_url: args.source_url.clone(),
        address: args.address.clone(),
        port: args.port,
        ttl: args.ttl,
    };
    let service = Arc::new(ControlService::new(launcher, defaults));

    info!("Video Streaming Server");
    info!("Default CDN URL: {}", args.source_url);
    info!("Default address: {}:{} ({})", args.address, args.port, classify(&args.address));
    info!("Default TTL: {}", args.ttl);
    info!("HLS output: {}", if args.hls { "enabled" } else { "disabled" });

    let listener = TcpListener::bind(args.listen).await?;
    info!("Control server listening on http://{}", args.listen);

    tokio::select! {
        _ = serve(listener, service.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested via Ctrl+C"),
    }

    service.shutdown().await;
    Ok(())
}
