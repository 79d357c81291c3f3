// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vivoh_stream_relay::capture::{Capture, CaptureConfig, CaptureMode};
use vivoh_stream_relay::Error;

#[derive(Parser, Debug)]
#[command(name = "vsr-capture")]
#[command(about = "Writes received broadcast or multicast UDP datagrams to a capture file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Listen for broadcast datagrams
    Broadcast(Common),
    /// Join a multicast group and listen on it
    Multicast {
        #[arg(short, long, default_value = "239.255.0.1")]
        group: Ipv4Addr,

        #[command(flatten)]
        common: Common,
    },
}

#[derive(Args, Debug)]
struct Common {
    #[arg(short, long, default_value_t = 1234)]
    port: u16,

    /// Directory the capture file is written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Receive timeout before a progress notice, in seconds
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let (mode, common) = match cli.mode {
        Mode::Broadcast(common) => (CaptureMode::Broadcast, common),
        Mode::Multicast { group, common } => (CaptureMode::Multicast { group }, common),
    };

    info!("Hostname: {}", hostname());
    match mode {
        CaptureMode::Broadcast => info!("Capturing broadcast traffic on port {}", common.port),
        CaptureMode::Multicast { group } => info!("Capturing multicast group {}:{}", group, common.port),
    }
    info!("Platform: {}", std::env::consts::OS);

    let config = CaptureConfig {
        mode,
        port: common.port,
        output_dir: common.output_dir,
        recv_timeout: Duration::from_secs(common.timeout_secs),
    };

    let capture = match Capture::bind(config) {
        Ok(capture) => capture,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    capture
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn hostname() -> String {
    #[cfg(unix)]
    if let Ok(name) = nix::unistd::gethostname() {
        return name.to_string_lossy().into_owned();
    }
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Cli::try_parse_from(["vsr-capture", "broadcast", "--timeout-secs", "0"]).is_err());

        let cli = Cli::try_parse_from(["vsr-capture", "multicast", "--group", "239.255.42.7", "--timeout-secs", "1"])
            .unwrap();
        match cli.mode {
            Mode::Multicast { group, common } => {
                assert_eq!(group, Ipv4Addr::new(239, 255, 42, 7));
                assert_eq!(common.timeout_secs, 1);
                assert_eq!(common.port, 1234);
            }
            other => panic!("unexpected mode: {other:?}"),
        }
    }
}
