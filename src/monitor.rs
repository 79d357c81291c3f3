// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::path::PathBuf;
use std::time::{Duration, Instant};

// ─── External Crates ────────────────────────────────────────────────────────────
use bytes::Bytes;
use clap::Parser;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use vivoh_stream_relay::config::{DEFAULT_SOURCE_URL, PLAYLIST_NAME};
use vivoh_stream_relay::stats::{format_bytes, latest_segment, HostSampler, Report, Sample, SourceProbe, Summary};
use vivoh_stream_relay::VsrError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_FILE: &str = "hls_performance_stats.json";
const REPORT_FILE: &str = "performance.txt";

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

#[derive(Parser, Debug)]
#[command(name = "vsr-monitor")]
#[command(about = "Samples control-server latency, HLS segment delivery and host load, then writes a report", long_about = None)]
struct Args {
    /// Base URL of the control server
    #[arg(short, long, default_value = "http://localhost:3000")]
    server: String,

    #[arg(short, long, default_value_t = 120)]
    duration_secs: u64,

    #[arg(short, long, default_value_t = 5)]
    interval_secs: u64,

    /// Source probed once with HEAD (plain http only)
    #[arg(long, default_value = DEFAULT_SOURCE_URL)]
    source_url: String,

    /// Directory for the JSON samples and the text report
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

struct Fetched {
    status: StatusCode,
    content_length: Option<u64>,
    body: Bytes,
    elapsed_ms: f64,
}

async fn fetch(client: &HttpClient, method: Method, url: &str) -> Result<Fetched, VsrError> {
    let uri: http::Uri = url.parse().map_err(|e| VsrError::Http(format!("{url}: {e}")))?;
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| VsrError::Http(e.to_string()))?;

    let started = Instant::now();
    let response = timeout(REQUEST_TIMEOUT, client.request(request))
        .await
        .map_err(|_| VsrError::Http(format!("{url}: timed out")))?
        .map_err(|e| VsrError::Http(format!("{url}: {e}")))?;

    let status = response.status();
    let content_length = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = timeout(REQUEST_TIMEOUT, response.into_body().collect())
        .await
        .map_err(|_| VsrError::Http(format!("{url}: body timed out")))?
        .map_err(|e| VsrError::Http(format!("{url}: {e}")))?
        .to_bytes();

    Ok(Fetched {
        status,
        content_length,
        body,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}

async fn probe_source(client: &HttpClient, source_url: &str) -> Option<SourceProbe> {
    if !source_url.starts_with("http://") {
        warn!("Skipping source probe, only plain http is supported: {source_url}");
        return None;
    }
    match fetch(client, Method::HEAD, source_url).await {
        Ok(fetched) => Some(SourceProbe {
            latency_ms: fetched.elapsed_ms,
            status: fetched.status.as_u16(),
            content_length: fetched.content_length.unwrap_or_default(),
        }),
        Err(e) => {
            warn!("Error getting source stats: {e}");
            None
        }
    }
}

async fn sample(client: &HttpClient, server: &str) -> Sample {
    let mut sample = Sample {
        timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
        ..Sample::default()
    };

    match fetch(client, Method::GET, &format!("{server}/status")).await {
        Ok(fetched) => {
            sample.latency_ms = Some(fetched.elapsed_ms);
            match serde_json::from_slice::<serde_json::Value>(&fetched.body) {
                Ok(status) => {
                    sample.multicast_running = status["multicast_running"].as_bool().unwrap_or(false);
                    sample.hls_running = status["hls_running"].as_bool().unwrap_or(false);
                }
                Err(e) => warn!("Unparseable status response: {e}"),
            }
        }
        Err(e) => warn!("Error measuring latency: {e}"),
    }

    let started = Instant::now();
    match fetch(client, Method::GET, &format!("{server}/hls/{PLAYLIST_NAME}")).await {
        Ok(playlist) if playlist.status == StatusCode::OK => {
            let text = String::from_utf8_lossy(&playlist.body);
            if let Some(segment) = latest_segment(&text) {
                match fetch(client, Method::GET, &format!("{server}/hls/{segment}")).await {
                    Ok(fetched) if fetched.status == StatusCode::OK => {
                        sample.segment_download_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                        sample.segment_size_bytes = Some(fetched.body.len() as u64);
                    }
                    Ok(fetched) => warn!("Segment {segment} returned {}", fetched.status),
                    Err(e) => warn!("Error getting segment download time: {e}"),
                }
            }
        }
        Ok(playlist) => warn!("Playlist returned {}", playlist.status),
        Err(e) => warn!("Error fetching playlist: {e}"),
    }

    sample
}

fn log_sample(sample: &Sample, samples: &[Sample]) {
    info!("Time: {}", sample.timestamp);
    info!("HLS Status: {}", if sample.hls_running { "Running" } else { "Stopped" });
    info!("UDP Status: {}", if sample.multicast_running { "Running" } else { "Stopped" });
    if let Some(latency) = sample.latency_ms {
        info!("  Server Latency: {latency:.2} ms");
    }
    if let (Some(ms), Some(size)) = (sample.segment_download_ms, sample.segment_size_bytes) {
        info!("  Segment Download Time: {ms:.2} ms");
        info!("  Segment Size: {}", format_bytes(size as f64));
    }
    info!(
        "  CPU/Memory/Disk: {:.1}%/{:.1}%/{:.1}%",
        sample.cpu_percent, sample.memory_percent, sample.disk_percent
    );
    if let Some(bps) = sample.bandwidth_bps {
        info!("  Current Bandwidth Usage: {}/s", format_bytes(bps));
    }
    info!(
        "  Total Data Sent/Received: {} / {}",
        format_bytes(sample.bytes_sent as f64),
        format_bytes(sample.bytes_recv as f64)
    );

    let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();
    if !latencies.is_empty() {
        let summary = Summary::of(&latencies);
        info!(
            "  Latency avg/min/max: {:.2}/{:.2}/{:.2} ms",
            summary.mean, summary.min, summary.max
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let server = args.server.trim_end_matches('/').to_string();
    let duration = Duration::from_secs(args.duration_secs);

    let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();

    info!("Starting HLS performance monitoring of {} for {} seconds...", server, args.duration_secs);
    let source = probe_source(&client, &args.source_url).await;
    if let Some(source) = &source {
        info!("Source content length: {}", format_bytes(source.content_length as f64));
    }

    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(args.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut samples = Vec::new();
    let mut host = HostSampler::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if started.elapsed() >= duration {
                    break;
                }
                let (usage, network) = host.sample();
                let current = sample(&client, &server).await.with_host(usage, network);
                samples.push(current);
                if let Some(last) = samples.last() {
                    log_sample(last, &samples);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, writing report for {} samples", samples.len());
                break;
            }
        }
    }

    tokio::fs::create_dir_all(&args.output_dir).await?;
    let stats_path = args.output_dir.join(STATS_FILE);
    tokio::fs::write(&stats_path, serde_json::to_vec_pretty(&samples)?).await?;

    let report = Report::from_samples(
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        started.elapsed().as_secs(),
        &samples,
        source,
    );
    let report_path = args.output_dir.join(REPORT_FILE);
    tokio::fs::write(&report_path, report.render()).await?;

    info!("Detailed stats saved to {}", stats_path.display());
    info!("Performance report saved to {}", report_path.display());
    Ok(())
}
