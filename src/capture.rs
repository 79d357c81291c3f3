// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Diagnostic UDP capture for broadcast and multicast streams.
//!
//! A [`Capture`] binds a datagram socket on all interfaces (joining the
//! multicast group when asked), then appends every datagram it receives to a
//! capture file until the shutdown future resolves. The file is flushed after
//! each datagram.

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ─── External Crates ────────────────────────────────────────────────────────────
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{info, warn};

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use crate::VsrError;

const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Broadcast,
    Multicast { group: Ipv4Addr },
}

impl CaptureMode {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            CaptureMode::Broadcast => "broadcast_data",
            CaptureMode::Multicast { .. } => "multicast_data",
        }
    }

    pub fn group(&self) -> Option<Ipv4Addr> {
        match self {
            CaptureMode::Broadcast => None,
            CaptureMode::Multicast { group } => Some(*group),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub port: u16,
    pub output_dir: PathBuf,
    pub recv_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Broadcast,
            port: 1234,
            output_dir: PathBuf::from("."),
            recv_timeout: Duration::from_secs(10),
        }
    }
}

/// `<prefix>_<unix seconds>.ts`
pub fn output_file_name(mode: CaptureMode, started: SystemTime) -> String {
    let secs = started
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}_{}.ts", mode.file_prefix(), secs)
}

/// Running totals after a datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub packets: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Throughput {
    pub fn megabytes(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }

    /// MB/s since the session started; zero before any time has passed.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.megabytes() / secs
        } else {
            0.0
        }
    }
}

/// Counters and sink for one capture run.
#[derive(Debug)]
pub struct CaptureSession<W> {
    output: W,
    packet_count: u64,
    total_bytes: u64,
    started_at: Instant,
}

impl<W: AsyncWrite + Unpin> CaptureSession<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            packet_count: 0,
            total_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Append one datagram and flush it.
    pub async fn record(&mut self, datagram: &[u8]) -> io::Result<Throughput> {
        self.output.write_all(datagram).await?;
        self.output.flush().await?;
        self.packet_count += 1;
        self.total_bytes += datagram.len() as u64;
        Ok(self.throughput())
    }

    pub fn throughput(&self) -> Throughput {
        Throughput {
            packets: self.packet_count,
            bytes: self.total_bytes,
            elapsed: self.started_at.elapsed(),
        }
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSummary {
    pub output_path: PathBuf,
    pub totals: Throughput,
}

fn bind_socket(mode: CaptureMode, port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    match mode {
        CaptureMode::Broadcast => socket.set_broadcast(true)?,
        // Several listeners on one host need SO_REUSEPORT on BSD-derived stacks.
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
        CaptureMode::Multicast { .. } => socket.set_reuse_port(true)?,
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd")))]
        CaptureMode::Multicast { .. } => {}
    }
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// A bound capture socket, ready to listen.
#[derive(Debug)]
pub struct Capture {
    config: CaptureConfig,
    socket: UdpSocket,
    bound_port: u16,
    joined_group: Option<Ipv4Addr>,
}

impl Capture {
    /// Bind (and join the group for multicast). Must run inside a tokio runtime.
    pub fn bind(config: CaptureConfig) -> Result<Self, VsrError> {
        let port = config.port;
        let std_socket = bind_socket(config.mode, port).map_err(|source| VsrError::BindFailed { port, source })?;
        let socket = UdpSocket::from_std(std_socket)?;
        let bound_port = socket.local_addr()?.port();
        info!("Successfully bound to port {bound_port}");

        let joined_group = config.mode.group();
        if let Some(group) = joined_group {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
            info!("Joined multicast group {group}");
        }

        Ok(Self {
            config,
            socket,
            bound_port,
            joined_group,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.bound_port
    }

    /// Receive until `shutdown` resolves or writing the capture file fails.
    pub async fn run<F>(self, shutdown: F) -> Result<CaptureSummary, VsrError>
    where
        F: Future<Output = ()>,
    {
        let output_path = self
            .config
            .output_dir
            .join(output_file_name(self.config.mode, SystemTime::now()));
        let file = tokio::fs::File::create(&output_path).await?;
        let mut session = CaptureSession::new(file);

        info!(
            "Listening for {} data on port {}... Ctrl+C to stop",
            match self.config.mode {
                CaptureMode::Broadcast => "broadcast",
                CaptureMode::Multicast { .. } => "multicast",
            },
            self.bound_port
        );

        let result = receive_loop(&self.socket, &mut session, self.config.recv_timeout, shutdown).await;
        if let Err(e) = &result {
            warn!("Capture stopped on error: {e}");
        }

        if let Some(group) = self.joined_group {
            match self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                Ok(()) => info!("Left multicast group {group}"),
                Err(e) => warn!("Failed to leave multicast group {group}: {e}"),
            }
        }
        drop(self.socket);
        info!("Socket closed");

        let totals = session.throughput();
        info!("Received {} packets, total {:.2} MB", totals.packets, totals.megabytes());
        info!("Data saved to {}", absolute(&output_path).display());

        result.map(|()| CaptureSummary { output_path, totals })
    }
}

async fn receive_loop<W, F>(
    socket: &UdpSocket,
    session: &mut CaptureSession<W>,
    recv_timeout: Duration,
    shutdown: F,
) -> Result<(), VsrError>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted");
                return Ok(());
            }
            received = timeout(recv_timeout, socket.recv_from(&mut buf)) => match received {
                Ok(Ok((len, from))) => {
                    let totals = session.record(&buf[..len]).await?;
                    info!(
                        "Received packet #{}: {} bytes from {} | Total: {:.2} MB | Rate: {:.2} MB/s",
                        totals.packets,
                        len,
                        from,
                        totals.megabytes(),
                        totals.rate()
                    );
                    if totals.packets == 1 {
                        info!("First packet received from {from}, connection established");
                    }
                }
                Ok(Err(e)) => warn!("Receive error: {e}"),
                Err(_) if session.packet_count() == 0 => {
                    info!("No data received in {} seconds, still waiting...", recv_timeout.as_secs());
                }
                Err(_) => {
                    info!(
                        "Timeout after receiving {} packets. Continuing to listen...",
                        session.packet_count()
                    );
                }
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
