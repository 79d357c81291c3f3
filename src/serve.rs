// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! HTTP/1.1 accept loop for the control surface.

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ─── External Crates ────────────────────────────────────────────────────────────
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use crate::control::ControlService;

/// Pause after a failed accept (e.g. EMFILE) before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where inbound control connections come from.
pub trait ConnectionSource: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl ConnectionSource for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Serve connections until the future is dropped. A failed accept is logged
/// and retried; it never ends the loop.
pub async fn serve<L: ConnectionSource>(mut listener: L, service: Arc<ControlService>) {
    info!("HTTP accept loop started");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let service = service.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let handler = service_fn(move |req| {
                let service = service.clone();
                async move {
                    debug!("{} {} from {}", req.method(), req.uri(), peer);
                    Ok::<_, std::convert::Infallible>(service.handle(req).await)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                debug!("Connection from {} ended with error: {e}", peer);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LaunchConfig, StreamDefaults};
    use crate::launcher::StreamLauncher;
    use crate::supervisor::ProcessSupervisor;
    use std::io::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Fails `failures` times, then hands out one in-memory connection.
    struct FlakySource {
        failures: usize,
        pending: Option<DuplexStream>,
    }

    impl ConnectionSource for FlakySource {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
            if self.failures > 0 {
                self.failures -= 1;
                let kind = if self.failures % 2 == 0 {
                    ErrorKind::ConnectionAborted
                } else {
                    ErrorKind::Other
                };
                return Err(io::Error::new(kind, "Too many open files"));
            }
            match self.pending.take() {
                Some(stream) => Ok((stream, SocketAddr::from(([127, 0, 0, 1], 40000)))),
                None => std::future::pending().await,
            }
        }
    }

    fn service() -> Arc<ControlService> {
        let launcher = StreamLauncher::new(LaunchConfig::default(), Arc::new(ProcessSupervisor::default()));
        Arc::new(ControlService::new(launcher, StreamDefaults::default()))
    }

    #[tokio::test]
    async fn accept_errors_do_not_end_the_loop() {
        let (mut client, server_side) = tokio::io::duplex(16 * 1024);
        let source = FlakySource {
            failures: 3,
            pending: Some(server_side),
        };
        let task = tokio::spawn(serve(source, service()));

        client
            .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("\"status\":\"stopped\""), "{response}");
        assert!(!task.is_finished());
        task.abort();
    }
}
