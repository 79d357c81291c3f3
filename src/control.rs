// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! HTTP control surface: `/start`, `/stop`, `/status` and `/hls/<file>`.
//!
//! Every control outcome, including failures, is a `200` JSON body with a
//! `success` flag. Only routing problems produce other status codes.

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

// ─── External Crates ────────────────────────────────────────────────────────────
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use crate::address::classify;
use crate::config::StreamDefaults;
use crate::launcher::StreamLauncher;
use crate::request::StreamRequest;
use crate::supervisor::{ProcessStatus, ProcessSupervisor, Role};

const INDEX_HTML: &str = r#"<html>
<head><title>Video Streaming Server</title></head>
<body>
    <h1>Video Streaming Server</h1>
    <p>Use the following endpoints:</p>
    <ul>
        <li><a href="/start">Start streaming</a> (parameters: cdn_url, multicast_addr, port, ttl)</li>
        <li><a href="/stop">Stop streaming</a></li>
        <li><a href="/status">Check status</a></li>
        <li><a href="/hls/playlist.m3u8">HLS playlist</a> (when HLS output is enabled)</li>
    </ul>
</body>
</html>
"#;

/// Raw `/start` query parameters; missing ones take the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartParams {
    pub cdn_url: Option<String>,
    pub multicast_addr: Option<String>,
    pub port: Option<String>,
    pub ttl: Option<String>,
}

impl StartParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "cdn_url" => params.cdn_url = value,
                "multicast_addr" => params.multicast_addr = value,
                "port" => params.port = value,
                "ttl" => params.ttl = value,
                _ => {}
            }
        }
        params
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_url: Option<String>,
}

/// `success` plus a human readable message; the body of `/stop` and of
/// routing errors.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusResponse {
    /// State of the primary role: `stopped`, `running` or `unknown`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub multicast_running: bool,
    pub hls_running: bool,
}

#[derive(Debug)]
pub struct ControlService {
    launcher: StreamLauncher,
    defaults: Mutex<StreamDefaults>,
}

impl ControlService {
    pub fn new(launcher: StreamLauncher, defaults: StreamDefaults) -> Self {
        Self {
            launcher,
            defaults: Mutex::new(defaults),
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        self.launcher.supervisor()
    }

    pub async fn defaults(&self) -> StreamDefaults {
        self.defaults.lock().await.clone()
    }

    pub async fn start(&self, params: StartParams) -> StartResponse {
        let defaults = self.defaults().await;
        let source_url = params.cdn_url.unwrap_or(defaults.source_url);
        let address = params.multicast_addr.unwrap_or(defaults.address);
        let port = params.port.unwrap_or_else(|| defaults.port.to_string());
        let ttl = params.ttl.unwrap_or_else(|| defaults.ttl.to_string());
        let stream_type = Some(classify(&address).stream_type().to_string());

        let request = match StreamRequest::parse(&source_url, &address, &port, &ttl) {
            Ok(request) => request,
            Err(e) => {
                return StartResponse {
                    success: false,
                    message: e.to_string(),
                    stream_type,
                    client_url: None,
                }
            }
        };

        match self.launcher.start(&request).await {
            Ok(outcome) => {
                // The last source that actually streamed becomes the default.
                self.defaults.lock().await.source_url = request.source_url().to_string();
                StartResponse {
                    success: true,
                    message: "Streaming started successfully.".to_string(),
                    stream_type,
                    client_url: Some(outcome.client_url),
                }
            }
            Err(e) => {
                warn!("Start rejected: {e}");
                StartResponse {
                    success: false,
                    message: e.to_string(),
                    stream_type,
                    client_url: None,
                }
            }
        }
    }

    pub async fn stop(&self) -> MessageResponse {
        let stopped = self.supervisor().stop_all().await;
        if stopped.is_empty() {
            return MessageResponse {
                success: false,
                message: "No streaming process is running.".to_string(),
            };
        }
        info!("Stopped {} transcoder(s)", stopped.len());
        MessageResponse {
            success: true,
            message: "Streaming stopped successfully.".to_string(),
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let primary = self.supervisor().status(Role::Primary).await;
        let segmented = self.supervisor().status(Role::Segmented).await;

        let mut response = StatusResponse {
            status: "stopped",
            exit_code: None,
            error: None,
            multicast_running: primary.is_running(),
            hls_running: segmented.is_running(),
        };
        match primary {
            ProcessStatus::Stopped => {}
            ProcessStatus::Running => response.status = "running",
            ProcessStatus::Exited { code, stderr } => {
                response.exit_code = code;
                response.error = Some(stderr);
            }
            ProcessStatus::Unknown(e) => {
                warn!("Status poll failed: {e}");
                response.status = "unknown";
            }
        }
        response
    }

    /// Stop everything; used on service shutdown.
    pub async fn shutdown(&self) {
        let stopped = self.supervisor().stop_all().await;
        info!("Shutdown stopped {} transcoder(s)", stopped.len());
    }

    /// Route one request. The body is ignored.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &MessageResponse {
                    success: false,
                    message: format!("Method {} not allowed", req.method()),
                },
            );
        }

        let path = req.uri().path();
        match path {
            "/" => response(StatusCode::OK, "text/html; charset=utf-8", INDEX_HTML),
            "/start" => {
                let params = StartParams::from_query(req.uri().query());
                json_response(StatusCode::OK, &self.start(params).await)
            }
            "/stop" => json_response(StatusCode::OK, &self.stop().await),
            "/status" => json_response(StatusCode::OK, &self.status().await),
            _ => match path.strip_prefix("/hls/") {
                Some(name) => match percent_decode_str(name).decode_utf8() {
                    Ok(name) => self.serve_segment(&name).await,
                    Err(_) => not_found(name),
                },
                None => not_found(path),
            },
        }
    }

    async fn serve_segment(&self, name: &str) -> Response<Full<Bytes>> {
        let Some(hls) = &self.launcher.config().hls else {
            return not_found(name);
        };
        if !is_plain_file_name(name) {
            return not_found(name);
        }

        let path = hls.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => response(StatusCode::OK, content_type(&path), data),
            Err(e) if e.kind() == ErrorKind::NotFound => not_found(name),
            Err(e) => {
                error!("Failed to read {}: {e}", path.display());
                response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain; charset=utf-8",
                    "internal error",
                )
            }
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains(['/', '\\'])
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") | Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn not_found(what: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &MessageResponse {
            success: false,
            message: format!("Not found: {what}"),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => response(status, "application/json", json),
        Err(e) => {
            error!("Failed to serialize response: {e}");
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                "internal error",
            )
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HlsSettings, LaunchConfig};
    use http_body_util::BodyExt;
    use serde_json::Value;

    fn service(hls: Option<HlsSettings>) -> ControlService {
        let supervisor = Arc::new(ProcessSupervisor::default());
        let config = LaunchConfig {
            hls,
            ..LaunchConfig::default()
        };
        ControlService::new(StreamLauncher::new(config, supervisor), StreamDefaults::default())
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn parses_start_query() {
        let params = StartParams::from_query(Some(
            "cdn_url=http%3A%2F%2Fx%2Fvideo.mp4&multicast_addr=239.255.0.1&port=5000&extra=1",
        ));
        assert_eq!(params.cdn_url.as_deref(), Some("http://x/video.mp4"));
        assert_eq!(params.multicast_addr.as_deref(), Some("239.255.0.1"));
        assert_eq!(params.port.as_deref(), Some("5000"));
        assert_eq!(params.ttl, None);
        assert_eq!(StartParams::from_query(None), StartParams::default());
    }

    #[test]
    fn file_name_filter() {
        assert!(is_plain_file_name("playlist.m3u8"));
        assert!(is_plain_file_name("segment_00001.ts"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("a/b.ts"));
        assert!(!is_plain_file_name(".hidden"));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn status_when_idle() {
        let response = service(None).handle(get("/status")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["multicast_running"], false);
        assert_eq!(json["hls_running"], false);
        assert!(json.get("exit_code").is_none());
    }

    #[tokio::test]
    async fn stop_when_idle_is_benign() {
        let json = body_json(service(None).handle(get("/stop")).await).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "No streaming process is running.");
    }

    #[tokio::test]
    async fn start_with_bad_port_launches_nothing() {
        let service = service(None);
        let json = body_json(service.handle(get("/start?port=99999")).await).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["stream_type"], "multicast");
        assert!(json["message"].as_str().unwrap().contains("invalid port"));
        assert!(service.supervisor().tracked_roles().await.is_empty());
    }

    #[tokio::test]
    async fn routing_errors() {
        let service = service(None);
        assert_eq!(service.handle(get("/nope")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(service.handle(get("/hls/playlist.m3u8")).await.status(), StatusCode::NOT_FOUND);

        let post = Request::builder().method(Method::POST).uri("/start").body(()).unwrap();
        assert_eq!(service.handle(post).await.status(), StatusCode::METHOD_NOT_ALLOWED);

        let index = service.handle(get("/")).await;
        assert_eq!(index.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("playlist.m3u8"), b"#EXTM3U\nsegment_00000.ts\n").unwrap();
        let service = service(Some(HlsSettings {
            dir: dir.path().to_path_buf(),
            ..HlsSettings::default()
        }));

        let response = service.handle(get("/hls/playlist.m3u8")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.apple.mpegurl"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"#EXTM3U"));

        let missing = service.handle(get("/hls/segment_00009.ts")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let escape = service.handle(get("/hls/..%2Fetc%2Fpasswd")).await;
        assert_eq!(escape.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_percent_encoded_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("segment 00001.ts"), b"\x47").unwrap();
        let service = service(Some(HlsSettings {
            dir: dir.path().to_path_buf(),
            ..HlsSettings::default()
        }));

        let response = service.handle(get("/hls/segment%2000001.ts")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");

        let invalid = service.handle(get("/hls/%FF.ts")).await;
        assert_eq!(invalid.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn routing_errors_carry_a_message() {
        let service = service(None);
        let post = Request::builder().method(Method::DELETE).uri("/stop").body(()).unwrap();
        let json = body_json(service.handle(post).await).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Method DELETE not allowed");

        let json = body_json(service.handle(get("/missing")).await).await;
        assert_eq!(json["message"], "Not found: /missing");
    }
}
