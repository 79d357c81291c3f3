// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

// ─── External Crates ────────────────────────────────────────────────────────────
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use crate::address::AddressClass;
use crate::command;
use crate::config::LaunchConfig;
use crate::firewall;
use crate::request::StreamRequest;
use crate::supervisor::{self, ManagedProcess, ProcessSupervisor, Role};
use crate::VsrError;

// Time allowed for the pipe readers to catch the last stderr lines of a dead child.
const STDERR_DRAIN: Duration = Duration::from_millis(500);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub class: AddressClass,
    pub client_url: String,
    pub roles: Vec<Role>,
}

/// Starts the transcoder roles and hands the children to the supervisor.
#[derive(Debug)]
pub struct StreamLauncher {
    config: LaunchConfig,
    supervisor: Arc<ProcessSupervisor>,
}

impl StreamLauncher {
    pub fn new(config: LaunchConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { config, supervisor }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Roles a start request launches.
    pub fn roles(&self) -> Vec<Role> {
        if self.config.hls.is_some() {
            vec![Role::Primary, Role::Segmented]
        } else {
            vec![Role::Primary]
        }
    }

    /// Launch every configured role for `req`.
    ///
    /// Fails with [`VsrError::AlreadyRunning`] without side effects when any of
    /// the roles is occupied. Either all roles end up registered or none.
    pub async fn start(&self, req: &StreamRequest) -> Result<LaunchOutcome, VsrError> {
        let _guard = self.supervisor.lifecycle().await;

        for role in self.roles() {
            if !self.supervisor.vacate_if_exited(role).await {
                return Err(VsrError::AlreadyRunning(role));
            }
        }

        let class = req.address_class();
        info!(
            "Starting {} stream from {} to {}:{} with TTL {}",
            class,
            req.source_url(),
            req.destination(),
            req.port(),
            req.ttl()
        );

        if self.config.configure_firewall && class == AddressClass::Multicast {
            firewall::open_multicast().await;
        }

        if let Some(hls) = &self.config.hls {
            supervisor::remove_dir_if_exists(&hls.dir).await?;
            tokio::fs::create_dir_all(&hls.dir).await?;
            debug!("Reset segment directory {}", hls.dir.display());
        }

        let primary = self.launch(Role::Primary, command::primary_args(req)).await?;
        let mut launched = vec![primary];

        if let Some(hls) = &self.config.hls {
            match self.launch(Role::Segmented, command::segmented_args(req, hls)).await {
                Ok(process) => launched.push(process),
                Err(e) => {
                    for mut process in launched {
                        supervisor::terminate(&mut process, self.supervisor.timeouts()).await;
                    }
                    return Err(e);
                }
            }
        }

        let roles = launched.iter().map(ManagedProcess::role).collect();
        for process in launched {
            self.supervisor.register(process).await;
        }

        let client_url = command::client_url(req.destination(), req.port());
        info!("Stream is up, open {} with network caching around 50 ms", client_url);

        Ok(LaunchOutcome {
            class,
            client_url,
            roles,
        })
    }

    // Spawn one role and run the liveness probe on it.
    async fn launch(&self, role: Role, args: Vec<String>) -> Result<ManagedProcess, VsrError> {
        info!(
            %role,
            "Executing command: {} {}",
            self.config.transcoder.display(),
            args.join(" ")
        );

        let mut command = Command::new(&self.config.transcoder);
        command.args(&args);
        let mut process =
            ManagedProcess::spawn(role, command).map_err(|e| VsrError::SpawnFailed(e.to_string()))?;

        match process.wait_for_exit(self.config.liveness_probe).await {
            Ok(None) => Ok(process),
            Ok(Some(status)) => {
                let stderr = process.collect_stderr(STDERR_DRAIN).await;
                warn!(%role, "Transcoder exited during liveness probe: {status}");
                let detail = if stderr.is_empty() {
                    status.to_string()
                } else {
                    format!("{status}: {stderr}")
                };
                Err(VsrError::ChildExitedImmediately(detail))
            }
            Err(e) => {
                supervisor::terminate(&mut process, self.supervisor.timeouts()).await;
                Err(VsrError::SpawnFailed(e.to_string()))
            }
        }
    }
}

/// Whether `transcoder -version` runs successfully.
pub async fn transcoder_available(transcoder: &Path) -> bool {
    let mut command = Command::new(transcoder);
    command
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(VERSION_PROBE_TIMEOUT, command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            debug!("Cannot run {}: {e}", transcoder.display());
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn missing_transcoder_is_unavailable() {
        assert!(!transcoder_available(&PathBuf::from("/nonexistent/bin/ffmpeg")).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn true_counts_as_available() {
        assert!(transcoder_available(&PathBuf::from("true")).await);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let supervisor = Arc::new(ProcessSupervisor::default());
        let config = LaunchConfig {
            transcoder: PathBuf::from("/nonexistent/bin/ffmpeg"),
            ..LaunchConfig::default()
        };
        let launcher = StreamLauncher::new(config, supervisor.clone());
        let req = StreamRequest::new("http://x/video.mp4", "127.0.0.1", 1234, 2).unwrap();

        match launcher.start(&req).await {
            Err(VsrError::SpawnFailed(_)) => {}
            other => panic!("unexpected start result: {other:?}"),
        }
        assert!(supervisor.tracked_roles().await.is_empty());
    }

    #[test]
    fn roles_follow_hls_setting() {
        let supervisor = Arc::new(ProcessSupervisor::default());
        let launcher = StreamLauncher::new(LaunchConfig::default(), supervisor.clone());
        assert_eq!(launcher.roles(), vec![Role::Primary]);

        let config = LaunchConfig {
            hls: Some(Default::default()),
            ..LaunchConfig::default()
        };
        let launcher = StreamLauncher::new(config, supervisor);
        assert_eq!(launcher.roles(), vec![Role::Primary, Role::Segmented]);
    }
}
