// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOURCE_URL: &str = "http://34.120.70.159/152407-802753527_small.mp4";
pub const DEFAULT_ADDRESS: &str = "239.255.0.1";
pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_TTL: u8 = 2;
pub const DEFAULT_TRANSCODER: &str = "ffmpeg";
pub const DEFAULT_HLS_DIR: &str = "hls";
pub const PLAYLIST_NAME: &str = "playlist.m3u8";

/// Values used for start parameters the caller leaves out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefaults {
    pub source_url: String,
    pub address: String,
    pub port: u16,
    pub ttl: u8,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Segmented (HLS) output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSettings {
    pub dir: PathBuf,
    /// Target segment length in seconds.
    pub segment_time: u32,
    pub list_size: u32,
}

impl HlsSettings {
    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_NAME)
    }
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_HLS_DIR),
            segment_time: 2,
            list_size: 5,
        }
    }
}

/// Bounded waits used when terminating a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    /// Wait after SIGTERM.
    pub graceful: Duration,
    /// Wait after SIGKILL to the child itself.
    pub forceful: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(3),
            forceful: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub transcoder: PathBuf,
    /// `None` runs the primary UDP role only.
    pub hls: Option<HlsSettings>,
    pub liveness_probe: Duration,
    pub configure_firewall: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            transcoder: PathBuf::from(DEFAULT_TRANSCODER),
            hls: None,
            liveness_probe: Duration::from_secs(2),
            configure_firewall: false,
        }
    }
}
