// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

pub mod address;
pub mod capture;
pub mod command;
pub mod config;
pub mod control;
pub mod firewall;
pub mod launcher;
pub mod request;
pub mod serve;
pub mod stats;
pub mod supervisor;

pub use address::{classify, AddressClass};
pub use config::{HlsSettings, LaunchConfig, StopTimeouts, StreamDefaults};
pub use control::ControlService;
pub use launcher::{LaunchOutcome, StreamLauncher};
pub use request::StreamRequest;
pub use supervisor::{ProcessStatus, ProcessSupervisor, Role, StopOutcome};

// Shared error type for the server, capture and monitor binaries
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VsrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} stream is already running.")]
    AlreadyRunning(Role),

    #[error("Transcoder failed: {0}")]
    ChildExitedImmediately(String),

    #[error("Error starting transcoder: {0}")]
    SpawnFailed(String),

    #[error("No {0} stream is running.")]
    NotRunning(Role),

    #[error("Error binding to port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Other error: {0}")]
    Other(String),
}

// Re-export for shared use
pub use anyhow;
pub use bytes;
pub use VsrError as Error;
