// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Optional host firewall opening for multicast traffic.
//!
//! Runs non-interactive `sudo` commands and never fails the caller: every
//! error is logged and swallowed.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

const MULTICAST_RANGE: &str = "239.0.0.0/8";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform specific rule commands, program first.
pub fn rule_commands() -> Vec<Vec<String>> {
    let rules: &[&[&str]] = if cfg!(target_os = "macos") {
        &[&["sudo", "-n", "pfctl", "-t", "com.apple.pfctl.skipfw", "-T", "add", MULTICAST_RANGE]]
    } else if cfg!(target_os = "linux") {
        &[
            &["sudo", "-n", "iptables", "-I", "INPUT", "-d", MULTICAST_RANGE, "-j", "ACCEPT"],
            &["sudo", "-n", "iptables", "-I", "OUTPUT", "-d", MULTICAST_RANGE, "-j", "ACCEPT"],
        ]
    } else {
        &[]
    };

    rules
        .iter()
        .map(|rule| rule.iter().map(|s| s.to_string()).collect())
        .collect()
}

pub async fn open_multicast() {
    #[cfg(unix)]
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, firewall configuration may fail");
    }

    let rules = rule_commands();
    if rules.is_empty() {
        info!("No firewall rules known for this platform");
        return;
    }

    info!("Configuring firewall for multicast traffic...");
    for rule in rules {
        let Some((program, args)) = rule.split_first() else {
            continue;
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(COMMAND_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => warn!(
                "Firewall rule '{}' failed ({}): {}",
                rule.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(e)) => warn!("Failed to run '{}': {e}", rule.join(" ")),
            Err(_) => warn!("Firewall rule '{}' timed out", rule.join(" ")),
        }
    }
    info!("Firewall configured for multicast (if sudo privileges were available)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_rules_cover_both_directions() {
        let rules = rule_commands();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r[0] == "sudo" && r.contains(&MULTICAST_RANGE.to_string())));
        assert!(rules[0].contains(&"INPUT".to_string()));
        assert!(rules[1].contains(&"OUTPUT".to_string()));
    }
}
