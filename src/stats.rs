// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Sample statistics, host resource sampling and the text report written by
//! `vsr-monitor`.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use sysinfo::{Disks, Networks, System};

const HIGH_LOAD_PERCENT: f64 = 80.0;
const MODERATE_BANDWIDTH_MB: f64 = 1.0;
const HIGH_BANDWIDTH_MB: f64 = 5.0;

/// One monitor tick. `None` marks a probe that failed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Sample {
    pub timestamp: String,
    pub multicast_running: bool,
    pub hls_running: bool,
    pub latency_ms: Option<f64>,
    pub segment_download_ms: Option<f64>,
    pub segment_size_bytes: Option<u64>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Usage of the filesystem mounted at `/`.
    pub disk_percent: f64,
    /// Bytes sent on all interfaces since the monitor started.
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    /// Send plus receive rate since the previous tick, bytes per second.
    pub bandwidth_bps: Option<f64>,
}

impl Sample {
    pub fn with_host(mut self, host: HostUsage, network: NetworkUsage) -> Self {
        self.cpu_percent = host.cpu_percent;
        self.memory_percent = host.memory_percent;
        self.disk_percent = host.disk_percent;
        self.bytes_sent = network.bytes_sent;
        self.bytes_recv = network.bytes_recv;
        self.bandwidth_bps = network.bandwidth_bps;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkUsage {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bandwidth_bps: Option<f64>,
}

/// Turns cumulative interface totals into traffic since the first reading
/// and a rate since the previous one.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    baseline: Option<(u64, u64)>,
    previous: Option<(u64, u64, Instant)>,
}

impl NetworkCounters {
    pub fn update(&mut self, total_sent: u64, total_recv: u64, now: Instant) -> NetworkUsage {
        let (base_sent, base_recv) = *self.baseline.get_or_insert((total_sent, total_recv));

        let bandwidth_bps = self.previous.and_then(|(sent, recv, at)| {
            let secs = now.saturating_duration_since(at).as_secs_f64();
            (secs > 0.0).then(|| {
                let moved = total_sent.saturating_sub(sent) + total_recv.saturating_sub(recv);
                moved as f64 / secs
            })
        });
        self.previous = Some((total_sent, total_recv, now));

        NetworkUsage {
            bytes_sent: total_sent.saturating_sub(base_sent),
            bytes_recv: total_recv.saturating_sub(base_recv),
            bandwidth_bps,
        }
    }
}

/// CPU, memory, root disk and network usage of the host.
pub struct HostSampler {
    system: System,
    networks: Networks,
    counters: NetworkCounters,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a difference between two refreshes.
        system.refresh_cpu();
        let mut sampler = Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            counters: NetworkCounters::default(),
        };
        sampler.read_network();
        sampler
    }

    pub fn sample(&mut self) -> (HostUsage, NetworkUsage) {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| f64::from(c.cpu_usage())).sum::<f64>() / cpus.len() as f64
        };
        let cpu_percent = if cpu_percent.is_finite() {
            cpu_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let memory_percent = percent(self.system.used_memory(), self.system.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let disk_percent = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .map(|d| percent(d.total_space().saturating_sub(d.available_space()), d.total_space()))
            .unwrap_or_default();

        let host = HostUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
        };
        (host, self.read_network())
    }

    fn read_network(&mut self) -> NetworkUsage {
        self.networks.refresh();
        let (sent, recv) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (sent + data.total_transmitted(), recv + data.total_received())
            });
        self.counters.update(sent, recv, Instant::now())
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl Summary {
    /// All-zero summary for an empty slice.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Self {
            count,
            mean,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std_dev: variance.sqrt(),
        }
    }
}

/// HEAD probe of the source URL.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct SourceProbe {
    pub latency_ms: f64,
    pub status: u16,
    pub content_length: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Report {
    pub date: String,
    pub duration_secs: u64,
    pub latency: Summary,
    pub segment_time: Summary,
    pub total_segment_bytes: u64,
    pub hls_uptime_ratio: f64,
    pub cpu: Summary,
    pub memory: Summary,
    pub disk: Summary,
    /// Bytes per second.
    pub bandwidth: Summary,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub source: Option<SourceProbe>,
}

impl Report {
    pub fn from_samples(date: String, duration_secs: u64, samples: &[Sample], source: Option<SourceProbe>) -> Self {
        let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();
        let segment_times: Vec<f64> = samples.iter().filter_map(|s| s.segment_download_ms).collect();
        let total_segment_bytes = samples.iter().filter_map(|s| s.segment_size_bytes).sum();
        let bandwidths: Vec<f64> = samples.iter().filter_map(|s| s.bandwidth_bps).collect();
        let field = |f: fn(&Sample) -> f64| samples.iter().map(f).collect::<Vec<_>>();
        let last = samples.last();
        let hls_uptime_ratio = if samples.is_empty() {
            0.0
        } else {
            samples.iter().filter(|s| s.hls_running).count() as f64 / samples.len() as f64
        };

        Self {
            date,
            duration_secs,
            latency: Summary::of(&latencies),
            segment_time: Summary::of(&segment_times),
            total_segment_bytes,
            hls_uptime_ratio,
            cpu: Summary::of(&field(|s| s.cpu_percent)),
            memory: Summary::of(&field(|s| s.memory_percent)),
            disk: Summary::of(&field(|s| s.disk_percent)),
            bandwidth: Summary::of(&bandwidths),
            bytes_sent: last.map(|s| s.bytes_sent).unwrap_or_default(),
            bytes_recv: last.map(|s| s.bytes_recv).unwrap_or_default(),
            source,
        }
    }

    pub fn latency_rating(&self) -> &'static str {
        if self.latency.mean < 10.0 {
            "Excellent (< 10ms)"
        } else if self.latency.mean < 50.0 {
            "Good (< 50ms)"
        } else {
            "Poor (> 50ms) - Consider network optimization"
        }
    }

    fn bandwidth_mb(&self) -> f64 {
        self.bandwidth.mean / (1024.0 * 1024.0)
    }

    pub fn bandwidth_rating(&self) -> String {
        let mb = self.bandwidth_mb();
        if mb < MODERATE_BANDWIDTH_MB {
            format!("Low ({mb:.2} MB/s)")
        } else if mb < HIGH_BANDWIDTH_MB {
            format!("Moderate ({mb:.2} MB/s)")
        } else {
            format!("High ({mb:.2} MB/s) - Consider compression")
        }
    }

    pub fn issues(&self) -> Vec<&'static str> {
        let mut issues = Vec::new();
        if self.latency.mean > 50.0 {
            issues.push("high latency");
        }
        if self.bandwidth_mb() > HIGH_BANDWIDTH_MB {
            issues.push("high bandwidth usage");
        }
        if self.cpu.mean > HIGH_LOAD_PERCENT {
            issues.push("high CPU usage");
        }
        if self.memory.mean > HIGH_LOAD_PERCENT {
            issues.push("high memory usage");
        }
        if self.segment_time.count > 0 && self.segment_time.mean > 1000.0 {
            issues.push("slow segment delivery");
        }
        if self.hls_uptime_ratio < 1.0 {
            issues.push("HLS output interruptions");
        }
        issues
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "=== VIDEO STREAMING PERFORMANCE REPORT ===")?;
        writeln!(out, "Date: {}", self.date)?;
        writeln!(out, "Duration: {} seconds", self.duration_secs)?;
        writeln!(out)?;

        if let Some(source) = &self.source {
            writeln!(out, "=== SOURCE ===")?;
            writeln!(out, "Latency: {:.2} ms", source.latency_ms)?;
            writeln!(out, "HTTP status: {}", source.status)?;
            writeln!(out, "Content length: {}", format_bytes(source.content_length as f64))?;
            writeln!(out)?;
        }

        writeln!(out, "=== LATENCY STATISTICS ===")?;
        write_summary(out, "Server Latency (ms)", &self.latency)?;
        writeln!(out)?;

        writeln!(out, "=== HLS SEGMENT STATISTICS ===")?;
        write_summary(out, "Segment Download Time (ms)", &self.segment_time)?;
        writeln!(out, "Segment data fetched: {}", format_bytes(self.total_segment_bytes as f64))?;
        writeln!(out, "HLS running in {:.0}% of samples", self.hls_uptime_ratio * 100.0)?;
        writeln!(out)?;

        writeln!(out, "=== SYSTEM PERFORMANCE ===")?;
        writeln!(out, "Average CPU Usage: {:.2}%", self.cpu.mean)?;
        writeln!(out, "Average Memory Usage: {:.2}%", self.memory.mean)?;
        writeln!(out, "Disk Usage: {:.2}%", self.disk.mean)?;
        writeln!(out)?;

        writeln!(out, "=== NETWORK PERFORMANCE ===")?;
        writeln!(out, "Average Bandwidth Usage: {}/s", format_bytes(self.bandwidth.mean))?;
        writeln!(out, "Peak Bandwidth Usage: {}/s", format_bytes(self.bandwidth.max))?;
        writeln!(out, "Total Data Sent: {}", format_bytes(self.bytes_sent as f64))?;
        writeln!(out, "Total Data Received: {}", format_bytes(self.bytes_recv as f64))?;
        writeln!(out)?;

        writeln!(out, "=== ANALYSIS AND RECOMMENDATIONS ===")?;
        writeln!(out, "Stream Latency: {}", self.latency_rating())?;
        writeln!(out, "Bandwidth Usage: {}", self.bandwidth_rating())?;
        write_load(out, "CPU", self.cpu.mean, "Consider scaling resources")?;
        write_load(out, "Memory", self.memory.mean, "Consider memory optimization")?;
        writeln!(out)?;
        writeln!(out, "FINAL ASSESSMENT:")?;
        let issues = self.issues();
        if issues.is_empty() {
            writeln!(out, "The streaming system is performing well.")?;
        } else {
            writeln!(out, "The streaming system is experiencing {}.", issues.join(", "))?;
            writeln!(
                out,
                "Recommendations: Review network configuration, the transcoder encoding settings and host resources."
            )?;
        }
        writeln!(out)?;
        writeln!(out, "=== END OF REPORT ===")
    }
}

fn write_load(out: &mut String, what: &str, mean: f64, advice: &str) -> std::fmt::Result {
    if mean > HIGH_LOAD_PERCENT {
        writeln!(out, "{what} Usage: High (> {HIGH_LOAD_PERCENT:.0}%) - {advice}")
    } else {
        writeln!(out, "{what} Usage: Normal ({mean:.2}%)")
    }
}

fn write_summary(out: &mut String, title: &str, summary: &Summary) -> std::fmt::Result {
    writeln!(out, "{title}:")?;
    writeln!(out, "  Samples: {}", summary.count)?;
    writeln!(out, "  Average: {:.2}", summary.mean)?;
    writeln!(out, "  Minimum: {:.2}", summary.min)?;
    writeln!(out, "  Maximum: {:.2}", summary.max)?;
    writeln!(out, "  Standard Deviation: {:.2}", summary.std_dev)
}

/// Human readable size, e.g. `1.50 MB`.
pub fn format_bytes(bytes: f64) -> String {
    let mut value = bytes;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} TB")
}

/// Last media segment listed in an HLS playlist.
pub fn latest_segment(playlist: &str) -> Option<&str> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && line.ends_with(".ts"))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_matches_hand_computation() {
        let s = Summary::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(s.count, 8);
        assert_eq!(s.mean, 5.0);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
        assert!((s.std_dev - 2.0).abs() < 1e-12);
        assert_eq!(Summary::of(&[]), Summary::default());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512.0), "512.00 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0), "3.00 MB");
        assert_eq!(format_bytes(2.0 * 1024f64.powi(4)), "2.00 TB");
    }

    #[test]
    fn picks_last_segment() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nsegment_00003.ts\n#EXTINF:2.0,\nsegment_00004.ts\n";
        assert_eq!(latest_segment(playlist), Some("segment_00004.ts"));
        assert_eq!(latest_segment("#EXTM3U\n"), None);
    }

    #[test]
    fn report_flags_latency_and_gaps() {
        let samples = vec![
            Sample {
                hls_running: true,
                latency_ms: Some(80.0),
                segment_download_ms: Some(20.0),
                segment_size_bytes: Some(1000),
                ..Sample::default()
            },
            Sample {
                hls_running: false,
                latency_ms: None,
                ..Sample::default()
            },
        ];
        let report = Report::from_samples("2025-01-01 00:00:00".into(), 10, &samples, None);
        assert_eq!(report.latency.count, 1);
        assert_eq!(report.total_segment_bytes, 1000);
        assert_eq!(report.hls_uptime_ratio, 0.5);
        assert_eq!(report.issues(), vec!["high latency", "HLS output interruptions"]);

        let text = report.render();
        assert!(text.starts_with("=== VIDEO STREAMING PERFORMANCE REPORT ==="));
        assert!(text.contains("Stream Latency: Poor"));
        assert!(text.trim_end().ends_with("=== END OF REPORT ==="));
    }

    #[test]
    fn report_flags_host_load_and_bandwidth() {
        let busy = |cpu: f64, bandwidth: Option<f64>, sent: u64| Sample {
            hls_running: true,
            latency_ms: Some(5.0),
            cpu_percent: cpu,
            memory_percent: 85.0,
            disk_percent: 40.0,
            bytes_sent: sent,
            bytes_recv: sent / 2,
            bandwidth_bps: bandwidth,
            ..Sample::default()
        };
        let mb = 1024.0 * 1024.0;
        let samples = vec![busy(90.0, None, 0), busy(70.0, Some(4.0 * mb), 10), busy(95.0, Some(8.0 * mb), 4096)];
        let report = Report::from_samples("2025-01-01 00:00:00".into(), 15, &samples, None);

        assert_eq!(report.cpu.mean, 85.0);
        assert_eq!(report.bandwidth.count, 2);
        assert_eq!(report.bytes_sent, 4096);
        assert_eq!(report.bytes_recv, 2048);
        assert_eq!(report.bandwidth_rating(), "High (6.00 MB/s) - Consider compression");
        assert_eq!(
            report.issues(),
            vec!["high bandwidth usage", "high CPU usage", "high memory usage"]
        );

        let text = report.render();
        assert!(text.contains("=== SYSTEM PERFORMANCE ==="));
        assert!(text.contains("Average CPU Usage: 85.00%"));
        assert!(text.contains("Disk Usage: 40.00%"));
        assert!(text.contains("=== NETWORK PERFORMANCE ==="));
        assert!(text.contains("Total Data Sent: 4.00 KB"));
        assert!(text.contains("CPU Usage: High (> 80%) - Consider scaling resources"));
        assert!(text.contains("Memory Usage: High (> 80%)"));
    }

    #[test]
    fn network_counters_report_traffic_and_rate() {
        let start = Instant::now();
        let mut counters = NetworkCounters::default();

        let first = counters.update(1_000, 5_000, start);
        assert_eq!((first.bytes_sent, first.bytes_recv, first.bandwidth_bps), (0, 0, None));

        let second = counters.update(3_000, 9_000, start + std::time::Duration::from_secs(2));
        assert_eq!((second.bytes_sent, second.bytes_recv), (2_000, 4_000));
        assert_eq!(second.bandwidth_bps, Some(3_000.0));

        // A counter reset never produces a negative rate.
        let reset = counters.update(0, 0, start + std::time::Duration::from_secs(4));
        assert_eq!(reset.bandwidth_bps, Some(0.0));
    }

    #[test]
    fn host_sampler_reports_percentages() {
        let mut sampler = HostSampler::new();
        let (host, network) = sampler.sample();
        for value in [host.cpu_percent, host.memory_percent, host.disk_percent] {
            assert!((0.0..=100.0).contains(&value), "{host:?}");
        }
        assert!(network.bandwidth_bps.is_some());
    }
}
