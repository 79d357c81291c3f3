// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Transcoder command lines.
//!
//! Both roles read the source in real time and loop it forever. The primary
//! role uses a very low latency H.264 baseline profile with 0.5 s GOPs and
//! writes MPEG-TS to UDP; the segmented role writes a rolling HLS playlist.

use crate::address::AddressClass;
use crate::config::HlsSettings;
use crate::request::StreamRequest;

const UDP_PACKET_SIZE: u32 = 1316;
const UDP_BUFFER_SIZE: u32 = 65536;

#[rustfmt::skip]
fn input_args(source_url: &str) -> Vec<String> {
    strings(&[
        "-loglevel", "warning",
        "-nostats",
        "-re",
        "-stream_loop", "-1",
        "-fflags", "+genpts+discardcorrupt+nobuffer+igndts",
        "-flags", "low_delay",
        "-avoid_negative_ts", "make_zero",
        "-analyzeduration", "500000",
        "-probesize", "1000000",
        "-i", source_url,
    ])
}

#[rustfmt::skip]
fn low_latency_video_args() -> Vec<String> {
    strings(&[
        "-c:v", "libx264",
        "-vsync", "cfr",
        "-preset", "ultrafast",
        "-tune", "zerolatency",
        "-profile:v", "baseline",
        "-level", "3.0",
        "-b:v", "800k",
        "-maxrate", "1000k",
        "-bufsize", "1000k",
        "-r", "24",
        "-x264opts",
        "no-cabac:no-scenecut:partitions=none:ref=1:me=dia:subme=0:trellis=0:weightp=0:no-weightb:bframes=0:8x8dct=0",
        "-force_key_frames", "expr:gte(t,n_forced*0.5)",
        "-g", "12",
        "-keyint_min", "12",
        "-sc_threshold", "0",
        "-vf", "fps=fps=24",
    ])
}

fn audio_args() -> Vec<String> {
    strings(&["-c:a", "aac", "-b:a", "96k", "-ar", "44100", "-ac", "2"])
}

/// UDP sink URL. Broadcast destinations get `broadcast=1`, broadcast and
/// multicast destinations get the ttl; unicast targets get neither.
pub fn udp_output_url(destination: &str, port: u16, ttl: u8, class: AddressClass) -> String {
    let mut url = format!(
        "udp://{destination}:{port}?pkt_size={UDP_PACKET_SIZE}&buffer_size={UDP_BUFFER_SIZE}"
    );
    if class.needs_broadcast_option() {
        url.push_str("&broadcast=1");
    }
    if class.carries_ttl() {
        url.push_str(&format!("&ttl={ttl}"));
    }
    url
}

/// URL a player (e.g. VLC) opens to receive the stream.
pub fn client_url(destination: &str, port: u16) -> String {
    format!("udp://@{destination}:{port}")
}

/// Arguments for the primary real-time UDP stream, without the program name.
#[rustfmt::skip]
pub fn primary_args(req: &StreamRequest) -> Vec<String> {
    let class = req.address_class();
    let mut args = input_args(req.source_url());
    args.extend(low_latency_video_args());
    args.extend(audio_args());
    args.extend(strings(&[
        "-max_muxing_queue_size", "9999",
        "-muxdelay", "0",
        "-muxpreload", "0",
        "-f", "mpegts",
    ]));
    args.push(udp_output_url(req.destination(), req.port(), req.ttl(), class));
    args
}

/// Arguments for the segmented HLS stream, without the program name.
#[rustfmt::skip]
pub fn segmented_args(req: &StreamRequest, hls: &HlsSettings) -> Vec<String> {
    let segment_pattern = hls.dir.join("segment_%05d.ts");
    let mut args = input_args(req.source_url());
    args.extend(strings(&[
        "-c:v", "libx264",
        "-preset", "veryfast",
        "-tune", "zerolatency",
        "-g", "48",
        "-sc_threshold", "0",
    ]));
    args.extend(audio_args());
    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        hls.segment_time.to_string(),
        "-hls_list_size".to_string(),
        hls.list_size.to_string(),
        "-hls_flags".to_string(),
        "delete_segments+independent_segments".to_string(),
        "-hls_segment_filename".to_string(),
        segment_pattern.to_string_lossy().into_owned(),
        hls.playlist_path().to_string_lossy().into_owned(),
    ]);
    args
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
