// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Destination address classification.
//!
//! The class decides which UDP output options the transcoder gets, whether a
//! receiving socket needs `SO_BROADCAST`, and the stream label shown to callers.
//! Classification is purely textual so that malformed input still yields a class.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClass {
    Broadcast,
    Multicast,
    LoopbackUnicast,
    Unicast,
}

/// Classify a destination address. Total: anything unrecognised is `Unicast`.
///
/// The broadcast suffix is checked before the multicast prefixes.
pub fn classify(address: &str) -> AddressClass {
    let address = address.trim();
    if address.ends_with(".255") {
        AddressClass::Broadcast
    } else if address.starts_with("239.") || address.starts_with("224.") {
        AddressClass::Multicast
    } else if address.starts_with("127.") {
        AddressClass::LoopbackUnicast
    } else {
        AddressClass::Unicast
    }
}

impl AddressClass {
    /// Label reported as `stream_type` by the control service.
    pub fn stream_type(&self) -> &'static str {
        match self {
            AddressClass::Broadcast => "broadcast",
            AddressClass::Multicast => "multicast",
            AddressClass::LoopbackUnicast | AddressClass::Unicast => "unicast",
        }
    }

    pub fn needs_broadcast_option(&self) -> bool {
        matches!(self, AddressClass::Broadcast)
    }

    /// Whether the UDP output should carry a `ttl` parameter.
    pub fn carries_ttl(&self) -> bool {
        matches!(self, AddressClass::Broadcast | AddressClass::Multicast)
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressClass::Broadcast => "broadcast",
            AddressClass::Multicast => "multicast",
            AddressClass::LoopbackUnicast => "unicast (localhost)",
            AddressClass::Unicast => "unicast",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reference_addresses() {
        assert_eq!(classify("192.168.0.255"), AddressClass::Broadcast);
        assert_eq!(classify("239.255.0.1"), AddressClass::Multicast);
        assert_eq!(classify("224.0.0.251"), AddressClass::Multicast);
        assert_eq!(classify("127.0.0.1"), AddressClass::LoopbackUnicast);
        assert_eq!(classify("10.0.0.5"), AddressClass::Unicast);
    }

    #[test]
    fn broadcast_suffix_wins_over_multicast_prefix() {
        assert_eq!(classify("239.1.1.255"), AddressClass::Broadcast);
        assert_eq!(classify("127.0.0.255"), AddressClass::Broadcast);
    }

    #[test]
    fn garbage_falls_through_to_unicast() {
        assert_eq!(classify(""), AddressClass::Unicast);
        assert_eq!(classify("not-an-address"), AddressClass::Unicast);
        assert_eq!(classify("2390.1.1.1"), AddressClass::Unicast);
    }

    #[test]
    fn stream_type_labels() {
        assert_eq!(classify("239.255.0.1").stream_type(), "multicast");
        assert_eq!(classify("127.0.0.1").stream_type(), "unicast");
        assert!(classify("10.0.0.255").needs_broadcast_option());
        assert!(!classify("10.0.0.1").carries_ttl());
    }
}
