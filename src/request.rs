// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

use crate::address::{classify, AddressClass};
use crate::VsrError;

/// A validated start request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    source_url: String,
    destination: String,
    port: u16,
    ttl: u8,
}

impl StreamRequest {
    pub fn new(
        source_url: impl Into<String>,
        destination: impl Into<String>,
        port: u16,
        ttl: u8,
    ) -> Result<Self, VsrError> {
        let source_url = source_url.into().trim().to_string();
        let destination = destination.into().trim().to_string();

        if source_url.is_empty() {
            return Err(VsrError::InvalidRequest("source URL is empty".into()));
        }
        if destination.is_empty() {
            return Err(VsrError::InvalidRequest("destination address is empty".into()));
        }
        if port == 0 {
            return Err(VsrError::InvalidRequest("port must be between 1 and 65535".into()));
        }

        Ok(Self {
            source_url,
            destination,
            port,
            ttl,
        })
    }

    /// Parse the textual port and ttl values received from a query string.
    pub fn parse(source_url: &str, destination: &str, port: &str, ttl: &str) -> Result<Self, VsrError> {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| VsrError::InvalidRequest(format!("invalid port '{port}'")))?;
        let ttl: u8 = ttl
            .trim()
            .parse()
            .map_err(|_| VsrError::InvalidRequest(format!("invalid ttl '{ttl}'")))?;
        Self::new(source_url, destination, port, ttl)
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn address_class(&self) -> AddressClass {
        classify(&self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_values() {
        let req = StreamRequest::parse("http://x/video.mp4", "239.255.0.1", "1234", "2").unwrap();
        assert_eq!(req.port(), 1234);
        assert_eq!(req.ttl(), 2);
        assert_eq!(req.address_class(), AddressClass::Multicast);
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(StreamRequest::parse("http://x", "239.255.0.1", "0", "2").is_err());
        assert!(StreamRequest::parse("http://x", "239.255.0.1", "65536", "2").is_err());
        assert!(StreamRequest::parse("http://x", "239.255.0.1", "abc", "2").is_err());
    }

    #[test]
    fn rejects_bad_ttl_and_empty_fields() {
        assert!(StreamRequest::parse("http://x", "239.255.0.1", "1234", "-1").is_err());
        assert!(StreamRequest::parse("http://x", "239.255.0.1", "1234", "256").is_err());
        assert!(StreamRequest::new("", "239.255.0.1", 1234, 2).is_err());
        assert!(StreamRequest::new("http://x", " ", 1234, 2).is_err());
    }

    #[test]
    fn surrounding_whitespace_is_dropped() {
        let req = StreamRequest::parse(" http://x/video.mp4\t", " 239.255.0.1 ", "1234", "2").unwrap();
        assert_eq!(req.destination(), "239.255.0.1");
        assert_eq!(req.source_url(), "http://x/video.mp4");
        assert_eq!(req.address_class(), AddressClass::Multicast);
    }
}
