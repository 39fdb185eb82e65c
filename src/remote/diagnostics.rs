// ABOUTME: Turns reqwest failures into classified transport errors with operator hints
// ABOUTME: Loopback and private-network targets get a "not reachable from here" hint

use std::error::Error as _;
use std::net::IpAddr;

use reqwest::Url;

use crate::error::{BridgeError, TransportKind};

/// True for hosts that usually only make sense from inside the same machine or LAN.
pub fn is_local_or_private(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost")
        || host.ends_with(".localhost")
        || host.ends_with(".local")
    {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => false,
    }
}

fn classify(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }
    let mut chain = err.to_string().to_ascii_lowercase();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(' ');
        chain.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }
    if chain.contains("dns error") || chain.contains("failed to lookup") {
        TransportKind::Dns
    } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        TransportKind::Tls
    } else if chain.contains("connection refused") {
        TransportKind::ConnectionRefused
    } else {
        TransportKind::Other
    }
}

fn hint(kind: TransportKind, host: Option<&str>) -> Option<String> {
    if let Some(host) = host.filter(|h| is_local_or_private(h)) {
        if kind != TransportKind::Tls {
            return Some(format!(
                "Target probably isn't reachable on this network path: '{host}' is a \
                 loopback or private-network address and may resolve to this host's own \
                 sandbox or container rather than the peer. Use an address both sites can reach"
            ));
        }
    }
    match kind {
        TransportKind::Tls => Some(
            "Check that the remote site's TLS certificate is valid and trusted by this host"
                .to_string(),
        ),
        TransportKind::Dns => {
            Some("Check the site URL in the migration key for typos".to_string())
        }
        TransportKind::Timeout => Some(
            "The remote site did not answer in time; it may still be processing, retry the step"
                .to_string(),
        ),
        TransportKind::ConnectionRefused => Some(
            "Nothing is listening at that address; is the bridge server running?".to_string(),
        ),
        TransportKind::Other => None,
    }
}

pub fn transport_error(err: reqwest::Error, url: &str) -> BridgeError {
    let kind = classify(&err);
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    BridgeError::Transport {
        kind,
        url: url.to_string(),
        message: err.to_string(),
        hint: hint(kind, host.as_deref()),
    }
}
