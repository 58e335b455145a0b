//! Ping probe with native ICMP and a `ping` command fallback.
//!
//! Native echo requests run on blocking sockets inside `spawn_blocking`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeOutcome, Prober};
use crate::db::TargetConfig;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const PACKET_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier and sequence so concurrent pings to one host can be told apart.
fn next_ping_id() -> (u16, u16) {
    (rand::random(), PING_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// One ICMP echo; a reply means up.
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(
        &self,
        target: &TargetConfig,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let host = target.ping_host()?;
        let rtt = ping(&host, timeout).await?;
        tracing::trace!(host = %host, rtt_us = rtt.as_micros() as u64, "echo reply");
        Ok(ProbeOutcome::default())
    }
}

/// Round-trip time of one echo request to `host`.
pub async fn ping(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return ping_command(host, timeout).await;
    }

    let ip = resolve(host).await?;
    let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Internal(format!("ping task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if msg.starts_with("permission denied") => {
            tracing::warn!(host, "Native ping not permitted, falling back to command: {}", msg);
            ping_command(host, timeout).await
        }
        other => other,
    }
}

async fn resolve(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| socket_error("create ICMP socket", e))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("connect", e))?;

    let (identifier, sequence) = next_ping_id();
    let packet = echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| socket_error("send", e))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => socket_error("receive", e),
        })?;
        // SAFETY: recv initialized the first `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_reply_to(buf, reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

fn socket_error(action: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == ErrorKind::PermissionDenied {
        ProbeError::Network(format!("permission denied: {}: {}", action, e))
    } else {
        ProbeError::Network(format!("failed to {}: {}", action, e))
    }
}

/// RAW IPv4 sockets deliver the IP header too; skip it when present.
fn is_reply_to(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && buf.first().map_or(false, |b| b >> 4 == 4) {
        20
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let icmp = &buf[offset..];
    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build an echo request. The kernel fills the ICMPv6 checksum.
fn echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

async fn ping_command(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Extract the round-trip time from `ping` output.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<(Regex, usize)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // per-packet "time=12.3 ms"
            (r"time[=<]([0-9.]+)\s*ms", 1),
            // macOS summary, average column
            (r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
            // Linux summary, average column
            (r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
        ]
        .into_iter()
        .filter_map(|(re, group)| Regex::new(re).ok().map(|re| (re, group)))
        .collect()
    });

    patterns
        .iter()
        .filter_map(|(re, group)| re.captures(output)?.get(*group))
        .find_map(|m| m.as_str().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
