//! # CoAP Addressing and Raw Frame Inspection
//!
//! The benchmark engine treats CoAP mostly as bytes. Templates are built once
//! with `coap-lite` (see [`frame`]), and the hot paths only read the handful
//! of header fields they need straight from the datagram.
//!
//! ## Key Components
//!
//! - [`TargetUri`]: a parsed `coap://host[:port]/path?query` target
//! - [`Method`]: request method plus the response codes it accepts
//! - Header accessors: [`message_id`], [`code`], [`message_type`], [`token`]
//! - Address helpers: family validation and local route discovery

pub mod frame;

pub use frame::Frame;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use coap_lite::RequestType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BenchError, Result};

/// Fixed CoAP header length (version/type/TKL, code, message id).
pub const HEADER_LEN: usize = 4;

pub const CODE_GET: u8 = 0x01;
pub const CODE_POST: u8 = 0x02;
pub const CODE_PUT: u8 = 0x03;
pub const CODE_DELETE: u8 = 0x04;
/// 2.05 Content
pub const CODE_CONTENT: u8 = 0x45;
/// 4.04 Not Found, also used to tear down an observe relationship
pub const CODE_NOT_FOUND: u8 = 0x84;

pub const TYPE_CON: u8 = 0;
pub const TYPE_NON: u8 = 1;
pub const TYPE_ACK: u8 = 2;
pub const TYPE_RST: u8 = 3;

/// Observe option number (RFC 7641).
pub const OPTION_OBSERVE: u16 = 6;

pub fn message_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([bytes[2], bytes[3]]))
}

pub fn code(bytes: &[u8]) -> Option<u8> {
    bytes.get(1).copied()
}

pub fn message_type(bytes: &[u8]) -> Option<u8> {
    bytes.first().map(|b| (b >> 4) & 0x03)
}

/// Token bytes of a datagram, if the buffer is long enough to hold them.
pub fn token(bytes: &[u8]) -> Option<&[u8]> {
    let tkl = (*bytes.first()? & 0x0F) as usize;
    bytes.get(HEADER_LEN..HEADER_LEN + tkl)
}

/// Whether the datagram is a version 1 CoAP message.
pub fn is_coap_v1(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes[0] & 0xC0 == 0x40
}

/// Locate an option inside a raw frame.
///
/// ## Returns
/// `(header_offset, value_offset, value_len)` of the first instance of
/// `number`, or `None` if the frame does not carry it.
pub fn find_option(bytes: &[u8], number: u16) -> Option<(usize, usize, usize)> {
    let tkl = (*bytes.first()? & 0x0F) as usize;
    let mut pos = HEADER_LEN + tkl;
    let mut current: u16 = 0;

    while pos < bytes.len() {
        let header = bytes[pos];
        if header == 0xFF {
            return None;
        }
        let header_offset = pos;
        pos += 1;

        let delta = read_extended(bytes, &mut pos, header >> 4)?;
        let len = read_extended(bytes, &mut pos, header & 0x0F)?;
        current = current.checked_add(delta)?;

        if current == number {
            return Some((header_offset, pos, len as usize));
        }
        if current > number {
            return None;
        }
        pos += len as usize;
    }
    None
}

fn read_extended(bytes: &[u8], pos: &mut usize, nibble: u8) -> Option<u16> {
    match nibble {
        0..=12 => Some(nibble as u16),
        13 => {
            let v = *bytes.get(*pos)? as u16 + 13;
            *pos += 1;
            Some(v)
        }
        14 => {
            let hi = *bytes.get(*pos)? as u16;
            let lo = *bytes.get(*pos + 1)? as u16;
            *pos += 2;
            Some(((hi << 8) | lo).checked_add(269)?)
        }
        _ => None,
    }
}

/// Minimal big-endian encoding of an option integer (zero is empty).
pub(crate) fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub(crate) fn decode_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

/// Request method of a benchmark template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn code(self) -> u8 {
        match self {
            Method::Get => CODE_GET,
            Method::Post => CODE_POST,
            Method::Put => CODE_PUT,
            Method::Delete => CODE_DELETE,
        }
    }

    /// Whether a response code counts as success for this method.
    ///
    /// GET must come back as 2.05 Content; the other methods accept any
    /// code in the 2.xx success class.
    pub fn accepts(self, response_code: u8) -> bool {
        match self {
            Method::Get => response_code == CODE_CONTENT,
            _ => response_code >> 5 == 2,
        }
    }
}

impl From<Method> for RequestType {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => RequestType::Get,
            Method::Post => RequestType::Post,
            Method::Put => RequestType::Put,
            Method::Delete => RequestType::Delete,
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("Unsupported method: {}", other)),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// A parsed benchmark target.
///
/// Only the `coap` scheme (CoAP over UDP) is accepted. IPv6 literals lose
/// their brackets so the host can be handed straight to the resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetUri {
    raw: String,
    host: String,
    port: u16,
    path: String,
    query: Vec<String>,
}

impl TargetUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| BenchError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "coap" {
            return Err(invalid("only the coap (UDP) scheme is supported"));
        }

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };

        let query = url
            .query()
            .map(|q| {
                q.split('&')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            raw: uri.to_string(),
            host,
            port: url.port().unwrap_or(crate::defaults::COAP_PORT),
            path: url.path().to_string(),
            query,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[String] {
        &self.query
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolve the host to the first socket address the resolver returns.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| BenchError::socket("resolving target host", e))?
            .next()
            .ok_or_else(|| BenchError::InvalidUri {
                uri: self.raw.clone(),
                reason: "host resolved to no addresses".to_string(),
            })
    }
}

impl FromStr for TargetUri {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        TargetUri::parse(s)
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reject a bind address whose family differs from the target's.
pub fn check_address_family(bind: IpAddr, target: SocketAddr) -> Result<()> {
    if bind.is_ipv4() == target.is_ipv4() {
        Ok(())
    } else {
        Err(BenchError::AddressFamilyMismatch { bind, target })
    }
}

/// The wildcard address of the target's family.
pub fn unspecified_for(target: SocketAddr) -> IpAddr {
    match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Find the local address the OS would use to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only asks the routing table.
pub fn route_local_address(target: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(unspecified_for(target), 0)).ok()?;
    socket.connect(target).ok()?;
    let local = socket.local_addr().ok()?.ip();
    if local.is_unspecified() {
        None
    } else {
        Some(local)
    }
}

/// Send a single confirmable POST and wait for the response code.
pub fn post_once(uri: &TargetUri, payload: Option<&[u8]>, timeout: Duration) -> Result<u8> {
    let target = uri.resolve()?;
    let socket = UdpSocket::bind(SocketAddr::new(unspecified_for(target), 0))
        .map_err(|e| BenchError::socket("binding post socket", e))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| BenchError::socket("configuring post socket", e))?;

    let mut frame = Frame::request_template(Method::Post, uri, payload, true)?;
    let expected = frame.message_id().wrapping_add(1);
    socket
        .send_to(frame.next_mid(), target)
        .map_err(|e| BenchError::socket("sending post", e))?;

    let mut buf = [0u8; 2048];
    loop {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return Err(BenchError::Timeout("post response")),
            Err(e) => return Err(BenchError::socket("receiving post response", e)),
        };
        let reply = &buf[..n];
        if message_id(reply) == Some(expected) {
            return code(reply).ok_or_else(|| BenchError::MalformedResponse {
                reason: "response shorter than header".to_string(),
            });
        }
        debug!("Ignoring datagram with unexpected message id from {}", target);
    }
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
