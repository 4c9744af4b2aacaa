use std::net::Ipv4Addr;

use uuid::Uuid;

use crate::error::{Result, TunnelError};

/// Shortest possible header: version + identity + options length + command +
/// port + address type + at least one address byte.
pub const MIN_HEADER_LEN: usize = 24;

/// The only supported command: open a TCP connection to the destination.
pub const CMD_TCP_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 2;
const ATYP_IPV6: u8 = 3;

/// A successfully parsed tunnel request.
///
/// `payload_offset` is the index of the first byte after the address field;
/// anything from there to the end of the same buffer is client payload that
/// must become the first backend write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub version: u8,
    pub host: String,
    pub port: u16,
    pub payload_offset: usize,
}

impl TunnelRequest {
    /// The two bytes acknowledging an accepted header, sent to the client
    /// exactly once before any relayed payload.
    #[must_use]
    pub fn response_header(&self) -> [u8; 2] {
        [self.version, 0]
    }

    #[must_use]
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses the binary handshake header from the first available bytes of a
/// session (early data or the first frame).
///
/// Wire layout, big-endian for multi-byte integers:
///
/// | offset | size | field                          |
/// |--------|------|--------------------------------|
/// | 0      | 1    | version (echoed back)          |
/// | 1      | 16   | identity                       |
/// | 17     | 1    | options length (N)             |
/// | 18     | N    | options (skipped)              |
/// | 18+N   | 1    | command                        |
/// | 19+N   | 2    | destination port               |
/// | 21+N   | 1    | address type (1/2/3)           |
/// | 22+N   | var  | address value                  |
///
/// An identity mismatch is reported before anything past the options field is
/// interpreted, and the caller must not open a backend connection on any
/// error path.
pub fn parse_request(buf: &[u8], identity: &Uuid) -> Result<TunnelRequest> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(TunnelError::Protocol("invalid data"));
    }

    let version = buf[0];
    let claimed =
        Uuid::from_slice(&buf[1..17]).map_err(|_| TunnelError::Protocol("invalid data"))?;
    if claimed != *identity {
        return Err(TunnelError::Auth);
    }

    let opt_len = buf[17] as usize;
    let command = *buf
        .get(18 + opt_len)
        .ok_or(TunnelError::Protocol("invalid data"))?;
    if command != CMD_TCP_CONNECT {
        return Err(TunnelError::Protocol("unsupported command"));
    }

    let port_index = 19 + opt_len;
    let port_bytes = buf
        .get(port_index..port_index + 2)
        .ok_or(TunnelError::Protocol("invalid data"))?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let addr_type = *buf
        .get(port_index + 2)
        .ok_or(TunnelError::Protocol("invalid data"))?;
    let addr_index = port_index + 3;

    let (host, payload_offset) = match addr_type {
        ATYP_IPV4 => {
            let octets = buf
                .get(addr_index..addr_index + 4)
                .ok_or(TunnelError::Protocol("invalid data"))?;
            let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
            (ip.to_string(), addr_index + 4)
        }
        ATYP_DOMAIN => {
            let len = *buf
                .get(addr_index)
                .ok_or(TunnelError::Protocol("invalid data"))? as usize;
            let name = buf
                .get(addr_index + 1..addr_index + 1 + len)
                .ok_or(TunnelError::Protocol("invalid data"))?;
            (
                String::from_utf8_lossy(name).into_owned(),
                addr_index + 1 + len,
            )
        }
        ATYP_IPV6 => {
            let raw = buf
                .get(addr_index..addr_index + 16)
                .ok_or(TunnelError::Protocol("invalid data"))?;
            // Eight uncompressed lowercase hex groups; no `::` shortening.
            let groups: Vec<String> = raw
                .chunks_exact(2)
                .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
                .collect();
            (groups.join(":"), addr_index + 16)
        }
        _ => return Err(TunnelError::Protocol("invalid address type")),
    };

    if host.is_empty() {
        return Err(TunnelError::Protocol("address is empty"));
    }

    Ok(TunnelRequest {
        version,
        host,
        port,
        payload_offset,
    })
}
