//! Minimal STUN (RFC 5389) binding codec.
//!
//! Only what a relay's address-discovery responder needs: recognize a
//! datagram as STUN, parse a fingerprinted binding request, and answer with
//! an XOR-MAPPED-ADDRESS. [`request`] and [`parse_response`] are the client
//! halves, used by probes and tests.

use crate::error::StunError;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// STUN header length in bytes.
pub const HEADER_LEN: usize = 20;

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xa4, 0x42];
const BINDING_REQUEST: [u8; 2] = [0x00, 0x01];
const BINDING_SUCCESS: [u8; 2] = [0x01, 0x01];

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;
const ATTR_FINGERPRINT: u16 = 0x8028;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
/// Attribute header plus CRC value.
const FINGERPRINT_ATTR_LEN: usize = 8;

const SOFTWARE: &[u8] = b"meshderp";

/// A 96-bit STUN transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub [u8; 12]);

impl TxId {
    /// A random transaction ID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Reports whether `packet` looks like a STUN message.
pub fn is(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[0] & 0b1100_0000 == 0 && packet[4..8] == MAGIC_COOKIE
}

/// Parse a binding request and return its transaction ID.
///
/// The request must end with a valid FINGERPRINT attribute.
pub fn parse_binding_request(packet: &[u8]) -> Result<TxId, StunError> {
    if !is(packet) {
        return Err(StunError::NotStun);
    }
    if packet[..2] != BINDING_REQUEST {
        return Err(StunError::NotBindingRequest);
    }

    let mut last_attr = None;
    let mut got_fingerprint = None;
    for_each_attr(&packet[HEADER_LEN..], |attr_type, value| {
        last_attr = Some(attr_type);
        if attr_type == ATTR_FINGERPRINT && value.len() == 4 {
            got_fingerprint = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
        }
    })?;

    if last_attr != Some(ATTR_FINGERPRINT) {
        return Err(StunError::NoFingerprint);
    }
    let want = fingerprint(&packet[..packet.len() - FINGERPRINT_ATTR_LEN]);
    if got_fingerprint != Some(want) {
        return Err(StunError::WrongFingerprint);
    }

    Ok(tx_id(packet))
}

/// Build a binding success response telling the client its observed address.
pub fn response(tx_id: TxId, observed: SocketAddr) -> Vec<u8> {
    let (family, ip_bytes): (u8, Vec<u8>) = match observed.ip().to_canonical() {
        IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
    };
    let value_len = 4 + ip_bytes.len();
    let attrs_len = 4 + value_len;

    let mut b = Vec::with_capacity(HEADER_LEN + attrs_len);
    b.extend_from_slice(&BINDING_SUCCESS);
    b.extend_from_slice(&(attrs_len as u16).to_be_bytes());
    b.extend_from_slice(&MAGIC_COOKIE);
    b.extend_from_slice(&tx_id.0);

    b.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    b.extend_from_slice(&(value_len as u16).to_be_bytes());
    b.push(0);
    b.push(family);
    let port = observed.port() ^ u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
    b.extend_from_slice(&port.to_be_bytes());
    b.extend(ip_bytes.iter().zip(xor_mask(&tx_id)).map(|(o, m)| o ^ m));
    b
}

/// Build a fingerprinted binding request.
pub fn request(tx_id: TxId) -> Vec<u8> {
    let software_len = SOFTWARE.len();
    let padded_software = (software_len + 3) & !3;
    let msg_len = 4 + padded_software + FINGERPRINT_ATTR_LEN;

    let mut b = Vec::with_capacity(HEADER_LEN + msg_len);
    b.extend_from_slice(&BINDING_REQUEST);
    b.extend_from_slice(&(msg_len as u16).to_be_bytes());
    b.extend_from_slice(&MAGIC_COOKIE);
    b.extend_from_slice(&tx_id.0);

    b.extend_from_slice(&ATTR_SOFTWARE.to_be_bytes());
    b.extend_from_slice(&(software_len as u16).to_be_bytes());
    b.extend_from_slice(SOFTWARE);
    b.resize(b.len() + padded_software - software_len, 0);

    let fp = fingerprint(&b);
    b.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
    b.extend_from_slice(&4u16.to_be_bytes());
    b.extend_from_slice(&fp.to_be_bytes());
    b
}

/// Parse a binding success response into its transaction ID and mapped address.
pub fn parse_response(packet: &[u8]) -> Result<(TxId, SocketAddr), StunError> {
    if !is(packet) {
        return Err(StunError::NotStun);
    }
    if packet[..2] != BINDING_SUCCESS {
        return Err(StunError::NotBindingResponse);
    }
    let tx_id = tx_id(packet);

    let mut xor_mapped = None;
    let mut mapped = None;
    for_each_attr(&packet[HEADER_LEN..], |attr_type, value| match attr_type {
        ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_address(value, Some(&tx_id)),
        ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
        _ => {}
    })?;

    xor_mapped
        .or(mapped)
        .map(|addr| (tx_id, addr))
        .ok_or(StunError::NoMappedAddress)
}

fn tx_id(packet: &[u8]) -> TxId {
    let mut id = [0u8; 12];
    id.copy_from_slice(&packet[8..HEADER_LEN]);
    TxId(id)
}

fn fingerprint(b: &[u8]) -> u32 {
    crc32fast::hash(b) ^ FINGERPRINT_XOR
}

/// Magic cookie followed by the transaction ID, as used by XOR-MAPPED-ADDRESS.
fn xor_mask(tx_id: &TxId) -> impl Iterator<Item = u8> + '_ {
    MAGIC_COOKIE.iter().chain(tx_id.0.iter()).copied()
}

fn for_each_attr(mut b: &[u8], mut f: impl FnMut(u16, &[u8])) -> Result<(), StunError> {
    while !b.is_empty() {
        if b.len() < 4 {
            return Err(StunError::MalformedAttributes);
        }
        let attr_type = u16::from_be_bytes([b[0], b[1]]);
        let attr_len = u16::from_be_bytes([b[2], b[3]]) as usize;
        let padded = (attr_len + 3) & !3;
        b = &b[4..];
        if padded > b.len() {
            return Err(StunError::MalformedAttributes);
        }
        f(attr_type, &b[..attr_len]);
        b = &b[padded..];
    }
    Ok(())
}

fn decode_address(value: &[u8], xor_with: Option<&TxId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut ip: Vec<u8> = value[4..].to_vec();
    if let Some(tx_id) = xor_with {
        port ^= u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
        for (o, m) in ip.iter_mut().zip(xor_mask(tx_id)) {
            *o ^= m;
        }
    }
    let ip = match (family, ip.len()) {
        (0x01, 4) => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
        (0x02, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_stun_and_parses() {
        let tx = TxId([9; 12]);
        let req = request(tx);
        assert!(is(&req));
        assert_eq!(req.len(), HEADER_LEN + 4 + 8 + FINGERPRINT_ATTR_LEN);
        assert_eq!(parse_binding_request(&req).unwrap(), tx);
    }

    #[test]
    fn junk_is_not_stun() {
        assert!(!is(b"hello world, this is not stun"));
        assert!(!is(&[0u8; 10]));
        assert_eq!(
            parse_binding_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Err(StunError::NotStun)
        );
    }

    #[test]
    fn request_without_fingerprint_is_rejected() {
        let mut req = request(TxId::random());
        req.truncate(req.len() - FINGERPRINT_ATTR_LEN);
        let len = (req.len() - HEADER_LEN) as u16;
        req[2..4].copy_from_slice(&len.to_be_bytes());
        assert_eq!(parse_binding_request(&req), Err(StunError::NoFingerprint));
    }

    #[test]
    fn corrupted_request_fails_fingerprint() {
        let mut req = request(TxId::random());
        req[HEADER_LEN + 4] ^= 0xff;
        assert_eq!(parse_binding_request(&req), Err(StunError::WrongFingerprint));
    }

    #[test]
    fn truncated_attribute_is_malformed() {
        let mut req = request(TxId::random());
        req.truncate(req.len() - 2);
        assert_eq!(
            parse_binding_request(&req),
            Err(StunError::MalformedAttributes)
        );
    }

    #[test]
    fn response_is_not_a_request() {
        let resp = response(TxId::random(), "1.2.3.4:5".parse().unwrap());
        assert!(is(&resp));
        assert_eq!(
            parse_binding_request(&resp),
            Err(StunError::NotBindingRequest)
        );
    }

    #[test]
    fn response_encodes_ipv4_address() {
        let tx = TxId::random();
        let addr: SocketAddr = "203.0.113.7:41641".parse().unwrap();
        let resp = response(tx, addr);
        assert_eq!(resp.len(), HEADER_LEN + 12);
        assert_eq!(parse_response(&resp).unwrap(), (tx, addr));
    }

    #[test]
    fn response_encodes_ipv6_address() {
        let tx = TxId::random();
        let addr: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let resp = response(tx, addr);
        assert_eq!(resp.len(), HEADER_LEN + 24);
        assert_eq!(parse_response(&resp).unwrap(), (tx, addr));
    }

    #[test]
    fn mapped_ipv6_source_is_answered_as_ipv4() {
        let tx = TxId::random();
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:1234".parse().unwrap();
        let (_, addr) = parse_response(&response(tx, mapped)).unwrap();
        assert_eq!(addr, "192.0.2.1:1234".parse::<SocketAddr>().unwrap());
    }
}
