use super::stream::ProxyReader;
use crate::utils::error::{PolyProxyError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::AsyncRead;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// High bit of the address type nibble: Shadowsocks one-time-auth marker.
pub const OTA_FLAG: u8 = 0x10;

/// Decode a SOCKS-style address from a stream. The type byte `atyp` has
/// already been consumed by the caller.
///
/// Returns `(host, port, raw)` where `raw` holds every byte consumed after
/// the type byte — Shadowsocks computes its one-time-auth header digest
/// over `atyp || raw`.
pub async fn read_address<R>(
    reader: &mut ProxyReader<R>,
    atyp: u8,
) -> Result<(String, u16, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut raw = BytesMut::new();
    let host = match atyp {
        0x01 | 0x11 => {
            let octets = reader.read_n(4).await?;
            raw.extend_from_slice(&octets);
            Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string()
        }
        0x03 | 0x13 => {
            let len = reader.read_n(1).await?;
            let name = reader.read_n(len[0] as usize).await?;
            raw.extend_from_slice(&len);
            raw.extend_from_slice(&name);
            String::from_utf8(name.to_vec())
                .map_err(|_| PolyProxyError::Malformed("domain is not valid UTF-8".to_string()))?
        }
        0x04 | 0x14 => {
            let octets = reader.read_n(16).await?;
            raw.extend_from_slice(&octets);
            let mut sixteen = [0u8; 16];
            sixteen.copy_from_slice(&octets);
            Ipv6Addr::from(sixteen).to_string()
        }
        n => {
            return Err(PolyProxyError::Malformed(format!(
                "unknown address type 0x{:02x}",
                n
            )));
        }
    };
    let port_bytes = reader.read_n(2).await?;
    raw.extend_from_slice(&port_bytes);
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok((host, port, raw.freeze()))
}

/// Decode a SOCKS-style address from the front of a datagram. `data[0]` is
/// the type byte; only the plain types {1, 3, 4} are accepted here.
///
/// Returns `(host, port, consumed)` where `consumed` counts the type byte.
pub fn decode_datagram_address(data: &[u8]) -> Option<(String, u16, usize)> {
    let atyp = *data.first()?;
    let (host, addr_end) = match atyp {
        0x01 => {
            if data.len() < 5 {
                return None;
            }
            (Ipv4Addr::new(data[1], data[2], data[3], data[4]).to_string(), 5)
        }
        0x03 => {
            let len = *data.get(1)? as usize;
            if data.len() < 2 + len {
                return None;
            }
            let name = String::from_utf8(data[2..2 + len].to_vec()).ok()?;
            (name, 2 + len)
        }
        0x04 => {
            if data.len() < 17 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            (Ipv6Addr::from(octets).to_string(), 17)
        }
        _ => return None,
    };
    if data.len() < addr_end + 2 {
        return None;
    }
    let port = u16::from_be_bytes([data[addr_end], data[addr_end + 1]]);
    Some((host, port, addr_end + 2))
}

/// Encode an outbound address in domain form (`0x03`), the one form every
/// downstream implementation accepts, even for IP literals.
pub fn encode_address(host: &str, port: u16) -> Vec<u8> {
    encode_address_tagged(ATYP_DOMAIN, host, port)
}

/// Domain-form encode with an explicit type byte (`0x13` for SS-OTA).
pub fn encode_address_tagged(tag: u8, host: &str, port: u16) -> Vec<u8> {
    // domain length field is a single byte
    let name = &host.as_bytes()[..host.len().min(255)];
    let mut buf = Vec::with_capacity(4 + name.len());
    buf.push(tag);
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    buf.put_u16(port);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn stream_decode(wire: &[u8]) -> Result<(String, u16, Bytes)> {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(wire).await.unwrap();
        drop(client);
        let mut reader = ProxyReader::new(server);
        let atyp = reader.read_u8().await?;
        read_address(&mut reader, atyp).await
    }

    #[tokio::test]
    async fn decodes_ipv4() {
        let (host, port, raw) = stream_decode(&[0x01, 1, 2, 3, 4, 0x00, 0x50]).await.unwrap();
        assert_eq!(host, "1.2.3.4");
        assert_eq!(port, 80);
        assert_eq!(&raw[..], &[1, 2, 3, 4, 0x00, 0x50]);
    }

    #[tokio::test]
    async fn decodes_domain_with_ota_variant() {
        let mut wire = vec![0x13, 11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&[0x00, 0x50]);
        let (host, port, raw) = stream_decode(&wire).await.unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        // raw covers everything after the type byte, length prefix included
        assert_eq!(&raw[..], &wire[1..]);
    }

    #[tokio::test]
    async fn decodes_ipv6() {
        let mut wire = vec![0x04];
        wire.extend_from_slice(&[0u8; 15]);
        wire.push(1);
        wire.extend_from_slice(&[0x1f, 0x90]);
        let (host, port, _) = stream_decode(&wire).await.unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn rejects_unknown_type_byte() {
        let err = stream_decode(&[0x07, 0, 0]).await.unwrap_err();
        assert!(matches!(err, PolyProxyError::Malformed(_)));
    }

    #[test]
    fn encode_then_decode_round_trips() {
        for (host, port) in [("example.com", 80u16), ("1.2.3.4", 443), ("::1", 0)] {
            let wire = encode_address(host, port);
            let (dec_host, dec_port, consumed) = decode_datagram_address(&wire).unwrap();
            assert_eq!(dec_host, host);
            assert_eq!(dec_port, port);
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn datagram_decode_leaves_payload() {
        let mut wire = encode_address("example.com", 80);
        let header_len = wire.len();
        wire.extend_from_slice(b"payload");
        let (_, _, consumed) = decode_datagram_address(&wire).unwrap();
        assert_eq!(consumed, header_len);
        assert_eq!(&wire[consumed..], b"payload");
    }

    #[test]
    fn datagram_decode_rejects_truncation() {
        let wire = encode_address("example.com", 80);
        assert!(decode_datagram_address(&wire[..wire.len() - 1]).is_none());
        assert!(decode_datagram_address(&[0x05, 1, 2]).is_none());
    }
}
