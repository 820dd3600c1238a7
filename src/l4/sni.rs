use std::time::Duration;
use tokio::net::TcpStream;

const TLS_HANDSHAKE: u8 = 0x16;
const MAX_RECORD_LEN: usize = 16384;
const PEEK_BUF: usize = MAX_RECORD_LEN + 5;

/// Peek the first TLS record off an accepted connection without consuming
/// bytes, and extract the SNI host name. Returns `None` on anything that is
/// not a parseable ClientHello — the caller keeps routing with an empty SNI.
pub async fn peek_sni(stream: &TcpStream) -> Option<String> {
    let mut buf = vec![0u8; PEEK_BUF];
    // The ClientHello may arrive fragmented; give it a few chances to land.
    let mut have = 0usize;
    for _ in 0..5 {
        have = match tokio::time::timeout(Duration::from_millis(500), stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => return None,
        };
        if have >= 5 {
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if record_len > MAX_RECORD_LEN {
                return None;
            }
            if have >= record_len + 5 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    extract_sni(&buf[..have])
}

/// Walk a TLS ClientHello record for the server_name extension.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    if data.len() < 5 || data[0] != TLS_HANDSHAKE {
        return None;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len > MAX_RECORD_LEN {
        return None;
    }
    let record = data.get(5..5 + record_len)?;

    // Handshake header: type (1, must be ClientHello) + length (3).
    if record.first() != Some(&0x01) || record.len() < 4 {
        return None;
    }
    let mut pos = 4;

    // client_version (2) + random (32).
    pos += 34;

    // session_id.
    let session_len = *record.get(pos)? as usize;
    pos += 1 + session_len;

    // cipher_suites.
    let cipher_len = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;

    // compression_methods.
    let compression_len = *record.get(pos)? as usize;
    pos += 1 + compression_len;

    // extensions.
    let ext_total = u16::from_be_bytes([*record.get(pos)?, *record.get(pos + 1)?]) as usize;
    pos += 2;
    let mut ext = record.get(pos..pos + ext_total)?;

    while ext.len() >= 4 {
        let ext_type = u16::from_be_bytes([ext[0], ext[1]]);
        let ext_len = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        let body = ext.get(4..4 + ext_len)?;
        if ext_type == 0x0000 {
            return parse_server_name_list(body);
        }
        ext = &ext[4 + ext_len..];
    }
    None
}

/// server_name extension body: list length (2), then entries of
/// name_type (1) + name length (2) + name.
fn parse_server_name_list(body: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([*body.first()?, *body.get(1)?]) as usize;
    let mut list = body.get(2..2 + list_len)?;
    while list.len() >= 3 {
        let name_type = list[0];
        let name_len = u16::from_be_bytes([list[1], list[2]]) as usize;
        let name = list.get(3..3 + name_len)?;
        if name_type == 0x00 {
            return std::str::from_utf8(name).ok().map(|s| s.to_string());
        }
        list = &list[3 + name_len..];
    }
    None
}

/// Match an extracted SNI against a pattern: exact, or single-level
/// wildcard (`*.example.com` matches `a.example.com` but not
/// `a.b.example.com`).
pub fn sni_matches(pattern: &str, sni: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match sni.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        };
    }
    pattern.eq_ignore_ascii_case(sni)
}

/// Build a minimal ClientHello carrying an SNI — synthetic wire bytes for
/// the parser tests.
#[cfg(test)]
pub(crate) fn synthetic_client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    // server_name extension body.
    let mut sni_entry = vec![0x00]; // name_type host_name
    sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_entry.extend_from_slice(name);
    let mut sni_body = (sni_entry.len() as u16).to_be_bytes().to_vec();
    sni_body.extend_from_slice(&sni_entry);

    let mut extensions = Vec::new();
    // A throwaway extension first, so the walker has to skip one.
    extensions.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
    extensions.extend_from_slice(&[0x00, 0x00]); // server_name type
    extensions.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_body);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client_version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // session_id length
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    hello.extend_from_slice(&[0x01, 0x00]); // one compression method (null)
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01]; // ClientHello
    let len = hello.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 3-byte length
    handshake.extend_from_slice(&hello);

    let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_sni() {
        let record = synthetic_client_hello("api.internal.example.com");
        assert_eq!(
            extract_sni(&record).as_deref(),
            Some("api.internal.example.com")
        );
    }

    #[test]
    fn test_non_handshake_rejected() {
        let mut record = synthetic_client_hello("x.example.com");
        record[0] = 0x17; // application data
        assert!(extract_sni(&record).is_none());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = synthetic_client_hello("x.example.com");
        assert!(extract_sni(&record[..20]).is_none());
    }

    #[test]
    fn test_no_sni_extension() {
        let mut record = synthetic_client_hello("x.example.com");
        // Corrupt the server_name extension type so the walker never finds it.
        let pos = record
            .windows(2)
            .rposition(|w| w == [0x00, 0x00])
            .unwrap();
        record[pos] = 0xff;
        assert!(extract_sni(&record).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(extract_sni(&[]).is_none());
        assert!(extract_sni(&[0x16, 0x03]).is_none());
        assert!(extract_sni(&[0xde, 0xad, 0xbe, 0xef, 0x00]).is_none());
    }

    #[test]
    fn test_sni_matches_exact() {
        assert!(sni_matches("api.example.com", "api.example.com"));
        assert!(sni_matches("API.example.COM", "api.example.com"));
        assert!(!sni_matches("api.example.com", "other.example.com"));
    }

    #[test]
    fn test_sni_matches_single_level_wildcard() {
        assert!(sni_matches("*.example.com", "api.example.com"));
        assert!(!sni_matches("*.example.com", "a.b.example.com"));
        assert!(!sni_matches("*.example.com", "example.com"));
    }
}
