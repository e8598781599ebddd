//! Protocol classification for the first bytes of a tunneled stream.
//!
//! After a CONNECT tunnel is established the proxy peeks at the first chunk
//! the client sends and decides which path the connection takes: plaintext
//! HTTP, a TLS ClientHello (candidate for interception), or something opaque
//! that can only be relayed.
//!
//! Classification is a pure function over a byte buffer. It never errors and
//! never panics; anything it cannot positively identify is `Unknown`.

use tracing::trace;

/// TLS extension number for ALPN.
const ALPN_EXTENSION: u16 = 0x0010;

/// Handshake record content type.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// ClientHello handshake message type.
const TLS_CLIENT_HELLO: u8 = 0x01;

/// HTTP version recognized on a request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpVersion::Http10 => write!(f, "1.0"),
            HttpVersion::Http11 => write!(f, "1.1"),
        }
    }
}

/// TLS version as encoded in ClientHello version fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// SSL 3.0 (0x0300)
    Ssl30,
    /// TLS 1.0 (0x0301)
    Tls10,
    /// TLS 1.1 (0x0302)
    Tls11,
    /// TLS 1.2 (0x0303), also what TLS 1.3 puts on the wire here.
    Tls12,
    /// TLS 1.3 (0x0304)
    Tls13,
}

impl TlsVersion {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0300 => Some(TlsVersion::Ssl30),
            0x0301 => Some(TlsVersion::Tls10),
            0x0302 => Some(TlsVersion::Tls11),
            0x0303 => Some(TlsVersion::Tls12),
            0x0304 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVersion::Ssl30 => write!(f, "SSL 3.0"),
            TlsVersion::Tls10 => write!(f, "TLS 1.0"),
            TlsVersion::Tls11 => write!(f, "TLS 1.1"),
            TlsVersion::Tls12 => write!(f, "TLS 1.2"),
            TlsVersion::Tls13 => write!(f, "TLS 1.3"),
        }
    }
}

/// What the first bytes of a stream look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A plaintext HTTP/1.x request line.
    Http {
        /// Request method, verbatim.
        method: String,
        /// Version token from the request line.
        version: HttpVersion,
    },
    /// A TLS ClientHello.
    Tls {
        /// Version from the ClientHello body.
        version: TlsVersion,
        /// ALPN protocol names in wire order; empty when the extension is
        /// absent.
        alpn: Vec<String>,
    },
    /// Neither of the above; relay only.
    Unknown,
}

/// Classify the first bytes of a stream.
///
/// HTTP is tried first (a request line is cheap to reject), then a TLS
/// ClientHello. Truncated or malformed input of either shape degrades to
/// [`Classification::Unknown`].
pub fn classify(buf: &[u8]) -> Classification {
    if let Some(http) = classify_http(buf) {
        return http;
    }
    if let Some(tls) = classify_tls(buf) {
        return tls;
    }
    Classification::Unknown
}

/// Recognize an HTTP/1.x request line.
///
/// Scans up to the first LF: every byte must be printable ASCII, except a CR
/// immediately before the LF. Exactly two spaces must appear before the
/// terminator, and the token after the second space must be `HTTP/1.1` or
/// `HTTP/1.0`.
fn classify_http(buf: &[u8]) -> Option<Classification> {
    let mut first_space = None;
    let mut second_space = None;

    for (i, &byte) in buf.iter().enumerate() {
        match byte {
            b' ' => {
                if first_space.is_none() {
                    first_space = Some(i);
                } else if second_space.is_none() {
                    second_space = Some(i);
                } else {
                    trace!("request line has more than two spaces, not HTTP");
                    return None;
                }
            }
            b'\n' => {
                let method_end = first_space?;
                let version_start = second_space? + 1;
                let mut line_end = i;
                if buf[i - 1] == b'\r' {
                    line_end -= 1;
                }
                let version = match buf.get(version_start..line_end)? {
                    b"HTTP/1.1" => HttpVersion::Http11,
                    b"HTTP/1.0" => HttpVersion::Http10,
                    _ => return None,
                };
                let method = std::str::from_utf8(&buf[..method_end]).ok()?.to_string();
                return Some(Classification::Http { method, version });
            }
            b'\r' => {
                // CR is only legal directly before the terminating LF.
                if buf.get(i + 1) != Some(&b'\n') {
                    return None;
                }
            }
            0x20..=0x7E => {}
            _ => {
                trace!("non-printable byte 0x{:02x} at offset {}, not HTTP", byte, i);
                return None;
            }
        }
    }

    // Ran out of bytes before a terminator: not enough evidence.
    None
}

/// Recognize a TLS ClientHello, extracting the version and ALPN list.
fn classify_tls(buf: &[u8]) -> Option<Classification> {
    if *buf.first()? != TLS_HANDSHAKE_RECORD {
        return None;
    }
    // Record legacy version must itself be a known version number.
    TlsVersion::from_u16(read_u16(buf, 1)?)?;

    let handshake = length_block(buf, 3, 2)?;
    if *handshake.first()? != TLS_CLIENT_HELLO {
        return None;
    }
    let body = length_block(handshake, 1, 3)?;

    let version = TlsVersion::from_u16(read_u16(body, 0)?)?;

    // Skip version (2) + random (32), then the three variable-length fields
    // before the extensions: session id, cipher suites, compression methods.
    let mut offset = 34;
    offset = skip_block(body, offset, 1)?;
    offset = skip_block(body, offset, 2)?;
    offset = skip_block(body, offset, 1)?;

    let extensions = length_block(body, offset, 2)?;
    let mut alpn = Vec::new();
    let mut cursor = 0;
    while cursor < extensions.len() {
        let ext_type = read_u16(extensions, cursor)?;
        if ext_type != ALPN_EXTENSION {
            cursor = skip_block(extensions, cursor + 2, 2)?;
            continue;
        }
        let data = length_block(extensions, cursor + 2, 2)?;
        let names = length_block(data, 0, 2)?;
        let mut pos = 0;
        while pos < names.len() {
            let name = length_block(names, pos, 1)?;
            alpn.push(String::from_utf8(name.to_vec()).ok()?);
            pos += 1 + name.len();
        }
        break;
    }

    Some(Classification::Tls { version, alpn })
}

/// Big-endian u16 at `offset`.
fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Big-endian unsigned integer of `len_size` bytes (1..=3) at `offset`.
fn read_uint(buf: &[u8], offset: usize, len_size: usize) -> Option<usize> {
    let bytes = buf.get(offset..offset + len_size)?;
    Some(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
}

/// Slice out a length-prefixed block starting at `offset`.
fn length_block(buf: &[u8], offset: usize, len_size: usize) -> Option<&[u8]> {
    let len = read_uint(buf, offset, len_size)?;
    let start = offset + len_size;
    buf.get(start..start + len)
}

/// Return the offset just past a length-prefixed block at `offset`.
fn skip_block(buf: &[u8], offset: usize, len_size: usize) -> Option<usize> {
    let len = read_uint(buf, offset, len_size)?;
    let end = offset + len_size + len;
    if end > buf.len() {
        return None;
    }
    Some(end)
}
