//! TLS ClientHello sniffing.
//!
//! Only enough of the handshake is parsed to learn the requested server
//! name; the bytes are then replayed to the real TLS acceptor.

use crate::error::DecodeError;

/// TLS record content type for handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

/// What was learned from the first TLS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// SNI host name, lowercased.
    pub server_name: Option<String>,
    /// Length of the record, header included.
    pub record_len: usize,
}

/// Returns true if the buffer starts like a TLS handshake record.
pub fn looks_like_tls(buf: &[u8]) -> bool {
    buf.first() == Some(&CONTENT_TYPE_HANDSHAKE)
}

/// Parses the ClientHello at the start of `buf`.
///
/// Returns `Ok(None)` until the whole first record is buffered.
pub fn parse_client_hello(buf: &[u8]) -> Result<Option<ClientHello>, DecodeError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(malformed("not a handshake record"));
    }
    let record_len = RECORD_HEADER_LEN + usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if buf.len() < record_len {
        return Ok(None);
    }

    let mut reader = Reader::new(&buf[RECORD_HEADER_LEN..record_len]);
    if reader.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(malformed("first handshake message is not a ClientHello"));
    }
    let _handshake_len = reader.u24()?;
    let _client_version = reader.u16()?;
    reader.skip(32)?;
    let session_id_len = usize::from(reader.u8()?);
    reader.skip(session_id_len)?;
    let cipher_suites_len = usize::from(reader.u16()?);
    reader.skip(cipher_suites_len)?;
    let compression_len = usize::from(reader.u8()?);
    reader.skip(compression_len)?;

    let server_name = if reader.is_empty() {
        None
    } else {
        let extensions_len = usize::from(reader.u16()?);
        find_server_name(Reader::new(reader.bytes(extensions_len)?))?
    };

    Ok(Some(ClientHello {
        server_name,
        record_len,
    }))
}

fn find_server_name(mut extensions: Reader<'_>) -> Result<Option<String>, DecodeError> {
    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = usize::from(extensions.u16()?);
        let mut body = Reader::new(extensions.bytes(len)?);
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let list_len = usize::from(body.u16()?);
        let mut list = Reader::new(body.bytes(list_len)?);
        while !list.is_empty() {
            let name_type = list.u8()?;
            let name_len = usize::from(list.u16()?);
            let name = list.bytes(name_len)?;
            if name_type == NAME_TYPE_HOST {
                let name = std::str::from_utf8(name)
                    .map_err(|_| malformed("server name is not UTF-8"))?;
                return Ok(Some(name.to_ascii_lowercase()));
            }
        }
    }
    Ok(None)
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::InvalidHead(format!("malformed ClientHello: {reason}"))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < len {
            return Err(malformed("truncated field"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}
