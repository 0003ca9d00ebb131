//! MySQL wire protocol constants and packet parsing.
//!
//! Pure, no I/O. Implements the packets a text-protocol client needs:
//! - Initial Handshake (server greeting)
//! - SSL Request and Handshake Response (client auth)
//! - COM_QUERY, COM_INIT_DB, COM_PING, COM_QUIT
//! - OK / ERR / EOF
//! - Result Set (column definitions + text rows)

use bytes::{BufMut, BytesMut};

use crate::{MySqlError, MySqlResult};

/// MySQL packet header: 3-byte length + 1-byte sequence
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single frame can carry. Longer payloads are split.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Max packet size announced in the handshake response.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
}

pub mod status {
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
}

pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Capabilities this client always asks for.
pub const CLIENT_CAPABILITIES: u32 = capability::CLIENT_LONG_PASSWORD
    | capability::CLIENT_LONG_FLAG
    | capability::CLIENT_PROTOCOL_41
    | capability::CLIENT_TRANSACTIONS
    | capability::CLIENT_SECURE_CONNECTION
    | capability::CLIENT_MULTI_RESULTS
    | capability::CLIENT_PLUGIN_AUTH;

/// Bounds-checked cursor over a packet payload.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> MySqlResult<u8> {
        let b = self.peek().ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: usize) -> MySqlResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(truncated());
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> MySqlResult<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn read_u16_le(&mut self) -> MySqlResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24_le(&mut self) -> MySqlResult<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32_le(&mut self) -> MySqlResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> MySqlResult<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read a null-terminated string. A missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    /// Read a length-encoded integer. `None` is the 0xFB NULL marker.
    pub fn read_len_enc_int(&mut self) -> MySqlResult<Option<u64>> {
        match self.read_u8()? {
            0xfb => Ok(None),
            0xfc => Ok(Some(u64::from(self.read_u16_le()?))),
            0xfd => Ok(Some(u64::from(self.read_u24_le()?))),
            0xfe => Ok(Some(self.read_u64_le()?)),
            0xff => Err(MySqlError::Protocol(
                "invalid length-encoded integer prefix 0xff".into(),
            )),
            n => Ok(Some(u64::from(n))),
        }
    }

    /// Read a length-encoded string. `None` is SQL NULL.
    pub fn read_len_enc_bytes(&mut self) -> MySqlResult<Option<&'a [u8]>> {
        match self.read_len_enc_int()? {
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| MySqlError::Protocol("length-encoded string too long".into()))?;
                Ok(Some(self.read_bytes(len)?))
            }
            None => Ok(None),
        }
    }

    fn read_len_enc_string(&mut self) -> MySqlResult<String> {
        let bytes = self.read_len_enc_bytes()?.unwrap_or_default();
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn truncated() -> MySqlError {
    MySqlError::Protocol("unexpected end of packet".into())
}

/// Write a length-encoded integer to buffer.
pub fn write_len_enc_int(buf: &mut BytesMut, val: u64) {
    if val < 251 {
        buf.put_u8(val as u8);
    } else if val < 65536 {
        buf.put_u8(0xfc);
        buf.put_u16_le(val as u16);
    } else if val < 16777216 {
        buf.put_u8(0xfd);
        buf.put_u8((val & 0xff) as u8);
        buf.put_u8(((val >> 8) & 0xff) as u8);
        buf.put_u8(((val >> 16) & 0xff) as u8);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(val);
    }
}

/// Initial handshake packet from server.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble (20 bytes on every supported server).
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn parse(data: &[u8]) -> MySqlResult<Self> {
        if data.first() == Some(&0xff) {
            // Server refused us before the greeting (too many connections, host blocked)
            return Err(ErrPacket::parse(data));
        }

        let mut buf = PacketReader::new(data);

        let protocol_version = buf.read_u8()?;
        if protocol_version != 10 {
            return Err(MySqlError::Protocol(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }

        let server_version = String::from_utf8_lossy(buf.read_null_string()).into_owned();
        let connection_id = buf.read_u32_le()?;

        // Auth plugin data part 1 (8 bytes) + filler
        let mut auth_data = buf.read_bytes(8)?.to_vec();
        buf.skip(1)?;

        let cap_lower = u32::from(buf.read_u16_le()?);

        // Pre-4.1 servers stop here
        if buf.remaining() == 0 {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                auth_plugin_data: auth_data,
                capability_flags: cap_lower,
                character_set: 0,
                status_flags: 0,
                auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
            });
        }

        let character_set = buf.read_u8()?;
        let status_flags = buf.read_u16_le()?;
        let cap_upper = u32::from(buf.read_u16_le()?);
        let capability_flags = cap_lower | (cap_upper << 16);

        let auth_data_len = usize::from(buf.read_u8()?);

        // Reserved
        buf.skip(10)?;

        if capability_flags & capability::CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = auth_data_len.saturating_sub(8).max(13).min(buf.remaining());
            auth_data.extend_from_slice(buf.read_bytes(part2_len)?);
        }

        // Scramble is sent null-terminated
        while auth_data.last() == Some(&0) {
            auth_data.pop();
        }

        let auth_plugin_name = if capability_flags & capability::CLIENT_PLUGIN_AUTH != 0 {
            String::from_utf8_lossy(buf.read_null_string()).into_owned()
        } else {
            MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data: auth_data,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }

    pub fn supports(&self, flag: u32) -> bool {
        self.capability_flags & flag != 0
    }
}

/// Encode handshake response (client authentication).
///
/// `database` is only sent (with CLIENT_CONNECT_WITH_DB) when present;
/// `Some("")` asks the server for a database named "".
pub fn encode_handshake_response(
    capabilities: u32,
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
    character_set: u8,
    auth_plugin: &str,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);

    let mut caps = capabilities;
    if database.is_some() {
        caps |= capability::CLIENT_CONNECT_WITH_DB;
    }
    buf.put_u32_le(caps);
    buf.put_u32_le(MAX_PACKET_SIZE);
    buf.put_u8(character_set);
    buf.put_slice(&[0u8; 23]);

    buf.put_slice(user.as_bytes());
    buf.put_u8(0);

    // Auth response (1-byte length, CLIENT_SECURE_CONNECTION)
    buf.put_u8(auth_response.len() as u8);
    buf.put_slice(auth_response);

    if let Some(db) = database {
        buf.put_slice(db.as_bytes());
        buf.put_u8(0);
    }

    buf.put_slice(auth_plugin.as_bytes());
    buf.put_u8(0);

    buf
}

/// Encode SSL request packet (for TLS upgrade).
pub fn encode_ssl_request(capabilities: u32, character_set: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u32_le(capabilities | capability::CLIENT_SSL);
    buf.put_u32_le(MAX_PACKET_SIZE);
    buf.put_u8(character_set);
    buf.put_slice(&[0u8; 23]);
    buf
}

/// Encode a command packet payload (command byte + argument).
pub fn encode_command(command: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(command);
    buf.put_slice(body);
    buf
}

/// OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn parse(data: &[u8]) -> MySqlResult<Self> {
        let mut buf = PacketReader::new(data);
        let header = buf.read_u8()?;
        if header != 0x00 && header != 0xfe {
            return Err(MySqlError::Protocol(format!(
                "expected OK packet, got header 0x{:02x}",
                header
            )));
        }
        let affected_rows = buf.read_len_enc_int()?.unwrap_or(0);
        let last_insert_id = buf.read_len_enc_int()?.unwrap_or(0);
        let status_flags = buf.read_u16_le()?;
        let warnings = buf.read_u16_le()?;
        let info = String::from_utf8_lossy(buf.read_rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// ERR packet.
pub struct ErrPacket;

impl ErrPacket {
    /// Decode an ERR packet into a server error. Malformed packets still
    /// yield an error carrying whatever text was present.
    pub fn parse(data: &[u8]) -> MySqlError {
        let mut buf = PacketReader::new(data);
        let _ = buf.read_u8();
        let code = buf.read_u16_le().unwrap_or(0);
        let sql_state = if buf.peek() == Some(b'#') {
            let _ = buf.read_u8();
            buf.read_bytes(5)
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        let message = String::from_utf8_lossy(buf.read_rest()).into_owned();
        MySqlError::server(code, sql_state, message)
    }
}

/// EOF packet (0xFE with a short payload).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn is_eof(data: &[u8]) -> bool {
        data.first() == Some(&0xfe) && data.len() < 9
    }

    pub fn parse(data: &[u8]) -> MySqlResult<Self> {
        let mut buf = PacketReader::new(data);
        buf.read_u8()?;
        if buf.remaining() < 4 {
            // Pre-4.1 EOF carries no flags
            return Ok(Self::default());
        }
        Ok(Self {
            warnings: buf.read_u16_le()?,
            status_flags: buf.read_u16_le()?,
        })
    }
}

/// Column type codes as declared in a column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    VarChar,
    Bit,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    Unknown(u8),
}

impl From<u8> for ColumnType {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Decimal,
            0x01 => Self::Tiny,
            0x02 => Self::Short,
            0x03 => Self::Long,
            0x04 => Self::Float,
            0x05 => Self::Double,
            0x06 => Self::Null,
            0x07 => Self::Timestamp,
            0x08 => Self::LongLong,
            0x09 => Self::Int24,
            0x0a => Self::Date,
            0x0b => Self::Time,
            0x0c => Self::DateTime,
            0x0d => Self::Year,
            0x0f => Self::VarChar,
            0x10 => Self::Bit,
            0xf5 => Self::Json,
            0xf6 => Self::NewDecimal,
            0xf7 => Self::Enum,
            0xf8 => Self::Set,
            0xf9 => Self::TinyBlob,
            0xfa => Self::MediumBlob,
            0xfb => Self::LongBlob,
            0xfc => Self::Blob,
            0xfd => Self::VarString,
            0xfe => Self::String,
            0xff => Self::Geometry,
            other => Self::Unknown(other),
        }
    }
}

/// Column definition from result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    pub fn parse(data: &[u8]) -> MySqlResult<Self> {
        let mut buf = PacketReader::new(data);

        let _catalog = buf.read_len_enc_string()?;
        let schema = buf.read_len_enc_string()?;
        let table = buf.read_len_enc_string()?;
        let _org_table = buf.read_len_enc_string()?;
        let name = buf.read_len_enc_string()?;
        let org_name = buf.read_len_enc_string()?;

        // Length of fixed fields, always 0x0c
        let _fixed_len = buf.read_len_enc_int()?;
        let charset = buf.read_u16_le()?;
        let column_length = buf.read_u32_le()?;
        let column_type = ColumnType::from(buf.read_u8()?);
        let flags = buf.read_u16_le()?;
        let decimals = buf.read_u8()?;

        Ok(Self {
            schema,
            table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }
}

/// Decode a text-protocol row with `column_count` values.
pub fn parse_text_row(data: &[u8], column_count: usize) -> MySqlResult<Vec<Option<Vec<u8>>>> {
    let mut buf = PacketReader::new(data);
    let mut values = Vec::with_capacity(column_count.min(buf.remaining()));
    for _ in 0..column_count {
        values.push(buf.read_len_enc_bytes()?.map(<[u8]>::to_vec));
    }
    if buf.remaining() != 0 {
        return Err(MySqlError::Protocol(format!(
            "row has {} trailing bytes after {} columns",
            buf.remaining(),
            column_count
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn handshake_packet() -> Vec<u8> {
        let mut p = vec![10];
        p.extend_from_slice(b"8.0.36\0");
        p.extend_from_slice(&42u32.to_le_bytes());
        p.extend_from_slice(b"abcdefgh");
        p.push(0);
        let caps = CLIENT_CAPABILITIES | capability::CLIENT_SSL | capability::CLIENT_CONNECT_WITH_DB;
        p.extend_from_slice(&(caps as u16).to_le_bytes());
        p.push(45);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(b"ijklmnopqrst\0");
        p.extend_from_slice(b"caching_sha2_password\0");
        p
    }

    #[test]
    fn test_parse_handshake() {
        let hs = InitialHandshake::parse(&handshake_packet()).unwrap();
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.auth_plugin_data, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(hs.character_set, 45);
        assert_eq!(hs.auth_plugin_name, CACHING_SHA2_PASSWORD);
        assert!(hs.supports(capability::CLIENT_SSL));
    }

    #[test]
    fn test_truncated_handshake_is_an_error() {
        let packet = handshake_packet();
        assert!(InitialHandshake::parse(&packet[..12]).is_err());
        assert!(InitialHandshake::parse(&[]).is_err());
    }

    #[test]
    fn test_handshake_err_packet() {
        let mut p = vec![0xff];
        p.extend_from_slice(&1040u16.to_le_bytes());
        p.extend_from_slice(b"Too many connections");
        let err = InitialHandshake::parse(&p).unwrap_err();
        assert_eq!(err.code(), Some(1040));
        assert_eq!(err.to_string(), "Too many connections");
    }

    #[test]
    fn test_handshake_response_database_is_optional() {
        let without = encode_handshake_response(CLIENT_CAPABILITIES, "u", &[], None, 45, MYSQL_NATIVE_PASSWORD);
        let caps = u32::from_le_bytes([without[0], without[1], without[2], without[3]]);
        assert_eq!(caps & capability::CLIENT_CONNECT_WITH_DB, 0);

        let empty = encode_handshake_response(CLIENT_CAPABILITIES, "u", &[], Some(""), 45, MYSQL_NATIVE_PASSWORD);
        let caps = u32::from_le_bytes([empty[0], empty[1], empty[2], empty[3]]);
        assert_ne!(caps & capability::CLIENT_CONNECT_WITH_DB, 0);
        // Empty database name still gets its terminator
        assert_eq!(empty.len(), without.len() + 1);
    }

    #[test]
    fn test_ok_packet() {
        let ok = OkPacket::parse(&[0x00, 0x03, 0xfc, 0x10, 0x27, 0x02, 0x02, 0x01, 0x00]).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 10000);
        assert_eq!(ok.status_flags, 0x0202);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_err_packet() {
        let mut p = vec![0xff];
        p.extend_from_slice(&1049u16.to_le_bytes());
        p.extend_from_slice(b"#42000Unknown database 'nope'");
        match ErrPacket::parse(&p) {
            MySqlError::Server { code, sql_state, message } => {
                assert_eq!(code, 1049);
                assert_eq!(sql_state, "42000");
                assert_eq!(message, "Unknown database 'nope'");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[test]
    fn test_len_enc_round_values() {
        for val in [0u64, 250, 251, 65535, 65536, 16_777_215, 16_777_216] {
            let mut buf = BytesMut::new();
            write_len_enc_int(&mut buf, val);
            let mut reader = PacketReader::new(&buf);
            assert_eq!(reader.read_len_enc_int().unwrap(), Some(val));
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_text_row_null_vs_empty() {
        let row = parse_text_row(&[0x01, b'1', 0xfb, 0x00], 3).unwrap();
        assert_eq!(row, vec![Some(b"1".to_vec()), None, Some(Vec::new())]);
        assert!(parse_text_row(&[0x05, b'a'], 1).is_err());
    }

    #[test]
    fn test_column_def() {
        let mut p = BytesMut::new();
        for s in ["def", "d", "t", "t", "id", "id"] {
            write_len_enc_int(&mut p, s.len() as u64);
            p.put_slice(s.as_bytes());
        }
        p.put_u8(0x0c);
        p.put_u16_le(63);
        p.put_u32_le(11);
        p.put_u8(0x03);
        p.put_u16_le(0x4203);
        p.put_u8(0);
        p.put_u16_le(0);

        let col = ColumnDef::parse(&p).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.table, "t");
        assert_eq!(col.column_type, ColumnType::Long);
        assert_eq!(col.column_length, 11);
    }
}
