//! Blocking MySQL connection.

use std::fmt;

use tracing::{debug, warn};

use crate::auth::scramble_for;
use crate::charset::Charset;
use crate::config::{ConnectionParams, SslMode};
use crate::escape::{EscapeDialect, escape};
use crate::protocol::{
    CACHING_SHA2_PASSWORD, CLIENT_CAPABILITIES, ColumnDef, EofPacket, ErrPacket, InitialHandshake,
    MYSQL_NATIVE_PASSWORD, OkPacket, PacketReader, capability, command, encode_handshake_response,
    encode_ssl_request, parse_text_row, status,
};
use crate::result::{Field, ResultSet, Row};
use crate::transport::{Session, TcpTransport, Transport};
use crate::{MySqlError, MySqlResult};

/// Preallocation cap for per-column buffers. MySQL tables top out here.
const MAX_COLUMNS: usize = 4096;

/// Server facts learned while connecting.
struct ServerInfo {
    version: String,
    connection_id: u32,
    status_flags: u16,
}

/// A single blocking session with a MySQL server.
///
/// Every method runs to completion before returning. After [`close`](Self::close)
/// (or a drop) every operation fails with `InvalidHandle`.
pub struct Connection {
    session: Option<Session>,
    charset: &'static Charset,
    status_flags: u16,
    server_version: String,
    connection_id: u32,
}

impl Connection {
    /// Connect over TCP.
    pub fn connect(params: &ConnectionParams) -> MySqlResult<Self> {
        params.validate()?;
        let transport = TcpTransport::connect(params.host(), params.port())?;
        Self::connect_with_transport(params, Box::new(transport))
    }

    /// Run the handshake over an already opened transport.
    ///
    /// On failure the transport is shut down before the error is returned.
    pub fn connect_with_transport(
        params: &ConnectionParams,
        transport: Box<dyn Transport>,
    ) -> MySqlResult<Self> {
        params.validate()?;
        let charset = params
            .charset()
            .and_then(Charset::by_name)
            .unwrap_or_else(Charset::default_charset);

        debug!(
            host = params.host(),
            port = params.port(),
            user = params.user().unwrap_or_default(),
            database = params.database().unwrap_or_default(),
            charset = charset.name,
            "connecting"
        );

        let mut session = Session::new(transport);
        match Self::handshake(&mut session, params, charset) {
            Ok(info) => {
                debug!(
                    server_version = %info.version,
                    connection_id = info.connection_id,
                    secure = session.is_secure(),
                    "connected"
                );
                Ok(Self {
                    session: Some(session),
                    charset,
                    status_flags: info.status_flags,
                    server_version: info.version,
                    connection_id: info.connection_id,
                })
            }
            Err(e) => {
                session.shutdown();
                Err(e.into_connect())
            }
        }
    }

    fn handshake(
        session: &mut Session,
        params: &ConnectionParams,
        charset: &'static Charset,
    ) -> MySqlResult<ServerInfo> {
        let greeting = InitialHandshake::parse(&session.read_packet()?)?;
        if !greeting.supports(capability::CLIENT_PROTOCOL_41) {
            return Err(MySqlError::Connect {
                message: format!(
                    "server {} does not support protocol 4.1",
                    greeting.server_version
                ),
            });
        }

        let mut caps = CLIENT_CAPABILITIES & greeting.capability_flags;

        let server_ssl = greeting.supports(capability::CLIENT_SSL);
        let use_tls = match params.ssl_mode() {
            SslMode::Disabled => false,
            SslMode::Preferred => server_ssl,
            SslMode::Required | SslMode::VerifyIdentity => {
                if !server_ssl {
                    return Err(MySqlError::Connect {
                        message: "SSL connection error: SSL is required but the server doesn't support it"
                            .to_string(),
                    });
                }
                true
            }
        };
        if use_tls {
            caps |= capability::CLIENT_SSL;
            session.write_packet(&encode_ssl_request(caps, charset.id))?;
            session.upgrade_tls(params.host(), params.ssl_mode())?;
        }

        let user = params.user().map(str::to_string).unwrap_or_else(default_user);
        let password = params.password().unwrap_or_default();

        // Unknown initial plugins get a native scramble; the server answers
        // with an auth switch if it really needs something else.
        let plugin = match greeting.auth_plugin_name.as_str() {
            CACHING_SHA2_PASSWORD => CACHING_SHA2_PASSWORD,
            _ => MYSQL_NATIVE_PASSWORD,
        };
        let auth_response = scramble_for(plugin, password, &greeting.auth_plugin_data)?;
        session.write_packet(&encode_handshake_response(
            caps,
            &user,
            &auth_response,
            params.database(),
            charset.id,
            plugin,
        ))?;

        let ok = Self::authenticate(session, password, plugin.to_string())?;
        Ok(ServerInfo {
            version: greeting.server_version,
            connection_id: greeting.connection_id,
            status_flags: ok.status_flags,
        })
    }

    /// Drive the authentication exchange until the server sends OK or ERR.
    fn authenticate(
        session: &mut Session,
        password: &str,
        mut plugin: String,
    ) -> MySqlResult<OkPacket> {
        loop {
            let packet = session.read_packet()?;
            match packet.first() {
                Some(0x00) => return OkPacket::parse(&packet),
                Some(0xff) => return Err(ErrPacket::parse(&packet)),
                Some(0xfe) => {
                    // AuthSwitchRequest: plugin name + new scramble
                    let mut buf = PacketReader::new(&packet[1..]);
                    plugin = String::from_utf8_lossy(buf.read_null_string()).into_owned();
                    let mut scramble = buf.read_rest().to_vec();
                    if scramble.last() == Some(&0) {
                        scramble.pop();
                    }
                    debug!(plugin = %plugin, "auth switch requested");
                    let response = scramble_for(&plugin, password, &scramble)?;
                    session.write_packet(&response)?;
                }
                Some(0x01) if plugin == CACHING_SHA2_PASSWORD => match packet.get(1) {
                    // Fast auth succeeded, OK follows
                    Some(0x03) => debug!("caching_sha2_password fast auth"),
                    Some(0x04) => {
                        if !session.is_secure() {
                            return Err(MySqlError::Connect {
                                message: format!(
                                    "Authentication plugin '{}' reported error: Authentication requires secure connection.",
                                    CACHING_SHA2_PASSWORD
                                ),
                            });
                        }
                        debug!("caching_sha2_password full auth");
                        let mut cleartext = password.as_bytes().to_vec();
                        cleartext.push(0);
                        session.write_packet(&cleartext)?;
                    }
                    other => {
                        return Err(MySqlError::Protocol(format!(
                            "unexpected caching_sha2_password state {:?}",
                            other
                        )));
                    }
                },
                other => {
                    return Err(MySqlError::Protocol(format!(
                        "unexpected auth response {:?}, packet len: {}",
                        other,
                        packet.len()
                    )));
                }
            }
        }
    }

    fn session(&mut self) -> MySqlResult<&mut Session> {
        self.session.as_mut().ok_or(MySqlError::InvalidHandle)
    }

    fn ensure_open(&self) -> MySqlResult<()> {
        match self.session {
            Some(_) => Ok(()),
            None => Err(MySqlError::InvalidHandle),
        }
    }

    /// Drop the session when `result` failed somewhere other than a server
    /// ERR at a response boundary. The stream position is unknown then, so
    /// no further command may be sent on it.
    fn desync_guard<T>(&mut self, result: MySqlResult<T>) -> MySqlResult<T> {
        if let Err(e) = &result {
            if !matches!(e, MySqlError::Server { .. }) {
                if let Some(mut session) = self.session.take() {
                    warn!(
                        error = %e,
                        connection_id = self.connection_id,
                        "connection out of sync, closing"
                    );
                    session.shutdown();
                }
            }
        }
        result
    }

    /// Send a command answered by a single OK or ERR packet.
    fn simple_command(&mut self, cmd: u8, body: &[u8]) -> MySqlResult<()> {
        let session = self.session()?;
        let result = Self::exchange_ok(session, cmd, body);
        self.status_flags = self.desync_guard(result)?;
        Ok(())
    }

    fn exchange_ok(session: &mut Session, cmd: u8, body: &[u8]) -> MySqlResult<u16> {
        session.send_command(cmd, body)?;
        let packet = session.read_packet()?;
        match packet.first() {
            Some(0x00) => Ok(OkPacket::parse(&packet)?.status_flags),
            Some(0xff) => Err(ErrPacket::parse(&packet)),
            other => Err(MySqlError::Protocol(format!(
                "expected OK packet, got {:?}",
                other
            ))),
        }
    }

    /// Check the server is alive.
    pub fn ping(&mut self) -> MySqlResult<()> {
        debug!("COM_PING");
        self.simple_command(command::COM_PING, &[])
    }

    /// Change the default database. The name is passed through as is.
    pub fn select_database(&mut self, name: &str) -> MySqlResult<()> {
        debug!(database = name, "COM_INIT_DB");
        self.simple_command(command::COM_INIT_DB, name.as_bytes())
    }

    /// Switch the connection character set with `SET NAMES`.
    ///
    /// Names the client does not know fail with error 2019 without
    /// contacting the server.
    pub fn set_charset(&mut self, name: &str) -> MySqlResult<()> {
        self.ensure_open()?;
        let charset = Charset::by_name(name).ok_or_else(|| {
            MySqlError::server(
                2019,
                "HY000",
                format!("Can't initialize character set {}", name),
            )
        })?;
        self.execute(format!("SET NAMES {}", charset.name))?;
        self.charset = charset;
        Ok(())
    }

    /// Escape `input` for use inside a quoted literal, following the
    /// connection's charset and the server's `NO_BACKSLASH_ESCAPES` mode.
    pub fn escape(&self, input: impl AsRef<[u8]>) -> MySqlResult<Vec<u8>> {
        self.ensure_open()?;
        let input = input.as_ref();
        if input.is_empty() {
            return Ok(Vec::new());
        }
        Ok(escape(input, self.dialect()))
    }

    /// Dialect [`escape`](Self::escape) currently uses.
    pub fn dialect(&self) -> EscapeDialect {
        EscapeDialect::new(self.charset).with_no_backslash_escapes(self.no_backslash_escapes())
    }

    /// Run a statement and buffer its whole result.
    ///
    /// Statements without a result set (INSERT, UPDATE, DDL) produce an
    /// empty [`ResultSet`] carrying the affected row count. Only the first
    /// result of a multi-result response is returned.
    pub fn execute(&mut self, sql: impl AsRef<[u8]>) -> MySqlResult<ResultSet> {
        let sql = sql.as_ref();
        if sql.is_empty() {
            return Err(MySqlError::EmptyStatement);
        }

        let session = self.session()?;
        debug!(len = sql.len(), "COM_QUERY");
        let result = Self::run_query(session, sql);
        let (result, flags) = self.desync_guard(result)?;

        self.status_flags = flags;
        debug!(
            fields = result.field_count(),
            rows = result.row_count(),
            affected_rows = result.affected_rows(),
            "result buffered"
        );
        Ok(result)
    }

    /// Send COM_QUERY and read every result it produces. Returns the first
    /// result and the status that ended the last one.
    fn run_query(session: &mut Session, sql: &[u8]) -> MySqlResult<(ResultSet, u16)> {
        session.send_command(command::COM_QUERY, sql)?;

        let (result, mut flags) = Self::read_result(session)?;
        let mut discarded = 0;
        while flags & status::SERVER_MORE_RESULTS_EXISTS != 0 {
            let (_, next) = Self::read_result(session)?;
            flags = next;
            discarded += 1;
        }
        if discarded > 0 {
            warn!(count = discarded, "discarded extra result sets");
        }
        Ok((result, flags))
    }

    /// Read one result: OK, ERR, LOCAL INFILE request or a text result set.
    /// Returns the result and the server status that ended it.
    fn read_result(session: &mut Session) -> MySqlResult<(ResultSet, u16)> {
        let packet = session.read_packet()?;
        match packet.first() {
            Some(0x00) => {
                let ok = OkPacket::parse(&packet)?;
                Ok((ResultSet::from_ok(&ok), ok.status_flags))
            }
            Some(0xff) => Err(ErrPacket::parse(&packet)),
            Some(0xfb) => {
                let file = String::from_utf8_lossy(&packet[1..]).into_owned();
                warn!(file = %file, "declining LOCAL INFILE request");
                // An empty packet tells the server no data follows
                session.write_packet(&[])?;
                let reply = session.read_packet()?;
                match reply.first() {
                    Some(0xff) => Err(ErrPacket::parse(&reply)),
                    Some(0x00) => {
                        let ok = OkPacket::parse(&reply)?;
                        if ok.status_flags & status::SERVER_MORE_RESULTS_EXISTS != 0 {
                            return Err(MySqlError::Protocol(
                                "more results follow a declined LOCAL INFILE request".to_string(),
                            ));
                        }
                        Err(MySqlError::server(
                            2068,
                            "HY000",
                            "LOAD DATA LOCAL INFILE file request rejected due to restrictions on access.",
                        ))
                    }
                    other => Err(MySqlError::Protocol(format!(
                        "expected OK packet after declined LOCAL INFILE, got {:?}",
                        other
                    ))),
                }
            }
            Some(_) => Self::read_text_result(session, &packet),
            None => Err(MySqlError::Protocol("empty response packet".to_string())),
        }
    }

    fn read_text_result(session: &mut Session, header: &[u8]) -> MySqlResult<(ResultSet, u16)> {
        let count = PacketReader::new(header)
            .read_len_enc_int()?
            .ok_or_else(|| MySqlError::Protocol("NULL column count".to_string()))?;
        let column_count = usize::try_from(count)
            .map_err(|_| MySqlError::Protocol(format!("column count {} out of range", count)))?;

        let mut fields = Vec::with_capacity(column_count.min(MAX_COLUMNS));
        for _ in 0..column_count {
            fields.push(Field::from(ColumnDef::parse(&session.read_packet()?)?));
        }

        let eof = session.read_packet()?;
        if !EofPacket::is_eof(&eof) {
            return Err(MySqlError::Protocol(
                "expected EOF after column definitions".to_string(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = session.read_packet()?;
            if EofPacket::is_eof(&packet) {
                let eof = EofPacket::parse(&packet)?;
                return Ok((ResultSet::new(fields, rows, eof.warnings), eof.status_flags));
            }
            if packet.first() == Some(&0xff) {
                return Err(ErrPacket::parse(&packet));
            }
            rows.push(Row::new(parse_text_row(&packet, column_count)?));
        }
    }

    /// Send COM_QUIT and release the socket. Calling it again does nothing.
    pub fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        debug!(connection_id = self.connection_id, "closing connection");
        if let Err(e) = session.send_command(command::COM_QUIT, &[]) {
            warn!(error = %e, "COM_QUIT failed");
        }
        session.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Whether the session runs over TLS. False once closed.
    pub fn is_secure(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_secure)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn charset(&self) -> &'static Charset {
        self.charset
    }

    /// Server status flags from the last OK or EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .field("charset", &self.charset.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Login name used when no user is configured.
fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
