//! Blocking frame I/O.
//!
//! [`Transport`] moves raw frames (4-byte header + payload). [`TcpTransport`]
//! drives a tokio socket, plain or TLS, on a runtime owned by the connection
//! so every call blocks until the server answers. [`Session`] sits on top and
//! handles sequence ids and payloads larger than one frame.

use std::io;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_rustls::TlsConnector;

use crate::config::SslMode;
use crate::protocol::{HEADER_SIZE, MAX_PAYLOAD_LEN, encode_command};
use crate::{MySqlError, MySqlResult};

/// A frame-level connection to the server.
///
/// Implementations block until the frame is written or read.
pub trait Transport: Send {
    /// Write one frame. `payload` is at most [`MAX_PAYLOAD_LEN`] bytes.
    fn write_frame(&mut self, sequence_id: u8, payload: &[u8]) -> MySqlResult<()>;

    /// Read one frame, returning its sequence id and payload.
    fn read_frame(&mut self) -> MySqlResult<(u8, Vec<u8>)>;

    /// Switch to TLS. Called right after the SSL request frame was written.
    fn upgrade_tls(&mut self, host: &str, mode: SslMode) -> MySqlResult<()> {
        let _ = (host, mode);
        Err(MySqlError::Connect {
            message: "SSL connection error: transport does not support TLS".to_string(),
        })
    }

    /// Whether the stream is encrypted.
    fn is_secure(&self) -> bool {
        false
    }

    /// Release the socket. Must be safe to call more than once.
    fn shutdown(&mut self);
}

/// MySQL stream wrapper supporting both plain and TLS connections.
enum MysqlStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MysqlStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            MysqlStream::Plain(s) => {
                s.read_exact(buf).await?;
            }
            MysqlStream::Tls(s) => {
                s.read_exact(buf).await?;
            }
        }
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            MysqlStream::Plain(s) => s.write_all(buf).await,
            MysqlStream::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            MysqlStream::Plain(s) => s.shutdown().await,
            MysqlStream::Tls(s) => s.shutdown().await,
        }
    }
}

/// TCP transport driven by a per-connection current-thread runtime.
pub struct TcpTransport {
    // Dropped before the runtime that registered it
    stream: Option<MysqlStream>,
    runtime: Runtime,
}

impl TcpTransport {
    /// Open a TCP connection to `host:port`.
    ///
    /// Fails with `Init` when the runtime cannot be created and with
    /// `Connect` when the server cannot be reached.
    pub fn connect(host: &str, port: u16) -> MySqlResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|e| MySqlError::Init(format!("failed to start I/O runtime: {}", e)))?;

        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let stream = runtime
            .block_on(TcpStream::connect(&addr))
            .map_err(|e| MySqlError::Connect {
                message: format!("Can't connect to MySQL server on '{}' ({})", addr, e),
            })?;

        // Disable Nagle's algorithm, every command is a single small write
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(MysqlStream::Plain(stream)),
            runtime,
        })
    }

    fn tls_config(mode: SslMode) -> MySqlResult<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| MySqlError::Connect {
                message: format!("SSL connection error: {}", e),
            })?;

        let config = match mode {
            SslMode::VerifyIdentity => builder
                .with_root_certificates(rustls::RootCertStore::from_iter(
                    webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
                ))
                .with_no_client_auth(),
            _ => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier {
                    algorithms: provider.signature_verification_algorithms,
                }))
                .with_no_client_auth(),
        };
        Ok(config)
    }
}

fn lost_connection(e: io::Error) -> MySqlError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        MySqlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Lost connection to MySQL server during query",
        ))
    } else {
        MySqlError::Io(e)
    }
}

impl Transport for TcpTransport {
    fn write_frame(&mut self, sequence_id: u8, payload: &[u8]) -> MySqlResult<()> {
        let stream = self.stream.as_mut().ok_or(MySqlError::InvalidHandle)?;
        let len = payload.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
        buf.put_slice(&[
            (len & 0xff) as u8,
            ((len >> 8) & 0xff) as u8,
            ((len >> 16) & 0xff) as u8,
            sequence_id,
        ]);
        buf.put_slice(payload);
        self.runtime
            .block_on(stream.write_all(&buf))
            .map_err(lost_connection)
    }

    fn read_frame(&mut self) -> MySqlResult<(u8, Vec<u8>)> {
        let stream = self.stream.as_mut().ok_or(MySqlError::InvalidHandle)?;
        self.runtime
            .block_on(async {
                let mut header = [0u8; HEADER_SIZE];
                stream.read_exact(&mut header).await?;
                let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
                let mut payload = vec![0u8; len];
                stream.read_exact(&mut payload).await?;
                Ok::<_, io::Error>((header[3], payload))
            })
            .map_err(lost_connection)
    }

    fn upgrade_tls(&mut self, host: &str, mode: SslMode) -> MySqlResult<()> {
        let tcp = match self.stream.take() {
            Some(MysqlStream::Plain(tcp)) => tcp,
            Some(tls @ MysqlStream::Tls(_)) => {
                self.stream = Some(tls);
                return Ok(());
            }
            None => return Err(MySqlError::InvalidHandle),
        };

        let connector = TlsConnector::from(Arc::new(Self::tls_config(mode)?));
        let domain = ServerName::try_from(host.to_string()).map_err(|_| MySqlError::Connect {
            message: format!("SSL connection error: invalid server name '{}'", host),
        })?;

        let tls = self
            .runtime
            .block_on(connector.connect(domain, tcp))
            .map_err(|e| MySqlError::Connect {
                message: format!("SSL connection error: {}", e),
            })?;

        self.stream = Some(MysqlStream::Tls(Box::new(tls)));
        Ok(())
    }

    fn is_secure(&self) -> bool {
        matches!(self.stream, Some(MysqlStream::Tls(_)))
    }

    fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = self.runtime.block_on(stream.shutdown()) {
                tracing::debug!(error = %e, "socket shutdown failed");
            }
        }
    }
}

/// Accepts any server certificate but still checks handshake signatures.
/// Used for `preferred` and `required` SSL modes.
#[derive(Debug)]
struct NoCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Packet-level session: sequence ids and multi-frame payloads.
pub(crate) struct Session {
    transport: Box<dyn Transport>,
    sequence_id: u8,
}

impl Session {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            sequence_id: 0,
        }
    }

    /// Start a new command: sequence ids restart at 0.
    pub(crate) fn send_command(&mut self, command: u8, body: &[u8]) -> MySqlResult<()> {
        self.sequence_id = 0;
        self.write_packet(&encode_command(command, body))
    }

    /// Write a payload, splitting it into frames of at most 16 MiB - 1.
    pub(crate) fn write_packet(&mut self, payload: &[u8]) -> MySqlResult<()> {
        let mut rest = payload;
        loop {
            let len = rest.len().min(MAX_PAYLOAD_LEN);
            let (chunk, tail) = rest.split_at(len);
            self.transport.write_frame(self.sequence_id, chunk)?;
            self.sequence_id = self.sequence_id.wrapping_add(1);
            rest = tail;
            // A full frame must be followed by another one, possibly empty
            if len < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    /// Read a full payload, joining continuation frames.
    pub(crate) fn read_packet(&mut self) -> MySqlResult<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let (sequence_id, frame) = self.transport.read_frame()?;
            if sequence_id != self.sequence_id {
                return Err(MySqlError::Protocol(format!(
                    "packets out of order (expected {}, got {})",
                    self.sequence_id, sequence_id
                )));
            }
            self.sequence_id = sequence_id.wrapping_add(1);

            let more = frame.len() == MAX_PAYLOAD_LEN;
            if payload.is_empty() {
                payload = frame;
            } else {
                payload.extend_from_slice(&frame);
            }
            if !more {
                return Ok(payload);
            }
        }
    }

    pub(crate) fn upgrade_tls(&mut self, host: &str, mode: SslMode) -> MySqlResult<()> {
        self.transport.upgrade_tls(host, mode)
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub(crate) fn shutdown(&mut self) {
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Echo transport: frames written are queued back for reading.
    #[derive(Default)]
    struct Loopback {
        frames: Arc<Mutex<VecDeque<(u8, Vec<u8>)>>>,
    }

    impl Transport for Loopback {
        fn write_frame(&mut self, sequence_id: u8, payload: &[u8]) -> MySqlResult<()> {
            self.frames
                .lock()
                .unwrap()
                .push_back((sequence_id, payload.to_vec()));
            Ok(())
        }

        fn read_frame(&mut self) -> MySqlResult<(u8, Vec<u8>)> {
            self.frames
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| MySqlError::Io(io::ErrorKind::UnexpectedEof.into()))
        }

        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_large_payload_is_split_and_joined() {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let mut session = Session::new(Box::new(Loopback {
            frames: frames.clone(),
        }));

        let payload = vec![7u8; MAX_PAYLOAD_LEN + 10];
        session.write_packet(&payload).unwrap();
        {
            let written = frames.lock().unwrap();
            assert_eq!(written.len(), 2);
            assert_eq!(written[0].0, 0);
            assert_eq!(written[0].1.len(), MAX_PAYLOAD_LEN);
            assert_eq!(written[1].0, 1);
            assert_eq!(written[1].1.len(), 10);
        }

        session.sequence_id = 0;
        assert_eq!(session.read_packet().unwrap(), payload);
    }

    #[test]
    fn test_exact_frame_size_gets_empty_trailer() {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let mut session = Session::new(Box::new(Loopback {
            frames: frames.clone(),
        }));

        session.write_packet(&vec![1u8; MAX_PAYLOAD_LEN]).unwrap();
        let written = frames.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[1].1.is_empty());
    }

    #[test]
    fn test_out_of_order_sequence_is_rejected() {
        let frames = Arc::new(Mutex::new(VecDeque::from([(5u8, vec![0u8])])));
        let mut session = Session::new(Box::new(Loopback { frames }));
        let err = session.read_packet().unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }
}
