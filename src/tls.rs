use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use crate::auth::AdbKeyPair;
use crate::protocol::AdbError;
use crate::stream::lock;

/// Accepts any server certificate. Peer identity on an ADB transport is
/// established by key enrolment, not by the server's certificate; TLS here
/// provides confidentiality only.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// TLS 1.3 client configuration with our identity certificate and
/// unconditional server trust
pub(crate) fn client_tls_config(keypair: &AdbKeyPair) -> Result<ClientConfig, AdbError> {
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(keypair.certificate_chain(), keypair.private_key_der()?)
        .map_err(|e| AdbError::Key(format!("TLS client identity rejected: {}", e)))?;
    Ok(config)
}

/// A TLS session over an ADB socket, after the handshake
pub(crate) struct TlsSession {
    pub(crate) conn: ClientConnection,
    pub(crate) sock: TcpStream,
}

/// Wrap the socket in a TLS 1.3 client session after the STLS exchange.
/// Honors the read timeout already set on the socket.
pub(crate) fn upgrade_client(
    mut sock: TcpStream,
    host: &str,
    keypair: &AdbKeyPair,
) -> Result<TlsSession, AdbError> {
    let config = Arc::new(client_tls_config(keypair)?);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| AdbError::Protocol(format!("invalid server name: {}", host)))?;
    let mut conn = ClientConnection::new(config, server_name)
        .map_err(|e| AdbError::Protocol(format!("TLS setup failed: {}", e)))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)?;
    }
    debug!("TLS upgrade complete");
    Ok(TlsSession { conn, sock })
}

/// True for handshake failures indicating the peer wanted a trusted client
/// certificate it does not have, i.e. this key is not enrolled.
pub(crate) fn is_certificate_error(err: &AdbError) -> bool {
    let AdbError::Io(io_err) = err else {
        return false;
    };
    let Some(inner) = io_err.get_ref() else {
        return false;
    };
    let Some(tls_err) = inner.downcast_ref::<rustls::Error>() else {
        return false;
    };
    use rustls::AlertDescription::{
        AccessDenied, BadCertificate, CertificateRequired, CertificateUnknown, UnknownCA,
    };
    matches!(
        tls_err,
        rustls::Error::AlertReceived(
            CertificateRequired | BadCertificate | CertificateUnknown | UnknownCA | AccessDenied
        )
    )
}

/// The connection's byte transport: plain TCP until an STLS exchange
/// upgrades it
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(TlsSession),
}

impl Transport {
    /// The underlying socket, for timeouts and shutdown
    pub(crate) fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls(session) => &session.sock,
        }
    }

    /// Split into halves usable concurrently from the reader task and
    /// writers. For TLS the session state is shared behind a mutex that is
    /// never held across a blocking socket read.
    pub(crate) fn split(self) -> io::Result<(TransportReader, TransportWriter)> {
        match self {
            Transport::Plain(sock) => {
                let reader = sock.try_clone()?;
                Ok((
                    TransportReader::Plain(reader),
                    TransportWriter::Plain(sock),
                ))
            }
            Transport::Tls(session) => {
                let conn = Arc::new(Mutex::new(session.conn));
                let read_sock = session.sock.try_clone()?;
                Ok((
                    TransportReader::Tls {
                        conn: conn.clone(),
                        sock: read_sock,
                    },
                    TransportWriter::Tls {
                        conn,
                        sock: session.sock,
                    },
                ))
            }
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            Transport::Tls(session) => {
                rustls::Stream::new(&mut session.conn, &mut session.sock).read(buf)
            }
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.write(buf),
            Transport::Tls(session) => {
                rustls::Stream::new(&mut session.conn, &mut session.sock).write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(sock) => sock.flush(),
            Transport::Tls(session) => {
                rustls::Stream::new(&mut session.conn, &mut session.sock).flush()
            }
        }
    }
}

pub(crate) enum TransportReader {
    Plain(TcpStream),
    Tls {
        conn: Arc<Mutex<ClientConnection>>,
        sock: TcpStream,
    },
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TransportReader::Plain(sock) => sock.read(buf),
            TransportReader::Tls { conn, sock } => loop {
                {
                    let mut tls = lock(conn);
                    match tls.reader().read(buf) {
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                        Err(e) => return Err(e),
                    }
                }
                // No plaintext buffered. Pull more records off the socket
                // without holding the session lock, so writers stay
                // unblocked during the blocking read. The plaintext buffer
                // is empty here, so every record we feed in fits.
                let mut raw = [0u8; 4096];
                let n = sock.read(&mut raw)?;
                if n == 0 {
                    return Ok(0);
                }
                let mut tls = lock(conn);
                let mut slice: &[u8] = &raw[..n];
                while !slice.is_empty() {
                    if tls.read_tls(&mut slice)? == 0 {
                        // session refused bytes it must accept; dropping
                        // them would corrupt the record stream
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "TLS session stalled",
                        ));
                    }
                    tls.process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
            },
        }
    }
}

pub(crate) enum TransportWriter {
    Plain(TcpStream),
    Tls {
        conn: Arc<Mutex<ClientConnection>>,
        sock: TcpStream,
    },
}

impl Write for TransportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TransportWriter::Plain(sock) => sock.write(buf),
            TransportWriter::Tls { conn, sock } => {
                let mut tls = lock(conn);
                let n = tls.writer().write(buf)?;
                while tls.wants_write() {
                    tls.write_tls(sock)?;
                }
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TransportWriter::Plain(sock) => sock.flush(),
            TransportWriter::Tls { conn, sock } => {
                let mut tls = lock(conn);
                while tls.wants_write() {
                    tls.write_tls(sock)?;
                }
                sock.flush()
            }
        }
    }
}
