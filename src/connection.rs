use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::auth::AdbKeyPair;
use crate::protocol::{AdbError, AuthType, Command, Message, MAX_PAYLOAD};
use crate::stream::{lock, AdbStream, StreamInner, StreamState};
use crate::tls::{self, Transport, TransportReader, TransportWriter};

/// A wall-clock deadline spanning the whole connect handshake
struct Deadline(Option<Instant>);

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    /// Time left, or `Timeout` once expired. `None` means unbounded.
    fn remaining(&self) -> Result<Option<Duration>, AdbError> {
        match self.0 {
            None => Ok(None),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    Err(AdbError::Timeout)
                } else {
                    Ok(Some(at - now))
                }
            }
        }
    }
}

/// Configures and establishes an [`AdbConnection`]
pub struct AdbConnectionBuilder {
    host: String,
    port: u16,
    api: u32,
    timeout: Option<Duration>,
    throw_on_unauthorized: bool,
}

impl AdbConnectionBuilder {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            api: 1,
            timeout: None,
            throw_on_unauthorized: false,
        }
    }

    /// Android API level of the peer; informational, TLS-era peers
    /// (API 29+) will request STLS regardless
    pub fn api(mut self, api: u32) -> Self {
        self.api = api;
        self
    }

    /// Single deadline across the whole handshake, TLS included
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail fast with [`AdbError::AuthRejected`] when the peer rejects the
    /// first signature, and with [`AdbError::PairingRequired`] when the TLS
    /// handshake shows the key is not enrolled, instead of waiting on the
    /// on-device prompt
    pub fn throw_on_unauthorized(mut self, value: bool) -> Self {
        self.throw_on_unauthorized = value;
        self
    }

    /// Dial the peer, run the CNXN/AUTH/STLS handshake and start the
    /// reader task
    pub fn connect(self, keypair: &AdbKeyPair) -> Result<AdbConnection, AdbError> {
        let deadline = Deadline::new(self.timeout);
        debug!(host = %self.host, port = self.port, "connecting");
        let sock = dial(&self.host, self.port, &deadline)?;
        let _ = sock.set_nodelay(true);

        let transport = Transport::Plain(sock);
        let (transport, max_payload) = handshake(
            transport,
            &self.host,
            keypair,
            self.throw_on_unauthorized,
            &deadline,
        )?;

        // handshake deadline no longer applies
        transport.socket().set_read_timeout(None)?;
        let shutdown_sock = transport.socket().try_clone()?;
        let (reader, writer) = transport.split()?;

        let inner = Arc::new(ConnectionInner {
            shared: Mutex::new(ConnShared {
                open: true,
                streams: HashMap::new(),
                next_local_id: 1,
            }),
            writer: Mutex::new(writer),
            shutdown_sock,
            max_payload,
        });

        let reader_inner = inner.clone();
        thread::Builder::new()
            .name("adb-reader".to_string())
            .spawn(move || reader_loop(&reader_inner, reader))?;

        Ok(AdbConnection { inner })
    }
}

fn dial(host: &str, port: u16, deadline: &Deadline) -> Result<TcpStream, AdbError> {
    match deadline.remaining()? {
        None => Ok(TcpStream::connect((host, port))?),
        Some(mut remaining) => {
            let mut last_err: Option<std::io::Error> = None;
            for addr in (host, port).to_socket_addrs()? {
                match TcpStream::connect_timeout(&addr, remaining) {
                    Ok(sock) => return Ok(sock),
                    Err(e) => last_err = Some(e),
                }
                if let Some(left) = deadline.remaining()? {
                    remaining = left;
                }
            }
            match last_err {
                Some(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
                {
                    Err(AdbError::Timeout)
                }
                Some(e) => Err(e.into()),
                None => Err(AdbError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {}", host),
                ))),
            }
        }
    }
}

/// Run the opening sequence of §CNXN/AUTH/STLS against a freshly dialed
/// socket. Returns the (possibly TLS-upgraded) transport and the
/// negotiated maximum outgoing payload.
fn handshake(
    mut transport: Transport,
    host: &str,
    keypair: &AdbKeyPair,
    fail_fast: bool,
    deadline: &Deadline,
) -> Result<(Transport, usize), AdbError> {
    send_frame(&mut transport, &Message::connect())?;

    let mut sent_signature = false;
    let mut sent_public_key = false;
    loop {
        transport.socket().set_read_timeout(deadline.remaining()?)?;
        let msg = match Message::decode(&mut transport) {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() => return Err(AdbError::Timeout),
            // a peer that does not trust our certificate aborts after the
            // TLS handshake looked complete on our side; the alert shows
            // up on this read
            Err(e) if fail_fast && tls::is_certificate_error(&e) => {
                return Err(AdbError::PairingRequired)
            }
            Err(e) => return Err(e),
        };
        if !msg.validate() {
            return Err(AdbError::Protocol(format!(
                "invalid frame during handshake: {}",
                msg
            )));
        }
        trace!(frame = %msg, "handshake frame");

        match msg.command {
            Command::Cnxn => {
                if msg.arg1 == 0 {
                    return Err(AdbError::Protocol(
                        "peer advertised zero max payload".to_string(),
                    ));
                }
                let max_payload = MAX_PAYLOAD.min(msg.arg1) as usize;
                debug!(peer_version = msg.arg0, max_payload, "handshake complete");
                return Ok((transport, max_payload));
            }
            Command::Auth if msg.arg0 == AuthType::Token as u32 => {
                if !sent_signature {
                    let signature = keypair.sign_token(&msg.payload)?;
                    send_frame(&mut transport, &Message::auth(AuthType::Signature, &signature))?;
                    sent_signature = true;
                } else if fail_fast {
                    return Err(AdbError::AuthRejected);
                } else if !sent_public_key {
                    // second token: the peer rejected our saved key; offer
                    // the public key and wait for the on-device prompt
                    debug!("signature rejected, sending public key");
                    let blob = keypair.public_key_blob()?;
                    send_frame(&mut transport, &Message::auth(AuthType::RsaPublicKey, &blob))?;
                    sent_public_key = true;
                } else {
                    return Err(AdbError::AuthRejected);
                }
            }
            Command::Stls => {
                send_frame(&mut transport, &Message::stls())?;
                transport = match transport {
                    Transport::Plain(sock) => {
                        sock.set_read_timeout(deadline.remaining()?)?;
                        match tls::upgrade_client(sock, host, keypair) {
                            Ok(session) => Transport::Tls(session),
                            Err(e) if e.is_timeout() => return Err(AdbError::Timeout),
                            Err(e) if fail_fast && tls::is_certificate_error(&e) => {
                                return Err(AdbError::PairingRequired)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Transport::Tls(_) => {
                        return Err(AdbError::Protocol("duplicate STLS".to_string()))
                    }
                };
            }
            other => {
                return Err(AdbError::Protocol(format!(
                    "unexpected {} during handshake",
                    other
                )))
            }
        }
    }
}

fn send_frame<W: Write>(writer: &mut W, msg: &Message) -> Result<(), AdbError> {
    writer.write_all(&msg.to_bytes())?;
    writer.flush()?;
    Ok(())
}

struct ConnShared {
    open: bool,
    streams: HashMap<u32, Arc<StreamInner>>,
    next_local_id: u32,
}

/// Connection state shared between the public handle, the reader task and
/// stream handles
pub(crate) struct ConnectionInner {
    shared: Mutex<ConnShared>,
    writer: Mutex<TransportWriter>,
    shutdown_sock: TcpStream,
    max_payload: usize,
}

impl ConnectionInner {
    /// Serialise one frame onto the wire. The writer mutex makes the
    /// header-plus-payload write atomic with respect to other senders.
    pub(crate) fn send_frame(&self, msg: &Message) -> Result<(), AdbError> {
        if !lock(&self.shared).open {
            return Err(AdbError::StreamClosed);
        }
        let mut writer = lock(&self.writer);
        writer.write_all(&msg.to_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn remove_stream(&self, local_id: u32) {
        lock(&self.shared).streams.remove(&local_id);
    }

    fn stream(&self, local_id: u32) -> Option<Arc<StreamInner>> {
        lock(&self.shared).streams.get(&local_id).cloned()
    }

    /// Close the socket, mark every stream closed and wake all waiters.
    /// Idempotent; runs from `close()` and from the reader task on error.
    fn teardown(&self) {
        let streams: Vec<Arc<StreamInner>> = {
            let mut shared = lock(&self.shared);
            if !shared.open {
                return;
            }
            shared.open = false;
            shared.streams.drain().map(|(_, s)| s).collect()
        };
        let _ = self.shutdown_sock.shutdown(Shutdown::Both);
        for stream in streams {
            stream.mark_closed();
        }
        debug!("connection closed");
    }
}

/// Dispatch inbound frames until the socket closes or a protocol violation
/// tears the connection down
fn reader_loop(inner: &ConnectionInner, mut reader: TransportReader) {
    loop {
        let msg = match Message::decode(&mut reader) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("reader stopping: {}", e);
                break;
            }
        };
        if !msg.validate() {
            warn!(frame = %msg, "invalid inbound frame");
            break;
        }

        match msg.command {
            Command::Okay => match inner.stream(msg.arg1) {
                Some(stream) => stream.handle_ready(msg.arg0),
                None => trace!(local_id = msg.arg1, "OKAY for unknown stream"),
            },
            Command::Wrte => {
                let (local_id, remote_id) = (msg.arg1, msg.arg0);
                let accepted = match inner.stream(local_id) {
                    Some(stream) => stream.push_inbound(msg.payload),
                    None => false,
                };
                if accepted {
                    // acknowledging the write is the peer's permission to
                    // send the next one
                    if inner.send_frame(&Message::ready(local_id, remote_id)).is_err() {
                        break;
                    }
                } else {
                    trace!(local_id, "WRTE for unknown or closed stream");
                    let _ = inner.send_frame(&Message::close(local_id, remote_id));
                }
            }
            Command::Clse => {
                let stream = lock(&inner.shared).streams.remove(&msg.arg1);
                if let Some(stream) = stream {
                    stream.mark_closed();
                }
            }
            other => {
                warn!("illegal {} after handshake", other);
                break;
            }
        }
    }
    inner.teardown();
}

/// An authenticated connection to an adbd daemon, multiplexing logical
/// streams over one socket.
///
/// Built via [`AdbConnection::builder`]; a background reader task
/// dispatches inbound frames into per-stream queues until the connection
/// is closed.
pub struct AdbConnection {
    inner: Arc<ConnectionInner>,
}

impl AdbConnection {
    pub fn builder(host: &str, port: u16) -> AdbConnectionBuilder {
        AdbConnectionBuilder::new(host, port)
    }

    /// Open a logical stream to `destination` (e.g. `shell:` or
    /// `tcp:8080`). Blocks until the peer acknowledges or refuses it.
    pub fn open(&self, destination: &str) -> Result<AdbStream, AdbError> {
        let stream = {
            let mut shared = lock(&self.inner.shared);
            if !shared.open {
                return Err(AdbError::StreamClosed);
            }
            let local_id = shared.next_local_id;
            shared.next_local_id = shared.next_local_id.checked_add(1).unwrap_or(1);
            let stream = Arc::new(StreamInner::new(local_id, self.inner.max_payload));
            shared.streams.insert(local_id, stream.clone());
            stream
        };
        let local_id = stream.local_id();

        if let Err(e) = self.inner.send_frame(&Message::open(local_id, destination)) {
            self.inner.remove_stream(local_id);
            return Err(e);
        }

        match stream.await_open() {
            StreamState::Open => Ok(AdbStream::new(stream, Arc::downgrade(&self.inner))),
            _ => {
                self.inner.remove_stream(local_id);
                Err(AdbError::OpenRejected(destination.to_string()))
            }
        }
    }

    /// Whether the connection is still up. A connection only exists once
    /// its CNXN handshake completed, so this is false solely after
    /// teardown.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.shared).open
    }

    /// Negotiated maximum outgoing payload per WRTE frame
    pub fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    /// Tear the connection down: closes the socket, marks every stream
    /// closed and wakes all blocked readers and writers. Idempotent.
    pub fn close(&self) {
        self.inner.teardown();
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
