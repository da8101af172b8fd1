use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use rustls::pki_types::ServerName;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tracing::debug;
use zeroize::Zeroizing;

use crate::auth::AdbKeyPair;
use crate::protocol::AdbError;
use crate::tls;

/// Pairing packet format version
pub const PAIRING_PACKET_VERSION: u8 = 1;

/// Largest payload a pairing packet may carry
pub const MAX_PAIRING_PAYLOAD: usize = 16384;

/// Fixed payload size of a peer-info record, excluding the type byte
pub const PEER_INFO_PAYLOAD_SIZE: usize = 8192;

/// Peer-info type: an RSA public key blob in the ADB format
pub const PEER_INFO_RSA_KEY: u8 = 1;

/// Peer-info type: the peer's device GUID string
pub const PEER_INFO_DEVICE_GUID: u8 = 2;

// SPAKE2 identity labels, byte-for-byte what adbd uses
const CLIENT_NAME: &[u8] = b"adb pair client\x00";
const SERVER_NAME: &[u8] = b"adb pair server\x00";

// Derivation label for both the HKDF info and the TLS keying-material
// export, trailing NUL included
const EXPORTED_KEY_LABEL: &[u8] = b"adb-label\x00";
const EXPORT_KEY_SIZE: usize = 64;

const GCM_KEY_SIZE: usize = 16;

/// Pairing packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingPacketType {
    /// A SPAKE2 key-agreement message
    Spake2Msg = 0,
    /// A (sealed) peer-info record
    PeerInfo = 1,
}

impl PairingPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PairingPacketType::Spake2Msg),
            1 => Some(PairingPacketType::PeerInfo),
            _ => None,
        }
    }
}

/// Framing unit of the pairing wire format: a 4-byte header
/// `version | type | payload_length (big-endian)` followed by the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPacket {
    pub kind: PairingPacketType,
    pub payload: Vec<u8>,
}

impl PairingPacket {
    pub fn new(kind: PairingPacketType, payload: Vec<u8>) -> Result<Self, AdbError> {
        if payload.len() > MAX_PAIRING_PAYLOAD {
            return Err(AdbError::PairingFailed(format!(
                "pairing payload too large: {}",
                payload.len()
            )));
        }
        Ok(Self { kind, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.push(PAIRING_PACKET_VERSION);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Read one packet, rejecting unknown versions and types and
    /// oversized payloads
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, AdbError> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;
        if header[0] != PAIRING_PACKET_VERSION {
            return Err(AdbError::PairingFailed(format!(
                "unsupported pairing packet version: {}",
                header[0]
            )));
        }
        let kind = PairingPacketType::from_u8(header[1]).ok_or_else(|| {
            AdbError::PairingFailed(format!("unknown pairing packet type: {}", header[1]))
        })?;
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if length > MAX_PAIRING_PAYLOAD {
            return Err(AdbError::PairingFailed(format!(
                "pairing payload too large: {}",
                length
            )));
        }
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload)?;
        Ok(Self { kind, payload })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), AdbError> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// The 1 + 8192-byte record identifying a paired principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    kind: u8,
    payload: Vec<u8>,
}

impl PeerInfo {
    /// Build a record; `data` is zero-padded up to the fixed payload size
    pub fn new(kind: u8, data: &[u8]) -> Result<Self, AdbError> {
        if data.len() > PEER_INFO_PAYLOAD_SIZE {
            return Err(AdbError::PairingFailed(format!(
                "peer info too large: {}",
                data.len()
            )));
        }
        let mut payload = data.to_vec();
        payload.resize(PEER_INFO_PAYLOAD_SIZE, 0);
        Ok(Self { kind, payload })
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// The full zero-padded payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + PEER_INFO_PAYLOAD_SIZE);
        bytes.push(self.kind);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() != 1 + PEER_INFO_PAYLOAD_SIZE {
            return Err(AdbError::PairingFailed(format!(
                "malformed peer info record: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            kind: bytes[0],
            payload: bytes[1..].to_vec(),
        })
    }
}

/// Which side of the pairing handshake this context plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    Client,
    Server,
}

/// Key agreement and record protection for one pairing exchange: SPAKE2
/// over the shared passcode, HKDF-SHA256 into a 64-byte secret, and an
/// AES-128-GCM envelope keyed from it.
pub struct PairingAuthCtx {
    spake: Option<Spake2<Ed25519Group>>,
    our_msg: Vec<u8>,
    secret: Option<Zeroizing<Vec<u8>>>,
    cipher: Option<Aes128Gcm>,
    enc_counter: u64,
    dec_counter: u64,
}

impl PairingAuthCtx {
    pub fn new(role: PairingRole, password: &[u8]) -> Self {
        let password = Password::new(password);
        let client = Identity::new(CLIENT_NAME);
        let server = Identity::new(SERVER_NAME);
        let (spake, our_msg) = match role {
            PairingRole::Client => Spake2::<Ed25519Group>::start_a(&password, &client, &server),
            PairingRole::Server => Spake2::<Ed25519Group>::start_b(&password, &client, &server),
        };
        Self {
            spake: Some(spake),
            our_msg,
            secret: None,
            cipher: None,
            enc_counter: 0,
            dec_counter: 0,
        }
    }

    /// Our key-agreement message, to be sent to the peer in cleartext
    pub fn msg(&self) -> &[u8] {
        &self.our_msg
    }

    /// Finish key agreement with the peer's message and derive the record
    /// cipher. One-shot.
    pub fn init_cipher(&mut self, their_msg: &[u8]) -> Result<(), AdbError> {
        let spake = self
            .spake
            .take()
            .ok_or_else(|| AdbError::PairingFailed("cipher already initialised".to_string()))?;
        let key_material = Zeroizing::new(
            spake
                .finish(their_msg)
                .map_err(|e| AdbError::PairingFailed(format!("key agreement failed: {:?}", e)))?,
        );

        let hkdf = Hkdf::<Sha256>::new(None, &key_material);
        let mut okm = Zeroizing::new(vec![0u8; EXPORT_KEY_SIZE]);
        hkdf.expand(EXPORTED_KEY_LABEL, &mut okm)
            .map_err(|_| AdbError::PairingFailed("key derivation failed".to_string()))?;

        let cipher = Aes128Gcm::new_from_slice(&okm[..GCM_KEY_SIZE])
            .map_err(|_| AdbError::PairingFailed("cipher setup failed".to_string()))?;
        self.cipher = Some(cipher);
        self.secret = Some(okm);
        Ok(())
    }

    /// The 64-byte derived secret, available after [`Self::init_cipher`]
    pub fn derived_secret(&self) -> Option<&[u8]> {
        self.secret.as_deref().map(|s| &s[..])
    }

    /// Seal a record. Nonces are derived from a send counter; `aad` binds
    /// the envelope to the surrounding session.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AdbError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| AdbError::PairingFailed("cipher not initialised".to_string()))?;
        let nonce = counter_nonce(self.enc_counter);
        self.enc_counter += 1;
        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| AdbError::PairingFailed("encryption failed".to_string()))
    }

    /// Open a sealed record. Fails when the peer derived a different key,
    /// i.e. the passcodes did not match, or when the session binding
    /// differs.
    pub fn decrypt(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, AdbError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| AdbError::PairingFailed("cipher not initialised".to_string()))?;
        let nonce = counter_nonce(self.dec_counter);
        self.dec_counter += 1;
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| AdbError::PairingFailed("message authentication failed".to_string()))
    }
}

fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// States of one pairing attempt, in order; `Failed` is terminal and
/// reachable from every other state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Init,
    Spake2Sent,
    Spake2Done,
    TlsUp,
    InfoSent,
    InfoReceived,
    Done,
    Failed,
}

/// Single-shot client handshake against a device's pairing port: SPAKE2
/// key agreement in cleartext, a TLS 1.3 session, then a mutual exchange
/// of sealed peer-info records.
pub struct PairingConnectionCtx<'a> {
    host: String,
    port: u16,
    password: Zeroizing<Vec<u8>>,
    keypair: &'a AdbKeyPair,
    timeout: Option<Duration>,
    state: PairingState,
}

impl<'a> PairingConnectionCtx<'a> {
    pub fn new(host: &str, port: u16, password: &[u8], keypair: &'a AdbKeyPair) -> Self {
        Self {
            host: host.to_string(),
            port,
            password: Zeroizing::new(password.to_vec()),
            keypair,
            timeout: None,
            state: PairingState::Init,
        }
    }

    /// Bound the dial and each blocking read
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Run the handshake to completion. On success the peer's info record
    /// is returned (callers may persist it for trust decisions); any
    /// failure is terminal for this context.
    pub fn start(&mut self) -> Result<PeerInfo, AdbError> {
        let result = self.run();
        if result.is_err() {
            self.state = PairingState::Failed;
        }
        result.map_err(|e| match e {
            AdbError::PairingFailed(_) => e,
            other => AdbError::PairingFailed(other.to_string()),
        })
    }

    fn run(&mut self) -> Result<PeerInfo, AdbError> {
        let mut sock = self.dial()?;
        let _ = sock.set_nodelay(true);

        // (a) cleartext SPAKE2 exchange
        let mut auth = PairingAuthCtx::new(PairingRole::Client, &self.password);
        PairingPacket::new(PairingPacketType::Spake2Msg, auth.msg().to_vec())?
            .write_to(&mut sock)?;
        self.state = PairingState::Spake2Sent;

        let peer_msg = PairingPacket::decode(&mut sock)?;
        if peer_msg.kind != PairingPacketType::Spake2Msg {
            return Err(AdbError::PairingFailed(
                "expected SPAKE2 message".to_string(),
            ));
        }
        auth.init_cipher(&peer_msg.payload)?;
        self.state = PairingState::Spake2Done;

        // (b) TLS 1.3 session with our identity certificate; the envelope
        // below proves passcode knowledge, the export binds it to this
        // session
        let config = Arc::new(tls::client_tls_config(self.keypair)?);
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| AdbError::PairingFailed(format!("invalid server name: {}", self.host)))?;
        let mut conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| AdbError::PairingFailed(format!("TLS setup failed: {}", e)))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        let export = conn
            .export_keying_material(vec![0u8; EXPORT_KEY_SIZE], EXPORTED_KEY_LABEL, None)
            .map_err(|e| AdbError::PairingFailed(format!("keying-material export failed: {}", e)))?;
        self.state = PairingState::TlsUp;
        debug!("pairing TLS session up");

        // (c) sealed peer-info exchange over the TLS session
        let blob = self.keypair.public_key_blob()?;
        let our_info = PeerInfo::new(PEER_INFO_RSA_KEY, &blob)?;
        let sealed = auth.encrypt(&our_info.to_bytes(), &export)?;

        let mut tls_stream = rustls::Stream::new(&mut conn, &mut sock);
        PairingPacket::new(PairingPacketType::PeerInfo, sealed)?.write_to(&mut tls_stream)?;
        self.state = PairingState::InfoSent;

        let packet = PairingPacket::decode(&mut tls_stream)?;
        if packet.kind != PairingPacketType::PeerInfo {
            return Err(AdbError::PairingFailed(
                "expected peer info".to_string(),
            ));
        }
        let opened = auth.decrypt(&packet.payload, &export)?;
        let their_info = PeerInfo::from_bytes(&opened)?;
        self.state = PairingState::InfoReceived;

        self.state = PairingState::Done;
        debug!(peer_kind = their_info.kind(), "pairing complete");
        Ok(their_info)
    }

    fn dial(&self) -> Result<TcpStream, AdbError> {
        let sock = match self.timeout {
            None => TcpStream::connect((self.host.as_str(), self.port))?,
            Some(timeout) => {
                let addr = (self.host.as_str(), self.port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        AdbError::PairingFailed(format!("no addresses for {}", self.host))
                    })?;
                TcpStream::connect_timeout(&addr, timeout)?
            }
        };
        sock.set_read_timeout(self.timeout)?;
        Ok(sock)
    }
}
