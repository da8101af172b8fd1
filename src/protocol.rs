use std::fmt;
use std::io::Read;

use thiserror::Error;

/// The length of the ADB message header
pub const ADB_HEADER_LENGTH: usize = 24;

/// ADB protocol version sent in our CNXN message
pub const ADB_VERSION: u32 = 0x01000001;

/// Peers at or above this version no longer fill in payload checksums
pub const ADB_VERSION_SKIP_CHECKSUM: u32 = 0x01000001;

/// Stream-based TLS version sent in our STLS reply
pub const ADB_STLS_VERSION: u32 = 0x01000000;

/// Maximum data payload we advertise in CNXN
pub const MAX_PAYLOAD: u32 = 4096;

/// Upper bound on any single frame payload; larger frames tear the
/// connection down to bound memory
pub const MAX_MESSAGE_PAYLOAD: u32 = 1024 * 1024;

/// The payload sent with the connect message
pub const CONNECT_PAYLOAD: &[u8] = b"host::\0";

/// ADB command constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Synchronize
    Sync = 0x434e5953,
    /// Connect
    Cnxn = 0x4e584e43,
    /// Authentication
    Auth = 0x48545541,
    /// Open stream
    Open = 0x4e45504f,
    /// OK/Ready
    Okay = 0x59414b4f,
    /// Close stream
    Clse = 0x45534c43,
    /// Write data
    Wrte = 0x45545257,
    /// Start TLS (Android 9+)
    Stls = 0x534c5453,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x434e5953 => Some(Command::Sync),
            0x4e584e43 => Some(Command::Cnxn),
            0x48545541 => Some(Command::Auth),
            0x4e45504f => Some(Command::Open),
            0x59414b4f => Some(Command::Okay),
            0x45534c43 => Some(Command::Clse),
            0x45545257 => Some(Command::Wrte),
            0x534c5453 => Some(Command::Stls),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sync => write!(f, "SYNC"),
            Command::Cnxn => write!(f, "CNXN"),
            Command::Auth => write!(f, "AUTH"),
            Command::Open => write!(f, "OPEN"),
            Command::Okay => write!(f, "OKAY"),
            Command::Clse => write!(f, "CLSE"),
            Command::Wrte => write!(f, "WRTE"),
            Command::Stls => write!(f, "STLS"),
        }
    }
}

/// Authentication types carried in AUTH arg0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Token (challenge from device)
    Token = 1,
    /// Signature (response to challenge)
    Signature = 2,
    /// RSA public key
    RsaPublicKey = 3,
}

/// An ADB message: the 24-byte header plus its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
    pub magic: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message; checksum and magic are computed from the fields
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Self {
        Self {
            command,
            arg0,
            arg1,
            data_length: payload.len() as u32,
            data_checksum: checksum(payload),
            magic: (command as u32) ^ 0xffffffff,
            payload: payload.to_vec(),
        }
    }

    /// CNXN message with our version, max payload and identity
    pub fn connect() -> Self {
        Self::new(Command::Cnxn, ADB_VERSION, MAX_PAYLOAD, CONNECT_PAYLOAD)
    }

    /// AUTH message of the given type
    pub fn auth(auth_type: AuthType, payload: &[u8]) -> Self {
        Self::new(Command::Auth, auth_type as u32, 0, payload)
    }

    /// STLS message with our TLS version
    pub fn stls() -> Self {
        Self::new(Command::Stls, ADB_STLS_VERSION, 0, &[])
    }

    /// OPEN message for a destination; the payload is null-terminated
    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, &payload)
    }

    /// WRTE message carrying stream data
    pub fn write(local_id: u32, remote_id: u32, payload: &[u8]) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, payload)
    }

    /// CLSE message for a stream
    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, &[])
    }

    /// OKAY message acknowledging a stream open or write
    pub fn ready(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, &[])
    }

    /// Serialize header and payload to bytes (little-endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ADB_HEADER_LENGTH + self.payload.len());
        bytes.extend_from_slice(&(self.command as u32).to_le_bytes());
        bytes.extend_from_slice(&self.arg0.to_le_bytes());
        bytes.extend_from_slice(&self.arg1.to_le_bytes());
        bytes.extend_from_slice(&self.data_length.to_le_bytes());
        bytes.extend_from_slice(&self.data_checksum.to_le_bytes());
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Read one message from `reader`: exactly 24 header bytes, then exactly
    /// `data_length` payload bytes. A short read surfaces as a stream-closed
    /// I/O failure.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, AdbError> {
        let mut header = [0u8; ADB_HEADER_LENGTH];
        reader.read_exact(&mut header)?;

        let raw_command = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let command = Command::from_u32(raw_command)
            .ok_or_else(|| AdbError::Protocol(format!("unknown command: 0x{:08x}", raw_command)))?;
        let arg0 = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let arg1 = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let data_length = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let data_checksum = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let magic = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);

        if data_length > MAX_MESSAGE_PAYLOAD {
            return Err(AdbError::Protocol(format!(
                "payload length {} exceeds limit",
                data_length
            )));
        }

        let mut payload = vec![0u8; data_length as usize];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum,
            magic,
            payload,
        })
    }

    /// Deserialize a complete message from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        let mut cursor = bytes;
        Self::decode(&mut cursor)
    }

    /// Validate command magic, payload length and, for legacy CNXN only,
    /// the payload checksum. Newer peers send garbage checksums and the
    /// field must not be used to reject their frames.
    pub fn validate(&self) -> bool {
        if self.magic != (self.command as u32) ^ 0xffffffff {
            return false;
        }
        if self.data_length as usize != self.payload.len() {
            return false;
        }
        if self.command != Command::Cnxn || self.arg0 >= ADB_VERSION_SKIP_CHECKSUM {
            return true;
        }
        self.data_checksum == checksum(&self.payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(arg0=0x{:x}, arg1=0x{:x}, len={})",
            self.command, self.arg0, self.arg1, self.data_length
        )
    }
}

/// Unsigned byte sum of the payload mod 2^32
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("credential failure: {0}")]
    Key(String),

    #[error("authentication rejected by peer")]
    AuthRejected,

    #[error("peer does not trust this key; pairing required")]
    PairingRequired,

    #[error("destination refused: {0}")]
    OpenRejected(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("connection timed out")]
    Timeout,

    #[error("pairing failed: {0}")]
    PairingFailed(String),
}

impl AdbError {
    /// True for socket-read failures that represent an expired read
    /// deadline rather than the peer going away.
    pub(crate) fn is_timeout(&self) -> bool {
        match self {
            AdbError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            AdbError::Timeout => true,
            _ => false,
        }
    }
}
