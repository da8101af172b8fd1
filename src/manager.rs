use std::time::Duration;

use tracing::debug;

use crate::auth::AdbKeyPair;
use crate::connection::AdbConnection;
use crate::pairing::{PairingConnectionCtx, PeerInfo};
use crate::protocol::AdbError;
use crate::stream::AdbStream;

/// Default target address; adbd on the same device listens on loopback
const DEFAULT_HOST_ADDRESS: &str = "127.0.0.1";

/// Lifecycle wrapper around an [`AdbConnection`]: owns the credentials,
/// remembers the target host and connection options, and exposes the
/// out-of-band pairing handshake.
pub struct AdbConnectionManager {
    keypair: AdbKeyPair,
    host_address: String,
    old_host_address: String,
    api: u32,
    timeout: Option<Duration>,
    throw_on_unauthorized: bool,
    connection: Option<AdbConnection>,
    closed: bool,
}

impl AdbConnectionManager {
    pub fn new(keypair: AdbKeyPair) -> Self {
        Self {
            keypair,
            host_address: DEFAULT_HOST_ADDRESS.to_string(),
            old_host_address: DEFAULT_HOST_ADDRESS.to_string(),
            api: 1,
            timeout: None,
            throw_on_unauthorized: false,
            connection: None,
            closed: false,
        }
    }

    /// Set the default host address used by [`Self::connect`] and
    /// [`Self::pair`]
    pub fn set_host_address(&mut self, host_address: &str) {
        self.old_host_address =
            std::mem::replace(&mut self.host_address, host_address.to_string());
    }

    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    /// Android API level of the peer, as a hint; default is 1
    pub fn set_api(&mut self, api: u32) {
        self.api = api;
    }

    pub fn api(&self) -> u32 {
        self.api
    }

    /// Deadline across the whole connect handshake; unbounded if unset
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fail fast instead of waiting for the on-device authorization prompt
    pub fn set_throw_on_unauthorized(&mut self, value: bool) {
        self.throw_on_unauthorized = value;
    }

    pub fn is_throw_on_unauthorized(&self) -> bool {
        self.throw_on_unauthorized
    }

    pub fn keypair(&self) -> &AdbKeyPair {
        &self.keypair
    }

    /// Whether a connection is up and its handshake completed
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Connect to the stored host address. Returns `Ok(false)` without
    /// dialing when a connection to the same host is already up.
    pub fn connect(&mut self, port: u16) -> Result<bool, AdbError> {
        let host = self.host_address.clone();
        self.connect_inner(host, port)
    }

    /// Connect to an explicit host, leaving the stored address untouched
    pub fn connect_to(&mut self, host: &str, port: u16) -> Result<bool, AdbError> {
        self.old_host_address = self.host_address.clone();
        self.connect_inner(host.to_string(), port)
    }

    fn connect_inner(&mut self, host: String, port: u16) -> Result<bool, AdbError> {
        if self.closed {
            return Err(AdbError::Key("manager closed".to_string()));
        }
        if self.need_no_new_connection(&host) {
            return Ok(false);
        }
        let mut builder = AdbConnection::builder(&host, port)
            .api(self.api)
            .throw_on_unauthorized(self.throw_on_unauthorized);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let connection = builder.connect(&self.keypair)?;
        self.connection = Some(connection);
        Ok(true)
    }

    /// A live connection to the same host makes a new dial pointless; a
    /// dead one only blocks re-dialing a *different* host.
    fn need_no_new_connection(&self, new_host: &str) -> bool {
        match &self.connection {
            None => false,
            Some(connection) if connection.is_connected() => true,
            Some(_) => new_host == self.old_host_address,
        }
    }

    /// Open a logical stream to `destination` on the connected peer
    pub fn open_stream(&self, destination: &str) -> Result<AdbStream, AdbError> {
        match &self.connection {
            Some(connection) if connection.is_connected() => connection.open(destination),
            _ => Err(AdbError::StreamClosed),
        }
    }

    /// Pair with the stored host address; see [`Self::pair_to`]
    pub fn pair(&self, port: u16, pairing_code: &str) -> Result<bool, AdbError> {
        let host = self.host_address.clone();
        self.pair_to(&host, port, pairing_code)
    }

    /// Run the six-digit-code pairing handshake against `host:port`. The
    /// port is the device's pairing port, not its ADB port. Returns
    /// `Ok(true)` on success; the peer's identity record is surfaced via
    /// [`Self::pair_and_get_peer_info`] for callers that persist it.
    pub fn pair_to(&self, host: &str, port: u16, pairing_code: &str) -> Result<bool, AdbError> {
        self.pair_and_get_peer_info(host, port, pairing_code)?;
        Ok(true)
    }

    /// As [`Self::pair_to`], returning the peer's info record
    pub fn pair_and_get_peer_info(
        &self,
        host: &str,
        port: u16,
        pairing_code: &str,
    ) -> Result<PeerInfo, AdbError> {
        let mut ctx =
            PairingConnectionCtx::new(host, port, pairing_code.as_bytes(), &self.keypair);
        if let Some(timeout) = self.timeout {
            ctx = ctx.timeout(timeout);
        }
        ctx.start()
    }

    /// Tear down the current connection, if any
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Destroy the private key (best-effort) and tear down the connection.
    /// The manager cannot be reused afterwards; build a new one with fresh
    /// credentials to reconnect.
    pub fn close(&mut self) {
        self.keypair.destroy();
        self.disconnect();
        self.closed = true;
        debug!("manager closed");
    }
}
