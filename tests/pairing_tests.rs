//! Pairing round-trip against a mock pairing server speaking the server
//! role of the same handshake.

use std::io::Write;
use std::net::TcpListener;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use tcpadb::pairing::{
    PairingAuthCtx, PairingConnectionCtx, PairingPacket, PairingPacketType, PairingRole,
    PairingState, PeerInfo, PEER_INFO_RSA_KEY,
};
use tcpadb::{AdbError, AdbKeyPair};

const MOCK_SERVER_BLOB: &[u8] = b"QAAAAmock-server-public-key tester@device\0";

fn shared_key_pem() -> &'static String {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        AdbKeyPair::generate("pairing@test")
            .unwrap()
            .private_key_pem()
            .unwrap()
            .to_string()
    })
}

fn test_keypair() -> AdbKeyPair {
    AdbKeyPair::from_pem(shared_key_pem(), "pairing@test").unwrap()
}

/// Mutual-auth server: any client certificate is accepted, identity is
/// proven by the passcode-bound envelope instead.
#[derive(Debug)]
struct AllowAnyClientCert;

impl ClientCertVerifier for AllowAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Run the server role of the pairing handshake. With matching passcodes
/// the exchange completes and the client's peer info is asserted; with a
/// mismatch the first sealed record fails to open and the connection is
/// dropped.
fn spawn_pairing_server(
    password: &'static str,
    expect_success: bool,
    expected_client_blob: Vec<u8>,
) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let _ = sock.set_nodelay(true);

        // (a) cleartext SPAKE2 exchange
        let client_msg = PairingPacket::decode(&mut sock).unwrap();
        assert_eq!(client_msg.kind, PairingPacketType::Spake2Msg);

        let mut auth = PairingAuthCtx::new(PairingRole::Server, password.as_bytes());
        sock.write_all(
            &PairingPacket::new(PairingPacketType::Spake2Msg, auth.msg().to_vec())
                .unwrap()
                .to_bytes(),
        )
        .unwrap();
        auth.init_cipher(&client_msg.payload).unwrap();

        // (b) TLS 1.3 with mutual certificates
        let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = identity.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(identity.key_pair.serialize_der().into());
        let config =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_client_cert_verifier(Arc::new(AllowAnyClientCert))
                .with_single_cert(vec![cert], key)
                .unwrap();
        let mut conn = rustls::ServerConnection::new(Arc::new(config)).unwrap();
        while conn.is_handshaking() {
            conn.complete_io(&mut sock).unwrap();
        }
        let export = conn
            .export_keying_material(vec![0u8; 64], b"adb-label\x00", None)
            .unwrap();

        // (c) sealed peer-info exchange
        let mut tls = rustls::Stream::new(&mut conn, &mut sock);
        let packet = PairingPacket::decode(&mut tls).unwrap();
        assert_eq!(packet.kind, PairingPacketType::PeerInfo);

        let opened = auth.decrypt(&packet.payload, &export);
        if !expect_success {
            // wrong passcode: the envelope must not authenticate
            assert!(opened.is_err());
            return;
        }

        let client_info = PeerInfo::from_bytes(&opened.unwrap()).unwrap();
        assert_eq!(client_info.kind(), PEER_INFO_RSA_KEY);
        assert_eq!(
            &client_info.payload()[..expected_client_blob.len()],
            &expected_client_blob[..]
        );

        let our_info = PeerInfo::new(PEER_INFO_RSA_KEY, MOCK_SERVER_BLOB).unwrap();
        let sealed = auth.encrypt(&our_info.to_bytes(), &export).unwrap();
        tls.write_all(
            &PairingPacket::new(PairingPacketType::PeerInfo, sealed)
                .unwrap()
                .to_bytes(),
        )
        .unwrap();

        // hold the session until the client hangs up
        let mut drain = [0u8; 64];
        while matches!(std::io::Read::read(&mut tls, &mut drain), Ok(n) if n > 0) {}
    });

    (port, handle)
}

#[test]
fn test_pairing_round_trip() {
    let keypair = test_keypair();
    let blob = keypair.public_key_blob().unwrap();
    let (port, server) = spawn_pairing_server("123456", true, blob);

    let mut ctx = PairingConnectionCtx::new("127.0.0.1", port, b"123456", &keypair);
    let peer = ctx.start().unwrap();

    assert_eq!(ctx.state(), PairingState::Done);
    assert_eq!(peer.kind(), PEER_INFO_RSA_KEY);
    assert_eq!(
        &peer.payload()[..MOCK_SERVER_BLOB.len()],
        MOCK_SERVER_BLOB
    );

    server.join().unwrap();
}

#[test]
fn test_pairing_via_manager() {
    let keypair = test_keypair();
    let blob = keypair.public_key_blob().unwrap();
    let (port, server) = spawn_pairing_server("123456", true, blob);

    // the manager pairs with its own key; same PEM, same blob
    let manager = tcpadb::AdbConnectionManager::new(test_keypair());
    assert!(manager.pair_to("127.0.0.1", port, "123456").unwrap());

    server.join().unwrap();
}

#[test]
fn test_pairing_passcode_mismatch_fails() {
    let keypair = test_keypair();
    let blob = keypair.public_key_blob().unwrap();
    // one altered digit on the server side
    let (port, server) = spawn_pairing_server("123457", false, blob);

    let mut ctx = PairingConnectionCtx::new("127.0.0.1", port, b"123456", &keypair);
    let result = ctx.start();

    assert!(matches!(result, Err(AdbError::PairingFailed(_))));
    assert_eq!(ctx.state(), PairingState::Failed);

    server.join().unwrap();
}

#[test]
fn test_pairing_refuses_garbage_peer() {
    // a server that replies with a non-pairing byte stream
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let _ = PairingPacket::decode(&mut sock);
        sock.write_all(b"\xffgarbage-not-a-pairing-packet").unwrap();
        let _ = sock.flush();
    });

    let keypair = test_keypair();
    let mut ctx = PairingConnectionCtx::new("127.0.0.1", port, b"123456", &keypair);
    assert!(matches!(ctx.start(), Err(AdbError::PairingFailed(_))));
    assert_eq!(ctx.state(), PairingState::Failed);

    server.join().unwrap();
}
