use base64::{engine::general_purpose, Engine as _};
use num_bigint_dig::BigUint;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    traits::PublicKeyParts,
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha1::Sha1;
use tracing::debug;
use zeroize::Zeroizing;

use crate::protocol::AdbError;

/// Modulus size handled by the legacy Android public-key format
const ANDROID_PUBKEY_MODULUS_SIZE: usize = 2048 / 8;

/// ADB key pair: an RSA signing key plus the self-signed X.509 identity
/// certificate presented during TLS
pub struct AdbKeyPair {
    private_key: Option<RsaPrivateKey>,
    public_key: RsaPublicKey,
    certificate: CertificateDer<'static>,
    name: String,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair with a self-signed certificate.
    /// `name` is the human-readable identity appended to the public-key
    /// blob, conventionally `user@host`.
    pub fn generate(name: &str) -> Result<Self, AdbError> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| AdbError::Key(format!("failed to generate key: {}", e)))?;
        Self::from_private_key(private_key, name)
    }

    /// Load from a PEM-encoded private key string (PKCS#1 or PKCS#8); the
    /// identity certificate is re-derived from the key.
    pub fn from_pem(pem: &str, name: &str) -> Result<Self, AdbError> {
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::Key(format!("failed to parse PEM: {}", e)))?
        };
        Self::from_private_key(private_key, name)
    }

    fn from_private_key(private_key: RsaPrivateKey, name: &str) -> Result<Self, AdbError> {
        let public_key = RsaPublicKey::from(&private_key);
        let certificate = self_signed_certificate(&private_key, name)?;
        Ok(Self {
            private_key: Some(private_key),
            public_key,
            certificate,
            name: name.to_string(),
        })
    }

    /// The identity name carried in the public-key blob suffix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign an authentication token. The token is the 20-byte SHA-1 digest
    /// itself; PKCS#1 v1.5 signing prepends the DigestInfo prefix, which is
    /// exactly the encoding adbd verifies.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| AdbError::Key("private key destroyed".to_string()))?;
        key.sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::Key(format!("signing failed: {}", e)))
    }

    /// Public key in the legacy Android format: little-endian word count,
    /// Montgomery n0inv, modulus and R^2 mod N as 64 32-bit words each, and
    /// the exponent; base64-encoded and suffixed with ` name\0`.
    pub fn public_key_blob(&self) -> Result<Vec<u8>, AdbError> {
        if self.public_key.size() != ANDROID_PUBKEY_MODULUS_SIZE {
            return Err(AdbError::Key(format!(
                "unsupported modulus size: {} bits",
                self.public_key.size() * 8
            )));
        }

        let n = self.public_key.n();
        let n_bytes = n.to_bytes_le();
        let n0 = u32::from_le_bytes([n_bytes[0], n_bytes[1], n_bytes[2], n_bytes[3]]);

        // n0inv = -(N^-1) mod 2^32. Newton iteration doubles the number of
        // correct bits each round; an odd seed is correct to 3 bits.
        let mut inv = n0;
        for _ in 0..4 {
            inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
        }
        let n0inv = inv.wrapping_neg();

        // R^2 mod N for R = 2^2048
        let rr = BigUint::from(2u32).modpow(&BigUint::from(2 * 2048u32), n);

        let mut encoded = Vec::with_capacity(12 + 2 * ANDROID_PUBKEY_MODULUS_SIZE);
        encoded.extend_from_slice(&((ANDROID_PUBKEY_MODULUS_SIZE / 4) as u32).to_le_bytes());
        encoded.extend_from_slice(&n0inv.to_le_bytes());
        encoded.extend_from_slice(&to_le_padded(n, ANDROID_PUBKEY_MODULUS_SIZE));
        encoded.extend_from_slice(&to_le_padded(&rr, ANDROID_PUBKEY_MODULUS_SIZE));
        encoded.extend_from_slice(&to_le_padded(self.public_key.e(), 4));

        let mut blob = general_purpose::STANDARD.encode(&encoded).into_bytes();
        blob.push(b' ');
        blob.extend_from_slice(self.name.as_bytes());
        blob.push(0);
        Ok(blob)
    }

    /// Certificate chain for TLS client authentication: the single
    /// self-signed identity certificate
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.certificate.clone()]
    }

    /// Private key in the DER form rustls consumes
    pub(crate) fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, AdbError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| AdbError::Key("private key destroyed".to_string()))?;
        let doc = key
            .to_pkcs8_der()
            .map_err(|e| AdbError::Key(format!("failed to encode private key: {}", e)))?;
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            doc.as_bytes().to_vec(),
        )))
    }

    /// Get the private key as PEM, e.g. for caller-side persistence
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, AdbError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| AdbError::Key("private key destroyed".to_string()))?;
        key.to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AdbError::Key(format!("failed to encode private key: {}", e)))
    }

    /// Get the public key as PEM
    pub fn public_key_pem(&self) -> Result<String, AdbError> {
        self.public_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AdbError::Key(format!("failed to encode public key: {}", e)))
    }

    /// Drop and zero the private key material. Signing and TLS client auth
    /// fail afterwards; the public half stays readable.
    pub fn destroy(&mut self) {
        if let Some(key) = self.private_key.take() {
            // RsaPrivateKey zeroizes its components on drop
            drop(key);
            debug!("private key material destroyed");
        }
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.private_key.is_none()
    }
}

/// Self-sign an X.509 certificate over the RSA key for TLS identity
fn self_signed_certificate(
    private_key: &RsaPrivateKey,
    name: &str,
) -> Result<CertificateDer<'static>, AdbError> {
    let pkcs8 = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AdbError::Key(format!("failed to encode private key: {}", e)))?;
    let key_pair = rcgen::KeyPair::from_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| AdbError::Key(format!("failed to load key for certificate: {}", e)))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| AdbError::Key(format!("failed to build certificate params: {}", e)))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, name);

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| AdbError::Key(format!("failed to self-sign certificate: {}", e)))?;
    Ok(certificate.der().clone())
}

fn to_le_padded(value: &BigUint, size: usize) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(size, 0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPublicKey;
    use std::sync::OnceLock;

    fn test_key() -> &'static AdbKeyPair {
        static KEY: OnceLock<AdbKeyPair> = OnceLock::new();
        KEY.get_or_init(|| AdbKeyPair::generate("tester@localhost").unwrap())
    }

    #[test]
    fn test_sign_token_verifies() {
        let keypair = test_key();
        let token = [0x5au8; 20];
        let signature = keypair.sign_token(&token).unwrap();
        assert_eq!(signature.len(), 256);

        let public = RsaPublicKey::from_pkcs1_pem(&keypair.public_key_pem().unwrap()).unwrap();
        public
            .verify(Pkcs1v15Sign::new::<Sha1>(), &token, &signature)
            .unwrap();
    }

    #[test]
    fn test_sign_token_rejects_wrong_length() {
        // The token must already be a SHA-1 digest; anything else is a
        // caller bug surfaced by the padding layer.
        assert!(test_key().sign_token(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_public_key_blob_format() {
        let keypair = test_key();
        let blob = keypair.public_key_blob().unwrap();

        // trailing " name\0"
        assert_eq!(blob.last(), Some(&0u8));
        let text = std::str::from_utf8(&blob[..blob.len() - 1]).unwrap();
        let (encoded, name) = text.split_once(' ').unwrap();
        assert_eq!(name, "tester@localhost");

        let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded.len(), 12 + 2 * ANDROID_PUBKEY_MODULUS_SIZE);

        // word count for a 2048-bit modulus
        let words = u32::from_le_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]);
        assert_eq!(words, 64);

        // n0inv * n0 == -1 mod 2^32
        let n0inv = u32::from_le_bytes([decoded[4], decoded[5], decoded[6], decoded[7]]);
        let n_bytes = keypair.public_key.n().to_bytes_le();
        let n0 = u32::from_le_bytes([n_bytes[0], n_bytes[1], n_bytes[2], n_bytes[3]]);
        assert_eq!(n0inv.wrapping_mul(n0), u32::MAX);

        // modulus words round-trip
        let modulus = BigUint::from_bytes_le(&decoded[8..8 + ANDROID_PUBKEY_MODULUS_SIZE]);
        assert_eq!(&modulus, keypair.public_key.n());

        // exponent
        let e_off = 8 + 2 * ANDROID_PUBKEY_MODULUS_SIZE;
        let e = u32::from_le_bytes([
            decoded[e_off],
            decoded[e_off + 1],
            decoded[e_off + 2],
            decoded[e_off + 3],
        ]);
        assert_eq!(e, 65537);
    }

    #[test]
    fn test_certificate_chain() {
        let chain = test_key().certificate_chain();
        assert_eq!(chain.len(), 1);
        assert!(!chain[0].as_ref().is_empty());
    }

    #[test]
    fn test_from_pem_roundtrip() {
        let keypair = test_key();
        let pem = keypair.private_key_pem().unwrap();
        let restored = AdbKeyPair::from_pem(&pem, "tester@localhost").unwrap();
        assert_eq!(
            restored.public_key_blob().unwrap(),
            keypair.public_key_blob().unwrap()
        );
    }

    #[test]
    fn test_destroy() {
        let mut keypair = AdbKeyPair::generate("doomed@localhost").unwrap();
        assert!(!keypair.is_destroyed());
        keypair.destroy();
        assert!(keypair.is_destroyed());
        assert!(keypair.sign_token(&[0u8; 20]).is_err());
        assert!(keypair.private_key_pem().is_err());
        // public half still readable
        assert!(keypair.public_key_blob().is_ok());
        // idempotent
        keypair.destroy();
    }
}
