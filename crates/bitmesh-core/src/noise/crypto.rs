//! Cryptographic primitives for the Noise layer
//!
//! Thin, safe wrappers around `snow` for the XX handshake and transport
//! ciphers, X25519 static keys, Ed25519 identity signatures, and fingerprint
//! derivation.

use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, OsRng, RngCore};
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState, TransportState};

use crate::errors::{CryptoError, MeshError, Result};
use crate::types::Fingerprint;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Noise protocol name, used verbatim in the symmetric-state initialisation.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Maximum Noise message size (from the Noise specification)
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// X25519 points of low order. DH against any of these yields a predictable
/// shared secret, so they are rejected before any key material is mixed.
const LOW_ORDER_POINTS: [[u8; 32]; 7] = [
    // 0 (identity)
    [0; 32],
    // 1
    [
        1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0,
    ],
    // point of order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // point of order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Reject the all-zero point and known low-order X25519 points.
pub fn validate_public_key(key: &[u8; 32]) -> Result<()> {
    // The sign bit is not part of the point encoding
    let mut normalized = *key;
    normalized[31] &= 0x7f;

    for low_order in &LOW_ORDER_POINTS {
        let mut masked = *low_order;
        masked[31] &= 0x7f;
        if normalized == masked {
            return Err(MeshError::Crypto(CryptoError::InvalidPublicKey));
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Fingerprints
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a static public key.
pub fn generate_fingerprint<T: AsRef<[u8]>>(public_key: T) -> Fingerprint {
    let digest = Sha256::digest(public_key.as_ref());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Fingerprint::new(bytes)
}

// ----------------------------------------------------------------------------
// Noise Key Pair (X25519)
// ----------------------------------------------------------------------------

/// Static X25519 key pair for the Noise handshake.
#[derive(Clone)]
pub struct NoiseKeyPair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl core::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

impl NoiseKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate a key pair from the supplied RNG.
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private_key = [0u8; 32];
        rng.fill_bytes(&mut private_key);
        Self::from_bytes(&private_key)
    }

    /// Derive the key pair for raw private key bytes.
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        let public_key = MontgomeryPoint::mul_base_clamped(*private_key).to_bytes();
        Self {
            private_key: *private_key,
            public_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private_key
    }

    /// Fingerprint of the public half.
    pub fn fingerprint(&self) -> Fingerprint {
        generate_fingerprint(self.public_key_bytes())
    }
}

// ----------------------------------------------------------------------------
// Identity Key Pair (Ed25519)
// ----------------------------------------------------------------------------

/// Ed25519 key pair used to sign packets and identity announcements.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl core::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_bytes(&secret)
    }

    /// Create from raw private key bytes.
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(private_key),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign arbitrary data.
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Verify a signature made by `public_key` over `data`.
    pub fn verify<D: AsRef<[u8]>>(
        public_key: &[u8; 32],
        data: D,
        signature: &[u8; 64],
    ) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| MeshError::Crypto(CryptoError::SignatureInvalid))?;
        let signature = Signature::from_bytes(signature);
        verifying_key
            .verify(data.as_ref(), &signature)
            .map_err(|_| MeshError::Crypto(CryptoError::SignatureInvalid))
    }
}

// ----------------------------------------------------------------------------
// Noise Handshake
// ----------------------------------------------------------------------------

/// In-flight XX handshake state.
pub struct NoiseHandshake {
    state: HandshakeState,
}

impl core::fmt::Debug for NoiseHandshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseHandshake")
            .field("finished", &self.state.is_handshake_finished())
            .finish_non_exhaustive()
    }
}

impl NoiseHandshake {
    /// Create the initiator side.
    pub fn initiator(local_key: &NoiseKeyPair) -> Result<Self> {
        let builder = Builder::new(NOISE_PATTERN.parse()?);
        let state = builder
            .local_private_key(&local_key.private_key_bytes())
            .build_initiator()?;
        Ok(Self { state })
    }

    /// Create the responder side.
    pub fn responder(local_key: &NoiseKeyPair) -> Result<Self> {
        let builder = Builder::new(NOISE_PATTERN.parse()?);
        let state = builder
            .local_private_key(&local_key.private_key_bytes())
            .build_responder()?;
        Ok(Self { state })
    }

    /// Produce the next handshake message.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let len = self.state.write_message(payload, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// Consume a peer handshake message, returning its payload.
    pub fn read_message(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        let len = self.state.read_message(input, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// True once all XX pattern tokens have been consumed.
    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Running transcript hash, for channel binding.
    pub fn handshake_hash(&self) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(self.state.get_handshake_hash());
        hash
    }

    /// The peer's static key, once transmitted. Validated against the
    /// low-order point list.
    pub fn remote_static(&self) -> Result<Option<[u8; 32]>> {
        match self.state.get_remote_static() {
            Some(key) => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(key);
                validate_public_key(&bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Split into the transport ciphers. The initiator's split yields
    /// (send, recv); the responder's the reverse - `snow` handles the swap.
    pub fn into_transport(self) -> Result<NoiseTransport> {
        let state = self.state.into_transport_mode()?;
        Ok(NoiseTransport { state })
    }
}

// ----------------------------------------------------------------------------
// Noise Transport
// ----------------------------------------------------------------------------

/// Post-handshake cipher pair. Nonces are a 64-bit counter encoded as four
/// zero bytes followed by the little-endian counter, per the Noise spec.
pub struct NoiseTransport {
    state: TransportState,
}

impl core::fmt::Debug for NoiseTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseTransport").finish_non_exhaustive()
    }
}

impl NoiseTransport {
    /// Encrypt a transport message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut ciphertext = vec![0u8; plaintext.len() + 16];
        let len = self.state.write_message(plaintext, &mut ciphertext)?;
        ciphertext.truncate(len);
        Ok(ciphertext)
    }

    /// Decrypt a transport message. Fails on any AEAD mismatch, including a
    /// replayed or regressed counter.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut plaintext)
            .map_err(|_| MeshError::Crypto(CryptoError::AeadFailed))?;
        plaintext.truncate(len);
        Ok(plaintext)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_derivation_is_deterministic() {
        let a = NoiseKeyPair::from_bytes(&[1u8; 32]);
        let b = NoiseKeyPair::from_bytes(&[1u8; 32]);
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = NoiseKeyPair::from_bytes(&[2u8; 32]);
        assert_ne!(a.public_key_bytes(), c.public_key_bytes());
    }

    #[test]
    fn test_low_order_points_rejected() {
        for point in &LOW_ORDER_POINTS {
            assert!(validate_public_key(point).is_err());
        }
        let good = NoiseKeyPair::generate();
        validate_public_key(&good.public_key_bytes()).unwrap();
    }

    #[test]
    fn test_identity_sign_verify() {
        let keypair = IdentityKeyPair::generate();
        let signature = keypair.sign(b"payload");
        IdentityKeyPair::verify(&keypair.public_key_bytes(), b"payload", &signature).unwrap();
        assert!(
            IdentityKeyPair::verify(&keypair.public_key_bytes(), b"tampered", &signature).is_err()
        );
    }

    #[test]
    fn test_xx_handshake_and_transport() {
        let alice_key = NoiseKeyPair::generate();
        let bob_key = NoiseKeyPair::generate();

        let mut alice = NoiseHandshake::initiator(&alice_key).unwrap();
        let mut bob = NoiseHandshake::responder(&bob_key).unwrap();

        // -> e
        let msg1 = alice.write_message(b"").unwrap();
        bob.read_message(&msg1).unwrap();
        // <- e, ee, s, es
        let msg2 = bob.write_message(b"").unwrap();
        alice.read_message(&msg2).unwrap();
        // -> s, se
        let msg3 = alice.write_message(b"").unwrap();
        bob.read_message(&msg3).unwrap();

        assert!(alice.is_finished());
        assert!(bob.is_finished());
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());
        assert_eq!(
            alice.remote_static().unwrap().unwrap(),
            bob_key.public_key_bytes()
        );
        assert_eq!(
            bob.remote_static().unwrap().unwrap(),
            alice_key.public_key_bytes()
        );

        let mut alice_transport = alice.into_transport().unwrap();
        let mut bob_transport = bob.into_transport().unwrap();

        let ciphertext = alice_transport.encrypt(b"foo").unwrap();
        assert_eq!(ciphertext.len(), 3 + 16);
        assert_eq!(bob_transport.decrypt(&ciphertext).unwrap(), b"foo");

        // And the reverse direction
        let ciphertext = bob_transport.encrypt(b"bar").unwrap();
        assert_eq!(alice_transport.decrypt(&ciphertext).unwrap(), b"bar");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alice_key = NoiseKeyPair::generate();
        let bob_key = NoiseKeyPair::generate();
        let mut alice = NoiseHandshake::initiator(&alice_key).unwrap();
        let mut bob = NoiseHandshake::responder(&bob_key).unwrap();
        let m1 = alice.write_message(b"").unwrap();
        bob.read_message(&m1).unwrap();
        let m2 = bob.write_message(b"").unwrap();
        alice.read_message(&m2).unwrap();
        let m3 = alice.write_message(b"").unwrap();
        bob.read_message(&m3).unwrap();

        let mut alice_transport = alice.into_transport().unwrap();
        let mut bob_transport = bob.into_transport().unwrap();

        let mut ciphertext = alice_transport.encrypt(b"foo").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(bob_transport.decrypt(&ciphertext).is_err());
    }
}
