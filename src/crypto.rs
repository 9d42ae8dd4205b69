// src/crypto.rs
// Identity & Crypto for peerns.
//
// Long-lived ECDSA-P521 signing identity; per-pair ECDH -> HKDF -> AES-256-GCM
// shared key derivation; message signing/verification; identity and
// shared-key fingerprints; time-windowed rendezvous slugs.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p521::ecdh::diffie_hellman;
use p521::ecdsa::{
    signature::hazmat::{PrehashSigner, PrehashVerifier},
    Signature, SigningKey, VerifyingKey,
};
use p521::pkcs8::{DecodePublicKey, EncodePublicKey};
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Info string HKDF mixes in when deriving an AES key from an ECDH secret.
const HKDF_INFO: &[u8] = b"peerns-e2e-v1";
/// Domain-separation prefix for rendezvous slugs (see `SharedKey::rendezvous_slug`).
const RENDEZVOUS_PREFIX: &str = "peerns-rvz-v1-";
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// Fingerprint length in bytes (identity and shared-key fingerprints alike).
const FINGERPRINT_LEN: usize = 8;

/// A device's long-lived ECDSA P-521 signing identity.
///
/// The public key's SPKI encoding is the cryptographic identity of a peer;
/// everything else (persistent ID, discovery UUID) is considered ephemeral
/// routing detail layered on top of it.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity. Returns [`CryptoError::Unavailable`] if the
    /// runtime's RNG cannot be used to produce key material; callers should
    /// treat that as a signal to run in degraded, E2E-disabled mode.
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = SecretKey::random(&mut OsRng);
        Ok(Identity {
            signing_key: SigningKey::from(secret),
        })
    }

    /// Reconstruct an identity from a previously generated PKCS#8 DER private
    /// key. The crate does not persist key material itself; this exists so a
    /// host application can restore one it has stored.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        use p521::pkcs8::DecodePrivateKey;
        let secret = SecretKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Identity {
            signing_key: SigningKey::from(secret),
        })
    }

    /// Export the private key as PKCS#8 DER for the host application to
    /// persist however it sees fit.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        use p521::pkcs8::EncodePrivateKey;
        let secret: SecretKey = self.signing_key.clone().into();
        secret
            .to_pkcs8_der()
            .map(|d| d.as_bytes().to_vec())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// The SPKI-encoded public key, base64 encoded. This is the wire
    /// representation sent in `hello`/`request`/`checkin` messages.
    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        public_key_to_base64(&self.verifying_key())
    }

    /// First 8 bytes of SHA-256 of the base64 SPKI public key, used for
    /// human verification (shown to the user to compare out-of-band).
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let pk_b64 = self.public_key_base64()?;
        Ok(fingerprint_of_bytes(pk_b64.as_bytes()))
    }

    /// Sign a message. The signature covers SHA-256(message), matching the
    /// scheme used throughout the wire protocol (ECDSA P-521 / SHA-256).
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        let digest = Sha256::digest(message);
        let sig: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(BASE64.encode(sig.to_der().as_bytes()))
    }

    /// Derive the shared AES-256-GCM key for a conversation with `peer_public_key_b64`.
    pub fn derive_shared_key(&self, peer_public_key_b64: &str) -> Result<SharedKey, CryptoError> {
        let peer_public = public_key_from_base64(peer_public_key_b64)?;
        let local_secret: SecretKey = self.signing_key.clone().into();

        let shared = diffie_hellman(local_secret.to_nonzero_scalar(), peer_public.as_affine());
        // 66-byte shared secret for the P-521 field, per the original design.
        let raw_secret = shared.raw_secret_bytes();

        let hk = Hkdf::<Sha256>::new(None, raw_secret.as_slice());
        let mut key_bytes = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key_bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(SharedKey { key: key_bytes })
    }
}

/// Verify a base64 ECDSA-P521/SHA-256 signature against a message and a
/// base64 SPKI public key. Used for handshake, checkin, and rendezvous
/// envelope verification where no shared key is established yet.
pub fn verify(peer_public_key_b64: &str, message: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
    let verifying_key = verifying_key_from_base64(peer_public_key_b64)?;
    let sig_der = BASE64
        .decode(signature_b64)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_der(&sig_der).map_err(|_| CryptoError::InvalidSignature)?;
    let digest = Sha256::digest(message);
    verifying_key
        .verify_prehash(&digest, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// First 8 bytes of SHA-256 of a base64-encoded public key, hex encoded.
pub fn identity_fingerprint(public_key_b64: &str) -> String {
    fingerprint_of_bytes(public_key_b64.as_bytes())
}

fn fingerprint_of_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..FINGERPRINT_LEN])
}

fn public_key_to_base64(verifying_key: &VerifyingKey) -> Result<String, CryptoError> {
    let public_key = PublicKey::from(*verifying_key);
    let der = public_key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

fn public_key_from_base64(public_key_b64: &str) -> Result<PublicKey, CryptoError> {
    let der = BASE64
        .decode(public_key_b64)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    PublicKey::from_public_key_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn verifying_key_from_base64(public_key_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let public_key = public_key_from_base64(public_key_b64)?;
    Ok(VerifyingKey::from(public_key))
}

/// An encrypted, authorship-signed message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Base64-encoded 12-byte AES-GCM nonce.
    pub iv: String,
    /// Base64-encoded ciphertext (including the GCM auth tag).
    pub ct: String,
    /// Base64 ECDSA signature over the ciphertext, proving authorship even
    /// if the recipient's copy of the shared key were somehow compromised.
    pub sig: String,
}

/// A derived, symmetric AES-256-GCM key shared between exactly two peers.
///
/// Deterministic given the two peers' public keys: both sides independently
/// arrive at the same key via ECDH + HKDF, so it never travels on the wire.
#[derive(Clone)]
pub struct SharedKey {
    key: [u8; 32],
}

impl SharedKey {
    pub fn from_raw(key: [u8; 32]) -> Self {
        SharedKey { key }
    }

    pub fn raw_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// First 8 bytes of SHA-256 of the raw AES key, hex encoded.
    pub fn fingerprint(&self) -> String {
        fingerprint_of_bytes(&self.key)
    }

    /// Encrypt `plaintext` and sign the ciphertext with `signer`.
    pub fn encrypt(&self, plaintext: &[u8], signer: &Identity) -> Result<EncryptedEnvelope, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptFailed)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let sig = signer.sign(&ciphertext)?;

        Ok(EncryptedEnvelope {
            iv: BASE64.encode(nonce_bytes),
            ct: BASE64.encode(&ciphertext),
            sig,
        })
    }

    /// Decrypt `envelope`, verifying its signature was produced by
    /// `sender_public_key_b64` over the ciphertext before attempting
    /// decryption. A signature mismatch is reported distinctly from a
    /// decryption failure so callers can apply the right sentinel policy.
    pub fn decrypt(
        &self,
        envelope: &EncryptedEnvelope,
        sender_public_key_b64: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = BASE64
            .decode(&envelope.ct)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        verify(sender_public_key_b64, &ciphertext, &envelope.sig)?;

        let nonce_bytes = BASE64
            .decode(&envelope.iv)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptFailed)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Compute the rendezvous slug for a given 10-minute window index.
    ///
    /// `hex8(HMAC-SHA-256(key, "peerns-rvz-v1-" || window_index))`. Both
    /// sides of a contact pair compute the same value because the key is
    /// symmetric, without ever exchanging the window index over the wire.
    pub fn rendezvous_slug(&self, window_index: u64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(RENDEZVOUS_PREFIX.as_bytes());
        mac.update(window_index.to_string().as_bytes());
        let result = mac.finalize().into_bytes();
        hex::encode(&result[..FINGERPRINT_LEN])
    }
}
