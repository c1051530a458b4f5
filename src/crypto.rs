//! Cryptographic capabilities the transactions rely on, behind the [Crypto] trait so that the
//!  protocol logic does not depend on a specific library.
//!
//! The default implementation [DalekCrypto] uses Ed25519 signatures for identity, and X25519 both
//!  for sealed boxes (anonymous public-key encryption of handshake challenges) and for agreeing
//!  on session keys based on ephemeral key pairs. Bulk encryption is AES-256-GCM.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// public key for verifying signatures
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerKey(pub [u8; 32]);

/// public key for encryption (sealed boxes, key agreement)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey(pub [u8; 32]);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub const LEN: usize = 64;
}

fn fmt_key_prefix(f: &mut Formatter<'_>, name: &str, key: &[u8]) -> std::fmt::Result {
    write!(f, "{}(", name)?;
    for b in &key[..4] {
        write!(f, "{:02x}", b)?;
    }
    write!(f, "..)")
}
impl Debug for VerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_key_prefix(f, "VerKey", &self.0)
    }
}
impl Debug for PubKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_key_prefix(f, "PubKey", &self.0)
    }
}
impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_key_prefix(f, "Signature", &self.0)
    }
}

pub struct EphemeralSecret(pub [u8; 32]);
impl Debug for EphemeralSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralSecret(***)")
    }
}

#[derive(Debug)]
pub struct EphemeralKeyPair {
    pub secret: EphemeralSecret,
    pub public: PubKey,
}

pub trait Crypto: Send + Sync {
    fn verkey(&self) -> VerKey;
    fn pubkey(&self) -> PubKey;

    fn sign(&self, msg: &[u8]) -> Signature;
    fn verify(&self, verkey: &VerKey, msg: &[u8], signature: &Signature) -> bool;

    fn generate_ephemeral_keypair(&self) -> EphemeralKeyPair;

    /// encrypt so that only the owner of `pubkey`'s private key can decrypt
    fn seal(&self, pubkey: &PubKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>>;
    /// decrypt something that was sealed for this instance's public key
    fn open(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Diffie-Hellman of an ephemeral secret with the other side's ephemeral public key
    fn agree(&self, secret: &EphemeralSecret, their_public: &PubKey) -> [u8; 32];
}

pub struct DalekCrypto {
    signing_key: SigningKey,
    private_key: StaticSecret,
}
impl Debug for DalekCrypto {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DalekCrypto{{{:?}, {:?}}}", self.verkey(), self.pubkey())
    }
}

impl DalekCrypto {
    const SEAL_NONCE_LEN: usize = 12;
    const SEAL_OVERHEAD: usize = 32 + Self::SEAL_NONCE_LEN + 16;

    pub fn generate() -> DalekCrypto {
        DalekCrypto::from_seeds(rand::random(), rand::random())
    }

    pub fn from_seeds(signing_seed: [u8; 32], private_seed: [u8; 32]) -> DalekCrypto {
        DalekCrypto {
            signing_key: SigningKey::from_bytes(&signing_seed),
            private_key: StaticSecret::from(private_seed),
        }
    }

    fn seal_cipher(shared: &[u8; 32], ephemeral_public: &[u8; 32], recipient: &[u8; 32]) -> anyhow::Result<Aes256Gcm> {
        let mut hasher = Sha256::new();
        hasher.update(b"roadstack seal");
        hasher.update(shared);
        hasher.update(ephemeral_public);
        hasher.update(recipient);
        let key: [u8; 32] = hasher.finalize().into();
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("invalid seal key: {}", e))
    }
}

impl Crypto for DalekCrypto {
    fn verkey(&self) -> VerKey {
        VerKey(self.signing_key.verifying_key().to_bytes())
    }

    fn pubkey(&self) -> PubKey {
        PubKey(PublicKey::from(&self.private_key).to_bytes())
    }

    fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.signing_key.sign(msg).to_bytes())
    }

    fn verify(&self, verkey: &VerKey, msg: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&verkey.0) {
            Ok(key) => key.verify(msg, &ed25519_dalek::Signature::from_bytes(&signature.0)).is_ok(),
            Err(_) => false,
        }
    }

    fn generate_ephemeral_keypair(&self) -> EphemeralKeyPair {
        let seed: [u8; 32] = rand::random();
        let public = PublicKey::from(&StaticSecret::from(seed));
        EphemeralKeyPair {
            secret: EphemeralSecret(seed),
            public: PubKey(public.to_bytes()),
        }
    }

    fn seal(&self, pubkey: &PubKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(pubkey.0));
        let cipher = Self::seal_cipher(shared.as_bytes(), &ephemeral_public, &pubkey.0)?;

        let nonce: [u8; Self::SEAL_NONCE_LEN] = rand::random();
        let ciphertext = cipher.encrypt(aead::Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow!("sealing failed: {}", e))?;

        let mut result = Vec::with_capacity(Self::SEAL_OVERHEAD + plaintext.len());
        result.extend_from_slice(&ephemeral_public);
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn open(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.len() < Self::SEAL_OVERHEAD {
            bail!("sealed box too short: {} bytes", ciphertext.len());
        }
        let (ephemeral_public, rest) = ciphertext.split_at(32);
        let (nonce, ciphertext) = rest.split_at(Self::SEAL_NONCE_LEN);

        let mut their_public = [0u8; 32];
        their_public.copy_from_slice(ephemeral_public);
        let shared = self.private_key.diffie_hellman(&PublicKey::from(their_public));
        let cipher = Self::seal_cipher(shared.as_bytes(), &their_public, &self.pubkey().0)?;

        cipher.decrypt(aead::Nonce::<Aes256Gcm>::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("opening sealed box failed: {}", e))
    }

    fn agree(&self, secret: &EphemeralSecret, their_public: &PubKey) -> [u8; 32] {
        StaticSecret::from(secret.0)
            .diffie_hellman(&PublicKey::from(their_public.0))
            .to_bytes()
    }
}


/// AES-256-GCM for one direction of a session. The 12 byte nonce consists of a random fixed part
///  and an incrementing counter, and it is sent as a prefix of the ciphertext.
pub struct SessionCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}
impl Debug for SessionCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCipher{{{:08x}:{}}}", self.nonce_fixed, self.nonce_incremented.load(Ordering::Acquire))
    }
}

impl SessionCipher {
    pub const NONCE_LEN: usize = 12;
    pub const OVERHEAD: usize = Self::NONCE_LEN + 16;

    pub fn new(key: &[u8; 32]) -> anyhow::Result<SessionCipher> {
        Ok(SessionCipher {
            cipher: Aes256Gcm::new_from_slice(key)
                .map_err(|e| anyhow!("invalid session key: {}", e))?,
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(0),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; Self::NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());

        let ciphertext = self.cipher.encrypt(aead::Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow!("encryption error: {}", e))?;

        let mut result = Vec::with_capacity(Self::OVERHEAD + plaintext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        if data.len() < Self::OVERHEAD {
            bail!("encrypted data too short: {} bytes", data.len());
        }
        let (nonce, ciphertext) = data.split_at(Self::NONCE_LEN);
        self.cipher.decrypt(aead::Nonce::<Aes256Gcm>::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("decryption error: {}", e))
    }
}

/// Symmetric session state established by an Allow transaction: one key per direction
#[derive(Debug)]
pub struct Session {
    pub tx: SessionCipher,
    pub rx: SessionCipher,
}
impl Session {
    /// Both sides derive the same pair of keys from the ephemeral Diffie-Hellman result and the
    ///  two challenge nonces; `initiator` selects which of them is used for sending.
    pub fn derive(shared: &[u8; 32], nonce_a: &[u8; 32], nonce_c: &[u8; 32], initiator: bool) -> anyhow::Result<Session> {
        let key = |label: &[u8]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(label);
            hasher.update(shared);
            hasher.update(nonce_a);
            hasher.update(nonce_c);
            hasher.finalize().into()
        };
        let initiator_to_correspondent = SessionCipher::new(&key(b"roadstack initiator"))?;
        let correspondent_to_initiator = SessionCipher::new(&key(b"roadstack correspondent"))?;

        if initiator {
            Ok(Session { tx: initiator_to_correspondent, rx: correspondent_to_initiator })
        }
        else {
            Ok(Session { tx: correspondent_to_initiator, rx: initiator_to_correspondent })
        }
    }
}
