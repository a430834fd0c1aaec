use crate::crypto::{base58check_decode, base58check_encode, hash160, PubkeyHash, Sha256Hash};
use crate::{Error, Result};
use rand::RngCore;
use secp256k1::{Message, PublicKey, SecretKey, Signature, SECP256K1};
use std::fmt;

/// An secp256k1 keypair that owns one wallet address and signs XRouter packets.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Keypair {
    /// Create and return a keypair with a randomly generated private key.
    pub fn new() -> Keypair {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // out-of-range scalars are astronomically rare, just draw again
            if let Ok(keypair) = Keypair::from_secret_slice(&bytes) {
                return keypair;
            }
        }
    }

    pub fn from_secret_slice(slice: &[u8]) -> Result<Keypair> {
        let secret_key = SecretKey::from_slice(slice)?;
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);

        Ok(Keypair {
            secret_key,
            public_key,
        })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Keypair> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret_hex, &mut bytes as &mut [u8])?;
        Keypair::from_secret_slice(&bytes)
    }

    /// Decode a wallet-import-format key, checking its version byte.
    pub fn from_wif(wif: &str, expected_version: u8) -> Result<Keypair> {
        let (version, payload) = base58check_decode(wif)?;
        if version != expected_version {
            return Err(Error::InvalidAddress(format!(
                "key version {} does not match {}",
                version, expected_version
            )));
        }
        match payload.len() {
            32 => Keypair::from_secret_slice(&payload),
            33 if payload[32] == 0x01 => Keypair::from_secret_slice(&payload[..32]),
            _ => Err(Error::InvalidAddress(String::from("bad wif length"))),
        }
    }

    /// Accepts either 64 hex characters or a WIF string.
    pub fn from_secret_str(secret: &str, wif_version: u8) -> Result<Keypair> {
        if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
            Keypair::from_secret_hex(secret)
        } else {
            Keypair::from_wif(secret, wif_version)
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// 33-byte compressed encoding of the public key.
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    pub fn pubkey_hash(&self) -> PubkeyHash {
        hash160(&self.public_key.serialize())
    }

    /// Base58check pay-to-address string for the given network version byte.
    pub fn address(&self, version: u8) -> String {
        base58check_encode(version, &self.pubkey_hash())
    }

    pub fn to_wif(&self, version: u8) -> String {
        let mut payload = self.secret_key[..].to_vec();
        payload.push(0x01);
        base58check_encode(version, &payload)
    }

    /// Sign a 32-byte digest. The result is always in low-S form.
    pub fn sign_hash(&self, digest: &Sha256Hash) -> Result<Signature> {
        let msg = Message::from_slice(digest)?;
        let mut signature = SECP256K1.sign(&msg, &self.secret_key);
        signature.normalize_s();
        Ok(signature)
    }
}

impl Default for Keypair {
    fn default() -> Self {
        Keypair::new()
    }
}

impl fmt::Display for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pubkey:{}", hex::encode(self.public_key_bytes()))
    }
}
