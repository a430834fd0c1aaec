use base58::{FromBase58, ToBase58};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

pub type Sha256Hash = [u8; 32];
pub type PubkeyHash = [u8; 20];

pub fn hash(data: &[u8]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn double_hash(data: &[u8]) -> Sha256Hash {
    hash(&hash(data))
}

/// RIPEMD160(SHA256(data)), the payload of pay-to-address scripts.
pub fn hash160(data: &[u8]) -> PubkeyHash {
    let mut hasher = Ripemd160::new();
    hasher.update(hash(data));
    hasher.finalize().into()
}

/// First four bytes of the double SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = double_hash(data);
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(payload.len() + 5);
    bytes.push(version);
    bytes.extend_from_slice(payload);
    let check = checksum(&bytes);
    bytes.extend_from_slice(&check);
    bytes.to_base58()
}

/// Returns the version byte and the payload of a base58check string.
pub fn base58check_decode(encoded: &str) -> Result<(u8, Vec<u8>)> {
    let bytes = encoded
        .from_base58()
        .map_err(|err| Error::InvalidAddress(format!("{}: {:?}", encoded, err)))?;
    if bytes.len() < 5 {
        return Err(Error::InvalidAddress(encoded.to_string()));
    }
    let (body, check) = bytes.split_at(bytes.len() - 4);
    if checksum(body) != check {
        return Err(Error::InvalidAddress(format!("{}: bad checksum", encoded)));
    }
    Ok((body[0], body[1..].to_vec()))
}
