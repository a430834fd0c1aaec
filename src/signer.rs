//! Recoverable signatures over XRouter packets.
//!
//! The signed digest is a single SHA-256 of the packet bytes with the
//! signature field zeroed and the compact-size prefix left out. Signatures
//! travel as a fixed 64-byte `R || S` pair with no recovery id, so
//! verification tries every recovery id and compares the recovered key with
//! the key the packet claims to be from.

use crate::crypto::hash;
use crate::keypair::Keypair;
use crate::{Error, Result};
use secp256k1::recovery::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SECP256K1};
use tracing::warn;

pub const SIGNATURE_SIZE: usize = 64;
pub const COMPONENT_SIZE: usize = 32;

pub type PacketSignature = [u8; SIGNATURE_SIZE];

/// Sign `message_bytes` and return the fixed-width `R || S` form.
pub fn sign(message_bytes: &[u8], keypair: &Keypair) -> Result<PacketSignature> {
    let digest = hash(message_bytes);
    let signature = keypair.sign_hash(&digest)?;
    let der = signature.serialize_der();
    let (r, s) = parse_der_components(&der)?;

    let mut out = [0u8; SIGNATURE_SIZE];
    out[..COMPONENT_SIZE].copy_from_slice(&fit_component(r));
    out[COMPONENT_SIZE..].copy_from_slice(&fit_component(s));
    Ok(out)
}

/// Left-pad short components with zeros, keep the trailing 32 bytes of long ones.
///
/// DER integers carry a leading 0x00 when the high bit is set, so 33-byte
/// components are routine. Dropping any other non-zero byte changes the value
/// and is logged.
pub fn fit_component(component: &[u8]) -> [u8; COMPONENT_SIZE] {
    let mut out = [0u8; COMPONENT_SIZE];
    if component.len() <= COMPONENT_SIZE {
        out[COMPONENT_SIZE - component.len()..].copy_from_slice(component);
    } else {
        let cut = component.len() - COMPONENT_SIZE;
        if component[..cut].iter().any(|b| *b != 0) {
            warn!(
                "signature component of {} bytes truncated with non-zero high bytes",
                component.len()
            );
        }
        out.copy_from_slice(&component[cut..]);
    }
    out
}

/// Pull the raw `r` and `s` integer bodies out of a DER signature.
fn parse_der_components(der: &[u8]) -> Result<(&[u8], &[u8])> {
    if der.len() < 8 || der[0] != 0x30 {
        return Err(Error::Malformed(String::from("bad DER signature")));
    }
    let mut pos = 2;
    let r = read_der_integer(der, &mut pos)?;
    let s = read_der_integer(der, &mut pos)?;
    Ok((r, s))
}

fn read_der_integer<'a>(der: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let malformed = || Error::Malformed(String::from("bad DER integer"));
    if der.get(*pos) != Some(&0x02) {
        return Err(malformed());
    }
    let len = *der.get(*pos + 1).ok_or_else(malformed)? as usize;
    let start = *pos + 2;
    let end = start + len;
    if end > der.len() {
        return Err(malformed());
    }
    *pos = end;
    Ok(&der[start..end])
}

/// All public keys that could have produced `signature` over `message_bytes`.
pub fn recover_candidates(signature: &PacketSignature, message_bytes: &[u8]) -> Vec<PublicKey> {
    let digest = hash(message_bytes);
    let msg = match Message::from_slice(&digest) {
        Ok(msg) => msg,
        Err(_) => return vec![],
    };

    (0..4)
        .filter_map(|id| {
            let recovery_id = RecoveryId::from_i32(id).ok()?;
            let recoverable = RecoverableSignature::from_compact(signature, recovery_id).ok()?;
            SECP256K1.recover(&msg, &recoverable).ok()
        })
        .collect()
}

/// Recover the signer and check it is `expected`, byte for byte.
pub fn recover_key(
    signature: &PacketSignature,
    message_bytes: &[u8],
    expected: &[u8; 33],
) -> Result<PublicKey> {
    recover_candidates(signature, message_bytes)
        .into_iter()
        .find(|key| key.serialize() == *expected)
        .ok_or(Error::InvalidSignature)
}

pub fn verify(signature: &PacketSignature, message_bytes: &[u8], expected: &[u8; 33]) -> bool {
    recover_key(signature, message_bytes, expected).is_ok()
}
