use serde::{Deserialize, Serialize};

use crate::context::CoinParams;
use crate::crypto::{base58check_decode, double_hash, Sha256Hash};
use crate::keypair::Keypair;
use crate::networking::wire::write_compact_size;
use crate::{Error, Result};

pub const SIGHASH_ALL: u32 = 1;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct OutPoint {
    /// Display (big-endian) hex form.
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: &str, vout: u32) -> OutPoint {
        OutPoint {
            txid: txid.to_lowercase(),
            vout,
        }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut txid = hex::decode(&self.txid)?;
        if txid.len() != 32 {
            return Err(Error::Malformed(format!("txid {} is not 32 bytes", self.txid)));
        }
        txid.reverse();
        out.extend(&txid);
        out.extend(&self.vout.to_le_bytes());
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TxIn {
    pub previous_output: OutPoint,
    /// Script of the output being spent, used while signing.
    pub script_pubkey: Vec<u8>,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> TxOut {
        TxOut {
            value,
            script_pubkey,
        }
    }
}

/// A legacy (non-segwit) transaction spending P2PKH outputs.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
        }
    }

    pub fn add_input(&mut self, previous_output: OutPoint, script_pubkey: Vec<u8>) {
        self.inputs.push(TxIn {
            previous_output,
            script_pubkey,
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        });
    }

    pub fn add_output(&mut self, output: TxOut) {
        self.outputs.push(output);
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.inputs.iter().map(|input| &input.previous_output)
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    fn serialize_with(&self, script_for: impl Fn(usize, &TxIn) -> Vec<u8>) -> Result<Vec<u8>> {
        let mut out = vec![];
        out.extend(&self.version.to_le_bytes());
        write_compact_size(&mut out, self.inputs.len() as u64);
        for (index, input) in self.inputs.iter().enumerate() {
            input.previous_output.serialize_into(&mut out)?;
            let script = script_for(index, input);
            write_compact_size(&mut out, script.len() as u64);
            out.extend(&script);
            out.extend(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend(&output.value.to_le_bytes());
            write_compact_size(&mut out, output.script_pubkey.len() as u64);
            out.extend(&output.script_pubkey);
        }
        out.extend(&self.lock_time.to_le_bytes());
        Ok(out)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.serialize_with(|_, input| input.script_sig.clone())
    }

    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.serialize()?))
    }

    pub fn txid(&self) -> Result<String> {
        let mut digest = double_hash(&self.serialize()?);
        digest.reverse();
        Ok(hex::encode(digest))
    }

    /// Legacy SIGHASH_ALL digest for input `index`: every other script sig is
    /// emptied and this input carries the script being spent.
    pub fn signature_hash(&self, index: usize) -> Result<Sha256Hash> {
        if index >= self.inputs.len() {
            return Err(Error::Malformed(format!("no input {}", index)));
        }
        let mut bytes = self.serialize_with(|i, input| {
            if i == index {
                input.script_pubkey.clone()
            } else {
                vec![]
            }
        })?;
        bytes.extend(&SIGHASH_ALL.to_le_bytes());
        Ok(double_hash(&bytes))
    }

    pub fn sign_input(&mut self, index: usize, keypair: &Keypair) -> Result<()> {
        let digest = self.signature_hash(index)?;
        let signature = keypair.sign_hash(&digest)?;

        let mut der = signature.serialize_der().to_vec();
        der.push(SIGHASH_ALL as u8);
        let pubkey = keypair.public_key_bytes();

        let mut script_sig = Vec::with_capacity(der.len() + pubkey.len() + 2);
        script_sig.push(der.len() as u8);
        script_sig.extend(&der);
        script_sig.push(pubkey.len() as u8);
        script_sig.extend(&pubkey);
        self.inputs[index].script_sig = script_sig;
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| !input.script_sig.is_empty())
    }
}

pub fn p2pkh_script(hash: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, hash.len() as u8];
    script.extend(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2sh_script(hash: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_HASH160, hash.len() as u8];
    script.extend(hash);
    script.push(OP_EQUAL);
    script
}

/// Decode `address` for `coin`. Returns the output script and whether the
/// address pays to a script hash.
pub fn script_for_address(address: &str, coin: &CoinParams) -> Result<(Vec<u8>, bool)> {
    let (version, payload) = base58check_decode(address)?;
    if payload.len() != 20 || !coin.acceptable_codes.contains(&version) {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    if coin.is_p2sh_version(version) {
        Ok((p2sh_script(&payload), true))
    } else {
        Ok((p2pkh_script(&payload), false))
    }
}
