//! XRouter packets: the header, the per-command bodies, and signing.
//!
//! ```text
//! +--------------+---------+---------+-----------+------+----------+------+--------+-----------+
//! | compact size | version | command | timestamp | size | reserved | uuid | pubkey | signature |
//! | 1/3/5 bytes  | u32 LE  | u32 LE  | u32 LE    | u32  | 8 bytes  | 36   | 33     | 64        |
//! +--------------+---------+---------+-----------+------+----------+------+--------+-----------+
//! |                               body (size bytes)                                            |
//! +--------------------------------------------------------------------------------------------+
//! ```
//!
//! The compact size encodes `size + 157`, the length of everything after it.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

use uuid::Uuid;

use crate::keypair::Keypair;
use crate::networking::wire::{
    read_array, read_compact_size, read_nt_string, read_u32_le, write_compact_size,
    write_nt_string,
};
use crate::networking::xrouter_config::{ParamType, PluginConfiguration};
use crate::signer::{self, PacketSignature, SIGNATURE_SIZE};
use crate::{Error, Result};

pub const XROUTER_PACKET_VERSION: u32 = 0xff00_0023;
/// Header bytes after the compact-size prefix.
pub const XROUTER_HEADER_SIZE: usize = 157;
pub const UUID_LENGTH: usize = 36;
pub const PUBKEY_LENGTH: usize = 33;
pub const FREE_PAYMENT: &str = "nohash;nofee";

lazy_static! {
    static ref COMMAND_NAMES: HashMap<&'static str, XRouterCommand> = XRouterCommand::ALL
        .iter()
        .map(|command| (command.name(), *command))
        .collect();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum XRouterCommand {
    Invalid = 0,
    Reply = 1,
    GetReply = 2,
    GetConfig = 3,
    ConfigReply = 4,
    GetBlockCount = 20,
    GetBlockHash = 21,
    GetBlock = 22,
    GetTransaction = 23,
    SendTransaction = 24,
    GetTxBloomFilter = 40,
    GenerateBloomFilter = 41,
    GetBlocks = 50,
    GetTransactions = 51,
    GetBlockAtTime = 52,
    DecodeRawTransaction = 53,
    GetBalance = 60,
    GetBalanceUpdate = 61,
    Service = 1000,
}

impl XRouterCommand {
    pub const ALL: [XRouterCommand; 19] = [
        XRouterCommand::Invalid,
        XRouterCommand::Reply,
        XRouterCommand::GetReply,
        XRouterCommand::GetConfig,
        XRouterCommand::ConfigReply,
        XRouterCommand::GetBlockCount,
        XRouterCommand::GetBlockHash,
        XRouterCommand::GetBlock,
        XRouterCommand::GetTransaction,
        XRouterCommand::SendTransaction,
        XRouterCommand::GetTxBloomFilter,
        XRouterCommand::GenerateBloomFilter,
        XRouterCommand::GetBlocks,
        XRouterCommand::GetTransactions,
        XRouterCommand::GetBlockAtTime,
        XRouterCommand::DecodeRawTransaction,
        XRouterCommand::GetBalance,
        XRouterCommand::GetBalanceUpdate,
        XRouterCommand::Service,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            XRouterCommand::Invalid => "xrInvalid",
            XRouterCommand::Reply => "xrReply",
            XRouterCommand::GetReply => "xrGetReply",
            XRouterCommand::GetConfig => "xrGetConfig",
            XRouterCommand::ConfigReply => "xrConfigReply",
            XRouterCommand::GetBlockCount => "xrGetBlockCount",
            XRouterCommand::GetBlockHash => "xrGetBlockHash",
            XRouterCommand::GetBlock => "xrGetBlock",
            XRouterCommand::GetTransaction => "xrGetTransaction",
            XRouterCommand::SendTransaction => "xrSendTransaction",
            XRouterCommand::GetTxBloomFilter => "xrGetTxBloomFilter",
            XRouterCommand::GenerateBloomFilter => "xrGenerateBloomFilter",
            XRouterCommand::GetBlocks => "xrGetBlocks",
            XRouterCommand::GetTransactions => "xrGetTransactions",
            XRouterCommand::GetBlockAtTime => "xrGetBlockAtTime",
            XRouterCommand::DecodeRawTransaction => "xrDecodeRawTransaction",
            XRouterCommand::GetBalance => "xrGetBalance",
            XRouterCommand::GetBalanceUpdate => "xrGetBalanceUpdate",
            XRouterCommand::Service => "xrService",
        }
    }

    pub fn from_name(name: &str) -> Option<XRouterCommand> {
        COMMAND_NAMES.get(name).copied()
    }

    pub fn is_reply(self) -> bool {
        matches!(self, XRouterCommand::Reply | XRouterCommand::ConfigReply)
    }
}

impl TryFrom<u32> for XRouterCommand {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        XRouterCommand::ALL
            .iter()
            .copied()
            .find(|command| command.id() == id)
            .ok_or(Error::UnknownCommand(id))
    }
}

impl fmt::Display for XRouterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XRouterHeader {
    pub version: u32,
    pub command: XRouterCommand,
    pub timestamp: u32,
    pub size: u32,
    pub uuid: String,
    pub pubkey: [u8; PUBKEY_LENGTH],
    pub signature: PacketSignature,
}

impl XRouterHeader {
    /// Length of everything after the compact-size prefix.
    pub fn extended_size(&self) -> u64 {
        self.size as u64 + XROUTER_HEADER_SIZE as u64
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.extended_size());
        self.encode_fixed(out);
    }

    fn encode_fixed(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.command.id().to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);

        let mut uuid = [0u8; UUID_LENGTH];
        let raw = self.uuid.as_bytes();
        let len = raw.len().min(UUID_LENGTH);
        uuid[..len].copy_from_slice(&raw[..len]);
        out.extend_from_slice(&uuid);

        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.signature);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<XRouterHeader> {
        let extended = read_compact_size(buf)?;
        if extended < XROUTER_HEADER_SIZE as u64 {
            return Err(Error::Malformed(format!(
                "xrouter extended size {} below header size",
                extended
            )));
        }
        let version = read_u32_le(buf)?;
        let command = XRouterCommand::try_from(read_u32_le(buf)?)?;
        let timestamp = read_u32_le(buf)?;
        let size = read_u32_le(buf)?;
        let _reserved: [u8; 8] = read_array(buf)?;
        let raw_uuid: [u8; UUID_LENGTH] = read_array(buf)?;
        let pubkey: [u8; PUBKEY_LENGTH] = read_array(buf)?;
        let signature: [u8; SIGNATURE_SIZE] = read_array(buf)?;

        let uuid = String::from_utf8_lossy(&raw_uuid)
            .trim_end_matches('\0')
            .to_string();

        Ok(XRouterHeader {
            version,
            command,
            timestamp,
            size,
            uuid,
            pubkey,
            signature,
        })
    }
}

/// A typed `xrService` parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginParam {
    String(String),
    Int(i64),
    Bool(bool),
}

impl PluginParam {
    /// Coerce a textual argument to the type the plugin declares.
    pub fn parse(value: &str, param_type: ParamType) -> Result<PluginParam> {
        match param_type {
            ParamType::String => Ok(PluginParam::String(value.to_string())),
            ParamType::Int => value.trim().parse::<i64>().map(PluginParam::Int).map_err(|_| {
                Error::InvalidPluginCall(format!("'{}' is not an int", value))
            }),
            ParamType::Bool => {
                if value.eq_ignore_ascii_case("true") {
                    Ok(PluginParam::Bool(true))
                } else if value.eq_ignore_ascii_case("false") {
                    Ok(PluginParam::Bool(false))
                } else {
                    Err(Error::InvalidPluginCall(format!("'{}' is not a bool", value)))
                }
            }
        }
    }

    pub fn param_type(&self) -> ParamType {
        match self {
            PluginParam::String(_) => ParamType::String,
            PluginParam::Int(_) => ParamType::Int,
            PluginParam::Bool(_) => ParamType::Bool,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            PluginParam::String(value) => write_nt_string(out, value),
            PluginParam::Int(value) => out.extend_from_slice(&(*value as u32).to_le_bytes()),
            PluginParam::Bool(value) => out.extend_from_slice(&(*value as u32).to_le_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XRouterBody {
    /// `xrReply` and `xrConfigReply`.
    Reply { reply: String },
    GetConfig { addr: String },
    /// Currency queries carrying a parameter count: block count, block hash,
    /// block, transaction, and send transaction.
    Query {
        currency: String,
        payment: String,
        params: Vec<String>,
    },
    /// Older currency queries whose trailing fields have no count prefix.
    Fields {
        currency: String,
        payment: String,
        fields: Vec<String>,
    },
    Service {
        plugin: String,
        payment: String,
        params: Vec<PluginParam>,
    },
    /// Bodies this node never needs to interpret.
    Raw(Vec<u8>),
}

impl XRouterBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        match self {
            XRouterBody::Reply { reply } => write_nt_string(&mut out, reply),
            XRouterBody::GetConfig { addr } => write_nt_string(&mut out, addr),
            XRouterBody::Query {
                currency,
                payment,
                params,
            } => {
                write_nt_string(&mut out, currency);
                write_nt_string(&mut out, payment);
                out.extend_from_slice(&(params.len() as u32).to_le_bytes());
                for param in params {
                    write_nt_string(&mut out, param);
                }
            }
            XRouterBody::Fields {
                currency,
                payment,
                fields,
            } => {
                write_nt_string(&mut out, currency);
                write_nt_string(&mut out, payment);
                for field in fields {
                    write_nt_string(&mut out, field);
                }
            }
            XRouterBody::Service {
                plugin,
                payment,
                params,
            } => {
                write_nt_string(&mut out, plugin);
                write_nt_string(&mut out, payment);
                out.extend_from_slice(&(params.len() as u32).to_le_bytes());
                for param in params {
                    param.encode(&mut out);
                }
            }
            XRouterBody::Raw(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    pub fn decode(command: XRouterCommand, mut buf: &[u8]) -> Result<XRouterBody> {
        let buf = &mut buf;
        match command {
            XRouterCommand::Reply | XRouterCommand::ConfigReply => Ok(XRouterBody::Reply {
                reply: read_nt_string(buf)?,
            }),
            XRouterCommand::GetConfig => Ok(XRouterBody::GetConfig {
                addr: read_nt_string(buf)?,
            }),
            XRouterCommand::GetBlockCount
            | XRouterCommand::GetBlockHash
            | XRouterCommand::GetBlock
            | XRouterCommand::GetTransaction
            | XRouterCommand::SendTransaction => {
                let currency = read_nt_string(buf)?;
                let payment = read_nt_string(buf)?;
                let count = read_u32_le(buf)?;
                let params = (0..count)
                    .map(|_| read_nt_string(buf))
                    .collect::<Result<Vec<_>>>()?;
                Ok(XRouterBody::Query {
                    currency,
                    payment,
                    params,
                })
            }
            XRouterCommand::GetBlocks
            | XRouterCommand::GetTransactions
            | XRouterCommand::GetBalanceUpdate
            | XRouterCommand::GetBalance
            | XRouterCommand::GetTxBloomFilter => {
                let currency = read_nt_string(buf)?;
                let payment = read_nt_string(buf)?;
                let mut fields = vec![];
                while !buf.is_empty() {
                    fields.push(read_nt_string(buf)?);
                }
                Ok(XRouterBody::Fields {
                    currency,
                    payment,
                    fields,
                })
            }
            _ => Ok(XRouterBody::Raw(buf.to_vec())),
        }
    }

    /// Build an `xrService` body, checking the arguments against the plugin schema.
    pub fn service(
        plugin: &PluginConfiguration,
        payment: &str,
        args: &[String],
    ) -> Result<XRouterBody> {
        if args.len() != plugin.param_types.len() {
            return Err(Error::InvalidPluginCall(format!(
                "{} expects {} parameters, got {}",
                plugin.name,
                plugin.param_types.len(),
                args.len()
            )));
        }
        let params = args
            .iter()
            .zip(plugin.param_types.iter())
            .map(|(arg, param_type)| PluginParam::parse(arg, *param_type))
            .collect::<Result<Vec<_>>>()?;

        Ok(XRouterBody::Service {
            plugin: plugin.name.clone(),
            payment: payment.to_string(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XRouterMessage {
    header: XRouterHeader,
    body: XRouterBody,
}

impl XRouterMessage {
    /// Build and sign a request. The signature is computed over the packet
    /// with a zeroed signature field and then spliced into the header.
    pub fn new_signed(
        command: XRouterCommand,
        uuid: Option<String>,
        body: XRouterBody,
        keypair: &Keypair,
        timestamp: u32,
    ) -> Result<XRouterMessage> {
        let body_bytes = body.encode();
        let uuid = uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        if uuid.len() > UUID_LENGTH {
            return Err(Error::Malformed(format!("uuid '{}' too long", uuid)));
        }

        let mut message = XRouterMessage {
            header: XRouterHeader {
                version: XROUTER_PACKET_VERSION,
                command,
                timestamp,
                size: body_bytes.len() as u32,
                uuid,
                pubkey: keypair.public_key_bytes(),
                signature: [0u8; SIGNATURE_SIZE],
            },
            body,
        };
        let signature = signer::sign(&message.signing_bytes(), keypair)?;
        message.header.signature = signature;
        Ok(message)
    }

    pub fn from_parts(header: XRouterHeader, body: XRouterBody) -> XRouterMessage {
        XRouterMessage { header, body }
    }

    pub fn header(&self) -> &XRouterHeader {
        &self.header
    }

    pub fn body(&self) -> &XRouterBody {
        &self.body
    }

    pub fn command(&self) -> XRouterCommand {
        self.header.command
    }

    pub fn uuid(&self) -> &str {
        &self.header.uuid
    }

    pub fn reply(&self) -> Option<&str> {
        match &self.body {
            XRouterBody::Reply { reply } => Some(reply),
            _ => None,
        }
    }

    /// Currency the request targets, if the body carries one.
    pub fn currency(&self) -> Option<&str> {
        match &self.body {
            XRouterBody::Query { currency, .. } | XRouterBody::Fields { currency, .. } => {
                Some(currency)
            }
            _ => None,
        }
    }

    /// Packet bytes without the compact-size prefix and with a zero signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.header.clone();
        unsigned.signature = [0u8; SIGNATURE_SIZE];
        let mut out = Vec::with_capacity(XROUTER_HEADER_SIZE + self.header.size as usize);
        unsigned.encode_fixed(&mut out);
        out.extend_from_slice(&self.body.encode());
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        self.header.encode(&mut out);
        out.extend_from_slice(&self.body.encode());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<XRouterMessage> {
        let mut buf = payload;
        let header = XRouterHeader::decode(&mut buf)?;
        let size = header.size as usize;
        if buf.len() < size {
            return Err(Error::Truncated {
                needed: size,
                available: buf.len(),
            });
        }
        let body = XRouterBody::decode(header.command, &buf[..size])?;
        Ok(XRouterMessage { header, body })
    }

    /// True when the sender left the key and signature empty.
    pub fn is_unsigned(&self) -> bool {
        self.header.pubkey.iter().all(|b| *b == 0)
    }

    /// Check the signature against the key in the header.
    pub fn verify_signature(&self) -> Result<()> {
        signer::recover_key(
            &self.header.signature,
            &self.signing_bytes(),
            &self.header.pubkey,
        )
        .map(|_| ())
    }
}
