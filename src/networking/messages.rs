//! Payloads carried inside the outer frame.
//!
//! Only the handshake messages and `xrouter` are interpreted. Everything else
//! a Blocknet node gossips (`inv`, `addr`, sporks, masternode lists) is kept
//! as an opaque payload and dropped by the connection.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use rand::Rng;

use crate::networking::wire::{
    read_array, read_i32_le, read_i64_le, read_u16_be, read_u64_le, read_u8, read_var_string,
    write_var_string,
};
use crate::networking::xrouter::XRouterMessage;
use crate::time::create_timestamp;
use crate::Result;

/// The NODE_NETWORK service bit: the peer serves a full chain.
pub const NODE_NETWORK: u64 = 1;

pub const VERSION_COMMAND: &str = "version";
pub const VERACK_COMMAND: &str = "verack";
pub const PING_COMMAND: &str = "ping";
pub const PONG_COMMAND: &str = "pong";
pub const REJECT_COMMAND: &str = "reject";
pub const XROUTER_COMMAND: &str = "xrouter";

/// Commands a Blocknet peer sends that carry nothing this node needs.
pub const IGNORED_COMMANDS: [&str; 7] = ["inv", "addr", "getsporks", "ssc", "mnget", "xbridge", "dseg"];

#[derive(Debug, Clone, PartialEq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(address: SocketAddr, services: u64) -> NetAddress {
        let ip = match address.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        NetAddress {
            services,
            ip,
            port: address.port(),
        }
    }

    pub fn unspecified() -> NetAddress {
        NetAddress {
            services: 0,
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.ip.octets());
        // port is the one big-endian field in the payload
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<NetAddress> {
        let services = read_u64_le(buf)?;
        let ip: [u8; 16] = read_array(buf)?;
        let port = read_u16_be(buf)?;
        Ok(NetAddress {
            services,
            ip: Ipv6Addr::from(ip),
            port,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: Option<bool>,
}

impl VersionMessage {
    /// Version message a light client sends: no services and no chain.
    pub fn new(version: i32, user_agent: &str, receiver: SocketAddr) -> VersionMessage {
        VersionMessage {
            version,
            services: 0,
            timestamp: (create_timestamp() / 1000) as i64,
            receiver: NetAddress::new(receiver, NODE_NETWORK),
            sender: NetAddress::unspecified(),
            nonce: rand::thread_rng().gen(),
            user_agent: user_agent.to_string(),
            start_height: 0,
            relay: Some(false),
        }
    }

    pub fn has_blockchain(&self) -> bool {
        self.services & NODE_NETWORK == NODE_NETWORK
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.receiver.encode(&mut out);
        self.sender.encode(&mut out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_var_string(&mut out, &self.user_agent);
        out.extend_from_slice(&self.start_height.to_le_bytes());
        if let Some(relay) = self.relay {
            out.push(relay as u8);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<VersionMessage> {
        let buf = &mut buf;
        let version = read_i32_le(buf)?;
        let services = read_u64_le(buf)?;
        let timestamp = read_i64_le(buf)?;
        let receiver = NetAddress::decode(buf)?;
        let sender = NetAddress::decode(buf)?;
        let nonce = read_u64_le(buf)?;
        let user_agent = read_var_string(buf)?;
        let start_height = read_i32_le(buf)?;
        let relay = if buf.is_empty() {
            None
        } else {
            Some(read_u8(buf)? != 0)
        };
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
}

impl RejectMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        write_var_string(&mut out, &self.message);
        out.push(self.code);
        write_var_string(&mut out, &self.reason);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<RejectMessage> {
        let buf = &mut buf;
        Ok(RejectMessage {
            message: read_var_string(buf)?,
            code: read_u8(buf)?,
            reason: read_var_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Reject(RejectMessage),
    XRouter(XRouterMessage),
    /// A known gossip command this node does not act on.
    Ignored(String),
    Unknown { command: String, payload: Vec<u8> },
}

impl NetworkMessage {
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => VERSION_COMMAND,
            NetworkMessage::Verack => VERACK_COMMAND,
            NetworkMessage::Ping(_) => PING_COMMAND,
            NetworkMessage::Pong(_) => PONG_COMMAND,
            NetworkMessage::Reject(_) => REJECT_COMMAND,
            NetworkMessage::XRouter(_) => XROUTER_COMMAND,
            NetworkMessage::Ignored(command) => command,
            NetworkMessage::Unknown { command, .. } => command,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            NetworkMessage::Version(version) => version.encode(),
            NetworkMessage::Verack => vec![],
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => nonce.to_le_bytes().to_vec(),
            NetworkMessage::Reject(reject) => reject.encode(),
            NetworkMessage::XRouter(message) => message.encode(),
            NetworkMessage::Ignored(_) => vec![],
            NetworkMessage::Unknown { payload, .. } => payload.clone(),
        }
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<NetworkMessage> {
        match command {
            VERSION_COMMAND => Ok(NetworkMessage::Version(VersionMessage::decode(payload)?)),
            VERACK_COMMAND => Ok(NetworkMessage::Verack),
            PING_COMMAND => Ok(NetworkMessage::Ping(decode_nonce(payload)?)),
            PONG_COMMAND => Ok(NetworkMessage::Pong(decode_nonce(payload)?)),
            REJECT_COMMAND => Ok(NetworkMessage::Reject(RejectMessage::decode(payload)?)),
            XROUTER_COMMAND => Ok(NetworkMessage::XRouter(XRouterMessage::decode(payload)?)),
            other if IGNORED_COMMANDS.contains(&other) => {
                Ok(NetworkMessage::Ignored(other.to_string()))
            }
            other => Ok(NetworkMessage::Unknown {
                command: other.to_string(),
                payload: payload.to_vec(),
            }),
        }
    }

    /// Messages a peer may send before the handshake has finished.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            NetworkMessage::Version(_) | NetworkMessage::Verack | NetworkMessage::Ping(_)
        )
    }
}

/// Very old peers send an empty ping.
fn decode_nonce(mut payload: &[u8]) -> Result<u64> {
    if payload.is_empty() {
        return Ok(0);
    }
    read_u64_le(&mut payload)
}
