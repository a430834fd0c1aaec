/*!

# Networking Interfaces and Methods

## Introduction

The node speaks the Blocknet peer protocol over plain TCP. Every packet is
wrapped in a Bitcoin-style envelope and carries either a handshake message or
an XRouter request/reply.

## Envelope

```bytes
0-3     Magic (big-endian, a1 a0 a2 a3 on mainnet)
4-15    Command (ASCII, NUL padded)
16-19   Payload length (little-endian u32, at most 32 MiB)
20-23   First 4 bytes of sha256d(payload)
24..    Payload
```

The `FrameCodec` in `codec` turns a byte stream into `Frame`s and checks the
magic, length and checksum. A bad frame closes the connection.

## Handshake

```bytes
version  ->
         <- version
         <- verack
         <- ping
pong     ->
```

A connection is ready once our version went out, the peer's version and
verack arrived, and the first ping was answered. The three events may finish
in any order. Anything else received before that closes the connection.

## XRouter

The `xrouter` command carries a signed header followed by a body:

```bytes
0..     Compact size of (body size + 157)
        Version (u32, 0xff000023)
        Command id (u32)
        Timestamp (u32)
        Body size (u32)
        UUID (36 bytes)
        Public key (33 bytes, compressed)
        Signature (64 bytes, R || S)
..      Body
```

The signature covers the packet without the compact size and with the
signature bytes zeroed. Requests are tracked by UUID until their reply arrives.

### xrGetConfig

Sent to every new peer. The reply holds the peer's INI configuration and its
plugin list; peers without configuration are never picked for requests.

### xrGetBlockCount, xrSendTransaction, ...

`currency`, `payment`, a parameter count and the parameters, all NUL
terminated strings. Free commands pay with `nohash;nofee`.

### xrService

Plugin name, payment, count, then parameters typed by the plugin's schema.
`xrmgetutxos` returns the UTXOs of a list of addresses.

*/

pub mod codec;
pub mod connection;
pub mod messages;
pub mod peer_group;
pub mod queue;
pub mod request_tracker;
pub mod seed;
pub mod wire;
pub mod xrouter;
pub mod xrouter_config;
