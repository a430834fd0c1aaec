/*!
# XRouter Wallet

A thin wallet node for the Blocknet network. It keeps TCP connections to a set
of service nodes, asks them for block heights and UTXOs over the XRouter
protocol, and builds and signs transactions from the UTXOs it tracks.

The node never validates or stores blocks; every chain fact comes from a
service node reply.

# Usage

```bash
xrouter_wallet --config config/xrouter.toml
```

Settings can be overridden from the environment, e.g.
`XRW_NETWORK__REQUEST_TIMEOUT_SECS=30`.

# Layout

- `networking`: framing, handshake, XRouter packets, the peer group.
- `ledger`, `wallet`, `transaction`, `fee`: UTXO bookkeeping and spending.
- `service`: reply handling and the calls an RPC front end uses.
- `node`: the runtime started by the binary.

*/
#[macro_use]
extern crate lazy_static;

pub mod context;
pub mod crypto;
pub mod error;
pub mod fee;
pub mod keypair;
pub mod ledger;
pub mod networking;
pub mod node;
pub mod service;
pub mod settings;
pub mod signer;
pub mod time;
pub mod transaction;
pub mod wallet;

#[cfg(test)]
mod test_setup;
#[cfg(test)]
pub mod test_utilities;

pub use error::{Error, Result};
