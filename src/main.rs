/*!
# XRouter Wallet Node

## Help

```bash
xrouter_wallet --help
```

## Example Usage

```bash
xrouter_wallet --config=config/xrouter.toml
```
*/

use xrouter_wallet::node;

#[tokio::main]
pub async fn main() -> xrouter_wallet::Result<()> {
    tracing_subscriber::fmt::init();
    node::run().await
}
