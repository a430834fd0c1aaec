/*!
# XRouter Wallet Command Line Interface

Offline helpers for keys, packets and coin selection.

## Usage

```bash
xrcli help [subcommand]
```

## Available subcommands

**address**

prints the address and WIF of a secret key for a currency

**packet**

prints a signed xrGetConfig packet, envelope included, as hex

**select**

runs coin selection over an xrmgetutxos reply saved to a file

## Example

```bash
xrcli address --ticker LTC --secret 0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d
xrcli select --ticker BLOCK --file utxos.json --amount 1.25
```

## Dev

```bash
cargo run --bin xrcli -- packet
```
*/
use clap::{App, Arg, ArgMatches};
use std::fs;
use xrouter_wallet::{
    context::{to_coins, to_minor_units, Context},
    keypair::Keypair,
    ledger::parse_utxo_reply,
    networking::codec::{encode, BLOCKNET_MAGIC},
    networking::messages::NetworkMessage,
    networking::xrouter::{XRouterBody, XRouterCommand, XRouterMessage},
    time::unix_seconds,
    wallet::{select_utxos, selection_order},
    Error,
};

#[tokio::main]
pub async fn main() -> xrouter_wallet::Result<()> {
    let secret_arg = Arg::with_name("secret")
        .short("s")
        .long("secret")
        .takes_value(true)
        .help("secret key as hex or WIF; a new key is generated when absent");
    let ticker_arg = Arg::with_name("ticker")
        .short("t")
        .long("ticker")
        .default_value("BLOCK")
        .takes_value(true)
        .help("currency ticker");

    let command_matches = App::new("XRouter Wallet Command Line Interface")
        .about("Offline key, packet and coin selection helpers")
        .subcommand(
            App::new("address")
                .about("prints the address of a key")
                .arg(secret_arg.clone())
                .arg(ticker_arg.clone()),
        )
        .subcommand(
            App::new("packet")
                .about("prints a signed xrGetConfig packet")
                .arg(secret_arg),
        )
        .subcommand(
            App::new("select")
                .about("selects utxos for an amount")
                .arg(ticker_arg)
                .arg(
                    Arg::with_name("file")
                        .short("f")
                        .long("file")
                        .required(true)
                        .takes_value(true)
                        .help("file holding an xrmgetutxos reply"),
                )
                .arg(
                    Arg::with_name("amount")
                        .short("a")
                        .long("amount")
                        .required(true)
                        .takes_value(true)
                        .help("amount to cover, in coins"),
                ),
        )
        .get_matches();

    let context = Context::default();
    match command_matches.subcommand() {
        ("address", Some(matches)) => {
            let coin = context.coin(matches.value_of("ticker").unwrap_or("BLOCK"))?;
            let keypair = keypair_from(matches, coin.wif_version)?;
            println!("ticker:  {}", coin.ticker);
            println!("address: {}", keypair.address(coin.address_version));
            println!("wif:     {}", keypair.to_wif(coin.wif_version));
            println!("{}", keypair);
        }
        ("packet", Some(matches)) => {
            let coin = context.coin("BLOCK")?;
            let keypair = keypair_from(matches, coin.wif_version)?;
            let message = XRouterMessage::new_signed(
                XRouterCommand::GetConfig,
                None,
                XRouterBody::GetConfig {
                    addr: String::from("self"),
                },
                &keypair,
                unix_seconds(),
            )?;
            println!("uuid: {}", message.uuid());
            let bytes = encode(&NetworkMessage::XRouter(message), BLOCKNET_MAGIC)?;
            println!("{}", hex::encode(bytes));
        }
        ("select", Some(matches)) => {
            let coin = context.coin(matches.value_of("ticker").unwrap_or("BLOCK"))?;
            let amount = matches
                .value_of("amount")
                .unwrap_or("0")
                .parse::<f64>()
                .map_err(|_| Error::Malformed(String::from("amount is not a number")))?;
            let reply = fs::read_to_string(matches.value_of("file").unwrap_or_default())?;
            let utxos = parse_utxo_reply(&coin.ticker, &reply)?;
            let total: u64 = utxos.iter().map(|utxo| utxo.value).sum();

            println!("order:");
            for utxo in selection_order(utxos.clone()) {
                println!("  {}", utxo);
            }
            match select_utxos(utxos, to_minor_units(amount)) {
                Some(selected) => {
                    let sum: u64 = selected.iter().map(|utxo| utxo.value).sum();
                    println!("selected {} utxos for {} {}:", selected.len(), amount, coin.ticker);
                    for utxo in selected {
                        println!("  {}:{}", utxo.txid, utxo.vout);
                    }
                    println!("change: {}", to_coins(sum - to_minor_units(amount)));
                }
                None => {
                    return Err(Error::InsufficientFunds {
                        requested: to_minor_units(amount),
                        available: total,
                    })
                }
            }
        }
        _ => {
            println!("no subcommand given, see xrcli help");
        }
    }
    Ok(())
}

fn keypair_from(matches: &ArgMatches, wif_version: u8) -> xrouter_wallet::Result<Keypair> {
    match matches.value_of("secret") {
        Some(secret) => Keypair::from_secret_str(secret, wif_version),
        None => Ok(Keypair::new()),
    }
}
