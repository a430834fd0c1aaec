//! Payment transactions for XRouter commands that charge a fee.
//!
//! Fees are always paid from the Blocknet wallet to the payment address the
//! serving node advertised in its configuration.

use tracing::debug;

use crate::context::to_minor_units;
use crate::networking::xrouter::{XRouterCommand, FREE_PAYMENT};
use crate::networking::xrouter_config::{PluginConfiguration, XRouterConfiguration};
use crate::transaction::Transaction;
use crate::wallet::{ChangePolicy, Wallet};
use crate::{Error, Result};

/// Change above 0.06 coins is split into three outputs.
pub const FEE_CHANGE_SPLIT_THRESHOLD: u64 = 6_000_000;

/// Fee in minor units the node charges for `command`, zero when free.
pub fn command_fee(config: &XRouterConfiguration, command: XRouterCommand) -> u64 {
    config
        .fee(command.name())
        .map(to_minor_units)
        .unwrap_or(0)
}

/// The output paying the node's `xrSendTransaction` fee.
pub fn send_fee_output(config: &XRouterConfiguration) -> Result<(String, u64)> {
    let fee = config
        .fee(XRouterCommand::SendTransaction.name())
        .ok_or_else(|| Error::Remote(String::from("no fee for xrSendTransaction")))?;
    let address = config
        .payment_address()
        .ok_or_else(|| Error::Remote(String::from("no payment address")))?;
    Ok((address.to_string(), to_minor_units(fee)))
}

/// Build and sign the fee payment for `command`. Returns the raw transaction
/// hex, or `nohash;nofee` when the command is free.
pub async fn fee_transaction(
    wallet: &Wallet,
    config: &XRouterConfiguration,
    command: XRouterCommand,
    relay_fee: u64,
) -> Result<String> {
    let fee = command_fee(config, command);
    pay(wallet, config, fee, relay_fee, command.name()).await
}

/// Fee payment for one call of `plugin`.
pub async fn plugin_fee_transaction(
    wallet: &Wallet,
    config: &XRouterConfiguration,
    plugin: &PluginConfiguration,
    relay_fee: u64,
) -> Result<String> {
    let fee = to_minor_units(plugin.fee);
    pay(wallet, config, fee, relay_fee, &plugin.name).await
}

async fn pay(
    wallet: &Wallet,
    config: &XRouterConfiguration,
    fee: u64,
    relay_fee: u64,
    label: &str,
) -> Result<String> {
    if fee == 0 {
        debug!("{} is free", label);
        return Ok(FREE_PAYMENT.to_string());
    }
    let address = config
        .payment_address()
        .ok_or_else(|| Error::Remote(String::from("no payment address")))?;

    let transaction = wallet
        .build(
            &[(address.to_string(), fee)],
            fee + relay_fee,
            ChangePolicy::SplitAbove(FEE_CHANGE_SPLIT_THRESHOLD),
        )
        .await?;
    debug!("fee transaction for {}: {}", label, transaction.txid()?);
    transaction.to_hex()
}

/// Pay the `xrSendTransaction` fee for `transaction`. Its inputs are marked
/// spent in `spending` first so the fee payment cannot reuse them.
pub async fn covered_send_fee(
    spending: &Wallet,
    fee_wallet: &Wallet,
    config: &XRouterConfiguration,
    transaction: &Transaction,
    relay_fee: u64,
) -> Result<String> {
    spending.set_spent(transaction, true).await;
    fee_transaction(fee_wallet, config, XRouterCommand::SendTransaction, relay_fee).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use crate::test_utilities::make_funded_wallet;

    const RELAY: u64 = 10_000;
    const COIN_TENTH: u64 = 10_000_000;

    fn config(fee: &str, payment_address: &str) -> XRouterConfiguration {
        XRouterConfiguration::parse_ini(&format!(
            "[Main]\nwallets=BLOCK\npaymentaddress={}\n[xrSendTransaction]\nfee={}\n[xrGetBlockCount]\nfee=0\n",
            payment_address, fee
        ))
        .unwrap()
    }

    fn decode_outputs(hex_tx: &str) -> usize {
        // version(4) + count(1) + one input with a signed p2pkh script sig
        let bytes = hex::decode(hex_tx).unwrap();
        let script_len = bytes[4 + 1 + 36] as usize;
        bytes[4 + 1 + 36 + 1 + script_len + 4] as usize
    }

    #[tokio::test]
    async fn free_commands_test() {
        let (wallet, _) = make_funded_wallet(&[COIN_TENTH]).await;
        let payment = Keypair::new().address(26);
        let config = config("0.015", &payment);

        let free = fee_transaction(&wallet, &config, XRouterCommand::GetBlockCount, RELAY)
            .await
            .unwrap();
        assert_eq!(free, FREE_PAYMENT);
        let unlisted = fee_transaction(&wallet, &config, XRouterCommand::GetBlockHash, RELAY)
            .await
            .unwrap();
        assert_eq!(unlisted, FREE_PAYMENT);
        assert_eq!(wallet.balance().await, COIN_TENTH);
    }

    #[tokio::test]
    async fn large_change_is_split_in_three_test() {
        // 0.1 - 0.015 - 0.0001 leaves 0.0849 change
        let (wallet, _) = make_funded_wallet(&[COIN_TENTH]).await;
        let payment = Keypair::new().address(26);
        let hex_tx = fee_transaction(
            &wallet,
            &config("0.015", &payment),
            XRouterCommand::SendTransaction,
            RELAY,
        )
        .await
        .unwrap();
        assert_eq!(decode_outputs(&hex_tx), 4);
        assert_eq!(wallet.balance().await, 0);
    }

    #[tokio::test]
    async fn small_change_is_single_output_test() {
        // 0.05 - 0.015 - 0.0001 leaves 0.0349 change
        let (wallet, _) = make_funded_wallet(&[5_000_000]).await;
        let payment = Keypair::new().address(26);
        let hex_tx = fee_transaction(
            &wallet,
            &config("0.015", &payment),
            XRouterCommand::SendTransaction,
            RELAY,
        )
        .await
        .unwrap();
        assert_eq!(decode_outputs(&hex_tx), 2);
    }

    #[tokio::test]
    async fn covered_fee_skips_spent_inputs_test() {
        let (spending, _) = make_funded_wallet(&[COIN_TENTH, COIN_TENTH]).await;
        let payment = Keypair::new().address(26);
        let destination = Keypair::new().address(26);
        let config = config("0.015", &payment);

        let sent = spending
            .create_transaction_simple(&destination, 1_000_000, RELAY)
            .await
            .unwrap();
        spending.set_spent(&sent, false).await;

        let fee_hex = covered_send_fee(&spending, &spending, &config, &sent, RELAY)
            .await
            .unwrap();
        let fee_bytes = hex::decode(fee_hex).unwrap();
        let fee_input = &fee_bytes[5..37];
        let mut sent_input = hex::decode(&sent.inputs[0].previous_output.txid).unwrap();
        sent_input.reverse();
        assert_ne!(fee_input, &sent_input[..]);
        assert_eq!(spending.balance().await, 0);
    }

    #[tokio::test]
    async fn plugin_fee_test() {
        let (wallet, _) = make_funded_wallet(&[COIN_TENTH]).await;
        let payment = Keypair::new().address(26);
        let config = config("0", &payment);
        let free = PluginConfiguration::parse("xrmgetutxos", "parameters=string,string\nfee=0").unwrap();
        let paid = PluginConfiguration::parse("xrmgetutxos", "parameters=string,string\nfee=0.001").unwrap();

        assert_eq!(
            plugin_fee_transaction(&wallet, &config, &free, RELAY).await.unwrap(),
            FREE_PAYMENT
        );
        let hex_tx = plugin_fee_transaction(&wallet, &config, &paid, RELAY).await.unwrap();
        assert_ne!(hex_tx, FREE_PAYMENT);
        // 0.1 - 0.001 - 0.0001 is above the split threshold
        assert_eq!(decode_outputs(&hex_tx), 4);
    }

    #[test]
    fn send_fee_output_test() {
        let payment = Keypair::new().address(26);
        let (address, amount) = send_fee_output(&config("0.015", &payment)).unwrap();
        assert_eq!(address, payment);
        assert_eq!(amount, 1_500_000);
        assert_eq!(command_fee(&config("0", &payment), XRouterCommand::SendTransaction), 0);
    }
}
