//! Remote service-node configuration received in `xrConfigReply`.
//!
//! The reply is JSON wrapping INI text:
//!
//! ```text
//! {"config": "[Main]\nwallets=BLOCK,LTC\n...", "plugins": {"xrmgetutxos": "parameters=string,string\nfee=0"}}
//! ```

use std::collections::HashMap;
use std::fmt;

use config::{Config, File, FileFormat, Value};
use serde::Deserialize;

use crate::{Error, Result};

/// Plugin every usable peer is expected to expose.
pub const REQUIRED_PLUGIN: &str = "xrmgetutxos";
pub const DEFAULT_CLIENT_REQUEST_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Bool,
}

impl ParamType {
    pub fn parse(name: &str) -> Result<ParamType> {
        match name.trim().to_lowercase().as_str() {
            "string" => Ok(ParamType::String),
            "int" => Ok(ParamType::Int),
            "bool" => Ok(ParamType::Bool),
            other => Err(Error::Malformed(format!("unknown plugin parameter type '{}'", other))),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => f.write_str("string"),
            ParamType::Int => f.write_str("int"),
            ParamType::Bool => f.write_str("bool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfiguration {
    pub name: String,
    pub param_types: Vec<ParamType>,
    pub fee: f64,
    pub client_request_limit: i64,
}

impl PluginConfiguration {
    pub fn parse(name: &str, ini: &str) -> Result<PluginConfiguration> {
        let settings = load_ini(ini)?;

        let declared = settings
            .get_str("parameters")
            .or_else(|_| settings.get_str("paramstype"))
            .unwrap_or_default();
        let param_types = declared
            .split(',')
            .filter(|token| !token.trim().is_empty())
            .map(ParamType::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(PluginConfiguration {
            name: name.to_string(),
            param_types,
            fee: settings.get_float("fee").unwrap_or(0.0),
            client_request_limit: settings
                .get_int("clientrequestlimit")
                .unwrap_or(DEFAULT_CLIENT_REQUEST_LIMIT),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XRouterConfiguration {
    supported_wallets: Vec<String>,
    timeout: Option<i64>,
    block_limit: Option<i64>,
    payment_address: Option<String>,
    /// Keyed by lower-cased command name, e.g. `xrgetblockcount`.
    fees: HashMap<String, f64>,
    plugins: HashMap<String, PluginConfiguration>,
}

#[derive(Deserialize)]
struct ConfigReply {
    config: String,
    #[serde(default)]
    plugins: HashMap<String, String>,
}

impl XRouterConfiguration {
    /// Parse the raw `xrConfigReply` string.
    pub fn from_reply(reply: &str) -> Result<XRouterConfiguration> {
        let parsed: ConfigReply = serde_json::from_str(reply)?;
        let mut configuration = XRouterConfiguration::parse_ini(&parsed.config)?;
        for (name, blob) in parsed.plugins.iter() {
            let plugin = PluginConfiguration::parse(name, blob)?;
            configuration.plugins.insert(name.clone(), plugin);
        }
        Ok(configuration)
    }

    pub fn parse_ini(ini: &str) -> Result<XRouterConfiguration> {
        let settings = load_ini(ini)?;

        let supported_wallets = settings
            .get_str("main.wallets")
            .unwrap_or_default()
            .split(',')
            .map(|ticker| ticker.trim().to_uppercase())
            .filter(|ticker| !ticker.is_empty())
            .collect();

        let mut fees = HashMap::new();
        let sections: HashMap<String, Value> = settings.clone().try_into()?;
        for (section, value) in sections.into_iter() {
            if !section.starts_with("xr") {
                continue;
            }
            if let Ok(table) = value.into_table() {
                if let Some(fee) = table.get("fee").and_then(|fee| fee.clone().into_float().ok()) {
                    fees.insert(section, fee);
                }
            }
        }

        Ok(XRouterConfiguration {
            supported_wallets,
            timeout: settings.get_int("main.timeout").ok(),
            block_limit: settings.get_int("main.blocklimit").ok(),
            payment_address: settings.get_str("main.paymentaddress").ok(),
            fees,
            plugins: HashMap::new(),
        })
    }

    pub fn supported_wallets(&self) -> &[String] {
        &self.supported_wallets
    }

    pub fn supports(&self, ticker: &str) -> bool {
        let ticker = ticker.to_uppercase();
        self.supported_wallets.iter().any(|wallet| *wallet == ticker)
    }

    pub fn timeout(&self) -> Option<i64> {
        self.timeout
    }

    pub fn block_limit(&self) -> Option<i64> {
        self.block_limit
    }

    pub fn payment_address(&self) -> Option<&str> {
        self.payment_address.as_deref()
    }

    /// Fee for `command` (e.g. `xrSendTransaction`), if the node charges for it.
    pub fn fee(&self, command: &str) -> Option<f64> {
        self.fees.get(&command.to_lowercase()).copied()
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfiguration> {
        self.plugins.get(name)
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn add_plugin(&mut self, plugin: PluginConfiguration) {
        self.plugins.insert(plugin.name.clone(), plugin);
    }
}

/// Escaped newlines arrive literally inside the JSON strings.
fn load_ini(ini: &str) -> Result<Config> {
    let text = ini.replace("\\n", "\n");
    let mut settings = Config::default();
    settings.merge(File::from_str(&text, FileFormat::Ini))?;
    Ok(settings)
}
