use crate::eip712::HashVariant;
use crate::error::{Error, Result};
use crate::types::WireFormat;
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    #[serde(default)]
    pub name: Option<String>,
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    #[serde(default)]
    pub paymaster: Option<String>,
    pub hash_variant: HashVariant,
    pub wire_format: WireFormat,
}

/// Contract addresses the builder works against. Passed explicitly; nothing is global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub entry_point: Address,
    pub factory: Address,
    pub paymaster: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub name: Option<String>,
    pub rpc_url: String,
    pub bundler_url: Option<String>,
    pub network: NetworkConfig,
    pub hash_variant: HashVariant,
    pub wire_format: WireFormat,
}

/// Values from the command line; they win over the file and its env vars.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc: Option<String>,
    pub bundler: Option<String>,
    pub hash_variant: Option<HashVariant>,
}

pub fn load_deployment(path: &Path, overrides: &Overrides) -> Result<Deployment> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read deployment json at {}: {e}",
            path.display()
        ))
    })?;
    parse_deployment(&raw, overrides).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

pub fn parse_deployment(json: &str, overrides: &Overrides) -> Result<Deployment> {
    let raw: DeploymentRaw = serde_json::from_str(json)
        .map_err(|e| Error::Config(format!("failed to parse deployment json: {e}")))?;

    let rpc_url = resolve(overrides.rpc.clone(), raw.rpc_env_var.as_deref(), Some(&raw.rpc))
        .unwrap_or_default();
    let bundler_url = resolve(
        overrides.bundler.clone(),
        raw.bundler_env_var.as_deref(),
        raw.bundler.as_ref(),
    );

    let paymaster = match raw.paymaster.as_deref() {
        None | Some("") => None,
        Some(p) => Some(parse_addr("paymaster", p)?),
    };

    Ok(Deployment {
        name: raw.name,
        rpc_url,
        bundler_url,
        network: NetworkConfig {
            chain_id: raw.chain_id,
            entry_point: parse_addr("entryPoint", &raw.entry_point)?,
            factory: parse_addr("factory", &raw.factory)?,
            paymaster,
        },
        hash_variant: overrides.hash_variant.unwrap_or(raw.hash_variant),
        wire_format: raw.wire_format,
    })
}

/// override → env var named in the file (if set) → literal from the file
fn resolve(
    override_value: Option<String>,
    env_var: Option<&str>,
    literal: Option<&String>,
) -> Option<String> {
    override_value
        .or_else(|| env_var.and_then(|name| env::var(name).ok()))
        .or_else(|| literal.cloned())
}

fn parse_addr(field: &str, s: &str) -> Result<Address> {
    s.parse::<Address>()
        .map_err(|e| Error::Config(format!("invalid {field} address {s:?}: {e}")))
}
