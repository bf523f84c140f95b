//! JSON-RPC hex encodings and the bundler wire view of a UserOperation.

use crate::error::{Error, Result};
use crate::gas;
use crate::paymaster::PaymasterAndData;
use crate::types::{FactoryCall, UserOperation, WireFormat};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_u128(v: u128) -> String {
    format!("0x{:x}", v)
}

pub fn fmt_bytes(b: &[u8]) -> String {
    format!("0x{}", hex::encode(b))
}

pub fn parse_u256_quantity(field: &'static str, s: &str) -> Result<U256> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|e| Error::invalid_field(field, format!("{s:?}: {e}")))
}

pub fn parse_h256(field: &'static str, s: &str) -> Result<H256> {
    let bytes = parse_hex(field, s)?;
    if bytes.len() != 32 {
        return Err(Error::invalid_field(
            field,
            format!("expected 32-byte hex, got {} bytes", bytes.len()),
        ));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_address(field: &'static str, s: &str) -> Result<Address> {
    let bytes = parse_hex(field, s)?;
    if bytes.len() != 20 {
        return Err(Error::invalid_field(
            field,
            format!("expected 20-byte address, got {} bytes", bytes.len()),
        ));
    }
    Ok(Address::from_slice(&bytes))
}

pub fn parse_bytes(field: &'static str, s: &str) -> Result<Bytes> {
    parse_hex(field, s).map(Bytes::from)
}

fn parse_hex(field: &'static str, s: &str) -> Result<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| Error::invalid_field(field, e))
}

/// Bundler JSON for `eth_sendUserOperation`. Gas values are sent unpacked as quantities in
/// both formats; v0.7 bundlers repack them.
pub fn user_op_to_json(op: &UserOperation, signature: &[u8], format: WireFormat) -> Value {
    let mut obj = Map::new();
    obj.insert("sender".into(), fmt_address(op.sender).into());
    obj.insert("nonce".into(), fmt_u256(op.nonce).into());

    match format {
        WireFormat::V06 => {
            obj.insert("initCode".into(), fmt_bytes(&op.init_code()).into());
        }
        WireFormat::V07 => {
            if let Some(factory) = &op.factory {
                obj.insert("factory".into(), fmt_address(factory.factory).into());
                obj.insert("factoryData".into(), fmt_bytes(&factory.factory_data).into());
            }
        }
    }

    obj.insert("callData".into(), fmt_bytes(&op.call_data).into());
    obj.insert("callGasLimit".into(), fmt_u128(op.call_gas_limit).into());
    obj.insert(
        "verificationGasLimit".into(),
        fmt_u128(op.verification_gas_limit).into(),
    );
    obj.insert(
        "preVerificationGas".into(),
        fmt_u256(op.pre_verification_gas).into(),
    );
    obj.insert("maxFeePerGas".into(), fmt_u128(op.max_fee_per_gas).into());
    obj.insert(
        "maxPriorityFeePerGas".into(),
        fmt_u128(op.max_priority_fee_per_gas).into(),
    );

    match format {
        WireFormat::V06 => {
            obj.insert(
                "paymasterAndData".into(),
                fmt_bytes(&op.paymaster_and_data()).into(),
            );
        }
        WireFormat::V07 => {
            if let Some(pm) = &op.paymaster {
                obj.insert("paymaster".into(), fmt_address(pm.paymaster).into());
                obj.insert(
                    "paymasterVerificationGasLimit".into(),
                    fmt_u128(pm.verification_gas_limit).into(),
                );
                obj.insert(
                    "paymasterPostOpGasLimit".into(),
                    fmt_u128(pm.post_op_gas_limit).into(),
                );
                obj.insert("paymasterData".into(), fmt_bytes(&pm.paymaster_data).into());
            }
        }
    }

    obj.insert("signature".into(), fmt_bytes(signature).into());
    Value::Object(obj)
}

/// Parses a bundler-echoed UserOperation in either wire format.
///
/// Accepts the bare object or the `eth_getUserOperationByHash` envelope
/// `{ userOperation: {...}, entryPoint, ... }`.
pub fn user_op_from_json(value: &Value) -> Result<(UserOperation, Bytes)> {
    let v = value.get("userOperation").unwrap_or(value);
    if !v.is_object() {
        return Err(Error::invalid_field("userOperation", format!("expected object, got {v}")));
    }

    let legacy = v.get("initCode").is_some() || v.get("paymasterAndData").is_some();

    let factory = if legacy {
        FactoryCall::from_init_code(&opt_bytes(v, "initCode")?)?
    } else {
        match opt_str(v, "factory")? {
            Some(f) if !is_empty_hex(f) => Some(FactoryCall {
                factory: parse_address("factory", f)?,
                factory_data: opt_bytes(v, "factoryData")?,
            }),
            _ => None,
        }
    };

    let paymaster = if legacy {
        let pnd = opt_bytes(v, "paymasterAndData")?;
        if pnd.is_empty() {
            None
        } else {
            Some(crate::paymaster::decode(&pnd)?)
        }
    } else {
        match opt_str(v, "paymaster")? {
            Some(p) if !is_empty_hex(p) => Some(PaymasterAndData {
                paymaster: parse_address("paymaster", p)?,
                verification_gas_limit: u128_field(v, "paymasterVerificationGasLimit")?,
                post_op_gas_limit: u128_field(v, "paymasterPostOpGasLimit")?,
                paymaster_data: opt_bytes(v, "paymasterData")?,
            }),
            _ => None,
        }
    };

    let op = UserOperation {
        sender: parse_address("sender", str_field(v, "sender")?)?,
        nonce: parse_u256_quantity("nonce", str_field(v, "nonce")?)?,
        factory,
        call_data: parse_bytes("callData", str_field(v, "callData")?)?,
        verification_gas_limit: u128_field(v, "verificationGasLimit")?,
        call_gas_limit: u128_field(v, "callGasLimit")?,
        pre_verification_gas: parse_u256_quantity(
            "preVerificationGas",
            str_field(v, "preVerificationGas")?,
        )?,
        max_priority_fee_per_gas: u128_field(v, "maxPriorityFeePerGas")?,
        max_fee_per_gas: u128_field(v, "maxFeePerGas")?,
        paymaster,
    };
    Ok((op, opt_bytes(v, "signature")?))
}

fn is_empty_hex(s: &str) -> bool {
    s.is_empty() || s == "0x"
}

fn str_field<'a>(v: &'a Value, key: &'static str) -> Result<&'a str> {
    opt_str(v, key)?.ok_or_else(|| Error::invalid_field(key, "missing"))
}

fn opt_str<'a>(v: &'a Value, key: &'static str) -> Result<Option<&'a str>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(Error::invalid_field(key, format!("expected hex string, got {other}"))),
    }
}

fn opt_bytes(v: &Value, key: &'static str) -> Result<Bytes> {
    match opt_str(v, key)? {
        Some(s) => parse_bytes(key, s),
        None => Ok(Bytes::default()),
    }
}

fn u128_field(v: &Value, key: &'static str) -> Result<u128> {
    gas::to_u128(key, parse_u256_quantity(key, str_field(v, key)?)?)
}
