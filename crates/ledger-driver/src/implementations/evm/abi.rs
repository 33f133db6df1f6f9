//! Conversions between JSON values and ABI-encoded data.
//!
//! Method parameters arrive as JSON: numbers, decimal or hex strings for
//! integers, hex strings for addresses and bytes, nested arrays for arrays and
//! tuples. Decoded values go back to JSON with integers as decimal strings so
//! that 256-bit values survive, checksummed addresses and 0x-prefixed bytes.

use crate::DriverError;
use alloy_dyn_abi::{DynSolType, DynSolValue, EventExt, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Event, Function, JsonAbi};
use alloy_primitives::{Bytes, B256};
use serde_json::{Map, Value};

/// Finds the overload of `name` taking `arity` arguments.
pub fn find_function<'a>(
	abi: &'a JsonAbi,
	name: &str,
	arity: usize,
) -> Result<&'a Function, DriverError> {
	let overloads = abi
		.function(name)
		.ok_or_else(|| DriverError::Configuration(format!("Method {} not found in ABI", name)))?;
	overloads
		.iter()
		.find(|function| function.inputs.len() == arity)
		.ok_or_else(|| {
			DriverError::Configuration(format!(
				"No overload of method {} takes {} arguments",
				name, arity
			))
		})
}

/// ABI-encodes a call to `function` with JSON arguments.
pub fn encode_call(function: &Function, args: &[Value]) -> Result<Bytes, DriverError> {
	let values = function
		.inputs
		.iter()
		.zip(args)
		.map(|(param, arg)| {
			let ty = param
				.resolve()
				.map_err(|e| DriverError::Configuration(format!("Invalid ABI type: {}", e)))?;
			json_to_sol(&ty, arg)
		})
		.collect::<Result<Vec<_>, _>>()?;

	function
		.abi_encode_input(&values)
		.map(Bytes::from)
		.map_err(|e| DriverError::Decode(format!("Failed to encode {}: {}", function.name, e)))
}

/// Decodes the return data of `function`.
///
/// A single output is returned as is, several as an array.
pub fn decode_output(function: &Function, data: &[u8]) -> Result<Value, DriverError> {
	let mut values = function.abi_decode_output(data, true).map_err(|e| {
		DriverError::Decode(format!("Failed to decode {} output: {}", function.name, e))
	})?;

	Ok(match values.len() {
		0 => Value::Null,
		1 => sol_to_json(&values.remove(0)),
		_ => Value::Array(values.iter().map(sol_to_json).collect()),
	})
}

/// Decodes a log of `event` into an object keyed by parameter name.
///
/// Unnamed parameters are keyed by their position.
pub fn decode_event(event: &Event, topics: &[B256], data: &[u8]) -> Result<Value, DriverError> {
	let decoded = event
		.decode_log_parts(topics.iter().copied(), data, true)
		.map_err(|e| DriverError::Decode(format!("Failed to decode {} log: {}", event.name, e)))?;

	let mut indexed = decoded.indexed.into_iter();
	let mut body = decoded.body.into_iter();
	let mut payload = Map::new();

	for (position, input) in event.inputs.iter().enumerate() {
		let value = if input.indexed {
			indexed.next()
		} else {
			body.next()
		};
		let value = value.ok_or_else(|| {
			DriverError::Decode(format!("Missing parameter {} in {} log", position, event.name))
		})?;
		let key = if input.name.is_empty() {
			position.to_string()
		} else {
			input.name.clone()
		};
		payload.insert(key, sol_to_json(&value));
	}

	Ok(Value::Object(payload))
}

fn json_to_sol(ty: &DynSolType, value: &Value) -> Result<DynSolValue, DriverError> {
	let mismatch = || {
		DriverError::Configuration(format!("Cannot encode {} as {}", value, ty.sol_type_name()))
	};

	match (ty, value) {
		(DynSolType::Array(inner), Value::Array(items)) => items
			.iter()
			.map(|item| json_to_sol(inner, item))
			.collect::<Result<Vec<_>, _>>()
			.map(DynSolValue::Array),
		(DynSolType::FixedArray(inner, len), Value::Array(items)) if items.len() == *len => items
			.iter()
			.map(|item| json_to_sol(inner, item))
			.collect::<Result<Vec<_>, _>>()
			.map(DynSolValue::FixedArray),
		(DynSolType::Tuple(types), Value::Array(items)) if items.len() == types.len() => types
			.iter()
			.zip(items)
			.map(|(ty, item)| json_to_sol(ty, item))
			.collect::<Result<Vec<_>, _>>()
			.map(DynSolValue::Tuple),
		(DynSolType::Bool, Value::Bool(b)) => Ok(DynSolValue::Bool(*b)),
		(_, Value::String(s)) => ty.coerce_str(s).map_err(|_| mismatch()),
		(_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|_| mismatch()),
		_ => Err(mismatch()),
	}
}

fn sol_to_json(value: &DynSolValue) -> Value {
	match value {
		DynSolValue::Bool(b) => Value::Bool(*b),
		DynSolValue::Int(i, _) => Value::String(i.to_string()),
		DynSolValue::Uint(u, _) => Value::String(u.to_string()),
		DynSolValue::FixedBytes(word, size) => {
			Value::String(format!("0x{}", hex::encode(&word[..*size])))
		},
		DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
		DynSolValue::Function(function) => Value::String(format!("0x{}", hex::encode(function))),
		DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
		DynSolValue::String(s) => Value::String(s.clone()),
		DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
			Value::Array(items.iter().map(sol_to_json).collect())
		},
		#[allow(unreachable_patterns)]
		other => Value::String(format!("{:?}", other)),
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use alloy_primitives::{address, U256};
	use serde_json::json;

	pub(crate) const TOKEN_ABI: &str = r#"[
		{"type":"function","name":"transfer","stateMutability":"nonpayable",
		 "inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],
		 "outputs":[{"name":"","type":"bool"}]},
		{"type":"function","name":"balanceOf","stateMutability":"view",
		 "inputs":[{"name":"owner","type":"address"}],
		 "outputs":[{"name":"","type":"uint256"}]},
		{"type":"function","name":"limits","stateMutability":"view",
		 "inputs":[],
		 "outputs":[{"name":"min","type":"uint64"},{"name":"max","type":"uint64"}]},
		{"type":"event","name":"Transfer","anonymous":false,
		 "inputs":[{"name":"from","type":"address","indexed":true},
		           {"name":"to","type":"address","indexed":true},
		           {"name":"value","type":"uint256","indexed":false}]},
		{"type":"event","name":"Approval","anonymous":false,
		 "inputs":[{"name":"owner","type":"address","indexed":true},
		           {"name":"spender","type":"address","indexed":true},
		           {"name":"value","type":"uint256","indexed":false}]}
	]"#;

	pub(crate) fn token_abi() -> JsonAbi {
		serde_json::from_str(TOKEN_ABI).unwrap()
	}

	#[test]
	fn test_encode_transfer_call() {
		let abi = token_abi();
		let function = find_function(&abi, "transfer", 2).unwrap();

		let data = encode_call(
			function,
			&[json!("0x000000000000000000000000000000000000dead"), json!(1000)],
		)
		.unwrap();

		// transfer(address,uint256) selector
		assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
		assert_eq!(data.len(), 4 + 64);
		assert_eq!(U256::from_be_slice(&data[36..68]), U256::from(1000));
	}

	#[test]
	fn test_unknown_method_and_arity() {
		let abi = token_abi();
		assert!(matches!(
			find_function(&abi, "mint", 1),
			Err(DriverError::Configuration(_))
		));
		assert!(matches!(
			find_function(&abi, "transfer", 1),
			Err(DriverError::Configuration(_))
		));
	}

	#[test]
	fn test_bad_argument_is_a_configuration_error() {
		let abi = token_abi();
		let function = find_function(&abi, "transfer", 2).unwrap();
		let result = encode_call(function, &[json!(true), json!(1)]);
		assert!(matches!(result, Err(DriverError::Configuration(_))));
	}

	#[test]
	fn test_decode_single_and_multiple_outputs() {
		let abi = token_abi();

		let balance_of = find_function(&abi, "balanceOf", 1).unwrap();
		let data = DynSolValue::Uint(U256::from(42u64), 256).abi_encode();
		assert_eq!(decode_output(balance_of, &data).unwrap(), json!("42"));

		let limits = find_function(&abi, "limits", 0).unwrap();
		let data = DynSolValue::Tuple(vec![
			DynSolValue::Uint(U256::from(1u64), 64),
			DynSolValue::Uint(U256::from(9u64), 64),
		])
		.abi_encode_params();
		assert_eq!(decode_output(limits, &data).unwrap(), json!(["1", "9"]));
	}

	#[test]
	fn test_decode_transfer_event() {
		let abi = token_abi();
		let event = &abi.event("Transfer").unwrap()[0];
		let from = address!("00000000000000000000000000000000000000aa");
		let to = address!("00000000000000000000000000000000000000bb");

		let topics = vec![event.selector(), from.into_word(), to.into_word()];
		let data = DynSolValue::Uint(U256::from(7u64), 256).abi_encode();

		let payload = decode_event(event, &topics, &data).unwrap();
		assert_eq!(
			payload,
			json!({
				"from": from.to_checksum(None),
				"to": to.to_checksum(None),
				"value": "7",
			})
		);
	}
}
