//! Conversions between Micheline expressions and JSON values.
//!
//! Decoding turns node data (event payloads, storage) into a plain value tree:
//! pairs are flattened into arrays, `Elt` lists become `{keys, vals}` objects,
//! booleans, strings and integers become their JSON counterparts.
//!
//! Encoding goes the other way for entrypoint parameters and is driven by the
//! entrypoint's Micheline type.

use serde_json::{json, Map, Value};

/// Decodes a Micheline expression into a JSON value tree.
pub fn decode(expr: &Value) -> Value {
	match expr {
		Value::Array(items) => decode_sequence(items),
		Value::Object(fields) => {
			if let Some(prim) = fields.get("prim").and_then(Value::as_str) {
				let args = fields
					.get("args")
					.and_then(Value::as_array)
					.map(Vec::as_slice)
					.unwrap_or_default();
				return decode_prim(prim, args, expr);
			}
			if let Some(Value::String(s)) = fields.get("string") {
				return Value::String(s.clone());
			}
			if let Some(Value::String(int)) = fields.get("int") {
				return decode_int(int);
			}
			if let Some(Value::String(bytes)) = fields.get("bytes") {
				return Value::String(bytes.clone());
			}
			expr.clone()
		},
		other => other.clone(),
	}
}

fn decode_prim(prim: &str, args: &[Value], expr: &Value) -> Value {
	match (prim, args) {
		("Pair", [first, rest @ ..]) => {
			let mut items = vec![decode(first)];
			for arg in rest {
				match decode(arg) {
					Value::Array(tail) => items.extend(tail),
					other => items.push(other),
				}
			}
			Value::Array(items)
		},
		("Elt", [key, val]) => json!({ "key": decode(key), "val": decode(val) }),
		("True", _) => Value::Bool(true),
		("False", _) => Value::Bool(false),
		("Some" | "Left" | "Right", [arg]) => decode(arg),
		("None" | "Unit", _) => Value::Null,
		_ => expr.clone(),
	}
}

fn decode_sequence(items: &[Value]) -> Value {
	let decoded: Vec<Value> = items.iter().map(decode).collect();
	let is_map = !decoded.is_empty() && items.iter().all(is_elt);
	if !is_map {
		return Value::Array(decoded);
	}

	let (keys, vals): (Vec<Value>, Vec<Value>) = decoded
		.into_iter()
		.map(|mut elt| (elt["key"].take(), elt["val"].take()))
		.unzip();
	json!({ "keys": keys, "vals": vals })
}

fn is_elt(expr: &Value) -> bool {
	expr.get("prim").and_then(Value::as_str) == Some("Elt")
}

/// Integers that fit in an `i64` become numbers, larger ones decimal strings.
fn decode_int(int: &str) -> Value {
	int.parse::<i64>()
		.map(Value::from)
		.unwrap_or_else(|_| Value::String(int.to_string()))
}

/// Flattens a decoded payload into the argument list handed to event mappers.
///
/// Arrays are flattened recursively; any other value becomes a single
/// element list.
pub fn flatten_payload(value: Value) -> Vec<Value> {
	fn collect(value: Value, out: &mut Vec<Value>) {
		match value {
			Value::Array(items) => items.into_iter().for_each(|item| collect(item, out)),
			other => out.push(other),
		}
	}

	let mut out = Vec::new();
	collect(value, &mut out);
	out
}

/// Encodes a JSON value as Micheline data of type `ty`.
pub fn encode(ty: &Value, value: &Value) -> Result<Value, String> {
	let prim = type_prim(ty)?;
	let args = type_args(ty);

	match prim {
		"int" | "nat" | "mutez" => encode_int(prim, value),
		"string" | "address" | "key_hash" | "key" | "signature" | "contract" | "chain_id" => {
			match value {
				Value::String(s) => Ok(json!({ "string": s })),
				_ => Err(mismatch(prim, value)),
			}
		},
		"timestamp" => match value {
			Value::String(s) => Ok(json!({ "string": s })),
			Value::Number(_) => encode_int(prim, value),
			_ => Err(mismatch(prim, value)),
		},
		"bytes" => match value {
			Value::String(s) => {
				let hex = s.strip_prefix("0x").unwrap_or(s);
				hex::decode(hex).map_err(|_| mismatch(prim, value))?;
				Ok(json!({ "bytes": hex.to_lowercase() }))
			},
			_ => Err(mismatch(prim, value)),
		},
		"bool" => match value {
			Value::Bool(true) => Ok(json!({ "prim": "True" })),
			Value::Bool(false) => Ok(json!({ "prim": "False" })),
			_ => Err(mismatch(prim, value)),
		},
		"unit" => Ok(json!({ "prim": "Unit" })),
		"option" => match value {
			Value::Null => Ok(json!({ "prim": "None" })),
			some => Ok(json!({ "prim": "Some", "args": [encode(arg(args, 0)?, some)?] })),
		},
		"list" | "set" => match value {
			Value::Array(items) => {
				let inner = arg(args, 0)?;
				let mut encoded = items
					.iter()
					.map(|item| encode(inner, item))
					.collect::<Result<Vec<_>, _>>()?;
				if prim == "set" {
					sort_michelson(&mut encoded, |item| item);
				}
				Ok(Value::Array(encoded))
			},
			_ => Err(mismatch(prim, value)),
		},
		"map" | "big_map" => encode_map(arg(args, 0)?, arg(args, 1)?, value),
		"pair" => encode_pair(ty, value),
		"or" => encode_or(ty, value),
		_ if is_micheline(value) => Ok(value.clone()),
		_ => Err(format!("Unsupported Michelson type {}", prim)),
	}
}

fn type_prim(ty: &Value) -> Result<&str, String> {
	ty.get("prim")
		.and_then(Value::as_str)
		.ok_or_else(|| format!("Invalid Michelson type {}", ty))
}

fn type_args(ty: &Value) -> &[Value] {
	ty.get("args")
		.and_then(Value::as_array)
		.map(Vec::as_slice)
		.unwrap_or_default()
}

fn arg(args: &[Value], index: usize) -> Result<&Value, String> {
	args.get(index)
		.ok_or_else(|| format!("Michelson type is missing argument {}", index))
}

/// Field annotation of a type, without its `%`.
pub fn field_name(ty: &Value) -> Option<&str> {
	ty.get("annots")?
		.as_array()?
		.iter()
		.filter_map(Value::as_str)
		.find_map(|annot| annot.strip_prefix('%'))
}

fn mismatch(prim: &str, value: &Value) -> String {
	format!("Cannot encode {} as {}", value, prim)
}

fn is_micheline(value: &Value) -> bool {
	match value {
		Value::Object(fields) => ["prim", "int", "string", "bytes"]
			.iter()
			.any(|key| fields.contains_key(*key)),
		Value::Array(items) => items.iter().all(is_micheline),
		_ => false,
	}
}

fn encode_int(prim: &str, value: &Value) -> Result<Value, String> {
	let digits = match value {
		Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
		Value::String(s) => s.clone(),
		_ => return Err(mismatch(prim, value)),
	};
	let unsigned = digits.strip_prefix('-').unwrap_or(&digits);
	if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
		return Err(mismatch(prim, value));
	}
	if prim != "int" && digits.starts_with('-') {
		return Err(mismatch(prim, value));
	}
	Ok(json!({ "int": digits }))
}

/// Orders encoded values the way Michelson compares them: integers
/// numerically, everything else by its textual form.
fn sort_michelson<T>(items: &mut [T], key: impl Fn(&T) -> &Value) {
	items.sort_by(|a, b| {
		let (a, b) = (key(a), key(b));
		let int = |v: &Value| {
			v.get("int")
				.and_then(Value::as_str)
				.and_then(|s| s.parse::<i128>().ok())
		};
		match (int(a), int(b)) {
			(Some(a), Some(b)) => a.cmp(&b),
			_ => a.to_string().cmp(&b.to_string()),
		}
	});
}

fn encode_map(key_ty: &Value, val_ty: &Value, value: &Value) -> Result<Value, String> {
	// Object keys are strings; integer key types accept decimal strings.
	let entries: Vec<(Value, &Value)> = match value {
		Value::Object(fields) => fields
			.iter()
			.map(|(k, v)| Ok((encode(key_ty, &Value::String(k.clone()))?, v)))
			.collect::<Result<_, String>>()?,
		Value::Array(pairs) => pairs
			.iter()
			.map(|pair| match pair.as_array().map(Vec::as_slice) {
				Some([k, v]) => Ok((encode(key_ty, k)?, v)),
				_ => Err(mismatch("map entry", pair)),
			})
			.collect::<Result<_, String>>()?,
		_ => return Err(mismatch("map", value)),
	};

	let mut elts = entries
		.into_iter()
		.map(|(key, val)| Ok((key, encode(val_ty, val)?)))
		.collect::<Result<Vec<_>, String>>()?;
	sort_michelson(&mut elts, |(key, _)| key);
	Ok(Value::Array(
		elts.into_iter()
			.map(|(key, val)| json!({ "prim": "Elt", "args": [key, val] }))
			.collect(),
	))
}

/// Leaves of a pair type. Nested pairs without a field annotation are
/// flattened into their parent, like right combs.
fn pair_fields(ty: &Value) -> Vec<&Value> {
	let mut fields = Vec::new();
	for arg in type_args(ty) {
		if arg.get("prim").and_then(Value::as_str) == Some("pair") && field_name(arg).is_none() {
			fields.extend(pair_fields(arg));
		} else {
			fields.push(arg);
		}
	}
	fields
}

fn encode_pair(ty: &Value, value: &Value) -> Result<Value, String> {
	let fields = pair_fields(ty);
	let encoded = match value {
		Value::Array(items) if items.len() == fields.len() => fields
			.iter()
			.zip(items)
			.map(|(field, item)| encode(field, item))
			.collect::<Result<Vec<_>, _>>()?,
		Value::Object(object) => fields
			.iter()
			.enumerate()
			.map(|(index, field)| {
				let item = lookup_field(object, field, index).ok_or_else(|| {
					format!(
						"Missing field {} in {}",
						field_name(field).map_or_else(|| index.to_string(), str::to_string),
						value
					)
				})?;
				encode(field, item)
			})
			.collect::<Result<Vec<_>, _>>()?,
		_ => return Err(mismatch("pair", value)),
	};

	let mut leaves = encoded.into_iter();
	build_pair(ty, &mut leaves)
}

fn lookup_field<'a>(object: &'a Map<String, Value>, field: &Value, index: usize) -> Option<&'a Value> {
	match field_name(field) {
		Some(name) => object.get(name),
		None => object.get(&index.to_string()),
	}
}

fn build_pair(ty: &Value, leaves: &mut impl Iterator<Item = Value>) -> Result<Value, String> {
	let args = type_args(ty)
		.iter()
		.map(|arg| {
			if arg.get("prim").and_then(Value::as_str) == Some("pair") && field_name(arg).is_none() {
				build_pair(arg, leaves)
			} else {
				leaves
					.next()
					.ok_or_else(|| "Pair type has more fields than values".to_string())
			}
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(json!({ "prim": "Pair", "args": args }))
}

/// Encodes `{"branch": value}` into the `Left`/`Right` path leading to the
/// branch annotated `%branch`.
fn encode_or(ty: &Value, value: &Value) -> Result<Value, String> {
	let (branch, inner) = match value.as_object().map(|object| object.iter().collect::<Vec<_>>()) {
		Some(entries) if entries.len() == 1 => entries[0],
		_ => return Err(mismatch("or", value)),
	};
	or_path(ty, branch, inner)?.ok_or_else(|| format!("No branch named {}", branch))
}

fn or_path(ty: &Value, branch: &str, value: &Value) -> Result<Option<Value>, String> {
	let args = type_args(ty);
	for (side, arg) in ["Left", "Right"].iter().zip(args) {
		if field_name(arg) == Some(branch) {
			return Ok(Some(json!({ "prim": side, "args": [encode(arg, value)?] })));
		}
		if arg.get("prim").and_then(Value::as_str) == Some("or") {
			if let Some(nested) = or_path(arg, branch, value)? {
				return Ok(Some(json!({ "prim": side, "args": [nested] })));
			}
		}
	}
	Ok(None)
}
