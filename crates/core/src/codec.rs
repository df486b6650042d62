//! Argument and result encoding.
//!
//! Values cross profiles as `serde_json::Value`. Object keys are sorted by
//! `serde_json`'s map, so the text of an encoded argument tuple is canonical
//! and can serve as a cache key.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use xprofile_runtime::{Error, MethodFailure, Result};

use crate::descriptor::MethodDescriptor;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
	serde_json::to_value(value).map_err(|err| Error::Serialization(err.to_string()))
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
	serde_json::from_value(value).map_err(|err| Error::Serialization(err.to_string()))
}

/// Decodes the `index`th argument on the target side.
///
/// Failures are reported as method failures so they travel back to the caller
/// like any other error raised by the method.
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> std::result::Result<T, MethodFailure> {
	let value = args.get(index).cloned().unwrap_or(Value::Null);
	serde_json::from_value(value).map_err(|err| MethodFailure::new("InvalidArguments", format!("argument '{name}' (#{index}): {err}")))
}

/// Encodes a method's return value on the target side.
pub fn encode_result<T: Serialize + ?Sized>(value: &T) -> std::result::Result<Value, MethodFailure> {
	serde_json::to_value(value).map_err(|err| MethodFailure::new("Serialization", err.to_string()))
}

/// Canonical text of the key-relevant arguments of a call.
pub fn argument_key(method: &MethodDescriptor, args: &[Value]) -> String {
	let selected: Vec<&Value> = method.key_indices().into_iter().filter_map(|index| args.get(index)).collect();
	serde_json::to_string(&selected).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;
	use serde_json::json;

	use super::*;

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Folder {
		name: String,
		depth: u8,
	}

	#[test]
	fn argument_key_ignores_non_key_params() {
		let method = MethodDescriptor::new("count").key("folder", "String").param("verbose", "bool").returns("u32");
		let a = argument_key(&method, &[json!("inbox"), json!(true)]);
		let b = argument_key(&method, &[json!("inbox"), json!(false)]);
		assert_eq!(a, b);
		assert_eq!(a, r#"["inbox"]"#);
	}

	#[test]
	fn argument_key_is_canonical_for_objects() {
		let method = MethodDescriptor::new("open").param("folder", "Folder").returns("u32");
		let a = argument_key(&method, &[json!({"name": "inbox", "depth": 1})]);
		let b = argument_key(&method, &[encode(&Folder { name: "inbox".into(), depth: 1 }).unwrap()]);
		assert_eq!(a, b);
	}

	#[test]
	fn decode_arg_reports_method_failure() {
		let args = vec![json!("not a number")];
		let failure = decode_arg::<u32>(&args, 0, "limit").unwrap_err();
		assert_eq!(failure.class_name(), Some("InvalidArguments"));
		assert!(failure.message().contains("limit"));

		let folder: Folder = decode_arg(&[json!({"name": "inbox", "depth": 2})], 0, "folder").unwrap();
		assert_eq!(folder.depth, 2);
	}

	#[test]
	fn unit_decodes_from_null() {
		decode::<()>(Value::Null).unwrap();
	}
}
