//! JSON-schema validation for pipeline params and input bindings.

use serde_json::Value;

/// Validate `value` against `schema`. Returns the joined validation error
/// messages on failure, or the compilation error if the schema itself is
/// invalid.
pub fn validate_value(schema: &Value, value: &Value) -> Result<(), String> {
  let compiled =
    jsonschema::validator_for(schema).map_err(|err| format!("invalid schema: {err}"))?;

  let errors: Vec<String> = compiled.iter_errors(value).map(|err| err.to_string()).collect();
  if errors.is_empty() {
    Ok(())
  } else {
    Err(errors.join("; "))
  }
}
