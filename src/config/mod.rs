//! Typed configuration store backed by JSON documents.
//!
//! A [`ConfigStore`] holds a schema of typed keys and the values explicitly
//! supplied for them. Features:
//!
//! - Configuration keys are typed according to the schema.
//! - Type validation with aggregated, value-typed errors.
//! - Default values, either static or computed by a provider on each read.
//! - Only keys defined in the schema are stored; unknown keys are ignored.
//! - Partial updates: keys absent from an update document keep their values,
//!   and an explicit JSON `null` clears a value.
//! - Updates are atomic: a document that fails validation changes nothing.
//!
//! Updates go through a preview step. [`ConfigStore::preview_update`] merges
//! an update document with the current values and validates the result
//! without mutating the store; [`ConfigStore::force_apply_update_preview`]
//! installs a preview unconditionally. [`ConfigStore::update`] combines the
//! two, applying only when validation passed. The preview shares its format
//! with [`ConfigStore::dump`]:
//!
//! ```json
//! {
//!   "url": {
//!     "user_value": "ws://example.com/",
//!     "effective_value": "ws://example.com/",
//!     "type": "string",
//!     "required": true
//!   },
//!   "ping_interval": {
//!     "user_value": null,
//!     "default_value": 30.0,
//!     "effective_value": 30.0,
//!     "type": "float"
//!   }
//! }
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

/// Value type of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    String,
    Integer,
    UnsignedInteger,
    Float,
    Boolean,
}

impl ConfigType {
    /// The tag used for this type in dump and preview documents.
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigType::String => "string",
            ConfigType::Integer => "integer",
            ConfigType::UnsignedInteger => "unsigned integer",
            ConfigType::Float => "float",
            ConfigType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation finding for one configuration key.
///
/// `key` is empty when the finding concerns the update document as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Render the error as `'<key>' <message>`, or just the message when the
    /// key is empty.
    pub fn full_message(&self) -> String {
        if self.key.is_empty() {
            self.message.clone()
        } else {
            format!("'{}' {}", self.key, self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_message())
    }
}

impl PartialOrd for ConfigError {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfigError {
    fn cmp(&self, other: &Self) -> Ordering {
        self.full_message().cmp(&other.full_message())
    }
}

/// Render a list of validation findings as a single `"; "`-separated string.
pub fn errors_to_string(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ConfigError::full_message)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Producer of a default value, invoked on every effective-value read.
pub type DefaultValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Clone)]
struct Entry {
    value_type: ConfigType,
    required: bool,
    user_value: Value,
    default_fn: Option<DefaultValueFn>,
}

impl Entry {
    fn effective_value(&self) -> Value {
        effective_value(&self.user_value, self.default_fn.as_ref())
    }

    fn dump_properties(&self, doc: &mut Map<String, Value>) {
        doc.insert("type".to_string(), Value::from(self.value_type.as_str()));
        if self.required {
            doc.insert("required".to_string(), Value::Bool(true));
        }
    }
}

fn effective_value(user_value: &Value, default_fn: Option<&DefaultValueFn>) -> Value {
    if user_value.is_null() {
        match default_fn {
            Some(default_fn) => default_fn(),
            None => Value::Null,
        }
    } else {
        user_value.clone()
    }
}

/// Schema-validated configuration store.
#[derive(Clone, Default)]
pub struct ConfigStore {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema entry. A key cannot be both required and carry a
    /// default value. Re-registering a key overwrites its schema and clears
    /// its user value.
    pub fn register_key(
        &mut self,
        key: &str,
        value_type: ConfigType,
        required: bool,
        default_fn: Option<DefaultValueFn>,
    ) -> Result<(), ConfigError> {
        if required && default_fn.is_some() {
            return Err(ConfigError::new(
                key,
                "cannot be required and have a default value at the same time",
            ));
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value_type,
                required,
                user_value: Value::Null,
                default_fn,
            },
        );
        Ok(())
    }

    /// Wrap a constant in a default-value provider.
    pub fn static_default(value: impl Into<Value>) -> DefaultValueFn {
        let value = value.into();
        Arc::new(move || value.clone())
    }

    /// The effective value of `key`: the user-supplied value, else the
    /// default, else null. Unregistered keys read as null.
    pub fn get(&self, key: &str) -> Value {
        self.entries
            .get(key)
            .map(Entry::effective_value)
            .unwrap_or(Value::Null)
    }

    /// Merge `updates` with the current configuration and validate the
    /// result, without mutating the store.
    ///
    /// Returns the merged document (same format as [`dump`](Self::dump)) and
    /// any validation findings. Unregistered keys in `updates` are omitted
    /// from the result; registered keys absent from `updates` keep their
    /// current user value. Apply the result with
    /// [`force_apply_update_preview`](Self::force_apply_update_preview) only
    /// when the findings are empty.
    pub fn preview_update(&self, updates: &Value) -> (Value, Vec<ConfigError>) {
        let mut errors = Vec::new();

        if !updates.is_null() && !updates.is_object() {
            errors.push(ConfigError::new("", "The JSON document must be an object"));
            return (self.dump(), errors);
        }

        let mut result = Map::new();
        for (key, entry) in &self.entries {
            let user_value = match updates.get(key) {
                Some(value) => value.clone(),
                None => entry.user_value.clone(),
            };

            let mut subdoc = Map::new();
            if let Some(default_fn) = &entry.default_fn {
                subdoc.insert("default_value".to_string(), default_fn());
            }
            subdoc.insert(
                "effective_value".to_string(),
                effective_value(&user_value, entry.default_fn.as_ref()),
            );
            subdoc.insert("user_value".to_string(), user_value);
            entry.dump_properties(&mut subdoc);
            result.insert(key.clone(), Value::Object(subdoc));
        }

        let result = Value::Object(result);
        self.validate_required_keys_exist(&result, &mut errors);
        self.validate_existent_keys(&result, &mut errors);
        (result, errors)
    }

    /// Install the `user_value` slots from a previously produced preview,
    /// without revalidating. Only call this with a preview that passed
    /// validation, otherwise the store ends up holding invalid data.
    pub fn force_apply_update_preview(&mut self, preview: &Value) {
        for (key, entry) in self.entries.iter_mut() {
            entry.user_value = preview
                .get(key)
                .and_then(|subdoc| subdoc.get("user_value"))
                .cloned()
                .unwrap_or(Value::Null);
        }
    }

    /// Merge `updates` into the store if and only if the merged result passes
    /// validation. Returns the applied preview, or the validation findings
    /// with the store unchanged.
    pub fn update(&mut self, updates: &Value) -> Result<Value, Vec<ConfigError>> {
        let (preview, errors) = self.preview_update(updates);
        if errors.is_empty() {
            self.force_apply_update_preview(&preview);
            Ok(preview)
        } else {
            Err(errors)
        }
    }

    /// Dump all keys with their user, default, and effective values. See the
    /// module documentation for the format.
    pub fn dump(&self) -> Value {
        let mut result = Map::new();
        for (key, entry) in &self.entries {
            let mut subdoc = Map::new();
            if let Some(default_fn) = &entry.default_fn {
                subdoc.insert("default_value".to_string(), default_fn());
            }
            subdoc.insert("effective_value".to_string(), entry.effective_value());
            subdoc.insert("user_value".to_string(), entry.user_value.clone());
            entry.dump_properties(&mut subdoc);
            result.insert(key.clone(), Value::Object(subdoc));
        }
        Value::Object(result)
    }

    fn validate_required_keys_exist(&self, merged: &Value, errors: &mut Vec<ConfigError>) {
        for (key, entry) in &self.entries {
            if !entry.required {
                continue;
            }
            let effective = merged
                .get(key)
                .and_then(|subdoc| subdoc.get("effective_value"))
                .unwrap_or(&Value::Null);
            if effective.is_null() {
                errors.push(ConfigError::new(key, "is required"));
            }
        }
    }

    fn validate_existent_keys(&self, merged: &Value, errors: &mut Vec<ConfigError>) {
        for (key, entry) in &self.entries {
            let effective = merged
                .get(key)
                .and_then(|subdoc| subdoc.get("effective_value"))
                .unwrap_or(&Value::Null);
            if effective.is_null() {
                // Missing values are the concern of the required-keys pass.
                continue;
            }
            if let Err(message) = validate_value_type(effective, entry.value_type) {
                errors.push(ConfigError::new(key, message));
            }
        }
    }
}

fn validate_value_type(value: &Value, value_type: ConfigType) -> Result<(), &'static str> {
    match value_type {
        ConfigType::String => {
            if value.is_string() || value.is_number() || value.is_boolean() {
                Ok(())
            } else {
                Err("must be a string")
            }
        }
        ConfigType::Integer => {
            if is_integer_convertible(value) {
                Ok(())
            } else {
                Err("must be an integer")
            }
        }
        ConfigType::UnsignedInteger => {
            if !is_integer_convertible(value) {
                Err("must be an integer")
            } else if is_negative(value) {
                Err("must be greater than 0")
            } else {
                Ok(())
            }
        }
        ConfigType::Float => {
            if value.is_number() || value.is_boolean() {
                Ok(())
            } else {
                Err("must be a number")
            }
        }
        ConfigType::Boolean => {
            if value.is_boolean() || value.is_number() {
                Ok(())
            } else {
                Err("must be a boolean")
            }
        }
    }
}

fn is_integer_convertible(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::Number(number) => {
            number.as_i64().is_some()
                || number
                    .as_f64()
                    .is_some_and(|f| f.fract() == 0.0 && f.is_finite())
        }
        _ => false,
    }
}

fn is_negative(value: &Value) -> bool {
    match value {
        Value::Number(number) => number.as_f64().is_some_and(|f| f < 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sorted_messages(mut errors: Vec<ConfigError>) -> Vec<String> {
        errors.sort();
        errors.iter().map(ConfigError::full_message).collect()
    }

    #[test]
    fn empty_schema_accepts_empty_updates() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!({}));
        assert!(errors.is_empty());
    }

    #[test]
    fn empty_schema_accepts_unknown_keys() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!({ "foo": "bar" }));
        assert!(errors.is_empty());
    }

    #[test]
    fn non_object_updates_are_rejected() {
        let store = ConfigStore::new();
        let (_, errors) = store.preview_update(&json!("hello"));
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].full_message(),
            "The JSON document must be an object"
        );
    }

    #[test]
    fn required_keys_must_exist() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key("bar", ConfigType::String, true, None)
            .unwrap();

        let (_, errors) = store.preview_update(&json!({ "bar": null }));
        assert_eq!(
            sorted_messages(errors),
            vec!["'bar' is required", "'foo' is required"]
        );
    }

    #[test]
    fn compatible_value_types_pass() {
        let mut store = ConfigStore::new();
        store
            .register_key("string_string", ConfigType::String, false, None)
            .unwrap();
        store
            .register_key("string_integer", ConfigType::String, false, None)
            .unwrap();
        store
            .register_key("string_real", ConfigType::String, false, None)
            .unwrap();
        store
            .register_key("string_boolean", ConfigType::String, false, None)
            .unwrap();
        store
            .register_key("integer_integer", ConfigType::Integer, false, None)
            .unwrap();
        store
            .register_key("integer_boolean", ConfigType::Integer, false, None)
            .unwrap();
        store
            .register_key("integer_signed", ConfigType::Integer, false, None)
            .unwrap();
        store
            .register_key("integer_unsigned", ConfigType::UnsignedInteger, false, None)
            .unwrap();
        store
            .register_key("float_float", ConfigType::Float, false, None)
            .unwrap();
        store
            .register_key("float_integer", ConfigType::Float, false, None)
            .unwrap();
        store
            .register_key("boolean_boolean", ConfigType::Boolean, false, None)
            .unwrap();
        store
            .register_key("boolean_integer", ConfigType::Boolean, false, None)
            .unwrap();
        store
            .register_key("boolean_real", ConfigType::Boolean, false, None)
            .unwrap();

        let (_, errors) = store.preview_update(&json!({
            "string_string": "string",
            "string_integer": 123,
            "string_real": 123.45,
            "string_boolean": true,
            "integer_integer": 123,
            "integer_boolean": true,
            "integer_signed": -123,
            "integer_unsigned": 123,
            "float_float": 123.45,
            "float_integer": 123,
            "boolean_boolean": true,
            "boolean_integer": 123,
            "boolean_real": 123.45,
        }));
        assert_eq!(sorted_messages(errors), Vec::<String>::new());
    }

    #[test]
    fn incompatible_value_types_are_reported() {
        let mut store = ConfigStore::new();
        store
            .register_key("integer_string", ConfigType::Integer, false, None)
            .unwrap();
        store
            .register_key("integer_unsigned", ConfigType::UnsignedInteger, false, None)
            .unwrap();
        store
            .register_key("float_string", ConfigType::Float, false, None)
            .unwrap();
        store
            .register_key("boolean_string", ConfigType::Boolean, false, None)
            .unwrap();

        let (_, errors) = store.preview_update(&json!({
            "integer_string": "string",
            "integer_unsigned": -123,
            "float_string": "string",
            "boolean_string": "string",
        }));
        assert_eq!(
            sorted_messages(errors),
            vec![
                "'boolean_string' must be a boolean",
                "'float_string' must be a number",
                "'integer_string' must be an integer",
                "'integer_unsigned' must be greater than 0",
            ]
        );
    }

    #[test]
    fn fractional_numbers_are_not_integers() {
        let mut store = ConfigStore::new();
        store
            .register_key("count", ConfigType::Integer, false, None)
            .unwrap();
        let (_, errors) = store.preview_update(&json!({ "count": 123.45 }));
        assert_eq!(sorted_messages(errors), vec!["'count' must be an integer"]);
    }

    #[test]
    fn preview_merges_without_mutating() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key("bar", ConfigType::Integer, true, None)
            .unwrap();

        let (preview, errors) = store.preview_update(&json!({ "foo": "string", "baz": true }));
        assert_eq!(sorted_messages(errors), vec!["'bar' is required"]);
        assert_eq!(preview["foo"]["user_value"], "string");
        assert!(preview["bar"]["user_value"].is_null());
        assert!(preview.get("baz").is_none());

        // The failed preview left the store untouched.
        assert!(store.get("foo").is_null());
    }

    #[test]
    fn force_apply_installs_a_preview_without_validation() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key("bar", ConfigType::Integer, true, None)
            .unwrap();

        let (preview, errors) = store.preview_update(&json!({ "foo": "string" }));
        assert_eq!(sorted_messages(errors), vec!["'bar' is required"]);

        store.force_apply_update_preview(&preview);
        assert_eq!(store.get("foo"), "string");
        assert!(store.get("bar").is_null());
    }

    #[test]
    fn update_is_atomic() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key("bar", ConfigType::Integer, false, None)
            .unwrap();

        assert!(store.update(&json!({ "foo": "first", "bar": 1 })).is_ok());

        // A document with any invalid member changes nothing.
        let errors = store
            .update(&json!({ "foo": "second", "bar": "nope" }))
            .unwrap_err();
        assert_eq!(sorted_messages(errors), vec!["'bar' must be an integer"]);
        assert_eq!(store.get("foo"), "first");
        assert_eq!(store.get("bar"), 1);
    }

    #[test]
    fn partial_updates_keep_other_keys() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key("bar", ConfigType::Float, false, None)
            .unwrap();

        store.update(&json!({ "foo": "strval" })).unwrap();
        store.update(&json!({ "bar": 123.45 })).unwrap();
        assert_eq!(store.get("foo"), "strval");
        assert_eq!(store.get("bar"), 123.45);
    }

    #[test]
    fn null_clears_a_value() {
        let mut store = ConfigStore::new();
        store
            .register_key("bar", ConfigType::Float, false, None)
            .unwrap();
        store
            .register_key(
                "baz",
                ConfigType::Integer,
                false,
                Some(ConfigStore::static_default(123)),
            )
            .unwrap();

        store.update(&json!({ "bar": 123.45, "baz": 7 })).unwrap();
        store.update(&json!({ "bar": null, "baz": null })).unwrap();
        assert!(store.get("bar").is_null());
        assert_eq!(
            store.get("baz"),
            123,
            "cleared values fall back to the default"
        );
    }

    #[test]
    fn unregistered_keys_never_reach_the_dump() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();

        store
            .update(&json!({ "foo": "strval", "unknown": true }))
            .unwrap();
        assert!(store.get("unknown").is_null());
        assert!(store.dump().get("unknown").is_none());
    }

    #[test]
    fn dump_reports_user_default_and_effective_values() {
        let mut store = ConfigStore::new();
        store
            .register_key("foo", ConfigType::String, true, None)
            .unwrap();
        store
            .register_key(
                "bar",
                ConfigType::Integer,
                false,
                Some(ConfigStore::static_default(123)),
            )
            .unwrap();

        store.update(&json!({ "foo": "strval" })).unwrap();

        let dump = store.dump();
        assert_eq!(dump["foo"]["user_value"], "strval");
        assert_eq!(dump["foo"]["effective_value"], "strval");
        assert_eq!(dump["foo"]["type"], "string");
        assert_eq!(dump["foo"]["required"], true);
        assert!(dump["foo"].get("default_value").is_none());

        assert!(dump["bar"]["user_value"].is_null());
        assert_eq!(dump["bar"]["default_value"], 123);
        assert_eq!(dump["bar"]["effective_value"], 123);
        assert_eq!(dump["bar"]["type"], "integer");
        assert!(dump["bar"].get("required").is_none());
    }

    #[test]
    fn default_values_are_recomputed_on_each_read() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let counter = Arc::new(AtomicI64::new(0));
        let provider_counter = counter.clone();
        let mut store = ConfigStore::new();
        store
            .register_key(
                "seq",
                ConfigType::Integer,
                false,
                Some(Arc::new(move || {
                    Value::from(provider_counter.fetch_add(1, Ordering::SeqCst))
                })),
            )
            .unwrap();

        assert_eq!(store.get("seq"), 0);
        assert_eq!(store.get("seq"), 1);

        // A user value suppresses the provider entirely.
        store.update(&json!({ "seq": 42 })).unwrap();
        let reads_before = counter.load(Ordering::SeqCst);
        assert_eq!(store.get("seq"), 42);
        assert_eq!(counter.load(Ordering::SeqCst), reads_before);
    }

    #[test]
    fn required_keys_cannot_have_defaults() {
        let mut store = ConfigStore::new();
        let error = store
            .register_key(
                "foo",
                ConfigType::String,
                true,
                Some(ConfigStore::static_default("x")),
            )
            .unwrap_err();
        assert_eq!(
            error.full_message(),
            "'foo' cannot be required and have a default value at the same time"
        );
    }

    #[test]
    fn error_rendering() {
        let keyed = ConfigError::new("foo", "is required");
        let bare = ConfigError::new("", "The JSON document must be an object");
        assert_eq!(keyed.full_message(), "'foo' is required");
        assert_eq!(bare.full_message(), "The JSON document must be an object");
        assert_eq!(
            errors_to_string(&[keyed, bare]),
            "'foo' is required; The JSON document must be an object"
        );
    }
}
