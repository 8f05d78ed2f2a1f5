//! Structural parameter validation for tool contracts.
//!
//! Contract schemas are strict: every required key is enumerated and
//! unknown fields are rejected. Validation is total — it classifies
//! problems into path-qualified [`ValidationError`]s and never panics,
//! whatever the shape of the incoming parameters.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ── Rules and errors ────────────────────────────────────────────

/// The rule a parameter failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Required key absent.
    Missing,
    /// Value has the wrong JSON type.
    Type,
    /// Value outside the enumerated set.
    Enum,
    /// Number outside the declared range.
    Range,
    /// String does not match the declared pattern.
    Pattern,
    /// Key not declared by the schema.
    UnknownKey,
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Type => f.write_str("type"),
            Self::Enum => f.write_str("enum"),
            Self::Range => f.write_str("range"),
            Self::Pattern => f.write_str("pattern"),
            Self::UnknownKey => f.write_str("unknown_key"),
        }
    }
}

/// A single structural validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted path to the failing value ("" for the root).
    pub path: String,
    /// Which rule failed.
    pub rule: ValidationRule,
    /// Human-readable detail.
    pub message: String,
}

/// Outcome of validating one set of parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when no errors were found.
    pub valid: bool,
    /// All failures, in schema order then document order.
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

// ── Schema model ────────────────────────────────────────────────

/// JSON type a field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// JSON string.
    String,
    /// JSON integer (no fractional part).
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    /// Inclusive lower bound.
    pub min: Option<f64>,
    /// Inclusive upper bound.
    pub max: Option<f64>,
}

/// Declaration for a single parameter field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected JSON type.
    pub kind: FieldKind,
    /// Whether the key must be present.
    pub required: bool,
    /// Allowed values, when the field is an enumeration.
    pub allowed: Option<Vec<serde_json::Value>>,
    /// Numeric bounds for number/integer fields.
    pub range: Option<NumericRange>,
    /// Regex the string value must match (validated at registration).
    pub pattern: Option<String>,
    /// Nested schema for object fields.
    pub nested: Option<Box<ParamSchema>>,
}

impl FieldSpec {
    /// A required field of the given kind.
    pub fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
            allowed: None,
            range: None,
            pattern: None,
            nested: None,
        }
    }

    /// An optional field of the given kind.
    pub fn optional(kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }

    /// Restrict the field to an enumerated set of values.
    #[must_use]
    pub fn one_of(mut self, allowed: Vec<serde_json::Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Bound a numeric field.
    #[must_use]
    pub fn in_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.range = Some(NumericRange { min, max });
        self
    }

    /// Require a string field to match a regex.
    #[must_use]
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Attach a nested schema to an object field.
    #[must_use]
    pub fn with_nested(mut self, nested: ParamSchema) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }
}

/// Strict structural schema over a parameter object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Declared fields by key.
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ParamSchema {
    /// An empty schema (accepts only `{}`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Problems that make the schema unusable (bad regexes, inverted ranges).
    ///
    /// Checked once at contract registration so [`ParamSchema::validate`]
    /// can stay total.
    pub fn compile_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        self.collect_compile_issues("", &mut issues);
        issues
    }

    fn collect_compile_issues(&self, prefix: &str, issues: &mut Vec<String>) {
        for (name, spec) in &self.fields {
            let path = join_path(prefix, name);
            if let Some(pattern) = &spec.pattern {
                if Regex::new(pattern).is_err() {
                    issues.push(format!("{path}: invalid pattern `{pattern}`"));
                }
            }
            if let Some(range) = &spec.range {
                if let (Some(min), Some(max)) = (range.min, range.max) {
                    if min > max {
                        issues.push(format!("{path}: range min {min} above max {max}"));
                    }
                }
            }
            if let Some(nested) = &spec.nested {
                nested.collect_compile_issues(&path, issues);
            }
        }
    }

    /// Validate parameters against this schema. Total: never panics.
    pub fn validate(&self, params: &serde_json::Value) -> ValidationReport {
        let Some(object) = params.as_object() else {
            return ValidationReport::from_errors(vec![ValidationError {
                path: String::new(),
                rule: ValidationRule::Type,
                message: format!("expected object, got {}", json_type_name(params)),
            }]);
        };

        let mut errors = Vec::new();
        self.validate_object(object, "", &mut errors);
        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::from_errors(errors)
        }
    }

    fn validate_object(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        prefix: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        for (name, spec) in &self.fields {
            let path = join_path(prefix, name);
            match object.get(name) {
                None => {
                    if spec.required {
                        errors.push(ValidationError {
                            path,
                            rule: ValidationRule::Missing,
                            message: format!("required key `{name}` is absent"),
                        });
                    }
                }
                Some(value) => self.validate_value(spec, value, &path, errors),
            }
        }

        for key in object.keys() {
            if !self.fields.contains_key(key) {
                errors.push(ValidationError {
                    path: join_path(prefix, key),
                    rule: ValidationRule::UnknownKey,
                    message: format!("key `{key}` is not declared by the contract"),
                });
            }
        }
    }

    fn validate_value(
        &self,
        spec: &FieldSpec,
        value: &serde_json::Value,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        if !spec.kind.matches(value) {
            errors.push(ValidationError {
                path: path.to_owned(),
                rule: ValidationRule::Type,
                message: format!(
                    "expected {}, got {}",
                    spec.kind.name(),
                    json_type_name(value)
                ),
            });
            return;
        }

        if let Some(allowed) = &spec.allowed {
            if !allowed.contains(value) {
                errors.push(ValidationError {
                    path: path.to_owned(),
                    rule: ValidationRule::Enum,
                    message: format!("value {value} is not one of the allowed set"),
                });
            }
        }

        if let Some(range) = &spec.range {
            if let Some(n) = value.as_f64() {
                let below = range.min.map(|min| n < min).unwrap_or(false);
                let above = range.max.map(|max| n > max).unwrap_or(false);
                if below || above {
                    errors.push(ValidationError {
                        path: path.to_owned(),
                        rule: ValidationRule::Range,
                        message: format!(
                            "value {n} outside [{:?}, {:?}]",
                            range.min, range.max
                        ),
                    });
                }
            }
        }

        if let Some(pattern) = &spec.pattern {
            if let Some(s) = value.as_str() {
                // Bad patterns are caught at registration; skip here.
                if let Ok(re) = Regex::new(pattern) {
                    if !re.is_match(s) {
                        errors.push(ValidationError {
                            path: path.to_owned(),
                            rule: ValidationRule::Pattern,
                            message: format!("value does not match `{pattern}`"),
                        });
                    }
                }
            }
        }

        if let (Some(nested), Some(object)) = (&spec.nested, value.as_object()) {
            nested.validate_object(object, path, errors);
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_schema() -> ParamSchema {
        ParamSchema::new().field("path", FieldSpec::required(FieldKind::String))
    }

    #[test]
    fn test_valid_params() {
        let report = file_schema().validate(&json!({"path": "./a.txt"}));
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_missing_required_key() {
        let report = file_schema().validate(&json!({}));
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, "path");
        assert_eq!(report.errors[0].rule, ValidationRule::Missing);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let report = file_schema().validate(&json!({"path": "a", "mode": "w"}));
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.rule == ValidationRule::UnknownKey && e.path == "mode"));
    }

    #[test]
    fn test_type_mismatch() {
        let report = file_schema().validate(&json!({"path": 42}));
        assert!(!report.valid);
        assert_eq!(report.errors[0].rule, ValidationRule::Type);
        assert!(report.errors[0].message.contains("expected string"));
    }

    #[test]
    fn test_non_object_params() {
        let report = file_schema().validate(&json!("just a string"));
        assert!(!report.valid);
        assert_eq!(report.errors[0].path, "");
        assert_eq!(report.errors[0].rule, ValidationRule::Type);
    }

    #[test]
    fn test_enum_rule() {
        let schema = ParamSchema::new().field(
            "mode",
            FieldSpec::required(FieldKind::String).one_of(vec![json!("r"), json!("w")]),
        );
        assert!(schema.validate(&json!({"mode": "r"})).valid);
        let report = schema.validate(&json!({"mode": "x"}));
        assert_eq!(report.errors[0].rule, ValidationRule::Enum);
    }

    #[test]
    fn test_range_rule() {
        let schema = ParamSchema::new().field(
            "limit",
            FieldSpec::required(FieldKind::Integer).in_range(Some(1.0), Some(100.0)),
        );
        assert!(schema.validate(&json!({"limit": 50})).valid);
        let report = schema.validate(&json!({"limit": 0}));
        assert_eq!(report.errors[0].rule, ValidationRule::Range);
    }

    #[test]
    fn test_pattern_rule() {
        let schema = ParamSchema::new().field(
            "branch",
            FieldSpec::required(FieldKind::String).matching(r"^[a-z][a-z0-9-]*$"),
        );
        assert!(schema.validate(&json!({"branch": "main"})).valid);
        let report = schema.validate(&json!({"branch": "Feature Branch"}));
        assert_eq!(report.errors[0].rule, ValidationRule::Pattern);
    }

    #[test]
    fn test_integer_rejects_float() {
        let schema =
            ParamSchema::new().field("count", FieldSpec::required(FieldKind::Integer));
        let report = schema.validate(&json!({"count": 1.5}));
        assert!(!report.valid);
        assert_eq!(report.errors[0].rule, ValidationRule::Type);
    }

    #[test]
    fn test_nested_object_paths() {
        let schema = ParamSchema::new().field(
            "target",
            FieldSpec::required(FieldKind::Object).with_nested(
                ParamSchema::new().field("host", FieldSpec::required(FieldKind::String)),
            ),
        );
        let report = schema.validate(&json!({"target": {"port": 22}}));
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.path == "target.host" && e.rule == ValidationRule::Missing));
        assert!(report
            .errors
            .iter()
            .any(|e| e.path == "target.port" && e.rule == ValidationRule::UnknownKey));
    }

    #[test]
    fn test_optional_field_absent_ok() {
        let schema = ParamSchema::new()
            .field("path", FieldSpec::required(FieldKind::String))
            .field("limit", FieldSpec::optional(FieldKind::Integer));
        assert!(schema.validate(&json!({"path": "a"})).valid);
    }

    #[test]
    fn test_compile_issues_bad_pattern() {
        let schema = ParamSchema::new()
            .field("x", FieldSpec::required(FieldKind::String).matching("(unclosed"));
        let issues = schema.compile_issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("invalid pattern"));
    }

    #[test]
    fn test_compile_issues_inverted_range() {
        let schema = ParamSchema::new().field(
            "n",
            FieldSpec::required(FieldKind::Number).in_range(Some(10.0), Some(1.0)),
        );
        assert!(!schema.compile_issues().is_empty());
    }

    #[test]
    fn test_multiple_errors_reported_together() {
        let schema = ParamSchema::new()
            .field("a", FieldSpec::required(FieldKind::String))
            .field("b", FieldSpec::required(FieldKind::Integer));
        let report = schema.validate(&json!({"b": "nope", "c": true}));
        assert_eq!(report.errors.len(), 3, "missing a, type b, unknown c: {report:?}");
    }
}
