//! Versioned JSON-schema validation of structured documents.
//!
//! A [`SchemaCatalogue`] holds compiled validators keyed by document type
//! and version. It is built once at startup and passed to whoever validates.
//! Pipeline documents are validated during compilation by the entry
//! registry; the bundled `ci-config` schema describes the authored form of
//! the same documents for editors and other tools.

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::{ConfigError, ConfigResult};

const BUILTIN_SCHEMAS: &[(&str, &str, &str)] = &[
    ("sast", "15.0.0", include_str!("../schemas/sast-15.0.0.json")),
    ("sast", "15.1.0", include_str!("../schemas/sast-15.1.0.json")),
    (
        "dependency-scanning",
        "15.0.0",
        include_str!("../schemas/dependency-scanning-15.0.0.json"),
    ),
    (
        "dependency-scanning",
        "15.1.0",
        include_str!("../schemas/dependency-scanning-15.1.0.json"),
    ),
    ("ci-config", "1.0.0", include_str!("../schemas/ci-config-1.0.0.json")),
];

/// One structural problem in a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    /// JSON pointer of the offending value; empty for the document itself.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "at root: {}", self.message)
        } else {
            write!(f, "at `{}`: {}", self.path, self.message)
        }
    }
}

/// Outcome of validating one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaReport {
    pub document_type: String,
    /// Schema version the payload was checked against.
    pub version: Option<String>,
    pub errors: Vec<SchemaError>,
    pub warnings: Vec<String>,
}

impl SchemaReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Dotted numeric version, ordered numerically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SchemaVersion(Vec<u64>);

impl SchemaVersion {
    fn parse(version: &str) -> Option<Self> {
        version
            .split('.')
            .map(|part| part.parse().ok())
            .collect::<Option<Vec<u64>>>()
            .map(Self)
    }
}

struct VersionedSchema {
    version: String,
    validator: Validator,
}

/// Compiled schemas keyed by document type, then version.
#[derive(Default)]
pub struct SchemaCatalogue {
    schemas: BTreeMap<String, BTreeMap<SchemaVersion, VersionedSchema>>,
}

impl SchemaCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with the bundled security report and pipeline schemas.
    pub fn builtin() -> ConfigResult<Self> {
        let mut catalogue = Self::new();
        for (document_type, version, text) in BUILTIN_SCHEMAS {
            let schema: Value = serde_json::from_str(text)
                .map_err(|e| ConfigError::Schema(format!("{} {}: {}", document_type, version, e)))?;
            catalogue.register(document_type, version, &schema)?;
        }
        Ok(catalogue)
    }

    /// Compile and add a schema (JSON Schema draft 7).
    pub fn register(&mut self, document_type: &str, version: &str, schema: &Value) -> ConfigResult<()> {
        let key = SchemaVersion::parse(version).ok_or_else(|| ConfigError::InvalidValue {
            field: "version".to_string(),
            message: format!("`{}` is not a dotted numeric version", version),
        })?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(schema)
            .map_err(|e| ConfigError::Schema(format!("{} {}: {}", document_type, version, e)))?;

        self.schemas.entry(document_type.to_string()).or_default().insert(
            key,
            VersionedSchema {
                version: version.to_string(),
                validator,
            },
        );
        Ok(())
    }

    pub fn document_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn versions(&self, document_type: &str) -> Vec<&str> {
        self.schemas
            .get(document_type)
            .map(|versions| versions.values().map(|s| s.version.as_str()).collect())
            .unwrap_or_default()
    }

    /// Validate `payload` as a `document_type` document.
    ///
    /// The payload's top-level `version` selects the schema. A missing or
    /// unsupported version is checked against the latest schema and noted
    /// as a warning.
    pub fn validate(&self, document_type: &str, payload: &Value) -> SchemaReport {
        let mut report = SchemaReport {
            document_type: document_type.to_string(),
            ..Default::default()
        };

        let Some(versions) = self.schemas.get(document_type) else {
            report.errors.push(SchemaError {
                path: String::new(),
                message: format!("unknown document type `{}`", document_type),
            });
            return report;
        };

        let requested = payload.get("version").and_then(Value::as_str);
        let exact = requested
            .and_then(SchemaVersion::parse)
            .and_then(|v| versions.get(&v));
        let schema = match (exact, versions.values().next_back()) {
            (Some(schema), _) => schema,
            (None, Some(latest)) => {
                report.warnings.push(match requested {
                    Some(version) => format!(
                        "version {} for report type {} is unsupported, validated against version {}",
                        version, document_type, latest.version
                    ),
                    None => format!(
                        "no version given for report type {}, validated against version {}",
                        document_type, latest.version
                    ),
                });
                latest
            }
            (None, None) => {
                report.errors.push(SchemaError {
                    path: String::new(),
                    message: format!("no schema registered for `{}`", document_type),
                });
                return report;
            }
        };

        report.version = Some(schema.version.clone());
        report.errors = schema
            .validator
            .iter_errors(payload)
            .map(|error| SchemaError {
                path: error.instance_path().to_string(),
                message: error.to_string(),
            })
            .collect();
        debug!(
            document_type,
            version = %schema.version,
            errors = report.errors.len(),
            "Validated document against schema"
        );
        report
    }
}
