//! Named input transformers: small field-level rewrites applied to raw
//! prediction inputs before preprocessing when a model config references
//! one by name.

use dashmap::DashMap;
use modelforge_core::{FeatureValue, ForgeError, Result, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Rename a field, keeping its value.
    Rename { from: String, to: String },
    /// Remove a field entirely.
    Drop { field: String },
    /// Copy a field's value under a second name.
    Copy { from: String, to: String },
    /// Lowercase a text field.
    Lowercase { field: String },
    /// Insert a value when the field is missing or absent.
    Default { field: String, value: FeatureValue },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub ops: Vec<TransformOp>,
}

impl TransformerSpec {
    pub fn apply(&self, mut row: Row) -> Row {
        for op in &self.ops {
            match op {
                TransformOp::Rename { from, to } => {
                    if let Some(value) = row.remove(from) {
                        row.insert(to.clone(), value);
                    }
                }
                TransformOp::Drop { field } => {
                    row.remove(field);
                }
                TransformOp::Copy { from, to } => {
                    if let Some(value) = row.get(from).cloned() {
                        row.insert(to.clone(), value);
                    }
                }
                TransformOp::Lowercase { field } => {
                    if let Some(FeatureValue::Text(text)) = row.get(field) {
                        let lowered = text.to_lowercase();
                        row.insert(field.clone(), FeatureValue::Text(lowered));
                    }
                }
                TransformOp::Default { field, value } => {
                    let missing = row
                        .get(field)
                        .map(|v| v.is_absent())
                        .unwrap_or(true);
                    if missing {
                        row.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        row
    }
}

#[derive(Default)]
pub struct TransformerRegistry {
    transformers: DashMap<String, TransformerSpec>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: TransformerSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(ForgeError::Validation("transformer needs a name".into()));
        }
        self.transformers.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TransformerSpec> {
        self.transformers.get(name).map(|t| t.clone())
    }

    pub fn list(&self) -> Vec<TransformerSpec> {
        let mut all: Vec<TransformerSpec> =
            self.transformers.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Apply a named transformer when it exists; unknown names fail so a
    /// model config cannot silently reference a missing transformer.
    pub fn apply(&self, name: &str, row: Row) -> Result<Row> {
        let spec = self
            .get(name)
            .ok_or_else(|| ForgeError::NotFound(format!("transformer '{name}' not found")))?;
        Ok(spec.apply(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, FeatureValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn ops_apply_in_order() {
        let spec = TransformerSpec {
            name: "normalize-names".into(),
            description: None,
            ops: vec![
                TransformOp::Rename {
                    from: "Region".into(),
                    to: "region".into(),
                },
                TransformOp::Lowercase {
                    field: "region".into(),
                },
                TransformOp::Default {
                    field: "channel".into(),
                    value: FeatureValue::Text("web".into()),
                },
                TransformOp::Drop {
                    field: "debug".into(),
                },
            ],
        };
        let out = spec.apply(row(&[
            ("Region", FeatureValue::Text("NORTH".into())),
            ("debug", FeatureValue::Bool(true)),
        ]));
        assert_eq!(out["region"], FeatureValue::Text("north".into()));
        assert_eq!(out["channel"], FeatureValue::Text("web".into()));
        assert!(!out.contains_key("Region"));
        assert!(!out.contains_key("debug"));
    }

    #[test]
    fn registry_round_trip_and_unknown_name() {
        let registry = TransformerRegistry::new();
        registry
            .register(TransformerSpec {
                name: "t".into(),
                description: None,
                ops: vec![],
            })
            .unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.apply("t", Row::new()).is_ok());
        assert!(registry.apply("missing", Row::new()).is_err());
    }
}
