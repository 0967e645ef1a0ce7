//! Version-string bookkeeping: `1.0.0` for the first save, a minor bump
//! for every full retrain, a patch bump reserved for callers that mint
//! versions out of incremental updates.

use modelforge_core::ModelRecord;

pub const INITIAL_VERSION: &str = "1.0.0";

fn parse(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some((major, minor, patch))
}

pub fn bump_minor(version: &str) -> String {
    match parse(version) {
        Some((major, minor, _)) => format!("{major}.{}.0", minor + 1),
        None => INITIAL_VERSION.to_string(),
    }
}

pub fn bump_patch(version: &str) -> String {
    match parse(version) {
        Some((major, minor, patch)) => format!("{major}.{minor}.{}", patch + 1),
        None => INITIAL_VERSION.to_string(),
    }
}

/// Version string for the next full training of a model.
pub fn next_training_version(record: &ModelRecord) -> String {
    record
        .versions
        .iter()
        .filter_map(|v| parse(&v.version).map(|p| (p, v.version.clone())))
        .max_by_key(|(p, _)| *p)
        .map(|(_, v)| bump_minor(&v))
        .unwrap_or_else(|| INITIAL_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelforge_core::{Algorithm, ModelConfig, ModelKind};
    use std::collections::HashMap;

    fn record_with_versions(versions: &[&str]) -> ModelRecord {
        let mut record = ModelRecord::new(
            "t1",
            "m",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec!["x".into()],
                target: None,
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        );
        for v in versions {
            record.versions.push(modelforge_core::ModelVersionEntry {
                version: v.to_string(),
                stage: modelforge_core::VersionStage::Development,
                performance: HashMap::new(),
                storage_uri: String::new(),
                created_at: chrono::Utc::now(),
                promoted_at: None,
                metadata: None,
            });
        }
        record
    }

    #[test]
    fn first_training_starts_at_one() {
        assert_eq!(next_training_version(&record_with_versions(&[])), "1.0.0");
    }

    #[test]
    fn retrain_bumps_minor_of_the_highest() {
        let record = record_with_versions(&["1.0.0", "1.2.0", "1.1.0"]);
        assert_eq!(next_training_version(&record), "1.3.0");
    }

    #[test]
    fn bumps_parse_and_format() {
        assert_eq!(bump_minor("2.4.7"), "2.5.0");
        assert_eq!(bump_patch("2.4.7"), "2.4.8");
        assert_eq!(bump_minor("garbage"), "1.0.0");
    }
}
