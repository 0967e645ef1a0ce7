//! Model persistence: a `model.json` manifest describing the network
//! topology and the weight shards it references, plus one binary shard of
//! little-endian f32 data per trainable layer. Loading needs only the files
//! the manifest names, which is what lets the storage adapter prefetch a
//! complete local directory.

use crate::layer::Layer;
use crate::network::{Network, NetworkSpec};
use crate::error::{NnError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE: &str = "model.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardEntry {
    pub file: String,
    pub tensors: Vec<TensorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub format: u32,
    pub spec: NetworkSpec,
    pub shards: Vec<ShardEntry>,
}

impl ModelManifest {
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: ModelManifest = serde_json::from_str(raw)?;
        if manifest.format != FORMAT_VERSION {
            return Err(NnError::Manifest(format!(
                "unsupported manifest format {}",
                manifest.format
            )));
        }
        Ok(manifest)
    }

    /// Weight-shard file names relative to the version directory.
    pub fn shard_files(&self) -> Vec<&str> {
        self.shards.iter().map(|s| s.file.as_str()).collect()
    }
}

fn tensors_of(layer: &Layer) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    match layer {
        Layer::Dense(d) => vec![
            (
                "weights".into(),
                vec![d.weights.nrows(), d.weights.ncols()],
                d.weights.iter().copied().collect(),
            ),
            ("bias".into(), vec![d.bias.len()], d.bias.to_vec()),
        ],
        Layer::Embedding(e) => vec![(
            "table".into(),
            vec![e.table.nrows(), e.table.ncols()],
            e.table.iter().copied().collect(),
        )],
        Layer::Lstm(l) => vec![
            (
                "weights".into(),
                vec![l.weights.nrows(), l.weights.ncols()],
                l.weights.iter().copied().collect(),
            ),
            ("bias".into(), vec![l.bias.len()], l.bias.to_vec()),
        ],
        Layer::Dropout(_) => Vec::new(),
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(NnError::Manifest("weight shard is truncated".into()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write the manifest and weight shards into `dir`.
pub async fn save_to_dir(network: &Network, dir: &Path) -> Result<ModelManifest> {
    tokio::fs::create_dir_all(dir).await?;

    let mut shards = Vec::new();
    for (idx, layer) in network.layers().iter().enumerate() {
        let tensors = tensors_of(layer);
        if tensors.is_empty() {
            continue;
        }
        let file = format!("weights-{idx:03}.bin");
        let mut infos = Vec::new();
        let mut payload = Vec::new();
        for (name, shape, values) in tensors {
            infos.push(TensorInfo { name, shape });
            payload.extend(encode_f32(&values));
        }
        tokio::fs::write(dir.join(&file), payload).await?;
        shards.push(ShardEntry {
            file,
            tensors: infos,
        });
    }

    let manifest = ModelManifest {
        format: FORMAT_VERSION,
        spec: network.spec.clone(),
        shards,
    };
    tokio::fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )
    .await?;
    Ok(manifest)
}

/// Rebuild a network from a version directory written by [`save_to_dir`].
pub async fn load_from_dir(dir: &Path) -> Result<Network> {
    let raw = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
    let manifest = ModelManifest::parse(&raw)?;
    // Seed is irrelevant here; every trainable tensor is overwritten below.
    let mut network = Network::build(manifest.spec.clone(), 0)?;

    let mut shard_iter = manifest.shards.iter();
    for (idx, layer) in network.layers_mut().iter_mut().enumerate() {
        if matches!(layer, Layer::Dropout(_)) {
            continue;
        }
        let shard = shard_iter.next().ok_or_else(|| {
            NnError::Manifest(format!("manifest is missing a shard for layer {idx}"))
        })?;
        let bytes = tokio::fs::read(dir.join(&shard.file)).await?;
        let values = decode_f32(&bytes)?;
        fill_layer(layer, shard, &values)?;
    }

    Ok(network)
}

fn fill_layer(layer: &mut Layer, shard: &ShardEntry, values: &[f32]) -> Result<()> {
    let mut cursor = 0usize;
    let mut take = |index: usize| -> Result<(Vec<usize>, Vec<f32>)> {
        let info = shard.tensors.get(index).ok_or_else(|| {
            NnError::Manifest(format!("shard {} declares too few tensors", shard.file))
        })?;
        let len: usize = info.shape.iter().product();
        let slice = values
            .get(cursor..cursor + len)
            .ok_or_else(|| NnError::Manifest(format!("shard {} is too short", shard.file)))?;
        cursor += len;
        Ok((info.shape.clone(), slice.to_vec()))
    };

    let matrix = |shape: &[usize], data: Vec<f32>| -> Result<Array2<f32>> {
        if shape.len() != 2 {
            return Err(NnError::Manifest(format!(
                "expected a rank-2 tensor in shard {}",
                shard.file
            )));
        }
        Array2::from_shape_vec((shape[0], shape[1]), data)
            .map_err(|e| NnError::Manifest(e.to_string()))
    };

    match layer {
        Layer::Dense(d) => {
            let (w_shape, w) = take(0)?;
            d.weights = matrix(&w_shape, w)?;
            let (_, b) = take(1)?;
            d.bias = Array1::from_vec(b);
        }
        Layer::Embedding(e) => {
            let (shape, t) = take(0)?;
            e.table = matrix(&shape, t)?;
        }
        Layer::Lstm(l) => {
            let (w_shape, w) = take(0)?;
            l.weights = matrix(&w_shape, w)?;
            let (_, b) = take(1)?;
            l.bias = Array1::from_vec(b);
        }
        Layer::Dropout(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::layer::LayerSpec;
    use crate::loss::Loss;
    use crate::optimizer::OptimizerSpec;
    use ndarray::Array2;

    fn small_spec() -> NetworkSpec {
        NetworkSpec {
            input_dim: 3,
            layers: vec![
                LayerSpec::Dense {
                    units: 4,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.2 },
                LayerSpec::Dense {
                    units: 2,
                    activation: Activation::Softmax,
                },
            ],
            loss: Loss::CategoricalCrossEntropy,
            optimizer: OptimizerSpec::Adam {
                learning_rate: 0.001,
            },
        }
    }

    #[tokio::test]
    async fn save_load_round_trip_preserves_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = Network::build(small_spec(), 42).unwrap();
        let manifest = save_to_dir(&original, dir.path()).await.unwrap();
        assert_eq!(manifest.shards.len(), 2);
        assert!(dir.path().join(MANIFEST_FILE).exists());

        let mut loaded = load_from_dir(dir.path()).await.unwrap();
        let x = Array2::from_shape_fn((5, 3), |(r, c)| (r + c) as f32 * 0.1);
        assert_eq!(
            original.predict(&x).unwrap(),
            loaded.predict(&x).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_shard_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let original = Network::build(small_spec(), 42).unwrap();
        save_to_dir(&original, dir.path()).await.unwrap();
        tokio::fs::remove_file(dir.path().join("weights-000.bin"))
            .await
            .unwrap();
        assert!(load_from_dir(dir.path()).await.is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let raw = r#"{"format": 99, "spec": {"input_dim": 1, "layers": [], "loss": "mean_squared_error", "optimizer": {"kind": "adam", "learning_rate": 0.1}}, "shards": []}"#;
        assert!(ModelManifest::parse(raw).is_err());
    }
}
