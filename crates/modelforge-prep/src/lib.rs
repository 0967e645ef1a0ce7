//! Data preparation for Modelforge: deterministic feature typing and
//! encoding, seeded splitting, normalization, embedding dictionaries, and
//! the `prep.json` metadata that lets inference replay training-time
//! preprocessing exactly.

pub mod dataset;
pub mod embedding;
pub mod encode;
pub mod error;
pub mod metadata;
pub mod remote;
pub mod schema;
pub mod split;

pub use dataset::{
    dataset_hash, encode_labels_with_metadata, fit_transform, transform_input, PrepConfig,
    PreparedDataset,
};
pub use embedding::{EmbeddingCache, EmbeddingCacheStats};
pub use encode::{encode_row, normalize, text_scalars, TEXT_SCALAR_DIM};
pub use error::PrepError;
pub use metadata::{EmbeddingDict, FeatureType, NormStat, PrepMetadata, PREP_FILE};
pub use remote::HttpEmbeddingProvider;
pub use schema::{
    FieldConstraint, FieldSchema, FieldViolation, Imputation, OutlierPolicy, ScaleParam, Scaling,
    SchemaOutput, SchemaPipeline, SchemaReport,
};
pub use split::{plain_split, stratified_split, Lcg, SplitIndices};
