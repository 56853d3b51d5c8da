//! Multi-resolution feature storage.
//!
//! Dense `[time, feature, asset]` tensors in 16-bit floats, one set per
//! trading day, at three resolutions (second / minute / hour). The layout
//! favours cross-sectional consumers: a fixed `(t, f)` is a contiguous
//! stride-1 run across all assets.

pub mod schema;
pub mod store;
pub mod tensor;

pub use schema::{
    validate_schemas, FieldDef, FieldKind, Level, Level0Row, Level1Row, Level2Row, Normalization,
    LEVEL_COUNT,
};
pub use store::{load_tensor_file, save_separate, save_unified, FeatureStore, PersistMode};
pub use tensor::{DailyTensor, TensorState};
