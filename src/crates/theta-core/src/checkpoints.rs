//! Checkpoint format plug-ins.
//!
//! A checkpoint handler converts between a serialized checkpoint stream and
//! the flat `name -> Tensor` map the filter driver works on. Formats are
//! selected per path: an explicit argument wins, then the
//! `GIT_THETA_CHECKPOINT_TYPE` environment variable, then the repository's
//! pattern configuration, then the default `flat` format.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde_json::Value;
use theta_tensor::{Dtype, Tensor};

use crate::config::ThetaConfig;
use crate::error::{Result, ThetaError};
use crate::utils::{env, flatten, unflatten, ParamName};

/// The default format name.
pub const DEFAULT_FORMAT: &str = flat::NAME;

/// A flat map from parameter names to tensors; the in-memory form of every
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    params: BTreeMap<ParamName, Tensor>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: BTreeMap<ParamName, Tensor>) -> Self {
        Self { params }
    }

    pub fn insert(&mut self, name: ParamName, tensor: Tensor) {
        self.params.insert(name, tensor);
    }

    pub fn get(&self, name: &ParamName) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamName, &Tensor)> {
        self.params.iter()
    }

    pub fn into_params(self) -> BTreeMap<ParamName, Tensor> {
        self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// A serialized checkpoint format.
pub trait CheckpointFormat: Send + Sync {
    /// The registry name.
    fn name(&self) -> &'static str;

    /// Read a framework-native stream into the flat map.
    fn load(&self, reader: &mut dyn Read) -> Result<Checkpoint>;

    /// Write the flat map back out in the framework-native form.
    fn save(&self, checkpoint: &Checkpoint, writer: &mut dyn Write) -> Result<()>;
}

pub mod flat {
    //! The default binary format: a bincode map of `name -> tensor`, the
    //! Rust-native stand-in for a pickled state dict.

    use super::*;

    pub const NAME: &str = "flat";

    #[derive(Debug, Default, Clone, Copy)]
    pub struct FlatCheckpoint;

    impl CheckpointFormat for FlatCheckpoint {
        fn name(&self) -> &'static str {
            NAME
        }

        fn load(&self, reader: &mut dyn Read) -> Result<Checkpoint> {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            let raw: BTreeMap<String, Tensor> = bincode::deserialize(&bytes).map_err(|e| {
                ThetaError::metadata_decode(None, None, format!("invalid flat checkpoint: {e}"))
            })?;
            Ok(Checkpoint::from_params(
                raw.into_iter()
                    .map(|(name, tensor)| (ParamName::from_path(&name), tensor))
                    .collect(),
            ))
        }

        fn save(&self, checkpoint: &Checkpoint, writer: &mut dyn Write) -> Result<()> {
            let raw: BTreeMap<String, &Tensor> = checkpoint
                .iter()
                .map(|(name, tensor)| (name.to_string(), tensor))
                .collect();
            let bytes = bincode::serialize(&raw).map_err(|e| {
                ThetaError::metadata_decode(None, None, format!("flat checkpoint encode: {e}"))
            })?;
            writer.write_all(&bytes)?;
            Ok(())
        }
    }
}

pub mod json {
    //! A human-readable format: nested JSON whose leaves carry `dtype`,
    //! `shape`, and the flattened `values`.

    use super::*;

    pub const NAME: &str = "json";

    #[derive(Debug, Default, Clone, Copy)]
    pub struct JsonCheckpoint;

    impl CheckpointFormat for JsonCheckpoint {
        fn name(&self) -> &'static str {
            NAME
        }

        fn load(&self, reader: &mut dyn Read) -> Result<Checkpoint> {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                ThetaError::metadata_decode(None, None, format!("invalid json checkpoint: {e}"))
            })?;
            let is_leaf = |v: &Value| v.get("values").is_some();
            let mut checkpoint = Checkpoint::new();
            for (name, leaf) in flatten(&value, &is_leaf) {
                let decode_err = |msg: &str| {
                    ThetaError::metadata_decode(None, Some(&name.to_string()), msg.to_string())
                };
                let dtype: Dtype = leaf
                    .get("dtype")
                    .and_then(Value::as_str)
                    .ok_or_else(|| decode_err("missing dtype"))?
                    .parse()?;
                let shape: Vec<usize> = leaf
                    .get("shape")
                    .and_then(Value::as_array)
                    .ok_or_else(|| decode_err("missing shape"))?
                    .iter()
                    .map(|v| v.as_u64().map(|n| n as usize))
                    .collect::<Option<_>>()
                    .ok_or_else(|| decode_err("non-integer shape entry"))?;
                let values: Vec<f64> = leaf
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| decode_err("missing values"))?
                    .iter()
                    .map(Value::as_f64)
                    .collect::<Option<_>>()
                    .ok_or_else(|| decode_err("non-numeric value entry"))?;
                checkpoint.insert(name, Tensor::from_f64s(shape, dtype, &values)?);
            }
            Ok(checkpoint)
        }

        fn save(&self, checkpoint: &Checkpoint, writer: &mut dyn Write) -> Result<()> {
            let flat: BTreeMap<ParamName, Value> = checkpoint
                .iter()
                .map(|(name, tensor)| {
                    let leaf = serde_json::json!({
                        "dtype": tensor.dtype().to_string(),
                        "shape": tensor.shape(),
                        "values": tensor.to_f64s(),
                    });
                    (name.clone(), leaf)
                })
                .collect();
            let nested = unflatten(&flat)?;
            let rendered = serde_json::to_string_pretty(&nested)?;
            writer.write_all(rendered.as_bytes())?;
            Ok(())
        }
    }
}

/// Resolve a checkpoint handler name: explicit argument, environment,
/// pattern configuration for the path, then the default.
pub fn get_checkpoint_handler_name(
    explicit: Option<&str>,
    config: &ThetaConfig,
    path: &str,
) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| env::var(env::CHECKPOINT_TYPE))
        .or_else(|| config.checkpoint_format_for(path).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string())
}

/// Look up a checkpoint format by name.
pub fn get_checkpoint_handler(name: &str) -> Result<Box<dyn CheckpointFormat>> {
    match name {
        flat::NAME => Ok(Box::new(flat::FlatCheckpoint)),
        json::NAME => Ok(Box::new(json::JsonCheckpoint)),
        other => Err(ThetaError::UnknownPlugin {
            kind: "checkpoint",
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut ckpt = Checkpoint::new();
        ckpt.insert(
            ParamName::from_path("a"),
            Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        ckpt.insert(
            ParamName::from_path("b/c"),
            Tensor::from_f64(vec![2, 2], &[0.0, 0.0, 0.0, 0.0]).unwrap(),
        );
        ckpt
    }

    #[test]
    fn flat_round_trip() {
        let ckpt = sample();
        let mut bytes = Vec::new();
        flat::FlatCheckpoint.save(&ckpt, &mut bytes).unwrap();
        let loaded = flat::FlatCheckpoint.load(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[test]
    fn json_round_trip() {
        let ckpt = sample();
        let mut bytes = Vec::new();
        json::JsonCheckpoint.save(&ckpt, &mut bytes).unwrap();
        let loaded = json::JsonCheckpoint.load(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(flat::FlatCheckpoint.load(&mut &b"nope"[..]).is_err());
        assert!(json::JsonCheckpoint.load(&mut &b"nope"[..]).is_err());
    }

    #[test]
    fn handler_name_precedence() {
        let mut config = ThetaConfig::default();
        config.set_pattern("*.ckpt", "json");
        assert_eq!(
            get_checkpoint_handler_name(Some("flat"), &config, "m.ckpt"),
            "flat"
        );
        assert_eq!(
            get_checkpoint_handler_name(None, &config, "m.ckpt"),
            "json"
        );
        assert_eq!(
            get_checkpoint_handler_name(None, &config, "other.bin"),
            "flat"
        );
    }

    #[test]
    fn unknown_handler_is_an_error() {
        assert!(matches!(
            get_checkpoint_handler("pickle"),
            Err(ThetaError::UnknownPlugin { .. })
        ));
    }
}
