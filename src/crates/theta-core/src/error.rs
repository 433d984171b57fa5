//! Error types for the clean/smudge pipeline.
//!
//! One enum spans the whole taxonomy: configuration, decode, integrity,
//! missing data, plug-in, and transient subprocess failures. Any error in any
//! per-parameter task aborts the enclosing clean or smudge and surfaces as a
//! non-zero filter exit.

use thiserror::Error;

/// Result type for git-theta operations
pub type Result<T> = std::result::Result<T, ThetaError>;

/// Errors that can occur across the git-theta pipeline
#[derive(Error, Debug)]
pub enum ThetaError {
    /// Malformed configuration file, bad value, or conflicting attributes
    #[error("Configuration error: {0}")]
    Config(String),

    /// A plug-in name that no registry entry matches
    #[error("Unknown {kind} plug-in: {name:?}")]
    UnknownPlugin {
        /// Plug-in category (update, checkpoint, merge)
        kind: &'static str,
        name: String,
    },

    /// Bad metadata JSON or a malformed parameter record
    #[error("Failed to decode metadata{}: {reason}", fmt_ctx(.path, .param))]
    MetadataDecode {
        path: Option<String>,
        param: Option<String>,
        reason: String,
    },

    /// A pointer document that does not match the strict pointer grammar
    #[error("Failed to parse object-store pointer: {0:?}")]
    PointerParse(String),

    /// Signature length, OID, or commit hash failed validation
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// An incremental update was selected but no previous value exists
    #[error("No previous value for parameter '{param}'")]
    MissingPreviousValue { param: String },

    /// The object store does not know the requested OID
    #[error("Object {oid} not found in the object store")]
    ObjectNotFound { oid: String },

    /// The object-store subprocess could not be reached or exited non-zero
    #[error("Object store unavailable: {0}")]
    ObjectStoreUnavailable(String),

    /// A git plumbing command failed
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// A user plug-in failed; wrapped with plug-in and parameter names
    #[error("Update plug-in '{plugin}' failed on parameter '{param}': {source}")]
    Plugin {
        plugin: String,
        param: String,
        #[source]
        source: Box<ThetaError>,
    },

    /// Tensor encode/decode error
    #[error(transparent)]
    Tensor(#[from] theta_tensor::TensorError),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_ctx(path: &Option<String>, param: &Option<String>) -> String {
    match (path, param) {
        (Some(p), Some(k)) => format!(" at {p} (parameter '{k}')"),
        (Some(p), None) => format!(" at {p}"),
        (None, Some(k)) => format!(" (parameter '{k}')"),
        (None, None) => String::new(),
    }
}

impl ThetaError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a metadata decode error with optional path/parameter context
    pub fn metadata_decode(
        path: Option<&str>,
        param: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MetadataDecode {
            path: path.map(str::to_string),
            param: param.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Wrap a plug-in failure with the plug-in and parameter names
    pub fn plugin(plugin: impl Into<String>, param: impl std::fmt::Display, source: ThetaError) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            param: param.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_error_carries_context() {
        let inner = ThetaError::MissingPreviousValue {
            param: "layers/0/weight".to_string(),
        };
        let err = ThetaError::plugin("sparse", "layers/0/weight", inner);
        let msg = err.to_string();
        assert!(msg.contains("sparse"));
        assert!(msg.contains("layers/0/weight"));
    }

    #[test]
    fn decode_context_formats() {
        let err = ThetaError::metadata_decode(Some("model.ckpt"), Some("a"), "bad json");
        assert_eq!(
            err.to_string(),
            "Failed to decode metadata at model.ckpt (parameter 'a'): bad json"
        );
    }
}
