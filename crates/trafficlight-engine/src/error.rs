//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup and shutdown so
//! `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: trafficlight_core::ConfigError,
    },

    /// Program catalog construction failed.
    #[error("catalog error: {source}")]
    Catalog {
        /// The underlying catalog error.
        #[from]
        source: trafficlight_core::CatalogError,
    },

    /// A signal unit could not be created.
    #[error("unit error: {source}")]
    Unit {
        /// The underlying unit error.
        #[from]
        source: trafficlight_core::UnitError,
    },

    /// A conductor control call failed.
    #[error("conductor error: {source}")]
    Conductor {
        /// The underlying conductor error.
        #[from]
        source: trafficlight_core::ConductorError,
    },

    /// The final status could not be serialized.
    #[error("status serialization error: {source}")]
    Status {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}
