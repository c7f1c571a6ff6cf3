pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ConfigError, ErrorClass, InfuseError, SamplerError};
pub use types::{BoundingBox, InfuseRequest, ResolvedTransform, SampleResult, Transform};
