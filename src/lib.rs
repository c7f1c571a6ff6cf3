// Library exports for the infuse compositing service

// Core modules
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ConfigError, ErrorClass, InfuseError, SamplerError},
    types::{BoundingBox, InfuseRequest, ResolvedTransform, SampleResult, Transform},
};

pub use orchestration::InfuseOrchestrator;

pub use services::{ObjectStitchModel, RandomSource, Sampler, SeedPolicy};

pub use utils::{load_image_from_memory_async, Metrics};
