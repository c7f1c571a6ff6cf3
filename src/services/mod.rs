pub mod onnx_builder; // Shared ONNX session builder
pub mod sampler;

// Re-export commonly used services
pub use sampler::{ObjectStitchModel, RandomSource, Sampler, SamplerAdapter, SeedPolicy};
