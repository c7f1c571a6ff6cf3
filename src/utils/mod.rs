pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    bt601_luma,
    encode_png,
    encode_png_async,
    load_image_from_memory_async,
    png_data_url,
    // Rotation about the centre, frame expanded to fit
    rotate_expand,
    rotated_dimensions,
};
pub use metrics::{Metrics, MetricsSnapshot};
