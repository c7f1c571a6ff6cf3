pub mod bbox;
pub mod compose;
pub mod encode;
pub mod mask;
pub mod transform;

pub use bbox::{BboxCalculator, BboxPolicy};
pub use compose::{BatchComposer, ConditioningBatch};
pub use encode::ResultEncoder;
pub use mask::{Mask, MaskExtractor};
pub use transform::{CoordinateScale, TransformResolver};
