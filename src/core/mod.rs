//! Core gap-filling modules

pub mod cloud_mask;
pub mod kriging;
pub mod modeler;
pub mod pipeline;
pub mod spline;
pub mod tiling;

// Re-export main types
pub use cloud_mask::{CloudClassifier, CloudMaskBuilder};
pub use kriging::{KrigingModel, KrigingParams};
pub use modeler::{ModelerParams, RowModel, TemporalModeler};
pub use pipeline::{BuildReport, DatasetPipeline};
pub use spline::CubicSpline;
pub use tiling::Tiler;
