//! Acquisition and persistence modules

pub mod reader;
pub mod source;
pub mod store;

// Re-export main types
pub use reader::{Frame, FrameSeries, FrameStore, FrameSummary};
pub use source::{CachingSource, RasterSource, SceneEncoding, SceneRequest, SceneStack};
pub use store::DatasetStore;
