//! gapfill: A Memory-Bounded Gap-Filler for Satellite Image Time Series
//!
//! This library reconstructs a dense daily image series from sparse,
//! cloud-affected acquisitions. Each pixel-band series is modeled over time
//! (natural cubic spline or Gaussian-process regression), persisted in fixed
//! day chunks, and streamed frame by frame to a consumer.

pub mod core;
pub mod io;
pub mod publish;
pub mod testdata;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    AcquisitionSettings, BoundingBox, CancelToken, CloudDetectionSettings, CoordinateReference,
    DayFrame, DuplicatePolicy, GapfillError, GapfillResult, ReconstructionVariant, SceneCube,
    SceneMasks, NO_DATA,
};

pub use crate::core::{
    BuildReport, CloudClassifier, CloudMaskBuilder, CubicSpline, DatasetPipeline, KrigingModel,
    KrigingParams, ModelerParams, TemporalModeler, Tiler,
};

pub use io::{
    CachingSource, DatasetStore, Frame, FrameSeries, FrameStore, FrameSummary, RasterSource,
    SceneEncoding, SceneRequest, SceneStack,
};

pub use publish::{
    FrameRecord, FrameSerializer, FrameStreamer, JsonFrameSerializer, MessageBus, StreamerParams,
};
