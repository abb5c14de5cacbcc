use chrono::NaiveDate;
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reflectance value for one pixel in one spectral band
pub type Reflectance = f32;

/// 4-D stack of raw acquisitions (scene x row x col x band)
pub type SceneCube = Array4<Reflectance>;

/// Per-scene boolean cloud masks on the main grid (scene x row x col), true = obscured
pub type SceneMasks = Array3<bool>;

/// One reconstructed day over the full grid (row x col x band)
pub type DayFrame = Array3<Reflectance>;

/// Dense series for a single spatial row (day x col x band)
pub type RowSeries = Array3<Reflectance>;

/// One stored chunk of consecutive reconstructed days (day x row x col x band)
pub type DaySlice = Array4<Reflectance>;

/// Sentinel written wherever no reconstructed value exists (masked-copy gaps,
/// degenerate pixel fits). Consumers must filter non-finite values before
/// aggregating.
pub const NO_DATA: Reflectance = f32::NAN;

/// Coordinate reference for bounding boxes and requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinateReference {
    /// Geographic lon/lat degrees (EPSG:4326)
    Wgs84,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

impl std::fmt::Display for CoordinateReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinateReference::Wgs84 => write!(f, "WGS84"),
            CoordinateReference::Projected { epsg } => write!(f, "EPSG:{}", epsg),
        }
    }
}

/// Geographic bounding box of the area of interest
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// Width in degrees longitude
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    /// Height in degrees latitude
    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        // Tulip-field test area in Noord-Holland, the historical default AOI
        Self::new(
            4.710_388_183_593_75,
            4.798_278_808_593_751,
            52.899_065_938_457_27,
            52.952_050_981_505_24,
        )
    }
}

/// Which same-day scene survives deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Keep the earliest scene of each calendar date
    #[default]
    KeepFirst,
    /// Keep the latest scene of each calendar date
    KeepLast,
}

/// Temporal reconstruction strategy for a pixel-band series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconstructionVariant {
    /// Exact natural cubic interpolant through all valid samples
    Spline,
    /// Gaussian-process regression with a fixed RBF kernel
    NonParametric,
}

impl ReconstructionVariant {
    /// Directory name under `full_data/`; stays `kriging` for the
    /// non-parametric variant so existing datasets keep reading.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ReconstructionVariant::Spline => "spline",
            ReconstructionVariant::NonParametric => "kriging",
        }
    }
}

impl std::fmt::Display for ReconstructionVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Cloud detection tuning, forwarded to the scene classifier.
///
/// `scale_x`/`scale_y` downscale the classified cube relative to the main grid
/// (classifying at full resolution is far too slow); the resulting masks are
/// block-replicated back up to the main grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDetectionSettings {
    /// Classification probability threshold
    pub threshold: f32,
    /// Temporal averaging window, in scenes
    pub average_over: usize,
    /// Mask dilation radius, in classifier pixels
    pub dilation_size: usize,
    /// Spatial downscale factor along columns (>= 1)
    pub scale_x: usize,
    /// Spatial downscale factor along rows (>= 1)
    pub scale_y: usize,
}

impl Default for CloudDetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            average_over: 4,
            dilation_size: 2,
            scale_x: 6,
            scale_y: 6,
        }
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date literal")
}

fn default_stream_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("gapfill").join("stream_data"))
        .unwrap_or_else(|| PathBuf::from("stream_data"))
}

/// Main settings type: customizes data acquisition and on-disk persistence.
///
/// All fields have named defaults; the service credential is never baked in and
/// must come from the environment, a config file, or the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Area of interest
    pub bbox: BoundingBox,
    /// Coordinate reference of `bbox`
    pub crs: CoordinateReference,
    /// First reconstructed day (inclusive)
    pub start_date: NaiveDate,
    /// One past the last reconstructed day (exclusive)
    pub end_date: NaiveDate,
    /// Main-grid resolution along columns, metres per pixel (> 0)
    pub res_x: u32,
    /// Main-grid resolution along rows, metres per pixel (> 0)
    pub res_y: u32,
    /// true = fit temporal models; false = masked copy with `NO_DATA` gaps
    pub interpolate: bool,
    /// Bypass the source's scene cache and fetch fresh imagery
    pub redownload: bool,
    /// Which same-day scene survives deduplication
    pub duplicate_policy: DuplicatePolicy,
    /// Reconstruction variants to compute and persist
    pub variants: Vec<ReconstructionVariant>,
    /// Days per stored chunk (>= 1); the last chunk may be short
    pub days_per_chunk: usize,
    /// Deadline for one external fetch; enforced by the source implementation
    pub request_timeout: Duration,
    /// Scratch folder handed to the raster source for raw-scene caching
    pub data_folder: PathBuf,
    /// Root folder for reconstructed datasets (one subfolder per dataset name)
    pub stream_root: PathBuf,
    /// Service credential for the raster source, if it requires one
    pub credential: Option<String>,
    /// Cloud detection tuning
    pub cloud_detection: CloudDetectionSettings,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            bbox: BoundingBox::default(),
            crs: CoordinateReference::Wgs84,
            start_date: ymd(2017, 1, 1),
            end_date: ymd(2017, 12, 31),
            res_x: 60,
            res_y: 60,
            interpolate: true,
            redownload: false,
            duplicate_policy: DuplicatePolicy::default(),
            variants: vec![
                ReconstructionVariant::Spline,
                ReconstructionVariant::NonParametric,
            ],
            days_per_chunk: 50,
            request_timeout: Duration::from_secs(60),
            data_folder: PathBuf::from("data"),
            stream_root: default_stream_root(),
            credential: None,
            cloud_detection: CloudDetectionSettings::default(),
        }
    }
}

impl AcquisitionSettings {
    /// Defaults with the credential and folder overrides drawn from the
    /// process environment (`GAPFILL_INSTANCE_ID`, `GAPFILL_DATA_FOLDER`,
    /// `GAPFILL_STREAM_ROOT`).
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(id) = std::env::var("GAPFILL_INSTANCE_ID") {
            if !id.is_empty() {
                settings.credential = Some(id);
            }
        }
        if let Ok(folder) = std::env::var("GAPFILL_DATA_FOLDER") {
            if !folder.is_empty() {
                settings.data_folder = PathBuf::from(folder);
            }
        }
        if let Ok(root) = std::env::var("GAPFILL_STREAM_ROOT") {
            if !root.is_empty() {
                settings.stream_root = PathBuf::from(root);
            }
        }
        settings
    }

    /// Check the structural invariants before any acquisition work starts.
    pub fn validate(&self) -> GapfillResult<()> {
        if self.res_x == 0 || self.res_y == 0 {
            return Err(GapfillError::InvalidSettings(format!(
                "resolution must be positive, got {}x{} m",
                self.res_x, self.res_y
            )));
        }
        let cd = &self.cloud_detection;
        if cd.scale_x == 0 || cd.scale_y == 0 {
            return Err(GapfillError::InvalidSettings(format!(
                "cloud downscale factors must be >= 1, got {}x{}",
                cd.scale_x, cd.scale_y
            )));
        }
        if self.start_date >= self.end_date {
            return Err(GapfillError::InvalidSettings(format!(
                "start date {} must precede end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.days_per_chunk == 0 {
            return Err(GapfillError::InvalidSettings(
                "chunk size must be at least one day".to_string(),
            ));
        }
        if self.variants.is_empty() {
            return Err(GapfillError::InvalidSettings(
                "at least one reconstruction variant must be selected".to_string(),
            ));
        }
        for (i, variant) in self.variants.iter().enumerate() {
            if self.variants[..i].contains(variant) {
                return Err(GapfillError::InvalidSettings(format!(
                    "variant `{}` selected more than once",
                    variant
                )));
            }
        }
        if !self.interpolate
            && self
                .variants
                .contains(&ReconstructionVariant::NonParametric)
        {
            return Err(GapfillError::InvalidSettings(
                "masked-copy mode produces only the spline variant; \
                 deselect the non-parametric variant or enable interpolation"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Number of days in the reconstruction range (end exclusive).
    pub fn total_days(&self) -> usize {
        (self.end_date - self.start_date).num_days().max(0) as usize
    }

    /// Calendar date of every reconstructed day, in day-index order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.total_days() as i64)
            .map(|offset| self.start_date + chrono::Duration::days(offset))
            .collect()
    }
}

/// Cooperative cancellation shared between a pipeline and its caller.
///
/// Checked between pixel-row units of work and between published day-frames;
/// one external call already in flight is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error out of the current stage if cancellation was requested.
    pub fn check(&self, stage: &'static str) -> GapfillResult<()> {
        if self.is_cancelled() {
            Err(GapfillError::Cancelled { stage })
        } else {
            Ok(())
        }
    }
}

/// Error types for the gap-filling pipeline
#[derive(Debug, thiserror::Error)]
pub enum GapfillError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("acquisition failed during {stage}: {detail}")]
    Acquisition { stage: String, detail: String },

    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("degenerate series: {valid} valid sample(s), {required} required")]
    DegenerateSeries { valid: usize, required: usize },

    #[error("dataset `{dataset}` is not ready: {detail}")]
    NotReady { dataset: String, detail: String },

    #[error("day index {index} out of range for {len} day(s)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("persistence failure at {path}: {detail}")]
    Persistence { path: PathBuf, detail: String },

    #[error("delivery of day {day} failed after {attempts} attempt(s): {detail}")]
    Delivery {
        day: usize,
        attempts: u32,
        detail: String,
    },

    #[error("cancelled during {stage}")]
    Cancelled { stage: &'static str },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for gap-filling operations
pub type GapfillResult<T> = Result<T, GapfillError>;
