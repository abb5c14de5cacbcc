//! Raster acquisition boundary.
//!
//! The engine never talks to an imagery service directly. It builds a
//! [`SceneRequest`] from the acquisition settings and hands it to whatever
//! [`RasterSource`] the caller injects; [`CachingSource`] wraps any source
//! with an on-disk scene cache so repeated builds skip the fetch.

use crate::io::store::{read_npy_file, write_npy_file};
use crate::types::{
    AcquisitionSettings, BoundingBox, CoordinateReference, DuplicatePolicy, GapfillError,
    GapfillResult, SceneCube,
};
use chrono::NaiveDate;
use ndarray::Axis;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sample encoding the service should ship scenes in. Sources decode into
/// `f32` either way; the tag only picks the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SceneEncoding {
    /// 32-bit float reflectance, the engine's native unit
    #[default]
    Float32,
    /// Scaled 16-bit integers, for services that only ship quantized data
    Uint16,
}

/// One acquisition request: where, when and how finely to sample.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SceneRequest {
    pub bbox: BoundingBox,
    pub crs: CoordinateReference,
    /// First date of interest (inclusive)
    pub start_date: NaiveDate,
    /// One past the last date of interest (exclusive)
    pub end_date: NaiveDate,
    /// Metres per pixel along columns
    pub res_x: u32,
    /// Metres per pixel along rows
    pub res_y: u32,
    /// Wire format requested from the service
    pub encoding: SceneEncoding,
    /// Bypass any scene cache and fetch fresh imagery
    pub redownload: bool,
    /// Deadline for the fetch; an expired call is a failure, not retried
    pub timeout: Duration,
}

impl SceneRequest {
    /// Main-grid request matching the acquisition settings.
    pub fn from_settings(settings: &AcquisitionSettings) -> Self {
        Self {
            bbox: settings.bbox,
            crs: settings.crs,
            start_date: settings.start_date,
            end_date: settings.end_date,
            res_x: settings.res_x,
            res_y: settings.res_y,
            encoding: SceneEncoding::default(),
            redownload: settings.redownload,
            timeout: settings.request_timeout,
        }
    }

    /// Same request at a different resolution, used for the auxiliary cloud
    /// cube.
    pub fn with_resolution(mut self, res_x: u32, res_y: u32) -> Self {
        self.res_x = res_x;
        self.res_y = res_y;
        self
    }
}

/// Scene stack returned by a source: one cube layer per acquisition date.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneStack {
    /// Acquisition date of each scene, ascending (duplicates allowed)
    pub dates: Vec<NaiveDate>,
    /// Scene x row x col x band
    pub cube: SceneCube,
}

impl SceneStack {
    pub fn new(dates: Vec<NaiveDate>, cube: SceneCube) -> Self {
        Self { dates, cube }
    }

    pub fn scene_count(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Structural invariants every source must deliver: one date per scene
    /// layer, dates ascending.
    pub fn validate(&self) -> GapfillResult<()> {
        if self.dates.len() != self.cube.dim().0 {
            return Err(GapfillError::ShapeMismatch {
                what: "scene stack".to_string(),
                expected: format!("{} scene layer(s)", self.dates.len()),
                actual: format!("{} scene layer(s)", self.cube.dim().0),
            });
        }
        if self.dates.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(GapfillError::Acquisition {
                stage: "scene listing".to_string(),
                detail: "scene dates are not in ascending order".to_string(),
            });
        }
        Ok(())
    }

    /// Collapse runs of scenes sharing a calendar date, keeping the first or
    /// last of each run per policy.
    pub fn deduplicate(&self, policy: DuplicatePolicy) -> SceneStack {
        let mut keep: Vec<usize> = Vec::with_capacity(self.dates.len());
        for (index, date) in self.dates.iter().enumerate() {
            match keep.last().copied() {
                Some(prev) if self.dates[prev] == *date => {
                    if policy == DuplicatePolicy::KeepLast {
                        if let Some(slot) = keep.last_mut() {
                            *slot = index;
                        }
                    }
                }
                _ => keep.push(index),
            }
        }
        if keep.len() < self.dates.len() {
            log::debug!(
                "Deduplicated {} scene(s) down to {} distinct date(s)",
                self.dates.len(),
                keep.len()
            );
        }
        SceneStack {
            dates: keep.iter().map(|&i| self.dates[i]).collect(),
            cube: self.cube.select(Axis(0), &keep),
        }
    }

    /// Drop scenes dated outside `[start, start + total_days)`. Catalogues
    /// occasionally return boundary scenes a day outside the requested window.
    pub fn clipped(self, start: NaiveDate, total_days: usize) -> SceneStack {
        let keep: Vec<usize> = self
            .dates
            .iter()
            .enumerate()
            .filter(|(_, &date)| {
                let offset = (date - start).num_days();
                offset >= 0 && (offset as usize) < total_days
            })
            .map(|(index, _)| index)
            .collect();
        if keep.len() == self.dates.len() {
            return self;
        }
        log::warn!(
            "Dropping {} scene(s) dated outside the reconstruction range",
            self.dates.len() - keep.len()
        );
        SceneStack {
            dates: keep.iter().map(|&i| self.dates[i]).collect(),
            cube: self.cube.select(Axis(0), &keep),
        }
    }

    /// Day offset of every scene relative to `start`.
    pub fn day_offsets(&self, start: NaiveDate) -> GapfillResult<Vec<usize>> {
        self.dates
            .iter()
            .map(|&date| {
                let offset = (date - start).num_days();
                if offset < 0 {
                    Err(GapfillError::Acquisition {
                        stage: "date indexing".to_string(),
                        detail: format!("scene date {} precedes range start {}", date, start),
                    })
                } else {
                    Ok(offset as usize)
                }
            })
            .collect()
    }
}

/// Supplier of cloud-affected scene stacks for a request.
///
/// Implementations own the network call and must enforce `request.timeout`.
pub trait RasterSource {
    fn fetch(&self, request: &SceneRequest) -> GapfillResult<SceneStack>;
}

/// Shared and boxed sources behave like the source itself, so one catalogue
/// handle can back several pipelines.
impl<S: RasterSource + ?Sized> RasterSource for std::sync::Arc<S> {
    fn fetch(&self, request: &SceneRequest) -> GapfillResult<SceneStack> {
        (**self).fetch(request)
    }
}

impl<S: RasterSource + ?Sized> RasterSource for Box<S> {
    fn fetch(&self, request: &SceneRequest) -> GapfillResult<SceneStack> {
        (**self).fetch(request)
    }
}

/// Wraps a source with an on-disk cache keyed by the request geometry.
///
/// A cached stack is reused unless the request asks for a redownload; an
/// unreadable cache entry is discarded and refetched rather than failing the
/// build.
pub struct CachingSource<S> {
    inner: S,
    cache_dir: PathBuf,
}

impl<S: RasterSource> CachingSource<S> {
    pub fn new(inner: S, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
        }
    }

    fn cube_path(&self, request: &SceneRequest) -> PathBuf {
        self.cache_dir.join(format!("{}.npy", cache_stem(request)))
    }

    fn dates_path(&self, request: &SceneRequest) -> PathBuf {
        self.cache_dir.join(format!("{}.json", cache_stem(request)))
    }

    fn load_cached(&self, cube_path: &Path, dates_path: &Path) -> GapfillResult<SceneStack> {
        let cube: SceneCube = read_npy_file(cube_path)?;
        let file = fs::File::open(dates_path)
            .map_err(|err| cache_error(dates_path, err))?;
        let dates: Vec<NaiveDate> =
            serde_json::from_reader(file).map_err(|err| cache_error(dates_path, err))?;
        let stack = SceneStack::new(dates, cube);
        stack.validate()?;
        Ok(stack)
    }

    fn save_cached(&self, stack: &SceneStack, request: &SceneRequest) -> GapfillResult<()> {
        write_npy_file(&self.cube_path(request), &stack.cube)?;
        let dates_path = self.dates_path(request);
        let file = fs::File::create(&dates_path)
            .map_err(|err| cache_error(&dates_path, err))?;
        serde_json::to_writer(file, &stack.dates)
            .map_err(|err| cache_error(&dates_path, err))
    }
}

impl<S: RasterSource> RasterSource for CachingSource<S> {
    fn fetch(&self, request: &SceneRequest) -> GapfillResult<SceneStack> {
        let cube_path = self.cube_path(request);
        let dates_path = self.dates_path(request);

        if !request.redownload && cube_path.exists() && dates_path.exists() {
            match self.load_cached(&cube_path, &dates_path) {
                Ok(stack) => {
                    log::debug!(
                        "Using {} cached scene(s) from {}",
                        stack.scene_count(),
                        cube_path.display()
                    );
                    return Ok(stack);
                }
                Err(err) => {
                    log::warn!(
                        "Discarding unreadable scene cache {}: {}",
                        cube_path.display(),
                        err
                    );
                }
            }
        }

        let stack = self.inner.fetch(request)?;
        stack.validate()?;
        self.save_cached(&stack, request)?;
        log::info!(
            "Fetched and cached {} scene(s) at {}x{} m",
            stack.scene_count(),
            request.res_x,
            request.res_y
        );
        Ok(stack)
    }
}

fn cache_stem(request: &SceneRequest) -> String {
    let crs = match request.crs {
        CoordinateReference::Wgs84 => "wgs84".to_string(),
        CoordinateReference::Projected { epsg } => format!("epsg{}", epsg),
    };
    let encoding = match request.encoding {
        SceneEncoding::Float32 => "f32",
        SceneEncoding::Uint16 => "u16",
    };
    format!(
        "scenes_{}_{}_{}x{}m_{:.6}_{:.6}_{:.6}_{:.6}_{}_{}",
        request.start_date,
        request.end_date,
        request.res_x,
        request.res_y,
        request.bbox.min_lon,
        request.bbox.min_lat,
        request.bbox.max_lon,
        request.bbox.max_lat,
        crs,
        encoding
    )
}

fn cache_error(path: &Path, err: impl std::fmt::Display) -> GapfillError {
    GapfillError::Persistence {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 1, day).unwrap()
    }

    /// Each scene layer is filled with its own index so selections are
    /// recognizable after deduplication.
    fn stack(dates: Vec<NaiveDate>) -> SceneStack {
        let scenes = dates.len();
        let cube = Array4::from_shape_fn((scenes, 2, 2, 1), |(s, _, _, _)| s as f32);
        SceneStack::new(dates, cube)
    }

    struct CountingSource {
        dates: Vec<NaiveDate>,
        fetches: Cell<usize>,
    }

    impl CountingSource {
        fn new(dates: Vec<NaiveDate>) -> Self {
            Self {
                dates,
                fetches: Cell::new(0),
            }
        }
    }

    impl RasterSource for CountingSource {
        fn fetch(&self, _request: &SceneRequest) -> GapfillResult<SceneStack> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(stack(self.dates.clone()))
        }
    }

    #[test]
    fn validate_rejects_inconsistent_stacks() {
        let mut bad_count = stack(vec![date(1), date(2)]);
        bad_count.dates.pop();
        assert!(matches!(
            bad_count.validate(),
            Err(GapfillError::ShapeMismatch { .. })
        ));

        let descending = stack(vec![date(5), date(2)]);
        assert!(matches!(
            descending.validate(),
            Err(GapfillError::Acquisition { .. })
        ));
    }

    #[test]
    fn duplicate_runs_collapse_per_policy() {
        let stack = stack(vec![date(1), date(3), date(3), date(3), date(7)]);

        let first = stack.deduplicate(DuplicatePolicy::KeepFirst);
        assert_eq!(first.dates, vec![date(1), date(3), date(7)]);
        assert_eq!(first.cube[(1, 0, 0, 0)], 1.0);

        let last = stack.deduplicate(DuplicatePolicy::KeepLast);
        assert_eq!(last.dates, vec![date(1), date(3), date(7)]);
        assert_eq!(last.cube[(1, 0, 0, 0)], 3.0);
    }

    #[test]
    fn day_offsets_are_relative_to_range_start() {
        let stack = stack(vec![date(1), date(15)]);
        assert_eq!(stack.day_offsets(date(1)).unwrap(), vec![0, 14]);
        assert!(stack.day_offsets(date(2)).is_err());
    }

    #[test]
    fn clipping_drops_boundary_scenes() {
        let full = stack(vec![date(1), date(5), date(20)]);
        let clipped = full.clipped(date(2), 10);
        assert_eq!(clipped.dates, vec![date(5)]);
        assert_eq!(clipped.cube.dim().0, 1);
        assert_eq!(clipped.cube[(0, 0, 0, 0)], 1.0);
    }

    #[test]
    fn cache_serves_repeat_requests_without_refetching() {
        let dir = tempdir().unwrap();
        let source = CachingSource::new(
            CountingSource::new(vec![date(1), date(9)]),
            dir.path(),
        );
        let request = SceneRequest::from_settings(&AcquisitionSettings::default());

        let fetched = source.fetch(&request).unwrap();
        assert_eq!(source.inner.fetches.get(), 1);

        let cached = source.fetch(&request).unwrap();
        assert_eq!(source.inner.fetches.get(), 1);
        assert_eq!(cached, fetched);
    }

    #[test]
    fn redownload_bypasses_the_cache() {
        let dir = tempdir().unwrap();
        let source = CachingSource::new(CountingSource::new(vec![date(1)]), dir.path());
        let mut request = SceneRequest::from_settings(&AcquisitionSettings::default());

        source.fetch(&request).unwrap();
        request.redownload = true;
        source.fetch(&request).unwrap();
        assert_eq!(source.inner.fetches.get(), 2);
    }

    #[test]
    fn corrupt_cache_entries_are_refetched() {
        let dir = tempdir().unwrap();
        let source = CachingSource::new(CountingSource::new(vec![date(1)]), dir.path());
        let request = SceneRequest::from_settings(&AcquisitionSettings::default());

        source.fetch(&request).unwrap();
        std::fs::write(source.cube_path(&request), b"not an npy file").unwrap();
        let stack = source.fetch(&request).unwrap();
        assert_eq!(source.inner.fetches.get(), 2);
        assert_eq!(stack.scene_count(), 1);
    }

    #[test]
    fn aux_request_only_changes_resolution() {
        let settings = AcquisitionSettings::default();
        let main = SceneRequest::from_settings(&settings);
        let aux = main.clone().with_resolution(360, 360);
        assert_eq!(aux.res_x, 360);
        assert_eq!(aux.bbox, main.bbox);
        assert_eq!(aux.start_date, main.start_date);
    }
}
