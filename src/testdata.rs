//! Deterministic in-memory fixtures shared by unit and integration tests.
//!
//! [`RasterCubeSource`] synthesizes scene stacks whose values depend only on
//! the day offset and band, so the main and auxiliary requests see the same
//! field regardless of resolution. [`ThresholdClassifier`] flags a pixel
//! cloudy when band 0 exceeds the configured threshold, which pairs with the
//! source marking whole scenes cloudy through band 0.

use crate::core::cloud_mask::CloudClassifier;
use crate::io::source::{RasterSource, SceneRequest, SceneStack};
use crate::types::{
    AcquisitionSettings, CloudDetectionSettings, GapfillResult, SceneCube, SceneMasks,
};
use chrono::NaiveDate;
use ndarray::{Array3, Array4};
use std::cell::Cell;
use std::collections::BTreeSet;

/// Band-0 value of scenes marked cloudy; far above any classifier threshold.
pub const CLOUDY_BAND0: f32 = 0.95;

/// Reflectance of a clear pixel: linear in the day offset, shifted per band.
/// Band 0 stays below the default cloud threshold for any day in a year.
pub fn clear_value(day: usize, band: usize) -> f32 {
    0.1 + 0.0005 * day as f32 + 0.07 * band as f32
}

/// Synthetic raster source covering a fixed ground span.
///
/// Grid size is derived from the requested resolution, so a coarser auxiliary
/// request automatically gets a smaller grid over the same span. Scene dates
/// outside the requested window are filtered like a real catalogue would.
pub struct RasterCubeSource {
    span_x_m: u32,
    span_y_m: u32,
    bands: usize,
    dates: Vec<NaiveDate>,
    cloudy: BTreeSet<usize>,
    fetches: Cell<usize>,
}

impl RasterCubeSource {
    pub fn new(span_x_m: u32, span_y_m: u32, bands: usize, dates: Vec<NaiveDate>) -> Self {
        Self {
            span_x_m,
            span_y_m,
            bands,
            dates,
            cloudy: BTreeSet::new(),
            fetches: Cell::new(0),
        }
    }

    /// Mark scenes (by position in the date list) as fully cloud-covered.
    pub fn with_cloudy_scenes(mut self, scenes: impl IntoIterator<Item = usize>) -> Self {
        self.cloudy = scenes.into_iter().collect();
        self
    }

    /// How many times `fetch` ran, over all requests.
    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }

    fn grid_len(span_m: u32, res_m: u32) -> usize {
        (span_m as usize).div_ceil(res_m.max(1) as usize)
    }
}

impl RasterSource for RasterCubeSource {
    fn fetch(&self, request: &SceneRequest) -> GapfillResult<SceneStack> {
        self.fetches.set(self.fetches.get() + 1);
        let rows = Self::grid_len(self.span_y_m, request.res_y);
        let cols = Self::grid_len(self.span_x_m, request.res_x);

        let selected: Vec<(usize, NaiveDate)> = self
            .dates
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, date)| *date >= request.start_date && *date < request.end_date)
            .collect();

        let cube = Array4::from_shape_fn(
            (selected.len(), rows, cols, self.bands),
            |(scene, _, _, band)| {
                let (index, date) = selected[scene];
                let day = (date - request.start_date).num_days().max(0) as usize;
                if band == 0 && self.cloudy.contains(&index) {
                    CLOUDY_BAND0
                } else {
                    clear_value(day, band)
                }
            },
        );
        Ok(SceneStack::new(
            selected.iter().map(|&(_, date)| date).collect(),
            cube,
        ))
    }
}

/// Flags a pixel cloudy when band 0 exceeds the settings threshold.
pub struct ThresholdClassifier;

impl CloudClassifier for ThresholdClassifier {
    fn classify(
        &self,
        aux: &SceneCube,
        settings: &CloudDetectionSettings,
    ) -> GapfillResult<SceneMasks> {
        let (scenes, rows, cols, _) = aux.dim();
        Ok(Array3::from_shape_fn((scenes, rows, cols), |(s, r, c)| {
            aux[(s, r, c, 0)] > settings.threshold
        }))
    }
}

/// Dates at the given day offsets from `start`.
pub fn dates_at(start: NaiveDate, offsets: &[i64]) -> Vec<NaiveDate> {
    offsets
        .iter()
        .map(|&offset| start + chrono::Duration::days(offset))
        .collect()
}

/// Compact settings for fast builds: a 5x5 grid at 60 m over a 20-day range
/// in 5-day chunks, rooted inside `root` so temporary directories clean
/// everything up.
pub fn small_settings(root: &std::path::Path) -> AcquisitionSettings {
    AcquisitionSettings {
        start_date: NaiveDate::from_ymd_opt(2017, 1, 1).expect("valid date"),
        end_date: NaiveDate::from_ymd_opt(2017, 1, 21).expect("valid date"),
        days_per_chunk: 5,
        data_folder: root.join("data"),
        stream_root: root.join("stream_data"),
        ..AcquisitionSettings::default()
    }
}

/// Ground span matching [`small_settings`]: 5x5 main pixels at 60 m.
pub const SMALL_SPAN_M: u32 = 300;
