//! Random and sequential access to a completed dataset.
//!
//! Opening derives the chunking from the files themselves, so any process can
//! read a dataset it did not build. Only whole-day frames are materialized;
//! a sequential [`FrameSeries`] keeps at most one chunk in memory.

use crate::io::store::DatasetStore;
use crate::types::{
    DayFrame, DaySlice, GapfillError, GapfillResult, ReconstructionVariant, Reflectance,
};
use chrono::NaiveDate;
use ndarray::Axis;

/// Mean and population standard deviation over the finite values of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSummary {
    pub mean: Reflectance,
    pub stddev: Reflectance,
}

/// One reconstructed day pulled from the store.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Day index within the dataset
    pub index: usize,
    /// Calendar date of the day
    pub date: NaiveDate,
    /// Row x col x band
    pub data: DayFrame,
}

impl Frame {
    /// Summarize the frame, skipping `NO_DATA` and other non-finite values.
    /// A frame with no finite values summarizes to NaN.
    pub fn summary(&self) -> FrameSummary {
        let mut count = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for &value in self.data.iter() {
            if value.is_finite() {
                count += 1;
                sum += value as f64;
                sum_sq += (value as f64) * (value as f64);
            }
        }
        if count == 0 {
            return FrameSummary {
                mean: f32::NAN,
                stddev: f32::NAN,
            };
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        FrameSummary {
            mean: mean as f32,
            stddev: variance.sqrt() as f32,
        }
    }
}

/// Reader over the final day slices of one reconstruction variant.
#[derive(Debug, Clone)]
pub struct FrameStore {
    store: DatasetStore,
    variant: ReconstructionVariant,
    dates: Vec<NaiveDate>,
    days_per_chunk: usize,
}

impl FrameStore {
    /// Open a completed dataset. Fails with [`GapfillError::NotReady`] until
    /// the builder has written the completion marker.
    pub fn open(store: DatasetStore, variant: ReconstructionVariant) -> GapfillResult<Self> {
        if !store.is_complete() {
            return Err(GapfillError::NotReady {
                dataset: store.name().to_string(),
                detail: "completion marker not written yet".to_string(),
            });
        }
        let dates = store.read_dates()?;

        // The first slice fixes the chunking for the whole dataset
        let days_per_chunk = if dates.is_empty() {
            1
        } else {
            if !store.slice_exists(variant, 0) {
                return Err(GapfillError::NotReady {
                    dataset: store.name().to_string(),
                    detail: format!("no day slices for the {} variant", variant),
                });
            }
            let first = store.read_slice(variant, 0)?;
            if first.dim().0 == 0 {
                return Err(GapfillError::NotReady {
                    dataset: store.name().to_string(),
                    detail: "first day slice is empty".to_string(),
                });
            }
            first.dim().0
        };

        log::debug!(
            "Opened dataset `{}` ({} variant): {} day(s) in chunks of {}",
            store.name(),
            variant,
            dates.len(),
            days_per_chunk
        );
        Ok(Self {
            store,
            variant,
            dates,
            days_per_chunk,
        })
    }

    /// Number of reconstructed days.
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn variant(&self) -> ReconstructionVariant {
        self.variant
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn date_of(&self, index: usize) -> GapfillResult<NaiveDate> {
        self.ensure_in_range(index)?;
        Ok(self.dates[index])
    }

    /// Load the frame for one day index.
    pub fn frame(&self, index: usize) -> GapfillResult<Frame> {
        self.ensure_in_range(index)?;
        let (chunk, offset) = self.locate(index);
        let slice = self.store.read_slice(self.variant, chunk)?;
        let data = self.extract(&slice, chunk, offset)?;
        Ok(Frame {
            index,
            date: self.dates[index],
            data,
        })
    }

    /// Iterate every frame from day 0.
    pub fn iter(&self) -> FrameSeries<'_> {
        self.iter_from(0)
    }

    /// Iterate frames starting at `start`, for resuming an interrupted
    /// consumer.
    pub fn iter_from(&self, start: usize) -> FrameSeries<'_> {
        FrameSeries {
            reader: self,
            next_index: start,
            cached: None,
        }
    }

    fn ensure_in_range(&self, index: usize) -> GapfillResult<()> {
        if index >= self.dates.len() {
            return Err(GapfillError::IndexOutOfRange {
                index,
                len: self.dates.len(),
            });
        }
        Ok(())
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.days_per_chunk, index % self.days_per_chunk)
    }

    fn extract(&self, slice: &DaySlice, chunk: usize, offset: usize) -> GapfillResult<DayFrame> {
        if offset >= slice.dim().0 {
            return Err(GapfillError::ShapeMismatch {
                what: format!("day slice {} of {}", chunk, self.variant),
                expected: format!("more than {} day(s)", offset),
                actual: format!("{} day(s)", slice.dim().0),
            });
        }
        Ok(slice.index_axis(Axis(0), offset).to_owned())
    }
}

/// Sequential frame iterator holding the most recent chunk in memory.
pub struct FrameSeries<'a> {
    reader: &'a FrameStore,
    next_index: usize,
    cached: Option<(usize, DaySlice)>,
}

impl FrameSeries<'_> {
    fn load(&mut self, index: usize) -> GapfillResult<Frame> {
        let (chunk, offset) = self.reader.locate(index);
        let slice = match self.cached.take() {
            Some((cached_chunk, slice)) if cached_chunk == chunk => slice,
            _ => self.reader.store.read_slice(self.reader.variant, chunk)?,
        };
        let data = self.reader.extract(&slice, chunk, offset);
        self.cached = Some((chunk, slice));
        Ok(Frame {
            index,
            date: self.reader.dates[index],
            data: data?,
        })
    }
}

impl Iterator for FrameSeries<'_> {
    type Item = GapfillResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.reader.len() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        Some(self.load(index))
    }
}
