//! Two-phase chunked persistence of reconstructed series.
//!
//! Phase 1 walks the grid row by row, models each row and scatters its dense
//! series into per-chunk strip files. Phase 2 gathers the strips of one day
//! chunk across all rows into a single day-slice file. Peak memory stays at
//! one row series (phase 1) plus one day slice (phase 2) regardless of the
//! grid or range size.

use crate::core::modeler::TemporalModeler;
use crate::io::store::DatasetStore;
use crate::types::{
    CancelToken, GapfillError, GapfillResult, ReconstructionVariant, SceneCube, SceneMasks,
};
use ndarray::{s, Array4};
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Splits the day axis into fixed-size chunks and drives both phases.
#[derive(Debug, Clone)]
pub struct Tiler {
    total_days: usize,
    days_per_chunk: usize,
}

impl Tiler {
    pub fn new(total_days: usize, days_per_chunk: usize) -> GapfillResult<Self> {
        if days_per_chunk == 0 {
            return Err(GapfillError::InvalidSettings(
                "days per chunk must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            total_days,
            days_per_chunk,
        })
    }

    pub fn days_per_chunk(&self) -> usize {
        self.days_per_chunk
    }

    pub fn chunk_count(&self) -> usize {
        self.total_days.div_ceil(self.days_per_chunk)
    }

    /// Number of days stored in `chunk`; only the last chunk may be short.
    pub fn chunk_days(&self, chunk: usize) -> usize {
        let lo = chunk * self.days_per_chunk;
        self.days_per_chunk.min(self.total_days.saturating_sub(lo))
    }

    /// Chunk index and offset within it for a day index.
    pub fn locate_day(&self, day: usize) -> (usize, usize) {
        (day / self.days_per_chunk, day % self.days_per_chunk)
    }

    /// Phase 1: model every spatial row and persist its series as per-chunk
    /// strips. Rows are independent and processed in parallel when the
    /// `parallel` feature is enabled.
    ///
    /// Returns the number of pixel-band series left at `NO_DATA` because too
    /// few valid samples remained.
    pub fn build_strips(
        &self,
        store: &DatasetStore,
        modeler: &TemporalModeler,
        cube: &SceneCube,
        masks: &SceneMasks,
        cancel: &CancelToken,
    ) -> GapfillResult<usize> {
        let (scenes, rows, cols, bands) = cube.dim();
        if masks.dim() != (scenes, rows, cols) {
            return Err(GapfillError::ShapeMismatch {
                what: "cloud masks".to_string(),
                expected: format!("{}x{}x{}", scenes, rows, cols),
                actual: format!("{:?}", masks.dim()),
            });
        }
        if modeler.total_days() != self.total_days {
            return Err(GapfillError::ShapeMismatch {
                what: "modeler day range".to_string(),
                expected: format!("{} day(s)", self.total_days),
                actual: format!("{} day(s)", modeler.total_days()),
            });
        }

        log::info!(
            "Building strips: {} row(s) x {} chunk(s), {} band(s)",
            rows,
            self.chunk_count(),
            bands
        );

        let degenerate = AtomicUsize::new(0);

        #[cfg(feature = "parallel")]
        {
            (0..rows).into_par_iter().try_for_each(|row| -> GapfillResult<()> {
                cancel.check("strip building")?;
                let skipped = self.process_row(store, modeler, cube, masks, row)?;
                degenerate.fetch_add(skipped, Ordering::Relaxed);
                Ok(())
            })?;
        }

        #[cfg(not(feature = "parallel"))]
        for row in 0..rows {
            cancel.check("strip building")?;
            let skipped = self.process_row(store, modeler, cube, masks, row)?;
            degenerate.fetch_add(skipped, Ordering::Relaxed);
        }

        Ok(degenerate.into_inner())
    }

    fn process_row(
        &self,
        store: &DatasetStore,
        modeler: &TemporalModeler,
        cube: &SceneCube,
        masks: &SceneMasks,
        row: usize,
    ) -> GapfillResult<usize> {
        let model = modeler.model_row(
            cube.slice(s![.., row, .., ..]),
            masks.slice(s![.., row, ..]),
        )?;
        for (variant, series) in &model.series {
            for chunk in 0..self.chunk_count() {
                let lo = chunk * self.days_per_chunk;
                let hi = lo + self.chunk_days(chunk);
                store.write_strip(*variant, row, chunk, series.slice(s![lo..hi, .., ..]))?;
            }
        }
        log::debug!("Strips written for row {}", row);
        Ok(model.degenerate)
    }

    /// Phase 2: gather the strips of each chunk into a day-slice file, then
    /// drop the strips.
    ///
    /// A chunk whose final slice already exists is skipped, so an interrupted
    /// restructuring resumes where it stopped.
    pub fn restructure(
        &self,
        store: &DatasetStore,
        variants: &[ReconstructionVariant],
        rows: usize,
        cancel: &CancelToken,
    ) -> GapfillResult<()> {
        if rows == 0 {
            return Err(GapfillError::Processing(
                "restructuring needs at least one spatial row".to_string(),
            ));
        }

        for &variant in variants {
            log::info!(
                "Restructuring {} chunk(s) of the {} variant",
                self.chunk_count(),
                variant
            );
            for chunk in 0..self.chunk_count() {
                cancel.check("restructuring")?;
                if store.slice_exists(variant, chunk) {
                    log::debug!("Chunk {} of {} already restructured, skipping", chunk, variant);
                    continue;
                }
                self.assemble_chunk(store, variant, chunk, rows)?;
            }
            store.remove_strips(variant)?;
        }
        Ok(())
    }

    fn assemble_chunk(
        &self,
        store: &DatasetStore,
        variant: ReconstructionVariant,
        chunk: usize,
        rows: usize,
    ) -> GapfillResult<()> {
        let chunk_days = self.chunk_days(chunk);
        let first = store.read_strip(variant, 0, chunk)?;
        let (days, cols, bands) = first.dim();
        if days != chunk_days {
            return Err(strip_shape_error(variant, 0, chunk, (chunk_days, cols, bands), first.dim()));
        }
        let mut slice = Array4::zeros((chunk_days, rows, cols, bands));
        slice.slice_mut(s![.., 0, .., ..]).assign(&first);

        for row in 1..rows {
            let strip = store.read_strip(variant, row, chunk)?;
            if strip.dim() != (chunk_days, cols, bands) {
                return Err(strip_shape_error(
                    variant,
                    row,
                    chunk,
                    (chunk_days, cols, bands),
                    strip.dim(),
                ));
            }
            slice.slice_mut(s![.., row, .., ..]).assign(&strip);
        }

        store.write_slice(variant, chunk, slice.view())
    }
}

fn strip_shape_error(
    variant: ReconstructionVariant,
    row: usize,
    chunk: usize,
    expected: (usize, usize, usize),
    actual: (usize, usize, usize),
) -> GapfillError {
    GapfillError::ShapeMismatch {
        what: format!("strip {}-{} of {}", row, chunk, variant),
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::modeler::{ModelerParams, TemporalModeler};
    use approx::assert_relative_eq;
    use ndarray::{Array3, Array4};
    use tempfile::tempdir;

    fn spline_only() -> ModelerParams {
        ModelerParams {
            variants: vec![ReconstructionVariant::Spline],
            ..ModelerParams::default()
        }
    }

    /// Two clear scenes on days 0 and 9; every pixel series is linear, so the
    /// spline reconstruction is exactly predictable.
    fn test_inputs() -> (SceneCube, SceneMasks) {
        let cube = Array4::from_shape_fn((2, 3, 2, 1), |(s, r, c, _)| {
            (s * 100) as f32 + (r * 10 + c) as f32
        });
        let masks = Array3::from_elem((2, 3, 2), false);
        (cube, masks)
    }

    fn expected(day: usize, row: usize, col: usize) -> f32 {
        (row * 10 + col) as f32 + day as f32 * 100.0 / 9.0
    }

    #[test]
    fn chunk_arithmetic_covers_partial_tails() {
        let tiler = Tiler::new(10, 4).unwrap();
        assert_eq!(tiler.chunk_count(), 3);
        assert_eq!(tiler.chunk_days(0), 4);
        assert_eq!(tiler.chunk_days(2), 2);
        assert_eq!(tiler.locate_day(0), (0, 0));
        assert_eq!(tiler.locate_day(5), (1, 1));
        assert_eq!(tiler.locate_day(9), (2, 1));

        // Seven days in threes tile as [0,3), [3,6), [6,7).
        let uneven = Tiler::new(7, 3).unwrap();
        assert_eq!(uneven.chunk_count(), 3);
        assert_eq!(uneven.chunk_days(0), 3);
        assert_eq!(uneven.chunk_days(1), 3);
        assert_eq!(uneven.chunk_days(2), 1);

        let empty = Tiler::new(0, 4).unwrap();
        assert_eq!(empty.chunk_count(), 0);

        assert!(Tiler::new(10, 0).is_err());
    }

    #[test]
    fn both_phases_produce_correct_day_slices() {
        let dir = tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "tiling");
        let tiler = Tiler::new(10, 4).unwrap();
        let modeler = TemporalModeler::with_params(vec![0, 9], 10, spline_only()).unwrap();
        let (cube, masks) = test_inputs();
        let cancel = CancelToken::new();

        let degenerate = tiler
            .build_strips(&store, &modeler, &cube, &masks, &cancel)
            .unwrap();
        assert_eq!(degenerate, 0);
        assert!(store
            .strip_path(ReconstructionVariant::Spline, 2, 2)
            .exists());

        tiler
            .restructure(&store, &[ReconstructionVariant::Spline], 3, &cancel)
            .unwrap();

        // Strips are gone, slices carry the right days in the right places
        assert!(!store
            .strip_path(ReconstructionVariant::Spline, 0, 0)
            .exists());
        let middle = store.read_slice(ReconstructionVariant::Spline, 1).unwrap();
        assert_eq!(middle.dim(), (4, 3, 2, 1));
        for (offset, day) in (4..8).enumerate() {
            for row in 0..3 {
                for col in 0..2 {
                    assert_relative_eq!(
                        middle[(offset, row, col, 0)],
                        expected(day, row, col),
                        epsilon = 1e-3
                    );
                }
            }
        }
        let tail = store.read_slice(ReconstructionVariant::Spline, 2).unwrap();
        assert_eq!(tail.dim(), (2, 3, 2, 1));
        assert_relative_eq!(tail[(1, 2, 1, 0)], expected(9, 2, 1), epsilon = 1e-3);
    }

    #[test]
    fn existing_slices_are_not_rebuilt() {
        let dir = tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "resume");
        let tiler = Tiler::new(10, 4).unwrap();
        let modeler = TemporalModeler::with_params(vec![0, 9], 10, spline_only()).unwrap();
        let (cube, masks) = test_inputs();
        let cancel = CancelToken::new();

        tiler
            .build_strips(&store, &modeler, &cube, &masks, &cancel)
            .unwrap();

        // Pretend a previous run already finished chunk 1
        let sentinel = Array4::from_elem((4, 3, 2, 1), -1.0f32);
        store
            .write_slice(ReconstructionVariant::Spline, 1, sentinel.view())
            .unwrap();

        tiler
            .restructure(&store, &[ReconstructionVariant::Spline], 3, &cancel)
            .unwrap();

        let untouched = store.read_slice(ReconstructionVariant::Spline, 1).unwrap();
        assert_relative_eq!(untouched[(0, 0, 0, 0)], -1.0);
        let rebuilt = store.read_slice(ReconstructionVariant::Spline, 0).unwrap();
        assert_relative_eq!(rebuilt[(0, 0, 0, 0)], expected(0, 0, 0), epsilon = 1e-3);
    }

    #[test]
    fn cancellation_stops_both_phases() {
        let dir = tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "cancel");
        let tiler = Tiler::new(10, 4).unwrap();
        let modeler = TemporalModeler::with_params(vec![0, 9], 10, spline_only()).unwrap();
        let (cube, masks) = test_inputs();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            tiler.build_strips(&store, &modeler, &cube, &masks, &cancel),
            Err(GapfillError::Cancelled { .. })
        ));
        assert!(matches!(
            tiler.restructure(&store, &[ReconstructionVariant::Spline], 3, &cancel),
            Err(GapfillError::Cancelled { .. })
        ));
    }

    #[test]
    fn inconsistent_strip_shapes_are_rejected() {
        let dir = tempdir().unwrap();
        let store = DatasetStore::new(dir.path(), "badstrip");
        let tiler = Tiler::new(4, 4).unwrap();
        let cancel = CancelToken::new();

        // Row 0 claims 3 days in a 4-day chunk
        let bad = Array3::zeros((3, 2, 1));
        store
            .write_strip(ReconstructionVariant::Spline, 0, 0, bad.view())
            .unwrap();
        assert!(matches!(
            tiler.restructure(&store, &[ReconstructionVariant::Spline], 1, &cancel),
            Err(GapfillError::ShapeMismatch { .. })
        ));
    }
}
