//! Per-pixel temporal modeling of one spatial row at a time.
//!
//! For every pixel and band the modeler gathers the cloud-free samples along
//! the scene axis and evaluates the configured reconstruction variants over
//! the full day range. Degenerate series (too few valid samples) yield
//! `NO_DATA` for that pixel-band and never abort the row.

use crate::core::kriging::{KrigingModel, KrigingParams};
use crate::core::spline::CubicSpline;
use crate::types::{
    GapfillError, GapfillResult, ReconstructionVariant, RowSeries, NO_DATA,
};
use ndarray::{Array3, ArrayView2, ArrayView3};

/// Minimum valid samples for the spline variant
const MIN_SPLINE_SAMPLES: usize = 2;
/// Minimum valid samples for the non-parametric variant
const MIN_KRIGING_SAMPLES: usize = 1;

/// Parameters controlling temporal reconstruction
#[derive(Debug, Clone)]
pub struct ModelerParams {
    /// Kernel hyperparameters for the non-parametric variant
    pub kriging: KrigingParams,
    /// true = fit temporal models; false = copy valid samples through
    pub interpolate: bool,
    /// Variants to produce, in persistence order
    pub variants: Vec<ReconstructionVariant>,
}

impl Default for ModelerParams {
    fn default() -> Self {
        Self {
            kriging: KrigingParams::default(),
            interpolate: true,
            variants: vec![
                ReconstructionVariant::Spline,
                ReconstructionVariant::NonParametric,
            ],
        }
    }
}

/// Dense day series for one spatial row, one entry per configured variant.
#[derive(Debug, Clone)]
pub struct RowModel {
    /// (variant, day x col x band) in configuration order
    pub series: Vec<(ReconstructionVariant, RowSeries)>,
    /// Pixel-band series skipped because too few valid samples remained
    pub degenerate: usize,
}

/// Reconstructs dense day series for the pixels of one spatial row.
#[derive(Debug, Clone)]
pub struct TemporalModeler {
    params: ModelerParams,
    /// Day offset of each scene within the reconstruction range, ascending
    scene_days: Vec<usize>,
    total_days: usize,
    day_grid: Vec<f32>,
}

impl TemporalModeler {
    /// Create a modeler with default parameters.
    pub fn new(scene_days: Vec<usize>, total_days: usize) -> GapfillResult<Self> {
        Self::with_params(scene_days, total_days, ModelerParams::default())
    }

    /// Create a modeler with custom parameters.
    pub fn with_params(
        scene_days: Vec<usize>,
        total_days: usize,
        params: ModelerParams,
    ) -> GapfillResult<Self> {
        if params.variants.is_empty() {
            return Err(GapfillError::InvalidSettings(
                "modeler needs at least one reconstruction variant".to_string(),
            ));
        }
        if scene_days.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(GapfillError::Processing(
                "scene days must be strictly increasing after deduplication".to_string(),
            ));
        }
        if let Some(&last) = scene_days.last() {
            if last >= total_days {
                return Err(GapfillError::IndexOutOfRange {
                    index: last,
                    len: total_days,
                });
            }
        }
        let day_grid = (0..total_days).map(|d| d as f32).collect();
        Ok(Self {
            params,
            scene_days,
            total_days,
            day_grid,
        })
    }

    pub fn total_days(&self) -> usize {
        self.total_days
    }

    pub fn variants(&self) -> &[ReconstructionVariant] {
        &self.params.variants
    }

    /// Model one row. `values` is the scene stack for this row
    /// (scene x col x band), `masks` the matching cloud flags (scene x col).
    pub fn model_row(
        &self,
        values: ArrayView3<'_, f32>,
        masks: ArrayView2<'_, bool>,
    ) -> GapfillResult<RowModel> {
        let (scenes, cols, bands) = values.dim();
        if scenes != self.scene_days.len() {
            return Err(GapfillError::ShapeMismatch {
                what: "row scene stack".to_string(),
                expected: format!("{} scene(s)", self.scene_days.len()),
                actual: format!("{} scene(s)", scenes),
            });
        }
        if masks.dim() != (scenes, cols) {
            return Err(GapfillError::ShapeMismatch {
                what: "row cloud masks".to_string(),
                expected: format!("{}x{}", scenes, cols),
                actual: format!("{}x{}", masks.dim().0, masks.dim().1),
            });
        }

        if !self.params.interpolate {
            let series = self
                .params
                .variants
                .iter()
                .map(|&variant| (variant, self.masked_copy(values, masks)))
                .collect();
            return Ok(RowModel {
                series,
                degenerate: 0,
            });
        }

        let mut outputs: Vec<(ReconstructionVariant, RowSeries)> = self
            .params
            .variants
            .iter()
            .map(|&variant| {
                (
                    variant,
                    Array3::from_elem((self.total_days, cols, bands), NO_DATA),
                )
            })
            .collect();

        let mut degenerate_spline = 0usize;
        let mut degenerate_kriging = 0usize;
        let mut xs = Vec::with_capacity(scenes);
        let mut ys = Vec::with_capacity(scenes);
        let mut xs64 = Vec::with_capacity(scenes);
        let mut ys64 = Vec::with_capacity(scenes);

        for col in 0..cols {
            for band in 0..bands {
                xs.clear();
                ys.clear();
                for (scene, &day) in self.scene_days.iter().enumerate() {
                    if masks[(scene, col)] {
                        continue;
                    }
                    let value = values[(scene, col, band)];
                    if value.is_finite() {
                        xs.push(day as f32);
                        ys.push(value);
                    }
                }

                for (variant, series) in outputs.iter_mut() {
                    match variant {
                        ReconstructionVariant::Spline => {
                            if xs.len() < MIN_SPLINE_SAMPLES {
                                degenerate_spline += 1;
                                continue;
                            }
                            let spline = CubicSpline::fit(&xs, &ys)?;
                            for (day, &x) in self.day_grid.iter().enumerate() {
                                series[(day, col, band)] = spline.evaluate(x);
                            }
                        }
                        ReconstructionVariant::NonParametric => {
                            if xs.len() < MIN_KRIGING_SAMPLES {
                                degenerate_kriging += 1;
                                continue;
                            }
                            xs64.clear();
                            ys64.clear();
                            xs64.extend(xs.iter().map(|&x| x as f64));
                            ys64.extend(ys.iter().map(|&y| y as f64));
                            let model = KrigingModel::fit(&xs64, &ys64, self.params.kriging)?;
                            for day in 0..self.total_days {
                                series[(day, col, band)] = model.predict(day as f64) as f32;
                            }
                        }
                    }
                }
            }
        }

        if degenerate_spline + degenerate_kriging > 0 {
            log::debug!(
                "Row modeling skipped {} spline and {} kriging pixel-band series with too few valid samples",
                degenerate_spline,
                degenerate_kriging
            );
        }
        Ok(RowModel {
            series: outputs,
            degenerate: degenerate_spline + degenerate_kriging,
        })
    }

    /// Copy valid samples to their acquisition days; everything else stays
    /// `NO_DATA`.
    fn masked_copy(
        &self,
        values: ArrayView3<'_, f32>,
        masks: ArrayView2<'_, bool>,
    ) -> RowSeries {
        let (_, cols, bands) = values.dim();
        let mut series = Array3::from_elem((self.total_days, cols, bands), NO_DATA);
        for (scene, &day) in self.scene_days.iter().enumerate() {
            for col in 0..cols {
                if masks[(scene, col)] {
                    continue;
                }
                for band in 0..bands {
                    let value = values[(scene, col, band)];
                    if value.is_finite() {
                        series[(day, col, band)] = value;
                    }
                }
            }
        }
        series
    }
}
