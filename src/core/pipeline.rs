//! End-to-end dataset construction.
//!
//! The pipeline ties the injected raster source and cloud classifier to the
//! modeling and tiling stages: fetch both cubes, mask clouds, deduplicate
//! scenes, model row by row, restructure into day slices, then publish the
//! date index and completion marker. The injected source is wrapped in an
//! on-disk scene cache under the data folder, so rebuilding a dataset does
//! not refetch imagery unless the settings ask for a redownload. A dataset
//! whose marker exists is never rebuilt unless forced.

use crate::core::cloud_mask::{CloudClassifier, CloudMaskBuilder};
use crate::core::kriging::KrigingParams;
use crate::core::modeler::{ModelerParams, TemporalModeler};
use crate::core::tiling::Tiler;
use crate::io::reader::FrameStore;
use crate::io::source::{CachingSource, RasterSource, SceneRequest};
use crate::io::store::DatasetStore;
use crate::types::{
    AcquisitionSettings, CancelToken, GapfillError, GapfillResult, ReconstructionVariant,
};

/// What one [`DatasetPipeline::ensure_built`] call did.
///
/// A reused dataset reports its day count from the stored date index and
/// zeros everywhere else; nothing was fetched or modeled for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// true when a completed dataset was found and left untouched
    pub reused: bool,
    /// Distinct scene dates that entered the modeling stage
    pub scenes: usize,
    pub rows: usize,
    pub cols: usize,
    pub bands: usize,
    pub total_days: usize,
    /// Pixel-band series left at `NO_DATA` for lack of valid samples
    pub degenerate_fits: usize,
}

/// Builds and maintains one named dataset under the stream root.
pub struct DatasetPipeline {
    name: String,
    settings: AcquisitionSettings,
    source: CachingSource<Box<dyn RasterSource>>,
    classifier: Box<dyn CloudClassifier>,
    kriging: KrigingParams,
    cancel: CancelToken,
}

impl DatasetPipeline {
    /// Create a pipeline. The settings are validated up front so a
    /// misconfiguration fails before any acquisition work.
    pub fn new(
        name: impl Into<String>,
        settings: AcquisitionSettings,
        source: Box<dyn RasterSource>,
        classifier: Box<dyn CloudClassifier>,
    ) -> GapfillResult<Self> {
        settings.validate()?;
        let source = CachingSource::new(source, settings.data_folder.clone());
        Ok(Self {
            name: name.into(),
            settings,
            source,
            classifier,
            kriging: KrigingParams::default(),
            cancel: CancelToken::new(),
        })
    }

    /// Override the kernel hyperparameters of the non-parametric variant.
    pub fn with_kriging_params(mut self, params: KrigingParams) -> Self {
        self.kriging = params;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Token for cancelling a running build from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Store handle for this dataset's on-disk location.
    pub fn store(&self) -> DatasetStore {
        DatasetStore::new(&self.settings.stream_root, &self.name)
    }

    /// Build the dataset unless it is already complete.
    ///
    /// Without `force`, a partial build on disk is resumed: strips are
    /// rewritten and already-restructured day slices are kept. With `force`
    /// the dataset directory is removed first.
    pub fn ensure_built(&self, force: bool) -> GapfillResult<BuildReport> {
        let store = self.store();
        if store.is_complete() {
            if !force {
                log::info!("Dataset `{}` is already built, reusing it", self.name);
                return Ok(BuildReport {
                    reused: true,
                    scenes: 0,
                    rows: 0,
                    cols: 0,
                    bands: 0,
                    total_days: store.read_dates()?.len(),
                    degenerate_fits: 0,
                });
            }
            log::info!("Rebuilding dataset `{}` from scratch", self.name);
        }
        if force {
            store.clear()?;
        }
        self.build(&store)
    }

    /// Open a reader over one variant of the (built) dataset.
    pub fn open(&self, variant: ReconstructionVariant) -> GapfillResult<FrameStore> {
        FrameStore::open(self.store(), variant)
    }

    fn build(&self, store: &DatasetStore) -> GapfillResult<BuildReport> {
        let settings = &self.settings;
        let total_days = settings.total_days();

        self.cancel.check("acquisition")?;
        let main_request = SceneRequest::from_settings(settings);
        log::info!(
            "Acquiring scenes for `{}`: {} to {} at {}x{} m",
            self.name,
            settings.start_date,
            settings.end_date,
            settings.res_x,
            settings.res_y
        );
        let stack = self.source.fetch(&main_request)?;
        stack.validate()?;
        let stack = stack
            .deduplicate(settings.duplicate_policy)
            .clipped(settings.start_date, total_days);

        let (scenes, rows, cols, bands) = stack.cube.dim();
        if rows == 0 || cols == 0 || bands == 0 {
            return Err(GapfillError::Acquisition {
                stage: "main fetch".to_string(),
                detail: format!("scene grid is empty ({}x{}, {} band(s))", rows, cols, bands),
            });
        }
        log::info!(
            "Modeling {} scene(s) on a {}x{} grid with {} band(s) over {} day(s)",
            scenes,
            rows,
            cols,
            bands,
            total_days
        );

        self.cancel.check("cloud detection")?;
        let mask_builder = CloudMaskBuilder::new(settings.cloud_detection.clone());
        let (aux_x, aux_y) = mask_builder.aux_resolution(settings.res_x, settings.res_y);
        let aux = self
            .source
            .fetch(&main_request.clone().with_resolution(aux_x, aux_y))?;
        aux.validate()?;
        let aux = aux
            .deduplicate(settings.duplicate_policy)
            .clipped(settings.start_date, total_days);
        if aux.dates != stack.dates {
            return Err(GapfillError::ShapeMismatch {
                what: "auxiliary scene stack".to_string(),
                expected: format!("{} scene(s) matching the main stack", stack.scene_count()),
                actual: format!("{} scene(s)", aux.scene_count()),
            });
        }
        let masks = mask_builder.build(self.classifier.as_ref(), &aux.cube, rows, cols)?;

        let scene_days = stack.day_offsets(settings.start_date)?;
        let modeler = TemporalModeler::with_params(
            scene_days,
            total_days,
            ModelerParams {
                kriging: self.kriging,
                interpolate: settings.interpolate,
                variants: settings.variants.clone(),
            },
        )?;
        let tiler = Tiler::new(total_days, settings.days_per_chunk)?;

        let degenerate_fits =
            tiler.build_strips(store, &modeler, &stack.cube, &masks, &self.cancel)?;
        if degenerate_fits > 0 {
            log::warn!(
                "{} pixel-band series had too few valid samples and stay empty",
                degenerate_fits
            );
        }
        tiler.restructure(store, &settings.variants, rows, &self.cancel)?;

        store.write_dates(&settings.dates())?;
        store.mark_complete()?;
        log::info!(
            "Dataset `{}` complete: {} day(s), {} variant(s), stored under {}",
            self.name,
            total_days,
            settings.variants.len(),
            store.dataset_dir().display()
        );
        Ok(BuildReport {
            reused: false,
            scenes,
            rows,
            cols,
            bands,
            total_days,
            degenerate_fits,
        })
    }
}
