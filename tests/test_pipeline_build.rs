use approx::assert_abs_diff_eq;
use gapfill::testdata::{clear_value, dates_at, small_settings, RasterCubeSource, ThresholdClassifier, SMALL_SPAN_M};
use gapfill::{DatasetPipeline, ReconstructionVariant};
use std::sync::Arc;
use tempfile::TempDir;

/// Acquisition days within the 20-day window of `small_settings`.
const SCENE_OFFSETS: [i64; 5] = [0, 4, 8, 12, 16];

fn scene_source(settings: &gapfill::AcquisitionSettings, cloudy: &[usize]) -> Arc<RasterCubeSource> {
    let dates = dates_at(settings.start_date, &SCENE_OFFSETS);
    Arc::new(
        RasterCubeSource::new(SMALL_SPAN_M, SMALL_SPAN_M, 2, dates)
            .with_cloudy_scenes(cloudy.iter().copied()),
    )
}

#[test]
fn test_full_build_reconstructs_the_field() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let temp = TempDir::new().expect("Failed to create temp directory");
    let settings = small_settings(temp.path());
    // Scene 2 (day 8) is fully overcast and must be interpolated over.
    let source = scene_source(&settings, &[2]);
    let pipeline = DatasetPipeline::new(
        "tulips-2017",
        settings,
        Box::new(Arc::clone(&source)),
        Box::new(ThresholdClassifier),
    )?;

    let report = pipeline.ensure_built(false)?;
    let store = pipeline.store();
    assert!(store.is_complete());
    assert!(!report.reused);
    assert_eq!(report.scenes, 5);
    assert_eq!((report.rows, report.cols, report.bands), (5, 5, 2));
    assert_eq!(report.total_days, 20);
    assert_eq!(report.degenerate_fits, 0);
    assert_eq!(source.fetch_count(), 2, "one main and one auxiliary fetch");

    // 20 days over 4 chunks, for both variants, with no row strips left over.
    let variants = [
        ReconstructionVariant::Spline,
        ReconstructionVariant::NonParametric,
    ];
    for variant in variants {
        for chunk in 0..4 {
            assert!(
                store.slice_exists(variant, chunk),
                "missing {} day slice {}",
                variant,
                chunk
            );
        }
        let leftovers: Vec<String> = std::fs::read_dir(store.variant_dir(variant))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "row strips left behind: {:?}", leftovers);
    }

    // The synthetic field is linear in time, which the spline reproduces
    // exactly, overcast day included.
    let reader = pipeline.open(ReconstructionVariant::Spline)?;
    assert_eq!(reader.len(), 20);
    assert_eq!(reader.date_of(0)?, pipeline.settings().start_date);
    for index in 0..reader.len() {
        let frame = reader.frame(index)?;
        assert_eq!(frame.data.dim(), (5, 5, 2));
        for ((_, _, band), &value) in frame.data.indexed_iter() {
            assert_abs_diff_eq!(value, clear_value(index, band), epsilon = 1e-3);
        }
    }

    // The cloud reflectance of the overcast scene must not leak through.
    let overcast = reader.frame(8)?;
    assert!(overcast.data.iter().all(|&value| value < 0.5));

    // Gaussian-process regression tracks the same field, tightest at the
    // clear acquisition days.
    let reader = pipeline.open(ReconstructionVariant::NonParametric)?;
    assert_eq!(reader.len(), 20);
    for index in 0..reader.len() {
        let clear_acquisition = SCENE_OFFSETS.contains(&(index as i64)) && index != 8;
        let epsilon = if clear_acquisition { 1e-3 } else { 3e-3 };
        let frame = reader.frame(index)?;
        for ((_, _, band), &value) in frame.data.indexed_iter() {
            assert_abs_diff_eq!(value, clear_value(index, band), epsilon = epsilon);
        }
    }

    Ok(())
}

#[test]
fn test_completed_build_is_reused_until_forced() -> anyhow::Result<()> {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let settings = small_settings(temp.path());
    let source = scene_source(&settings, &[]);
    let pipeline = DatasetPipeline::new(
        "tulips-cached",
        settings,
        Box::new(Arc::clone(&source)),
        Box::new(ThresholdClassifier),
    )?;

    let report = pipeline.ensure_built(false)?;
    assert!(!report.reused);
    assert_eq!(source.fetch_count(), 2);

    // A second run sees the completion marker and does no work.
    let again = pipeline.ensure_built(false)?;
    assert!(again.reused);
    assert_eq!(again.total_days, 20);
    assert_eq!(source.fetch_count(), 2);

    // A forced run rebuilds from the scene cache without refetching, and the
    // rebuilt slices are identical to the originals.
    let store = pipeline.store();
    let slice_before = std::fs::read(store.slice_path(ReconstructionVariant::Spline, 0))?;
    let forced = pipeline.ensure_built(true)?;
    assert!(!forced.reused);
    assert_eq!(source.fetch_count(), 2);
    let slice_after = std::fs::read(store.slice_path(ReconstructionVariant::Spline, 0))?;
    assert_eq!(slice_before, slice_after);

    // Asking for a redownload bypasses the scene cache.
    let mut refetch_settings = small_settings(temp.path());
    refetch_settings.redownload = true;
    let refetching = DatasetPipeline::new(
        "tulips-cached",
        refetch_settings,
        Box::new(Arc::clone(&source)),
        Box::new(ThresholdClassifier),
    )?;
    refetching.ensure_built(true)?;
    assert_eq!(source.fetch_count(), 4);

    let reader = refetching.open(ReconstructionVariant::Spline)?;
    assert_eq!(reader.len(), 20);
    let frame = reader.frame(0)?;
    for ((_, _, band), &value) in frame.data.indexed_iter() {
        assert_abs_diff_eq!(value, clear_value(0, band), epsilon = 1e-3);
    }

    Ok(())
}
