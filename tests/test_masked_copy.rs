use approx::assert_abs_diff_eq;
use gapfill::testdata::{clear_value, dates_at, small_settings, RasterCubeSource, ThresholdClassifier, SMALL_SPAN_M};
use gapfill::{DatasetPipeline, ReconstructionVariant};
use std::sync::Arc;
use tempfile::TempDir;

/// With interpolation turned off the builder copies valid acquisitions into
/// their day slots and leaves every other day as NaN.
#[test]
fn test_masked_copy_keeps_only_clear_acquisitions() -> anyhow::Result<()> {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let mut settings = small_settings(temp.path());
    settings.interpolate = false;
    settings.variants = vec![ReconstructionVariant::Spline];

    // Day 6 was acquired twice; deduplication keeps the first pass, which is
    // fully overcast, and drops the clear retake.
    let dates = dates_at(settings.start_date, &[2, 6, 6, 13]);
    let source = Arc::new(
        RasterCubeSource::new(SMALL_SPAN_M, SMALL_SPAN_M, 2, dates).with_cloudy_scenes([1]),
    );
    let pipeline = DatasetPipeline::new(
        "tulips-raw",
        settings,
        Box::new(Arc::clone(&source)),
        Box::new(ThresholdClassifier),
    )?;

    let report = pipeline.ensure_built(false)?;
    assert_eq!(report.scenes, 3, "duplicate acquisition date collapsed");
    assert_eq!(source.fetch_count(), 2, "the copy still needs a cloud mask");

    let reader = pipeline.open(ReconstructionVariant::Spline)?;
    assert_eq!(reader.len(), 20);

    for index in 0..reader.len() {
        let frame = reader.frame(index)?;
        if index == 2 || index == 13 {
            // Clear acquisitions pass through the copy untouched.
            for ((_, _, band), &value) in frame.data.indexed_iter() {
                assert_eq!(value, clear_value(index, band));
            }
        } else {
            assert!(
                frame.data.iter().all(|value| value.is_nan()),
                "day {} should be empty",
                index
            );
        }
    }

    // Summaries ignore the NaN filler.
    let clear = reader.frame(13)?.summary();
    let expected_mean = (clear_value(13, 0) + clear_value(13, 1)) / 2.0;
    assert_abs_diff_eq!(clear.mean, expected_mean, epsilon = 1e-6);
    let empty = reader.frame(6)?.summary();
    assert!(empty.mean.is_nan());
    assert!(empty.stddev.is_nan());

    // Only the requested variant was materialized.
    assert!(!pipeline
        .store()
        .variant_dir(ReconstructionVariant::NonParametric)
        .exists());
    assert!(matches!(
        pipeline.open(ReconstructionVariant::NonParametric),
        Err(gapfill::GapfillError::NotReady { .. })
    ));

    Ok(())
}
