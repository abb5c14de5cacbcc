//! Cloud mask construction from a coarse auxiliary cube.
//!
//! Classification runs on a downscaled auxiliary acquisition of the same area
//! and date range; the resulting per-scene masks are block-replicated back up
//! to the main grid and cropped to its exact shape.

use crate::types::{CloudDetectionSettings, GapfillError, GapfillResult, SceneCube, SceneMasks};
use ndarray::Array3;

/// Per-scene cloud classification on the auxiliary grid.
///
/// Implementations receive the full auxiliary cube (scene x row x col x band)
/// and return one boolean mask per scene at the same spatial shape, true where
/// the ground is obscured.
pub trait CloudClassifier {
    fn classify(
        &self,
        aux: &SceneCube,
        settings: &CloudDetectionSettings,
    ) -> GapfillResult<SceneMasks>;
}

/// Builds main-grid cloud masks by classifying a coarse cube and upscaling.
#[derive(Debug, Clone)]
pub struct CloudMaskBuilder {
    settings: CloudDetectionSettings,
}

impl CloudMaskBuilder {
    pub fn new(settings: CloudDetectionSettings) -> Self {
        Self { settings }
    }

    /// Resolution of the auxiliary request in metres per pixel, coarser than
    /// the main grid by the configured scale factors.
    pub fn aux_resolution(&self, res_x: u32, res_y: u32) -> (u32, u32) {
        (
            res_x * self.settings.scale_x as u32,
            res_y * self.settings.scale_y as u32,
        )
    }

    /// Classify `aux` and lift the masks onto the main grid of
    /// `main_rows` x `main_cols` pixels.
    ///
    /// Each coarse mask pixel becomes a `scale_y` x `scale_x` block; overhang
    /// beyond the main grid is cropped, underhang is an error.
    pub fn build(
        &self,
        classifier: &dyn CloudClassifier,
        aux: &SceneCube,
        main_rows: usize,
        main_cols: usize,
    ) -> GapfillResult<SceneMasks> {
        let coarse = classifier.classify(aux, &self.settings)?;
        let (scenes, coarse_rows, coarse_cols) = coarse.dim();
        if scenes != aux.dim().0 {
            return Err(GapfillError::ShapeMismatch {
                what: "cloud classifier output".to_string(),
                expected: format!("{} scene(s)", aux.dim().0),
                actual: format!("{} scene(s)", scenes),
            });
        }

        let scale_y = self.settings.scale_y;
        let scale_x = self.settings.scale_x;
        if coarse_rows * scale_y < main_rows || coarse_cols * scale_x < main_cols {
            return Err(GapfillError::ShapeMismatch {
                what: "upscaled cloud mask".to_string(),
                expected: format!("at least {}x{} pixels", main_rows, main_cols),
                actual: format!("{}x{} pixels", coarse_rows * scale_y, coarse_cols * scale_x),
            });
        }

        log::debug!(
            "Upscaling {} cloud mask(s) from {}x{} to {}x{} (crop from {}x{})",
            scenes,
            coarse_rows,
            coarse_cols,
            main_rows,
            main_cols,
            coarse_rows * scale_y,
            coarse_cols * scale_x
        );

        let masks = Array3::from_shape_fn((scenes, main_rows, main_cols), |(s, r, c)| {
            coarse[(s, r / scale_y, c / scale_x)]
        });
        Ok(masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    /// Marks a pixel cloudy when band 0 exceeds the configured threshold.
    struct BandThreshold;

    impl CloudClassifier for BandThreshold {
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

    /// Always returns a mask stack for the wrong number of scenes.
    struct WrongSceneCount;

    impl CloudClassifier for WrongSceneCount {
        fn classify(
            &self,
            aux: &SceneCube,
            _settings: &CloudDetectionSettings,
        ) -> GapfillResult<SceneMasks> {
            let (scenes, rows, cols, _) = aux.dim();
            Ok(Array3::from_elem((scenes + 1, rows, cols), false))
        }
    }

    fn settings(scale: usize) -> CloudDetectionSettings {
        CloudDetectionSettings {
            scale_x: scale,
            scale_y: scale,
            ..CloudDetectionSettings::default()
        }
    }

    #[test]
    fn aux_resolution_is_coarser_by_scale() {
        let builder = CloudMaskBuilder::new(settings(6));
        assert_eq!(builder.aux_resolution(60, 60), (360, 360));
    }

    #[test]
    fn masks_are_block_replicated() {
        let builder = CloudMaskBuilder::new(settings(3));
        // One scene, 2x2 coarse grid; top-left coarse pixel cloudy
        let mut aux = Array4::zeros((1, 2, 2, 1));
        aux[(0, 0, 0, 0)] = 0.9;
        let masks = builder.build(&BandThreshold, &aux, 6, 6).unwrap();
        assert_eq!(masks.dim(), (1, 6, 6));
        for r in 0..6 {
            for c in 0..6 {
                let expected = r < 3 && c < 3;
                assert_eq!(masks[(0, r, c)], expected, "pixel ({}, {})", r, c);
            }
        }
    }

    #[test]
    fn overhang_is_cropped_to_main_grid() {
        let builder = CloudMaskBuilder::new(settings(3));
        // Bottom-right coarse pixel cloudy; crop to 5x5 keeps part of its block
        let mut aux = Array4::zeros((1, 2, 2, 1));
        aux[(0, 1, 1, 0)] = 0.9;
        let masks = builder.build(&BandThreshold, &aux, 5, 5).unwrap();
        assert_eq!(masks.dim(), (1, 5, 5));
        assert!(masks[(0, 4, 4)]);
        assert!(masks[(0, 3, 3)]);
        assert!(!masks[(0, 2, 2)]);
    }

    #[test]
    fn underhang_is_an_error() {
        let builder = CloudMaskBuilder::new(settings(2));
        let aux = Array4::zeros((1, 1, 1, 1));
        let err = builder.build(&BandThreshold, &aux, 5, 5).unwrap_err();
        assert!(matches!(err, GapfillError::ShapeMismatch { .. }));
    }

    #[test]
    fn scene_count_mismatch_is_an_error() {
        let builder = CloudMaskBuilder::new(settings(1));
        let aux = Array4::zeros((2, 4, 4, 1));
        let err = builder.build(&WrongSceneCount, &aux, 4, 4).unwrap_err();
        assert!(matches!(err, GapfillError::ShapeMismatch { .. }));
    }

    #[test]
    fn empty_scene_stack_produces_empty_masks() {
        let builder = CloudMaskBuilder::new(settings(2));
        let aux = Array4::zeros((0, 3, 3, 1));
        let masks = builder.build(&BandThreshold, &aux, 6, 6).unwrap();
        assert_eq!(masks.dim(), (0, 6, 6));
    }
}
