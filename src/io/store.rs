//! On-disk layout and persistence of reconstructed datasets.
//!
//! A dataset lives under `<stream_root>/<name>/`:
//!
//! ```text
//! <name>/
//!     dates.json                      calendar date of every day index
//!     final.txt                       completion marker, written last
//!     full_data/<variant>/
//!         tmp-<row>-<chunk>.npy       phase-1 strip (day x col x band)
//!         final-<chunk>.npy           phase-2 slice (day x row x col x band)
//! ```
//!
//! Strips are transient: the restructuring pass deletes them once every final
//! slice of a variant is on disk.

use crate::types::{DaySlice, GapfillError, GapfillResult, ReconstructionVariant};
use chrono::NaiveDate;
use ndarray::{Array3, ArrayView3, ArrayView4};
use std::fs;
use std::path::{Path, PathBuf};

const DATES_FILE: &str = "dates.json";
const MARKER_FILE: &str = "final.txt";
const DATA_DIR: &str = "full_data";
const STRIP_PREFIX: &str = "tmp-";

/// Path layout and file access for one named dataset.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    name: String,
    dir: PathBuf,
}

impl DatasetStore {
    pub fn new(stream_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: stream_root.join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding everything belonging to this dataset.
    pub fn dataset_dir(&self) -> &Path {
        &self.dir
    }

    pub fn dates_path(&self) -> PathBuf {
        self.dir.join(DATES_FILE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    pub fn variant_dir(&self, variant: ReconstructionVariant) -> PathBuf {
        self.dir.join(DATA_DIR).join(variant.dir_name())
    }

    pub fn strip_path(&self, variant: ReconstructionVariant, row: usize, chunk: usize) -> PathBuf {
        self.variant_dir(variant)
            .join(format!("{}{}-{}.npy", STRIP_PREFIX, row, chunk))
    }

    pub fn slice_path(&self, variant: ReconstructionVariant, chunk: usize) -> PathBuf {
        self.variant_dir(variant).join(format!("final-{}.npy", chunk))
    }

    /// The dataset is complete once the marker file exists.
    pub fn is_complete(&self) -> bool {
        self.marker_path().exists()
    }

    /// Write the completion marker, stamped with the current time. Only call
    /// after every final slice and the date index are on disk.
    pub fn mark_complete(&self) -> GapfillResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.marker_path(), chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn write_dates(&self, dates: &[NaiveDate]) -> GapfillResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dates_path();
        let file = fs::File::create(&path)?;
        serde_json::to_writer(file, dates).map_err(|err| persistence(&path, err))
    }

    pub fn read_dates(&self) -> GapfillResult<Vec<NaiveDate>> {
        let path = self.dates_path();
        let file = fs::File::open(&path).map_err(|err| persistence(&path, err))?;
        serde_json::from_reader(file).map_err(|err| persistence(&path, err))
    }

    /// Persist one phase-1 strip (day x col x band) for a spatial row.
    pub fn write_strip(
        &self,
        variant: ReconstructionVariant,
        row: usize,
        chunk: usize,
        data: ArrayView3<'_, f32>,
    ) -> GapfillResult<()> {
        write_npy_file(&self.strip_path(variant, row, chunk), &data.as_standard_layout())
    }

    pub fn read_strip(
        &self,
        variant: ReconstructionVariant,
        row: usize,
        chunk: usize,
    ) -> GapfillResult<Array3<f32>> {
        read_npy_file(&self.strip_path(variant, row, chunk))
    }

    /// Persist one phase-2 day slice (day x row x col x band).
    pub fn write_slice(
        &self,
        variant: ReconstructionVariant,
        chunk: usize,
        data: ArrayView4<'_, f32>,
    ) -> GapfillResult<()> {
        write_npy_file(&self.slice_path(variant, chunk), &data.as_standard_layout())
    }

    pub fn read_slice(
        &self,
        variant: ReconstructionVariant,
        chunk: usize,
    ) -> GapfillResult<DaySlice> {
        read_npy_file(&self.slice_path(variant, chunk))
    }

    pub fn slice_exists(&self, variant: ReconstructionVariant, chunk: usize) -> bool {
        self.slice_path(variant, chunk).exists()
    }

    /// Delete every phase-1 strip of a variant; final slices are untouched.
    pub fn remove_strips(&self, variant: ReconstructionVariant) -> GapfillResult<()> {
        let dir = self.variant_dir(variant);
        if !dir.exists() {
            return Ok(());
        }
        let mut removed = 0usize;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STRIP_PREFIX) && name.ends_with(".npy") {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        log::debug!("Removed {} strip file(s) from {}", removed, dir.display());
        Ok(())
    }

    /// Remove the whole dataset directory, marker included. Used by forced
    /// rebuilds.
    pub fn clear(&self) -> GapfillResult<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

pub(crate) fn write_npy_file<T>(path: &Path, array: &T) -> GapfillResult<()>
where
    T: ndarray_npy::WriteNpyExt,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path).map_err(|err| persistence(path, err))?;
    array
        .write_npy(file)
        .map_err(|err| persistence(path, err))
}

pub(crate) fn read_npy_file<T>(path: &Path) -> GapfillResult<T>
where
    T: ndarray_npy::ReadNpyExt,
{
    let file = fs::File::open(path).map_err(|err| persistence(path, err))?;
    T::read_npy(file).map_err(|err| persistence(path, err))
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> GapfillError {
    GapfillError::Persistence {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}
