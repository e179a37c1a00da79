// grain-source/src/lib.rs
// ============================================================
// Sample source + results sink for the grain estimator
// Reads a CSV manifest of image IDs and grain-type labels,
// decodes each photograph to RGB8, and writes one result row
// per image to a CSV table.
// ------------------------------------------------------------
// Public API:
//   * ImageSource::open()   – parse manifest, bind image dir
//   * ImageSource::samples() – lazy iterator of GrainSample
//   * ResultsSink::new()    – fixed-column CSV writer
// ============================================================

//! Grain estimator – sample I/O layer
//!
//! The manifest is a CSV with at least an `ID` column and a `Comment`
//! column holding the grain-type label (`Paddy`, `White`, `Brown`).
//! Images are resolved as `{image_dir}/{ID}.{ext}`.  Each image is decoded
//! only when the iterator reaches it, so a corrupt file surfaces as an
//! error for that row alone and never stops the batch.

use image::RgbImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod sink;
mod stream;
pub use sink::{ResultRow, ResultsSink};
pub use stream::SampleStream;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Manifest row {row} is malformed: {source}")]
    ManifestRow {
        row: usize,
        #[source]
        source: csv::Error,
    },
    #[error("Image for {id} could not be decoded ({path:?}): {source}")]
    Image {
        id: String,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Image for {id} is empty ({width}x{height})")]
    EmptyImage { id: String, width: u32, height: u32 },
    #[error("Results sink error: {0}")]
    Sink(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Identifier of the sample the error belongs to, if any.
    pub fn sample_id(&self) -> Option<&str> {
        match self {
            SourceError::Image { id, .. } | SourceError::EmptyImage { id, .. } => Some(id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "ID")]
    pub id: String,
    /// Grain-type label, free text; interpretation happens downstream.
    #[serde(rename = "Comment", default)]
    pub label: String,
}

/// A decoded photograph plus its identifier and label.
#[derive(Debug, Clone)]
pub struct GrainSample {
    pub id: String,
    pub label: String,
    pub image: RgbImage,
}

/// Manifest-backed image source.
#[derive(Debug, Clone)]
pub struct ImageSource {
    image_dir: PathBuf,
    extension: String,
    entries: Vec<ManifestEntry>,
}

impl ImageSource {
    /// Parse the manifest and bind it to `image_dir`.
    ///
    /// ```no_run
    /// use grain_source::ImageSource;
    /// let src = ImageSource::open("Data/Test.csv", "Data/images").unwrap();
    /// for sample in src.samples() {
    ///     match sample {
    ///         Ok(s) => println!("{} ({}×{})", s.id, s.image.width(), s.image.height()),
    ///         Err(e) => eprintln!("skip: {e}"),
    ///     }
    /// }
    /// ```
    pub fn open(manifest: impl AsRef<Path>, image_dir: impl AsRef<Path>) -> Result<Self> {
        let path = manifest.as_ref();
        let mut reader = csv::Reader::from_path(path).map_err(|source| SourceError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::new();
        for (row, record) in reader.deserialize::<ManifestEntry>().enumerate() {
            let entry = record.map_err(|source| SourceError::ManifestRow { row: row + 1, source })?;
            entries.push(entry);
        }
        log::info!("manifest {:?}: {} entries", path, entries.len());

        Ok(Self::from_entries(entries, image_dir))
    }

    /// Build a source from already-parsed entries.
    pub fn from_entries(entries: Vec<ManifestEntry>, image_dir: impl AsRef<Path>) -> Self {
        Self {
            image_dir: image_dir.as_ref().to_path_buf(),
            extension: "png".to_string(),
            entries,
        }
    }

    /// Change the image file extension (default `png`).
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extension = ext.trim_start_matches('.').to_string();
        self
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path an entry's image is expected at.
    pub fn image_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.image_dir.join(format!("{}.{}", entry.id, self.extension))
    }

    /// Decode one entry's image to RGB8.
    pub fn load(&self, entry: &ManifestEntry) -> Result<GrainSample> {
        let path = self.image_path(entry);
        let image = image::open(&path)
            .map_err(|source| SourceError::Image {
                id: entry.id.clone(),
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        if image.width() == 0 || image.height() == 0 {
            return Err(SourceError::EmptyImage {
                id: entry.id.clone(),
                width: image.width(),
                height: image.height(),
            });
        }

        Ok(GrainSample {
            id: entry.id.clone(),
            label: entry.label.clone(),
            image,
        })
    }

    /// Lazy per-row iterator; each item decodes one image.
    pub fn samples(&self) -> SampleStream<'_> {
        SampleStream::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn manifest_parses_id_and_comment() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("Test.csv");
        let mut f = std::fs::File::create(&manifest).unwrap();
        writeln!(f, "ID,Comment,Extra").unwrap();
        writeln!(f, "img_001,Paddy,x").unwrap();
        writeln!(f, "img_002,Brown,y").unwrap();
        drop(f);

        let src = ImageSource::open(&manifest, dir.path()).unwrap();
        assert_eq!(src.len(), 2);
        assert_eq!(src.entries()[1].id, "img_002");
        assert_eq!(src.entries()[1].label, "Brown");
        assert_eq!(src.image_path(&src.entries()[0]), dir.path().join("img_001.png"));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempdir().unwrap();
        let err = ImageSource::open(dir.path().join("nope.csv"), dir.path()).unwrap_err();
        assert!(matches!(err, SourceError::Manifest { .. }));
    }

    #[test]
    fn extension_override() {
        let entry = ManifestEntry { id: "a".into(), label: "White".into() };
        let src = ImageSource::from_entries(vec![entry.clone()], "/data").with_extension(".jpg");
        assert_eq!(src.image_path(&entry), PathBuf::from("/data/a.jpg"));
    }
}
