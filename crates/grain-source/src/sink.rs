// grain-source/src/sink.rs
use crate::Result;
use std::io::Write;

/// One output row: identifier, integer counts, float measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: String,
    pub counts: Vec<u32>,
    pub measures: Vec<f32>,
}

/// CSV writer with a fixed column order: `ID`, counts, measures.
pub struct ResultsSink<W: Write> {
    writer: csv::Writer<W>,
    n_counts: usize,
    n_measures: usize,
    rows: usize,
}

impl ResultsSink<std::fs::File> {
    pub fn create(
        path: impl AsRef<std::path::Path>,
        count_columns: &[&str],
        measure_columns: &[&str],
    ) -> Result<Self> {
        let file = std::fs::File::create(path)?;
        Self::new(file, count_columns, measure_columns)
    }
}

impl<W: Write> ResultsSink<W> {
    /// Write the header immediately so an empty batch still yields a valid table.
    pub fn new(out: W, count_columns: &[&str], measure_columns: &[&str]) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(out);
        let header = std::iter::once("ID")
            .chain(count_columns.iter().copied())
            .chain(measure_columns.iter().copied());
        writer.write_record(header)?;
        Ok(Self {
            writer,
            n_counts: count_columns.len(),
            n_measures: measure_columns.len(),
            rows: 0,
        })
    }

    pub fn write(&mut self, row: &ResultRow) -> Result<()> {
        if row.counts.len() != self.n_counts || row.measures.len() != self.n_measures {
            return Err(crate::SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "row {} has {}/{} fields, expected {}/{}",
                    row.id,
                    row.counts.len(),
                    row.measures.len(),
                    self.n_counts,
                    self.n_measures
                ),
            )));
        }
        let fields = std::iter::once(row.id.clone())
            .chain(row.counts.iter().map(u32::to_string))
            .chain(row.measures.iter().map(f32::to_string));
        self.writer.write_record(fields)?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far (header excluded).
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| crate::SourceError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_rows_in_fixed_order() {
        let mut sink = ResultsSink::new(Vec::new(), &["Count", "Broken_Count"], &["Average_L"]).unwrap();
        sink.write(&ResultRow {
            id: "img_1".into(),
            counts: vec![120, 4],
            measures: vec![64.5],
        })
        .unwrap();
        assert_eq!(sink.rows(), 1);
        let bytes = sink.finish().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "ID,Count,Broken_Count,Average_L\nimg_1,120,4,64.5\n");
    }

    #[test]
    fn rejects_wrong_width_rows() {
        let mut sink = ResultsSink::new(Vec::new(), &["Count"], &["Average_L"]).unwrap();
        let err = sink.write(&ResultRow { id: "x".into(), counts: vec![], measures: vec![1.0] });
        assert!(err.is_err());
        assert_eq!(sink.rows(), 0);
    }
}
