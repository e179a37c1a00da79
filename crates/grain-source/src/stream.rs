// grain-source/src/stream.rs
use crate::{GrainSample, ImageSource, Result};

/// Iterator over manifest rows; decoding happens on `next()`.
///
/// A failed decode yields `Err` for that row and the iterator keeps going.
pub struct SampleStream<'a> {
    source: &'a ImageSource,
    cursor: usize,
}

impl<'a> SampleStream<'a> {
    pub(crate) fn new(source: &'a ImageSource) -> Self {
        Self { source, cursor: 0 }
    }
}

impl Iterator for SampleStream<'_> {
    type Item = Result<GrainSample>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.source.entries().get(self.cursor)?;
        self.cursor += 1;
        Some(self.source.load(entry))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.source.len() - self.cursor;
        (left, Some(left))
    }
}

impl ExactSizeIterator for SampleStream<'_> {}
