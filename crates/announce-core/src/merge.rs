/// Accumulation of filtering results across chunks.
///
/// Records and serial numbers are only ever pushed together, so the two sequences
/// stay the same length and positionally aligned whatever happens to individual chunks.
use serde::Serialize;

use crate::record::RawRecord;

#[derive(Debug, Default)]
pub struct ResultMerger {
    records: Vec<RawRecord>,
    serial_numbers: Vec<String>,
    chunks_attempted: usize,
    failed_chunks: Vec<usize>,
}

impl ResultMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: RawRecord, serial_number: String) {
        self.records.push(record);
        self.serial_numbers.push(serial_number);
    }

    /// Mark a chunk as attempted. `succeeded == false` records it as failed; it
    /// contributes nothing.
    pub fn finish_chunk(&mut self, index: usize, succeeded: bool) {
        self.chunks_attempted += 1;
        if !succeeded {
            self.failed_chunks.push(index);
        }
    }

    pub fn finish(self) -> FilterOutcome {
        FilterOutcome {
            records: self.records,
            serial_numbers: self.serial_numbers,
            chunks_attempted: self.chunks_attempted,
            failed_chunks: self.failed_chunks,
        }
    }
}

/// Final, order-preserving result of a filtering run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOutcome {
    records: Vec<RawRecord>,
    serial_numbers: Vec<String>,
    chunks_attempted: usize,
    failed_chunks: Vec<usize>,
}

impl FilterOutcome {
    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn serial_numbers(&self) -> &[String] {
        &self.serial_numbers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn chunks_attempted(&self) -> usize {
        self.chunks_attempted
    }

    /// Ordinals of chunks whose backend call failed.
    pub fn failed_chunks(&self) -> &[usize] {
        &self.failed_chunks
    }

    pub fn into_parts(self) -> (Vec<RawRecord>, Vec<String>) {
        (self.records, self.serial_numbers)
    }
}
