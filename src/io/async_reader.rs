//! Asynchronous CSV reader with chunked interface
//!
//! Streams operation records from a CSV source in chunks, so input of any
//! size is read with constant memory.
//!
//! # Architecture
//!
//! ```text
//! CSV Reader → AsyncReader → Chunks of OperationRecords
//!                  ↓
//!           csv_format module
//!           (CsvRecord, convert_csv_record)
//! ```

use csv_async::AsyncReaderBuilder;
use futures::io::AsyncRead;
use futures::stream::StreamExt;
use tracing::warn;

use crate::io::csv_format::{convert_csv_record, CsvRecord, OperationRecord};

/// Asynchronous CSV reader
pub struct AsyncReader<R: AsyncRead + Unpin> {
    csv_reader: csv_async::AsyncDeserializer<R>,
}

impl<R: AsyncRead + Unpin + Send + 'static> AsyncReader<R> {
    pub fn new(reader: R) -> Self {
        let csv_reader = AsyncReaderBuilder::new()
            .flexible(true)
            .trim(csv_async::Trim::All)
            .create_deserializer(reader);

        Self { csv_reader }
    }

    /// Read up to `chunk_size` operation records
    ///
    /// Rows that fail to parse or convert are logged and skipped.
    ///
    /// # Returns
    ///
    /// The converted records; empty once the input is exhausted.
    pub async fn read_chunk(&mut self, chunk_size: usize) -> Vec<OperationRecord> {
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut records = self.csv_reader.deserialize::<CsvRecord>();

        while chunk.len() < chunk_size {
            match records.next().await {
                Some(Ok(csv_record)) => match convert_csv_record(csv_record) {
                    Ok(operation) => chunk.push(operation),
                    Err(e) => warn!(error = %e, "Skipping unconvertible record"),
                },
                Some(Err(e)) => warn!(error = %e, "Skipping malformed CSV row"),
                None => break,
            }
        }

        chunk
    }
}
