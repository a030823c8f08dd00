//! Job enqueueing: single jobs and bulk files.
//!
//! Bulk input is parsed on a blocking thread and streamed to the async side
//! through a bounded channel, so a large file is never held in memory. Items
//! are validated in order and inserted in fixed-size batches, one transaction
//! per batch: the first invalid item stops the run, leaving earlier batches
//! committed and nothing from its own batch.

use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer as _, SeqAccess, Visitor};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use dprompts_core::{JobId, JobSpec, SchemaRegistry, ValidationError};

use crate::error::StoreError;
use crate::jobs::InsertParams;
use crate::store::JobQueue;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("job {index} is invalid: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: ValidationError,
    },

    #[error("job {index} is not valid JSON: {message}")]
    Decode { index: usize, message: String },

    #[error("metadata is not valid JSON: {0}")]
    Metadata(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bulk parser stopped unexpectedly: {0}")]
    Parser(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Batching knobs for bulk enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOptions {
    pub batch_size: usize,
    /// Log a progress line every this many loaded items.
    pub progress_every: usize,
    /// Parsed items buffered between the parser thread and the inserter.
    pub channel_capacity: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            progress_every: 50,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub inserted: usize,
    pub batches: usize,
}

type ParsedItem = Result<(usize, JobSpec), EnqueueError>;

pub struct Enqueuer<Q> {
    queue: Q,
    schemas: SchemaRegistry,
    options: BulkOptions,
}

impl<Q: JobQueue> Enqueuer<Q> {
    pub fn new(queue: Q, schemas: SchemaRegistry) -> Self {
        Self {
            queue,
            schemas,
            options: BulkOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BulkOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and insert one job.
    ///
    /// `metadata` overrides whatever metadata the specification carries.
    #[instrument(skip_all, err)]
    pub async fn enqueue(
        &self,
        spec: JobSpec,
        metadata: Option<JsonValue>,
    ) -> Result<JobId, EnqueueError> {
        let (args, spec_metadata) = spec
            .into_args(&self.schemas)
            .map_err(|source| EnqueueError::Invalid { index: 0, source })?;

        let params = InsertParams::new(args).with_metadata(metadata.or(spec_metadata));
        let id = self.queue.insert(params).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// [`enqueue`](Self::enqueue) from raw JSON text.
    pub async fn enqueue_json(
        &self,
        args: &str,
        metadata: Option<&str>,
    ) -> Result<JobId, EnqueueError> {
        let spec: JobSpec = serde_json::from_str(args).map_err(|e| EnqueueError::Decode {
            index: 0,
            message: e.to_string(),
        })?;
        let metadata = metadata
            .filter(|m| !m.trim().is_empty())
            .map(|m| serde_json::from_str::<JsonValue>(m))
            .transpose()
            .map_err(|e| EnqueueError::Metadata(e.to_string()))?;

        self.enqueue(spec, metadata).await
    }

    /// Bulk-enqueue a JSON array or NDJSON file.
    #[instrument(skip(self, path), fields(path = %path.display()), err)]
    pub async fn enqueue_file(&self, path: &Path) -> Result<BulkSummary, EnqueueError> {
        let file = File::open(path).map_err(|source| EnqueueError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.enqueue_reader(path.to_path_buf(), file).await
    }

    /// Bulk-enqueue from any reader. `source` names the input in errors.
    pub async fn enqueue_reader<R>(
        &self,
        source: PathBuf,
        reader: R,
    ) -> Result<BulkSummary, EnqueueError>
    where
        R: Read + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<ParsedItem>(self.options.channel_capacity.max(1));
        let parser = tokio::task::spawn_blocking(move || parse_items(source, reader, &tx));

        let batch_size = self.options.batch_size.max(1);
        let progress_every = self.options.progress_every.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut summary = BulkSummary::default();
        let mut loaded = 0usize;

        while let Some(item) = rx.recv().await {
            let (index, spec) = item?;
            let (args, metadata) = spec
                .into_args(&self.schemas)
                .map_err(|source| EnqueueError::Invalid { index, source })?;
            batch.push(InsertParams::new(args).with_metadata(metadata));

            loaded += 1;
            if loaded % progress_every == 0 {
                info!(loaded, "jobs loaded");
            }
            if batch.len() >= batch_size {
                self.flush(&mut batch, &mut summary).await?;
            }
        }

        parser
            .await
            .map_err(|e| EnqueueError::Parser(e.to_string()))?;

        if !batch.is_empty() {
            self.flush(&mut batch, &mut summary).await?;
        }

        if summary.inserted == 0 {
            warn!("bulk input contained no jobs");
        } else {
            info!(
                inserted = summary.inserted,
                batches = summary.batches,
                "bulk enqueue finished"
            );
        }
        Ok(summary)
    }

    async fn flush(
        &self,
        batch: &mut Vec<InsertParams>,
        summary: &mut BulkSummary,
    ) -> Result<(), EnqueueError> {
        let items: Vec<_> = batch.drain(..).collect();
        let size = items.len();

        let mut tx = self.queue.begin().await?;
        self.queue.insert_many(&mut tx, items).await?;
        self.queue.commit(tx).await?;

        summary.batches += 1;
        summary.inserted += size;
        info!(
            batch = summary.batches,
            size,
            total = summary.inserted,
            "batch inserted"
        );
        Ok(())
    }
}

/// Skip leading whitespace and return the first significant byte, unconsumed.
fn peek_significant<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(pos) => {
                let byte = buf[pos];
                reader.consume(pos);
                return Ok(Some(byte));
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Runs on a blocking thread. Every outcome, including failures, is reported
/// through `tx`; a closed channel means the consumer gave up and parsing stops.
fn parse_items<R: Read>(source: PathBuf, reader: R, tx: &mpsc::Sender<ParsedItem>) {
    let mut reader = BufReader::new(reader);
    let result = match peek_significant(&mut reader) {
        Ok(Some(b'[')) => parse_array(&mut reader, tx),
        Ok(Some(_)) => parse_lines(&mut reader, tx),
        Ok(None) => Ok(()),
        Err(err) => Err(EnqueueError::Io { path: source, source: err }),
    };

    if let Err(err) = result {
        let _ = tx.blocking_send(Err(err));
    }
}

fn decode_error(index: usize, err: serde_json::Error) -> EnqueueError {
    EnqueueError::Decode {
        index,
        message: err.to_string(),
    }
}

fn parse_lines<R: Read>(reader: R, tx: &mpsc::Sender<ParsedItem>) -> Result<(), EnqueueError> {
    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<JobSpec>();
    for (index, item) in stream.enumerate() {
        let spec = item.map_err(|e| decode_error(index, e))?;
        if tx.blocking_send(Ok((index, spec))).is_err() {
            break;
        }
    }
    Ok(())
}

fn parse_array<R: Read>(reader: R, tx: &mpsc::Sender<ParsedItem>) -> Result<(), EnqueueError> {
    let next_index = Cell::new(0);
    let mut de = serde_json::Deserializer::from_reader(reader);

    let streamed = (&mut de).deserialize_seq(ArrayItems {
        tx,
        next_index: &next_index,
    });
    match streamed {
        Ok(()) => de.end().map_err(|e| decode_error(next_index.get(), e)),
        Err(err) => Err(decode_error(next_index.get(), err)),
    }
}

/// Sends array elements one by one instead of collecting them.
struct ArrayItems<'a> {
    tx: &'a mpsc::Sender<ParsedItem>,
    next_index: &'a Cell<usize>,
}

impl<'de> Visitor<'de> for ArrayItems<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of job specifications")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(spec) = seq.next_element::<JobSpec>()? {
            let index = self.next_index.get();
            if self.tx.blocking_send(Ok((index, spec))).is_err() {
                return Err(de::Error::custom("consumer stopped"));
            }
            self.next_index.set(index + 1);
        }
        Ok(())
    }
}
