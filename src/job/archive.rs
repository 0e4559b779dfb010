//! ZIP archive production, either streamed towards an HTTP consumer while
//! the job runs or buffered into a temporary file first.
//!
//! The streaming path shares a bounded chunk queue between the job
//! (producer) and a [`SyncZipSender`] (consumer). The producer observes a
//! closed queue as "the HTTP client has disconnected"; the consumer ends on
//! the terminal marker or once the job reaches a dead state.

use crate::context::{ArchiveEntry, ResourceStore, Transcoder};
use crate::error::RelayError;
use crate::job::{Job, JobId, JobRegistry, StepOutcome};
use crate::types::UI;
use async_trait::async_trait;
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::Bytes;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::PollSender;
use tracing::{debug, info, warn};

/// How long the consumer waits on the queue before probing the job state.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Producer→consumer unit: a slice of the ZIP byte stream, or the terminal
/// marker. The marker appears at most once and at the end.
#[derive(Debug, Clone)]
pub enum ArchiveChunk {
	Data(Bytes),
	Done,
}

/// Creates the bounded queue shared between an [`ArchiveStreamJob`] and a
/// [`SyncZipSender`].
pub fn chunk_queue(capacity: usize) -> (Sender<ArchiveChunk>, Receiver<ArchiveChunk>) {
	tokio::sync::mpsc::channel(capacity)
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
	/// Lay the entries out as a DICOMDIR media tree instead of the
	/// hierarchical paths of the resource index.
	pub media: bool,
	/// Suggested download filename.
	pub filename: String,
	/// Transcode every instance to this transfer syntax before archiving.
	pub transcode: Option<UI>,
	pub lossy_quality: u8,
}

impl Default for ArchiveOptions {
	fn default() -> Self {
		Self {
			media: false,
			filename: String::from("Archive.zip"),
			transcode: None,
			lossy_quality: 90,
		}
	}
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

enum ArchiveTarget {
	Stream {
		sender: Sender<ArchiveChunk>,
	},
	TempFile {
		// Keeps the file alive (and deleted) for the job's lifetime.
		guard: NamedTempFile,
	},
}

/// Produces a ZIP of the requested DICOM resources.
pub struct ArchiveStreamJob {
	store: Arc<dyn ResourceStore>,
	transcoder: Option<Arc<dyn Transcoder>>,
	resources: Vec<String>,
	options: ArchiveOptions,
	target: ArchiveTarget,
	archive_size: Arc<AtomicU64>,
	entries: Option<Vec<ArchiveEntry>>,
	writer: Option<ZipFileWriter<BoxedWriter>>,
	next_entry: usize,
	finished: bool,
}

impl ArchiveStreamJob {
	/// A job that pushes the ZIP bytes into `queue` while it runs.
	pub fn streaming(
		store: Arc<dyn ResourceStore>,
		resources: Vec<String>,
		options: ArchiveOptions,
		queue: Sender<ArchiveChunk>,
	) -> Self {
		Self::new(store, resources, options, ArchiveTarget::Stream { sender: queue })
	}

	/// A job that buffers the ZIP into a temporary file, for the legacy
	/// non-streaming path. Returns the file path to serve afterwards.
	pub fn to_temp_file(
		store: Arc<dyn ResourceStore>,
		resources: Vec<String>,
		options: ArchiveOptions,
	) -> Result<(Self, std::path::PathBuf), RelayError> {
		let guard =
			NamedTempFile::new().map_err(|err| RelayError::CannotWriteFile(err.to_string()))?;
		let path = guard.path().to_path_buf();
		let job = Self::new(store, resources, options, ArchiveTarget::TempFile { guard });
		Ok((job, path))
	}

	fn new(
		store: Arc<dyn ResourceStore>,
		resources: Vec<String>,
		options: ArchiveOptions,
		target: ArchiveTarget,
	) -> Self {
		Self {
			store,
			transcoder: None,
			resources,
			options,
			target,
			archive_size: Arc::new(AtomicU64::new(0)),
			entries: None,
			writer: None,
			next_entry: 0,
			finished: false,
		}
	}

	pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
		self.transcoder = Some(transcoder);
		self
	}

	/// Bytes produced so far.
	pub fn archive_size(&self) -> u64 {
		self.archive_size.load(Ordering::Relaxed)
	}

	fn open_writer(&mut self) -> Result<(), RelayError> {
		let inner: BoxedWriter = match &self.target {
			ArchiveTarget::Stream { sender } => Box::pin(CountingWriter::new(
				ChunkQueueWriter::new(sender.clone()),
				Arc::clone(&self.archive_size),
			)),
			ArchiveTarget::TempFile { guard } => {
				let file = guard
					.reopen()
					.map_err(|err| RelayError::CannotWriteFile(err.to_string()))?;
				Box::pin(CountingWriter::new(
					tokio::fs::File::from_std(file),
					Arc::clone(&self.archive_size),
				))
			}
		};
		self.writer = Some(ZipFileWriter::with_tokio(inner));
		Ok(())
	}

	fn write_failed(&self, details: String) -> RelayError {
		match &self.target {
			// The queue only fails once the consumer is gone.
			ArchiveTarget::Stream { .. } => RelayError::Disconnected,
			ArchiveTarget::TempFile { .. } => RelayError::CannotWriteFile(details),
		}
	}

	async fn write_next_entry(&mut self) -> Result<(), RelayError> {
		let entries = self.entries.as_ref().expect("entries are resolved");
		let entry = &entries[self.next_entry];

		if let ArchiveTarget::Stream { sender } = &self.target {
			if sender.is_closed() {
				return Err(RelayError::Disconnected);
			}
		}

		let mut bytes = self.store.read_instance(&entry.instance_id).await?;
		if let (Some(transcoder), Some(transfer_syntax)) =
			(&self.transcoder, &self.options.transcode)
		{
			bytes = transcoder.transcode(bytes, transfer_syntax, self.options.lossy_quality)?;
		}

		let path = if self.options.media {
			format!("IMAGES/IMG{:06}", self.next_entry + 1)
		} else {
			entry.path.clone()
		};
		debug!(path = %path, size = bytes.len(), "Adding archive entry");

		let builder = ZipEntryBuilder::new(path.into(), Compression::Deflate);
		let written = {
			let writer = self.writer.as_mut().expect("writer is open");
			writer.write_entry_whole(builder, &bytes).await
		};
		written.map_err(|err| self.write_failed(err.to_string()))?;

		self.next_entry += 1;
		Ok(())
	}

	async fn finish(&mut self) -> Result<(), RelayError> {
		if let Some(writer) = self.writer.take() {
			writer
				.close()
				.await
				.map_err(|err| self.write_failed(err.to_string()))?;
		}

		if let ArchiveTarget::Stream { sender } = &self.target {
			// The consumer may already be gone; the marker is then moot.
			if sender.send(ArchiveChunk::Done).await.is_err() {
				warn!("Archive consumer disappeared before the terminal marker");
			}
		}

		self.finished = true;
		info!(
			archive_size = self.archive_size(),
			"Archive completed"
		);
		Ok(())
	}
}

#[async_trait]
impl Job for ArchiveStreamJob {
	async fn step(&mut self) -> Result<StepOutcome, RelayError> {
		if self.finished {
			return Ok(StepOutcome::Done);
		}

		if self.entries.is_none() {
			let entries = self.store.archive_entries(&self.resources).await?;
			debug!(count = entries.len(), "Resolved archive entries");
			self.entries = Some(entries);
			self.open_writer()?;
			return Ok(StepOutcome::Continue);
		}

		if self.next_entry < self.entries.as_ref().map_or(0, Vec::len) {
			self.write_next_entry().await?;
			Ok(StepOutcome::Continue)
		} else {
			self.finish().await?;
			Ok(StepOutcome::Done)
		}
	}

	fn progress(&self) -> f32 {
		match &self.entries {
			Some(entries) if !entries.is_empty() => self.next_entry as f32 / entries.len() as f32,
			Some(_) => 1.0,
			None => 0.0,
		}
	}

	fn public_content(&self) -> Value {
		json!({
			"ArchiveSize": self.archive_size(),
			"InstancesCount": self.entries.as_ref().map_or(0, Vec::len),
		})
	}
}

/// The HTTP-side consumer of the archive chunk queue.
///
/// `content_length` is unknown by construction; the response is chunked
/// with the ZIP MIME type and a suggested filename. HTTP compression
/// negotiation does not apply, the body is already opaque.
pub struct SyncZipSender {
	jobs: JobRegistry,
	job_id: JobId,
	queue: Receiver<ArchiveChunk>,
	filename: String,
	chunk: Bytes,
	done: bool,
}

impl SyncZipSender {
	pub const fn new(
		jobs: JobRegistry,
		job_id: JobId,
		queue: Receiver<ArchiveChunk>,
		filename: String,
	) -> Self {
		Self {
			jobs,
			job_id,
			queue,
			filename,
			chunk: Bytes::new(),
			done: false,
		}
	}

	pub const fn content_type() -> &'static str {
		"application/zip"
	}

	pub fn content_filename(&self) -> &str {
		&self.filename
	}

	/// The body length is not known while the job is still producing.
	pub const fn content_length() -> Option<u64> {
		None
	}

	/// Pulls the next chunk. Returns `false` when the stream is over,
	/// either on the terminal marker or because the job reached a state
	/// that cannot produce more data.
	pub async fn read_next_chunk(&mut self) -> bool {
		loop {
			match tokio::time::timeout(DEQUEUE_TIMEOUT, self.queue.recv()).await {
				Ok(Some(ArchiveChunk::Data(bytes))) => {
					self.chunk = bytes;
					self.done = false;
					return true;
				}
				Ok(Some(ArchiveChunk::Done)) => {
					self.done = true;
					return false;
				}
				// The producer vanished without a marker.
				Ok(None) => return false,
				Err(_) => {
					// Check that the job is still active, which indicates
					// that more data might still arrive.
					let state = self.jobs.state(self.job_id);
					if !state.is_some_and(super::JobState::is_active) {
						return false;
					}
				}
			}
		}
	}

	/// The chunk produced by the last successful `read_next_chunk`.
	pub fn chunk(&self) -> &[u8] {
		debug_assert!(!self.done, "no chunk after the terminal marker");
		&self.chunk
	}
}

/// Bridges the bounded chunk queue to `AsyncWrite` for the ZIP encoder.
/// A closed queue surfaces as a broken pipe.
struct ChunkQueueWriter {
	sender: PollSender<ArchiveChunk>,
}

impl ChunkQueueWriter {
	fn new(sender: Sender<ArchiveChunk>) -> Self {
		Self {
			sender: PollSender::new(sender),
		}
	}
}

fn disconnected() -> std::io::Error {
	std::io::Error::new(
		std::io::ErrorKind::BrokenPipe,
		"archive chunk queue is closed",
	)
}

impl AsyncWrite for ChunkQueueWriter {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let this = self.get_mut();
		match this.sender.poll_reserve(cx) {
			Poll::Ready(Ok(())) => {
				let chunk = ArchiveChunk::Data(Bytes::copy_from_slice(buf));
				if this.sender.send_item(chunk).is_err() {
					return Poll::Ready(Err(disconnected()));
				}
				Poll::Ready(Ok(buf.len()))
			}
			Poll::Ready(Err(_)) => Poll::Ready(Err(disconnected())),
			Poll::Pending => Poll::Pending,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

/// Accumulates the number of bytes written through it.
struct CountingWriter<W> {
	inner: W,
	written: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
	const fn new(inner: W, written: Arc<AtomicU64>) -> Self {
		Self { inner, written }
	}
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_write(cx, buf) {
			Poll::Ready(Ok(written)) => {
				this.written.fetch_add(written as u64, Ordering::Relaxed);
				Poll::Ready(Ok(written))
			}
			other => other,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::JobState;
	use std::collections::HashMap;

	struct FakeStore {
		instances: HashMap<String, Vec<u8>>,
	}

	impl FakeStore {
		fn with_instances(ids: &[&str]) -> Arc<Self> {
			Arc::new(Self {
				instances: ids
					.iter()
					.map(|id| (String::from(*id), format!("DICM-{id}").into_bytes()))
					.collect(),
			})
		}
	}

	#[async_trait]
	impl ResourceStore for FakeStore {
		async fn archive_entries(
			&self,
			resources: &[String],
		) -> Result<Vec<ArchiveEntry>, RelayError> {
			let mut entries: Vec<ArchiveEntry> = resources
				.iter()
				.filter(|id| self.instances.contains_key(*id))
				.map(|id| ArchiveEntry {
					instance_id: id.clone(),
					path: format!("STUDY/{id}.dcm"),
				})
				.collect();
			entries.sort_by(|a, b| a.path.cmp(&b.path));
			Ok(entries)
		}

		async fn read_instance(&self, instance_id: &str) -> Result<Vec<u8>, RelayError> {
			self.instances
				.get(instance_id)
				.cloned()
				.ok_or_else(|| RelayError::BadRequest(format!("Unknown instance {instance_id}")))
		}
	}

	fn resources(ids: &[&str]) -> Vec<String> {
		ids.iter().map(|id| String::from(*id)).collect()
	}

	#[tokio::test]
	async fn streamed_archive_is_drained_through_the_sender() {
		let store = FakeStore::with_instances(&["a", "b"]);
		let (tx, rx) = chunk_queue(16);
		let jobs = JobRegistry::new();

		let job = ArchiveStreamJob::streaming(
			store,
			resources(&["a", "b"]),
			ArchiveOptions::default(),
			tx,
		);
		let id = jobs.submit(job);

		let mut sender =
			SyncZipSender::new(jobs.clone(), id, rx, String::from("Archive.zip"));
		let mut body = Vec::new();
		while sender.read_next_chunk().await {
			body.extend_from_slice(sender.chunk());
		}

		// Local file header magic of the first ZIP entry.
		assert_eq!(&body[..4], b"PK\x03\x04");
		// Wait out the submit bookkeeping before checking the state.
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(jobs.state(id), Some(JobState::Success));
	}

	#[tokio::test]
	async fn disconnected_consumer_fails_the_producer() {
		let store = FakeStore::with_instances(&["a"]);
		let (tx, rx) = chunk_queue(1);
		drop(rx);

		let mut job = ArchiveStreamJob::streaming(
			store,
			resources(&["a"]),
			ArchiveOptions::default(),
			tx,
		);

		// Resolving entries still succeeds; the first write fails.
		assert_eq!(job.step().await.unwrap(), StepOutcome::Continue);
		assert!(matches!(
			job.step().await.unwrap_err(),
			RelayError::Disconnected
		));
	}

	#[tokio::test]
	async fn sender_stops_when_the_job_dies_without_a_marker() {
		let jobs = JobRegistry::new();
		let (tx, rx) = chunk_queue(4);

		// A job that failed before producing anything.
		struct DoomedJob;
		#[async_trait]
		impl Job for DoomedJob {
			async fn step(&mut self) -> Result<StepOutcome, RelayError> {
				Err(RelayError::InternalError(String::from("boom")))
			}
			fn progress(&self) -> f32 {
				0.0
			}
			fn public_content(&self) -> Value {
				Value::Null
			}
		}
		let (id, state) = jobs.submit_and_wait(DoomedJob).await;
		assert_eq!(state, JobState::Failure);

		// Keep the producer side alive so the queue never closes.
		let _tx = tx;
		let mut sender = SyncZipSender::new(jobs, id, rx, String::from("Archive.zip"));
		assert!(!sender.read_next_chunk().await);
	}

	#[tokio::test]
	async fn media_layout_renames_entries() {
		let store = FakeStore::with_instances(&["a"]);
		let (tx, mut rx) = chunk_queue(64);

		let options = ArchiveOptions {
			media: true,
			..ArchiveOptions::default()
		};
		let mut job = ArchiveStreamJob::streaming(store, resources(&["a"]), options, tx);
		while !matches!(job.step().await.unwrap(), StepOutcome::Done) {}

		let mut body = Vec::new();
		while let Some(chunk) = rx.recv().await {
			match chunk {
				ArchiveChunk::Data(bytes) => body.extend_from_slice(&bytes),
				ArchiveChunk::Done => break,
			}
		}
		let haystack = String::from_utf8_lossy(&body);
		assert!(haystack.contains("IMAGES/IMG000001"));
	}

	#[tokio::test]
	async fn temp_file_archive_lands_on_disk() {
		let store = FakeStore::with_instances(&["a", "b"]);
		let (mut job, path) = ArchiveStreamJob::to_temp_file(
			store,
			resources(&["a", "b"]),
			ArchiveOptions::default(),
		)
		.unwrap();

		while !matches!(job.step().await.unwrap(), StepOutcome::Done) {}

		let bytes = std::fs::read(&path).unwrap();
		assert_eq!(&bytes[..4], b"PK\x03\x04");
		assert_eq!(job.archive_size(), bytes.len() as u64);
	}

	#[tokio::test]
	async fn terminal_marker_is_exactly_one_and_last() {
		let store = FakeStore::with_instances(&["a"]);
		let (tx, mut rx) = chunk_queue(64);

		let mut job = ArchiveStreamJob::streaming(
			store,
			resources(&["a"]),
			ArchiveOptions::default(),
			tx,
		);
		while !matches!(job.step().await.unwrap(), StepOutcome::Done) {}
		drop(job);

		let mut markers = 0;
		let mut chunks_after_marker = 0;
		while let Some(chunk) = rx.recv().await {
			match chunk {
				ArchiveChunk::Done => markers += 1,
				ArchiveChunk::Data(_) if markers > 0 => chunks_after_marker += 1,
				ArchiveChunk::Data(_) => {}
			}
		}
		assert_eq!(markers, 1);
		assert_eq!(chunks_after_marker, 0);
	}
}
