//! Contracts of the surrounding server that the core consumes.
//!
//! The resource index, the file storage area and the transcoding codecs are
//! external collaborators; the core only sees them through these traits.

use crate::error::RelayError;
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;

/// Where an inbound C-STORE sub-operation came from.
#[derive(Debug, Clone)]
pub struct StoreOrigin {
	pub remote_aet: AE,
	pub remote_ip: String,
	pub called_aet: AE,
}

/// Result of handing a received instance to the storage layer.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
	/// Placed verbatim in the C-STORE RSP DimseStatus.
	pub status: US,
	/// Identifier of the stored resource, when storage succeeded.
	pub instance_id: Option<String>,
}

impl StoreOutcome {
	pub const fn success(instance_id: String) -> Self {
		Self {
			status: 0x0000,
			instance_id: Some(instance_id),
		}
	}

	pub const fn failed(status: US) -> Self {
		Self {
			status,
			instance_id: None,
		}
	}
}

/// Receives every data set delivered by a C-GET sub-session.
#[async_trait]
pub trait InstanceSink: Send + Sync {
	async fn on_instance(&self, dataset: InMemDicomObject, origin: &StoreOrigin) -> StoreOutcome;
}

/// Sub-operation progress as reported by the peer, forwarded verbatim.
pub trait ProgressListener: Send + Sync {
	fn on_progress(&self, remaining: US, completed: US, failed: US, warning: US);
}

/// Storage SOP class knowledge of the surrounding server.
#[async_trait]
pub trait SopClassDirectory: Send + Sync {
	/// The storage SOP classes the local side accepts, most relevant first.
	/// `max == 0` means no limit.
	async fn accepted_storage_sop_classes(&self, max: usize) -> Vec<UI>;

	/// The ordered transfer-syntax list proposed for storage contexts.
	async fn proposed_storage_transfer_syntaxes(&self) -> Vec<UI>;
}

/// One file to place into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
	pub instance_id: String,
	/// Path of the entry inside the ZIP.
	pub path: String,
}

/// Read access to the stored DICOM resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
	/// Expands the requested resources into archive entries, in the order
	/// they should appear in the ZIP.
	async fn archive_entries(&self, resources: &[String]) -> Result<Vec<ArchiveEntry>, RelayError>;

	async fn read_instance(&self, instance_id: &str) -> Result<Vec<u8>, RelayError>;
}

/// Opaque transcoding service. Codec internals live outside the core.
pub trait Transcoder: Send + Sync {
	fn transcode(
		&self,
		bytes: Vec<u8>,
		target_transfer_syntax: &str,
		lossy_quality: u8,
	) -> Result<Vec<u8>, RelayError>;
}
