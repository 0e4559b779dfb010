//! Core of a lightweight DICOM store and router.
//!
//! This crate drives DICOM network SCU operations and the long-running
//! jobs that wrap them:
//! - [`connection::ControlConnection`] performs C-ECHO, C-FIND, C-MOVE and
//!   C-GET over a lazily opened association, including the C-GET
//!   sub-session that answers inbound C-STORE requests on the same
//!   association.
//! - [`job::retrieve::RetrieveJob`] turns a list of Find answers into a
//!   resumable, progress-reporting, serializable command sequence in
//!   either C-MOVE or C-GET flavor.
//! - [`job::archive::ArchiveStreamJob`] materializes a ZIP of DICOM
//!   resources as a backpressured byte stream towards an HTTP consumer.
//!
//! The REST surface, the resource index, the file storage area and the
//! transcoding codecs are external collaborators, consumed through the
//! traits in [`context`].

pub mod config;
pub mod connection;
pub mod context;
pub mod dimse;
pub mod error;
pub mod job;
pub mod query;
pub mod types;

pub use connection::{ControlConnection, ScuOperations};
pub use dimse::association::{Association, AssociationParameters, RemoteNode};
pub use error::RelayError;
pub use job::archive::{ArchiveOptions, ArchiveStreamJob, SyncZipSender};
pub use job::registry::MessageRegistry;
pub use job::retrieve::RetrieveJob;
pub use job::{JobRegistry, JobState};
pub use query::{FindAnswer, QueryAnswers};
pub use types::{ManufacturerProfile, QueryFormat, RetrieveLevel};

/// Default application entity title of the relay.
pub const DEFAULT_AET: &str = "DICOM-RELAY";
