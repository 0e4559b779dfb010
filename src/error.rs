use crate::types::{AE, US};
use thiserror::Error;

/// Error taxonomy of the relay core.
///
/// Transport-level failures from the DIMSE layer are folded into
/// [`RelayError::NetworkProtocol`] at the operation boundary so that callers
/// always see the remote AET they were talking to.
#[derive(Debug, Error)]
pub enum RelayError {
	/// A DIMSE failure or an unexpected command field.
	#[error("{operation} to AET \"{remote_aet}\" failed: {details}")]
	NetworkProtocol {
		operation: &'static str,
		remote_aet: AE,
		details: String,
		/// Terminal DIMSE status, when the failure carries one.
		dimse_status: Option<US>,
	},

	/// The HTTP consumer went away while an archive was being produced.
	#[error("HTTP client has disconnected while creating an archive in synchronous mode")]
	Disconnected,

	/// The requested operation's abstract syntax was not accepted by the peer.
	#[error("{operation} is not available on AET \"{remote_aet}\"")]
	FeatureUnavailable {
		operation: &'static str,
		remote_aet: AE,
	},

	/// The peer accepted none of the proposed presentation contexts.
	#[error("No presentation context was accepted by AET \"{remote_aet}\"")]
	ServiceUnavailable { remote_aet: AE },

	/// The local side had nothing valid to propose.
	#[error("No presentation context to propose: {0}")]
	NoPresentationContext(String),

	/// API misuse, e.g. mutating a job after it has started.
	#[error("Bad sequence of calls: {0}")]
	BadSequenceOfCalls(String),

	/// A malformed job body.
	#[error("Bad file format: {0}")]
	BadFileFormat(String),

	/// A request that cannot be honored, e.g. a Find answer missing the
	/// mandatory identifier tag for the requested level.
	#[error("Bad request: {0}")]
	BadRequest(String),

	#[error("Internal error: {0}")]
	InternalError(String),

	/// Filesystem failure on the archive temp-file path.
	#[error("Cannot write to file: {0}")]
	CannotWriteFile(String),
}

impl RelayError {
	/// DIMSE status attached to a protocol failure, if any.
	///
	/// Retrieve commands persist this value so that a failed command keeps
	/// its terminal status across job serialization.
	pub const fn dimse_status(&self) -> Option<US> {
		match self {
			Self::NetworkProtocol { dimse_status, .. } => *dimse_status,
			_ => None,
		}
	}

	pub(crate) fn dimse_failure(
		operation: &'static str,
		remote_aet: &str,
		status: US,
		hint: &str,
	) -> Self {
		let details = if hint.is_empty() {
			format!("DIMSE status 0x{status:04X}")
		} else {
			format!("DIMSE status 0x{status:04X} ({hint})")
		};
		Self::NetworkProtocol {
			operation,
			remote_aet: AE::from(remote_aet),
			details,
			dimse_status: Some(status),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dimse_failure_formats_hex_status() {
		let err = RelayError::dimse_failure("C-FIND", "PACS", 0xA700, "");
		assert_eq!(err.dimse_status(), Some(0xA700));
		assert!(err.to_string().contains("0xA700"));
		assert!(err.to_string().contains("PACS"));
	}

	#[test]
	fn hint_is_appended_to_details() {
		let err = RelayError::dimse_failure("C-FIND", "PACS", 0xC000, "unable to process");
		assert!(err.to_string().contains("unable to process"));
	}
}
