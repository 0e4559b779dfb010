//! DIMSE message plumbing on top of the DICOM upper layer.
//!
//! A [`DicomMessage`] is a command set followed by an optional data set,
//! carried as P-DATA PDUs over a negotiated association. The command set is
//! always coded in Implicit VR Little Endian; the data set uses the transfer
//! syntax negotiated for its presentation context.

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod cstore;

use crate::types::{UI, US};
use association::AssociationError;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{
	PDataValue, PDataValueType, PresentationContextNegotiated, PresentationContextResultReason,
};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message
/// contains a data set. For reading, prefer checking against
/// [`DATA_SET_MISSING`] since AEs are free to choose another truthy value.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has
/// no data set (DICOM NULL).
pub const DATA_SET_MISSING: US = 0x0101;

// Command Field (0000,0100) values interpreted by this crate.
// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_E.html>
pub const COMMAND_FIELD_C_STORE_RQ: US = 0x0001;
pub const COMMAND_FIELD_C_STORE_RSP: US = 0x8001;
pub const COMMAND_FIELD_C_GET_RQ: US = 0x0010;
pub const COMMAND_FIELD_C_GET_RSP: US = 0x8010;
pub const COMMAND_FIELD_C_FIND_RQ: US = 0x0020;
pub const COMMAND_FIELD_C_FIND_RSP: US = 0x8020;
pub const COMMAND_FIELD_C_MOVE_RQ: US = 0x0021;
pub const COMMAND_FIELD_C_MOVE_RSP: US = 0x8021;
pub const COMMAND_FIELD_C_ECHO_RQ: US = 0x0030;
pub const COMMAND_FIELD_C_ECHO_RSP: US = 0x8030;

/// C-STORE status sent back when the sub-operation data set could not be
/// received inside a C-GET session.
pub const STATUS_STORE_CANNOT_UNDERSTAND: US = 0xC000;

/// Represents a DICOM message composed of a command set followed by an
/// optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id the message arrived on.
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	/// Command Field (0000,0100) of this message.
	pub fn command_field(&self) -> Result<US, ReadError> {
		self.ushort(tags::COMMAND_FIELD)
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))
	}

	/// Status (0000,0900) of this message.
	pub fn status(&self) -> Result<US, ReadError> {
		self.ushort(tags::STATUS)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))
	}

	pub fn ushort(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn string(&self, tag: Tag) -> Option<UI> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| UI::from(value.trim_end_matches('\0').trim()))
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

/// Sub-operation counters carried by C-MOVE and C-GET responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperationCounts {
	pub remaining: US,
	pub completed: US,
	pub failed: US,
	pub warning: US,
}

impl SubOperationCounts {
	pub fn read_from(message: &DicomMessage) -> Self {
		Self {
			remaining: message
				.ushort(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
				.unwrap_or(0),
			completed: message
				.ushort(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
				.unwrap_or(0),
			failed: message
				.ushort(tags::NUMBER_OF_FAILED_SUBOPERATIONS)
				.unwrap_or(0),
			warning: message
				.ushort(tags::NUMBER_OF_WARNING_SUBOPERATIONS)
				.unwrap_or(0),
		}
	}
}

/// Transport abstraction over one negotiated association.
///
/// The production implementation is [`association::ClientChannel`], which
/// confines the blocking upper-layer socket to a dedicated thread.
pub trait PduTransport {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError>;

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError>;

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated];
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<T: PduTransport> DicomMessageWriter for T {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let presentation_context = match presentation_context_id {
			None => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.reason == PresentationContextResultReason::Acceptance),
			Some(presentation_context_id) => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == presentation_context_id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

/// A fully received message whose data set may have failed to decode.
///
/// Transport failures abort the read; a decoding failure of the data set
/// alone preserves the command set so that a C-GET sub-session can still
/// answer the C-STORE request with an error status.
pub(crate) struct IncomingMessage {
	pub command: InMemDicomObject,
	pub data: Option<Result<InMemDicomObject, ReadError>>,
	pub presentation_context_id: Option<u8>,
}

#[instrument(skip_all)]
pub(crate) async fn read_message_parts<T: PduTransport>(
	transport: &T,
	timeout: Duration,
) -> Result<IncomingMessage, ReadError> {
	let mut command_fragments = Vec::new();
	let mut data_fragments = Vec::new();
	let mut message_command: Option<InMemDicomObject> = None;

	loop {
		let pdu = transport.receive(timeout).await?;
		let Pdu::PData { data } = pdu else {
			return Err(ReadError::UnexpectedPdu(pdu));
		};

		for mut pdv in data {
			match pdv.value_type {
				PDataValueType::Command => {
					trace!("Received command fragment (last={})", pdv.is_last);
					if message_command.is_some() {
						// The command set is complete; another command
						// fragment before the data set is a protocol
						// violation.
						return Err(ReadError::OutOfOrder);
					}
					command_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let command = InMemDicomObject::read_dataset_with_ts(
							command_fragments.as_slice(),
							&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
						)?;
						let has_data_set = command
							.get(tags::COMMAND_DATA_SET_TYPE)
							.map(InMemElement::to_int::<US>)
							.and_then(Result::ok)
							.is_some_and(|value| value != DATA_SET_MISSING);

						if has_data_set {
							message_command = Some(command);
						} else {
							return Ok(IncomingMessage {
								command,
								data: None,
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
				PDataValueType::Data => {
					trace!("Received data fragment (last={})", pdv.is_last);
					data_fragments.append(&mut pdv.data);
					if pdv.is_last {
						let Some(command) = message_command else {
							// Data fragments before the full command set.
							return Err(ReadError::OutOfOrder);
						};
						let decoded = decode_data_set(
							transport,
							pdv.presentation_context_id,
							data_fragments.as_slice(),
						);

						return Ok(IncomingMessage {
							command,
							data: Some(decoded),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}

fn decode_data_set<T: PduTransport>(
	transport: &T,
	presentation_context_id: u8,
	fragments: &[u8],
) -> Result<InMemDicomObject, ReadError> {
	let presentation_context = transport
		.presentation_contexts()
		.iter()
		.find(|pctx| pctx.id == presentation_context_id)
		.ok_or(NegotiationError::NoPresentationContext)?;
	let transfer_syntax = TransferSyntaxRegistry
		.get(&presentation_context.transfer_syntax)
		.ok_or_else(|| {
			NegotiationError::UnknownTransferSyntax(UI::from(
				&presentation_context.transfer_syntax,
			))
		})?;
	Ok(InMemDicomObject::read_dataset_with_ts(
		fragments,
		transfer_syntax,
	)?)
}

impl<T: PduTransport> DicomMessageReader for T {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let message = read_message_parts(self, timeout).await?;
		Ok(DicomMessage {
			command: message.command,
			data: message.data.transpose()?,
			presentation_context_id: message.presentation_context_id,
		})
	}
}

/// Returns a new message id for ad-hoc messages (C-ECHO, C-FIND).
///
/// Ids stay in `1..1000`; ids from 1000 upwards are reserved for retrieve
/// commands, which obtain theirs from the message registry.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst) % 999 + 1
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_type_classification() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xC000), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
	}

	#[test]
	fn ad_hoc_message_ids_stay_below_retrieve_range() {
		for _ in 0..4096 {
			let id = next_message_id();
			assert!((1..1000).contains(&id), "id {id} out of ad-hoc range");
		}
	}
}
