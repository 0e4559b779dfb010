//! Client association lifecycle.
//!
//! The `dicom-ul` upper layer uses blocking socket I/O. Every open
//! association therefore owns a dedicated OS thread that runs the socket
//! loop; callers talk to it through a bounded command channel with an ask
//! pattern, which is also where DIMSE timeouts are enforced. Closing the
//! association shuts the TCP stream down, which interrupts a blocked read
//! on the backend thread.

use crate::error::RelayError;
use crate::types::{ManufacturerProfile, AE, UI};
use dicom::ul::association::Error as UlError;
use dicom::ul::pdu::{
	PDataValueType, PresentationContextNegotiated, PresentationContextResultReason,
};
use dicom::ul::Pdu;
use serde::{Deserialize, Serialize};
use std::convert::identity;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::PduTransport;

/// The remote application entity an association is opened against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
	#[serde(rename = "AET")]
	pub aet: AE,
	#[serde(rename = "Host")]
	pub host: String,
	#[serde(rename = "Port")]
	pub port: u16,
	#[serde(rename = "Manufacturer", default)]
	pub manufacturer: ManufacturerProfile,
}

impl RemoteNode {
	fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

/// Immutable call configuration, consumed by every `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationParameters {
	#[serde(rename = "LocalAet")]
	pub local_aet: AE,
	#[serde(rename = "Remote")]
	pub remote: RemoteNode,
	/// DIMSE timeout in seconds; `None` means blocking reads.
	#[serde(rename = "Timeout")]
	pub timeout: Option<u32>,
}

impl AssociationParameters {
	/// The deadline applied to a single DIMSE send or receive.
	pub fn dimse_timeout(&self) -> Duration {
		self.timeout
			.map_or(Duration::MAX, |secs| Duration::from_secs(u64::from(secs)))
	}

	pub fn remote_aet(&self) -> &str {
		&self.remote.aet
	}
}

/// The role negotiated for a proposed presentation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRole {
	ServiceUser,
	ServiceProvider,
}

/// One entry in the association proposal. Lives only until the association
/// is opened.
#[derive(Debug, Clone)]
pub struct PresentationContextProposal {
	pub abstract_syntax: UI,
	pub transfer_syntaxes: Vec<UI>,
	pub role: AssociationRole,
}

/// Transfer syntaxes proposed for control operations (C-ECHO, C-FIND,
/// C-MOVE, C-GET): Implicit VR Little Endian first, per the DICOM default.
pub const GENERIC_TRANSFER_SYNTAXES: [&str; 2] = [
	dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN,
	dicom::dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN,
];

/// One DICOM association lifecycle: accumulate proposals, open, look up
/// accepted contexts, close. Created closed; `open` is idempotent.
pub struct Association {
	proposals: Vec<PresentationContextProposal>,
	channel: Option<ClientChannel>,
}

impl Association {
	pub const fn new() -> Self {
		Self {
			proposals: Vec::new(),
			channel: None,
		}
	}

	/// Registers a proposal using the default transfer-syntax list for
	/// control operations. Must be called before `open`.
	pub fn propose_generic(&mut self, abstract_syntax: &str) {
		self.proposals.push(PresentationContextProposal {
			abstract_syntax: UI::from(abstract_syntax),
			transfer_syntaxes: GENERIC_TRANSFER_SYNTAXES.map(UI::from).to_vec(),
			role: AssociationRole::ServiceUser,
		});
	}

	/// Registers a storage-class proposal with an explicit ordered
	/// transfer-syntax list and role.
	pub fn propose_storage(
		&mut self,
		abstract_syntax: &str,
		transfer_syntaxes: &[UI],
		role: AssociationRole,
	) {
		self.proposals.push(PresentationContextProposal {
			abstract_syntax: UI::from(abstract_syntax),
			transfer_syntaxes: transfer_syntaxes.to_vec(),
			role,
		});
	}

	pub const fn is_open(&self) -> bool {
		self.channel.is_some()
	}

	/// Opens the association with the accumulated proposals. A second call
	/// on an already-open association is a no-op.
	pub async fn open(&mut self, params: &AssociationParameters) -> Result<(), RelayError> {
		if self.channel.is_some() {
			return Ok(());
		}

		let mut channel = ClientChannel::connect(params, &self.proposals)
			.await
			.map_err(|err| RelayError::NetworkProtocol {
				operation: "A-ASSOCIATE",
				remote_aet: AE::from(params.remote_aet()),
				details: err.to_string(),
				dimse_status: None,
			})?;

		// The negotiation result also lists the contexts the peer turned
		// down; the association is only usable with at least one acceptance.
		let accepted_any = channel
			.presentation_contexts()
			.iter()
			.any(|pctx| pctx.reason == PresentationContextResultReason::Acceptance);
		if !accepted_any {
			channel.close();
			return Err(RelayError::ServiceUnavailable {
				remote_aet: AE::from(params.remote_aet()),
			});
		}

		self.channel = Some(channel);
		Ok(())
	}

	/// The peer-accepted presentation context id for the given abstract
	/// syntax, or `None` if the peer did not accept one.
	pub fn accepted_context_id(&self, abstract_syntax: &str) -> Option<u8> {
		self.channel.as_ref().and_then(|channel| {
			channel
				.presentation_contexts()
				.iter()
				.find(|pctx| {
					pctx.reason == PresentationContextResultReason::Acceptance
						&& pctx.abstract_syntax == abstract_syntax
				})
				.map(|pctx| pctx.id)
		})
	}

	/// Releases the channel. Safe to call on a closed association.
	pub fn close(&mut self) {
		if let Some(mut channel) = self.channel.take() {
			channel.close();
		}
	}

	/// The open transport, or `BadSequenceOfCalls` when `open` was skipped.
	pub fn transport(&self) -> Result<&ClientChannel, RelayError> {
		self.channel.as_ref().ok_or_else(|| {
			RelayError::BadSequenceOfCalls(String::from(
				"The association must be opened before any DIMSE exchange",
			))
		})
	}

	/// Translates a transport-level failure into the public taxonomy,
	/// preserving the remote AET.
	pub fn check<T, E>(
		result: Result<T, E>,
		params: &AssociationParameters,
		operation: &'static str,
	) -> Result<T, RelayError>
	where
		E: std::fmt::Display,
	{
		result.map_err(|err| RelayError::NetworkProtocol {
			operation,
			remote_aet: AE::from(params.remote_aet()),
			details: err.to_string(),
			dimse_status: None,
		})
	}
}

impl Default for Association {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn association thread: {0}")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Client(#[from] UlError),
}

pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

/// PDU transport over one established client association.
///
/// Socket I/O runs on a backend thread; dropping the channel sender makes
/// the thread abort the association and exit.
pub struct ClientChannel {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

impl ClientChannel {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					association.send(pdu).map_err(AssociationError::Client)
				} else {
					let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
					if data_length > association.acceptor_max_pdu_length() as usize {
						for pdv in data {
							let mut writer = association.send_pdata(pdv.presentation_context_id);
							writer
								.write_all(&pdv.data)
								.map_err(AssociationError::ChunkWriter)?;
						}
						Ok(())
					} else {
						association.send(pdu).map_err(AssociationError::Client)
					}
				}
			}
			_ => association.send(pdu).map_err(AssociationError::Client),
		}
	}

	#[instrument(skip_all, fields(remote_aet = params.remote_aet()))]
	pub async fn connect(
		params: &AssociationParameters,
		proposals: &[PresentationContextProposal],
	) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = params.remote.address();
		let mut options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(params.local_aet.clone())
			.called_ae_title(params.remote.aet.clone());
		for proposal in proposals {
			options = options.with_presentation_context(
				proposal.abstract_syntax.clone(),
				proposal.transfer_syntaxes.clone(),
			);
		}

		let _handle = thread::Builder::new()
			.name(format!("assoc-{}", params.remote.aet))
			.spawn(move || {
				let mut association = match options.establish(address.as_str()) {
					Ok(mut association) => {
						let presentation_contexts =
							Vec::from(association.presentation_contexts());

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream should be cloneable");

						connect_tx
							.send(Ok((stream, presentation_contexts)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Client);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in association backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort association: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) =
			connect_result.await.map_err(|_| ChannelError::Closed)??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// The IP address of the connected peer, for store-origin reporting.
	pub fn peer_address(&self) -> String {
		self.tcp_stream
			.peer_addr()
			.map(|addr| addr.ip().to_string())
			.unwrap_or_default()
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}
}

impl Drop for ClientChannel {
	fn drop(&mut self) {
		self.close();
	}
}

impl PduTransport for ClientChannel {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn params() -> AssociationParameters {
		AssociationParameters {
			local_aet: AE::from("RELAY"),
			remote: RemoteNode {
				aet: AE::from("REMOTE"),
				host: String::from("127.0.0.1"),
				port: 11112,
				manufacturer: ManufacturerProfile::Generic,
			},
			timeout: Some(10),
		}
	}

	#[test]
	fn dimse_timeout_defaults_to_blocking() {
		let mut p = params();
		assert_eq!(p.dimse_timeout(), Duration::from_secs(10));
		p.timeout = None;
		assert_eq!(p.dimse_timeout(), Duration::MAX);
	}

	#[test]
	fn closed_association_has_no_contexts() {
		let association = Association::new();
		assert!(!association.is_open());
		assert_eq!(association.accepted_context_id("1.2.840.10008.1.1"), None);
	}

	#[test]
	fn close_is_safe_on_a_closed_association() {
		let mut association = Association::new();
		association.close();
		association.close();
		assert!(!association.is_open());
	}

	#[test]
	fn transport_before_open_is_a_sequence_error() {
		let association = Association::new();
		assert!(matches!(
			association.transport(),
			Err(RelayError::BadSequenceOfCalls(_))
		));
	}

	#[test]
	fn parameters_serialize_with_job_field_names() {
		let json = serde_json::to_value(params()).unwrap();
		assert_eq!(json["LocalAet"], "RELAY");
		assert_eq!(json["Remote"]["AET"], "REMOTE");
		assert_eq!(json["Remote"]["Port"], 11112);
		assert_eq!(json["Timeout"], 10);
	}
}
