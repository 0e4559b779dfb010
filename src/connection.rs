//! The control SCU: Echo, Find, Move and Get against one configured remote,
//! over a lazily opened association.
//!
//! The set of intended operations is fixed at construction so that the
//! association proposal can be assembled up front; a Get-capable connection
//! additionally needs the storage SOP classes the local side can receive.

use crate::context::{InstanceSink, ProgressListener, StoreOrigin};
use crate::dimse::association::{Association, AssociationParameters, AssociationRole};
use crate::dimse::cecho::{CompositeEchoRequest, CompositeEchoResponse};
use crate::dimse::cfind::{CompositeFindRequest, CompositeFindResponse};
use crate::dimse::cget::{CompositeGetRequest, CompositeGetResponse};
use crate::dimse::cmove::{CompositeMoveRequest, CompositeMoveResponse};
use crate::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::dimse::{
	next_message_id, read_message_parts, DicomMessage, DicomMessageReader, DicomMessageWriter,
	PduTransport, StatusType, COMMAND_FIELD_C_GET_RSP, COMMAND_FIELD_C_STORE_RQ,
	STATUS_STORE_CANNOT_UNDERSTAND,
};
use crate::error::RelayError;
use crate::job::registry::MessageRegistry;
use crate::query::{normalize_query, FindAnswer, QueryAnswers};
use crate::types::{ManufacturerProfile, Priority, QueryInformationModel, RetrieveLevel, AE, UI, US};
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::VR;
use dicom::dictionary_std::{tags, uids, StandardDataDictionary};
use std::sync::Arc;
use tracing::{instrument, trace, warn};

/// C-FIND refused with "unable to process", usually an invalid query.
const STATUS_FIND_UNABLE_TO_PROCESS: US = 0xC000;
/// C-MOVE refused with "unable to process", usually an unknown resource.
const STATUS_MOVE_UNABLE_TO_PROCESS: US = 0xC000;

/// The operations a [`ControlConnection`] is allowed to perform, fixed at
/// construction time so the association proposal matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScuOperations(u8);

impl ScuOperations {
	pub const ECHO: Self = Self(1 << 0);
	pub const FIND_PATIENT: Self = Self(1 << 1);
	pub const FIND_STUDY: Self = Self(1 << 2);
	pub const FIND_WORKLIST: Self = Self(1 << 3);
	pub const MOVE_STUDY: Self = Self(1 << 4);
	pub const MOVE_PATIENT: Self = Self(1 << 5);
	pub const GET: Self = Self(1 << 6);

	pub const FIND: Self = Self::FIND_PATIENT.with(Self::FIND_STUDY).with(Self::FIND_WORKLIST);
	pub const MOVE: Self = Self::MOVE_STUDY.with(Self::MOVE_PATIENT);
	pub const ALL: Self = Self::ECHO.with(Self::FIND).with(Self::MOVE).with(Self::GET);

	pub const fn with(self, other: Self) -> Self {
		Self(self.0 | other.0)
	}

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 != 0
	}
}

impl std::ops::BitOr for ScuOperations {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		self.with(rhs)
	}
}

pub struct ControlConnection {
	params: AssociationParameters,
	association: Association,
	progress_listener: Option<Arc<dyn ProgressListener>>,
	registry: Option<MessageRegistry>,
}

impl std::fmt::Debug for ControlConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ControlConnection").finish_non_exhaustive()
	}
}

impl ControlConnection {
	/// A connection for Echo, Find and Move. Constructing a Get-capable
	/// connection without storage SOP classes is a sequence error.
	pub fn new(
		params: AssociationParameters,
		operations: ScuOperations,
	) -> Result<Self, RelayError> {
		if operations.contains(ScuOperations::GET) {
			return Err(RelayError::BadSequenceOfCalls(String::from(
				"Storage SOP classes must be provided for a C-GET SCU",
			)));
		}
		Ok(Self::build(params, operations, &[], &[]))
	}

	/// A connection that may also perform C-GET: `storage_sop_classes` are
	/// proposed in the SCP role with the given transfer syntaxes so that the
	/// peer can send its C-STORE sub-operations over the same association.
	pub fn with_storage(
		params: AssociationParameters,
		operations: ScuOperations,
		storage_sop_classes: &[UI],
		storage_transfer_syntaxes: &[UI],
	) -> Result<Self, RelayError> {
		if operations.contains(ScuOperations::GET) && storage_sop_classes.is_empty() {
			return Err(RelayError::BadSequenceOfCalls(String::from(
				"Storage SOP classes must be provided for a C-GET SCU",
			)));
		}
		Ok(Self::build(
			params,
			operations,
			storage_sop_classes,
			storage_transfer_syntaxes,
		))
	}

	fn build(
		params: AssociationParameters,
		operations: ScuOperations,
		storage_sop_classes: &[UI],
		storage_transfer_syntaxes: &[UI],
	) -> Self {
		let mut association = Association::new();

		if operations.contains(ScuOperations::ECHO) {
			association.propose_generic(uids::VERIFICATION);
		}
		if operations.contains(ScuOperations::FIND_PATIENT) {
			association
				.propose_generic(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
		}
		if operations.contains(ScuOperations::FIND_STUDY) {
			association.propose_generic(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
		}
		if operations.contains(ScuOperations::FIND_WORKLIST) {
			association.propose_generic(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND);
		}
		if operations.contains(ScuOperations::MOVE_PATIENT) {
			association
				.propose_generic(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE);
		}
		if operations.contains(ScuOperations::MOVE_STUDY) {
			association.propose_generic(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE);
		}
		if operations.contains(ScuOperations::GET) {
			association.propose_generic(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET);
			association
				.propose_generic(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET);

			for sop_class in storage_sop_classes {
				association.propose_storage(
					sop_class,
					storage_transfer_syntaxes,
					AssociationRole::ServiceProvider,
				);
			}
		}

		Self {
			params,
			association,
			progress_listener: None,
			registry: None,
		}
	}

	pub fn set_progress_listener(&mut self, listener: Arc<dyn ProgressListener>) {
		self.progress_listener = Some(listener);
	}

	pub fn set_message_registry(&mut self, registry: MessageRegistry) {
		self.registry = Some(registry);
	}

	pub const fn parameters(&self) -> &AssociationParameters {
		&self.params
	}

	/// Closes the underlying association. The next operation re-opens it.
	pub fn close(&mut self) {
		self.association.close();
	}

	fn accepted_context(&self, sop_class: &str, operation: &'static str) -> Result<u8, RelayError> {
		self.association
			.accepted_context_id(sop_class)
			.ok_or_else(|| RelayError::FeatureUnavailable {
				operation,
				remote_aet: AE::from(self.params.remote_aet()),
			})
	}

	/// Issues a C-ECHO and reports whether the peer answered with Success.
	#[instrument(skip_all, fields(remote_aet = self.params.remote_aet()))]
	pub async fn echo(&mut self) -> Result<bool, RelayError> {
		self.association.open(&self.params).await?;
		let context_id = self.accepted_context(uids::VERIFICATION, "C-ECHO")?;
		let transport = self.association.transport()?;
		let timeout = self.params.dimse_timeout();

		let request = CompositeEchoRequest {
			message_id: next_message_id(),
		};
		Association::check(
			transport.write_message(request, Some(context_id), timeout).await,
			&self.params,
			"C-ECHO",
		)?;

		let response = Association::check(
			transport.read_message(timeout).await,
			&self.params,
			"C-ECHO",
		)?;
		let response = Association::check(
			CompositeEchoResponse::try_from(response),
			&self.params,
			"C-ECHO",
		)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);
		trace!(status = response.status, "Received C-ECHO-RSP ({status_type:?})");
		Ok(status_type == StatusType::Success)
	}

	/// Performs a C-FIND at the given level.
	///
	/// With `normalize`, the query is restricted to the attributes allowed
	/// at that level and rewritten for the peer's manufacturer quirks. The
	/// mandatory identifier attributes for the level are always present in
	/// the outgoing identifier, defaulted with the universal matcher.
	#[instrument(skip(self, query), fields(remote_aet = self.params.remote_aet()))]
	pub async fn find(
		&mut self,
		level: RetrieveLevel,
		query: &FindAnswer,
		normalize: bool,
	) -> Result<QueryAnswers, RelayError> {
		let manufacturer = self.params.remote.manufacturer;
		let mut identifier = if normalize {
			apply_manufacturer_quirks(&normalize_query(query, level), manufacturer)
		} else {
			query.clone()
		};

		identifier.set(tags::QUERY_RETRIEVE_LEVEL, level.as_dicom_str());
		default_mandatory_identifiers(&mut identifier, level, manufacturer);

		let model = match level {
			RetrieveLevel::Patient => QueryInformationModel::PatientRoot,
			_ => QueryInformationModel::StudyRoot,
		};

		self.find_internal(model.as_sop_class(), identifier.to_dataset(), false, Some(level))
			.await
	}

	/// Performs a Modality Worklist C-FIND. The query is passed through
	/// unmodified and the answers are flagged as worklist entries.
	#[instrument(skip(self, query), fields(remote_aet = self.params.remote_aet()))]
	pub async fn find_worklist(&mut self, query: &FindAnswer) -> Result<QueryAnswers, RelayError> {
		self.find_internal(
			QueryInformationModel::Worklist.as_sop_class(),
			query.to_dataset(),
			true,
			None,
		)
		.await
	}

	async fn find_internal(
		&mut self,
		sop_class: &str,
		identifier: dicom::object::InMemDicomObject,
		worklist: bool,
		level: Option<RetrieveLevel>,
	) -> Result<QueryAnswers, RelayError> {
		self.association.open(&self.params).await?;
		let context_id = self.accepted_context(sop_class, "C-FIND")?;
		let transport = self.association.transport()?;
		let timeout = self.params.dimse_timeout();

		let request = CompositeFindRequest {
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			affected_sop_class_uid: UI::from(sop_class),
			identifier,
		};
		Association::check(
			transport.write_message(request, Some(context_id), timeout).await,
			&self.params,
			"C-FIND",
		)?;
		trace!("Sent C-FIND-RQ");

		let mut answers = QueryAnswers::new(worklist);
		loop {
			let response = Association::check(
				transport.read_message(timeout).await,
				&self.params,
				"C-FIND",
			)?;
			let response = Association::check(
				CompositeFindResponse::try_from(response),
				&self.params,
				"C-FIND",
			)?;
			trace!(status = response.status, "Received C-FIND-RSP");

			if let Some(data) = response.data {
				let mut answer = FindAnswer::from_dataset(&data);
				if !worklist && answer.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
					if let Some(level) = level {
						answer.set(tags::QUERY_RETRIEVE_LEVEL, level.as_dicom_str());
					}
				}
				answers.add(answer);
			}

			match response.status {
				0x0000 => break,
				// Pending, matches are continuing (with or without optional
				// keys); only C-FIND accepts 0xFF01.
				0xFF00 | 0xFF01 => {}
				STATUS_FIND_UNABLE_TO_PROCESS => {
					return Err(RelayError::dimse_failure(
						"C-FIND",
						self.params.remote_aet(),
						response.status,
						"unable to process - invalid query ?",
					));
				}
				status => {
					return Err(RelayError::dimse_failure(
						"C-FIND",
						self.params.remote_aet(),
						status,
						"",
					));
				}
			}
		}

		Ok(answers)
	}

	/// Retrieves a Find answer via C-MOVE towards `target_aet`, taking the
	/// level from the answer's QueryRetrieveLevel.
	pub async fn move_answer(
		&mut self,
		target_aet: &str,
		answer: &FindAnswer,
		message_id: US,
	) -> Result<(), RelayError> {
		let Some(level) = answer.level() else {
			return Err(RelayError::InternalError(String::from(
				"Find answer has no QueryRetrieveLevel",
			)));
		};
		self.move_resource(target_aet, level, answer, message_id).await
	}

	/// Retrieves a resource via C-MOVE, keeping only the mandatory
	/// identifier tags for the level from the Find answer.
	pub async fn move_resource(
		&mut self,
		target_aet: &str,
		level: RetrieveLevel,
		answer: &FindAnswer,
		message_id: US,
	) -> Result<(), RelayError> {
		let identifier = move_identifier(level, answer)?;
		self.move_internal(target_aet, level, &identifier, message_id)
			.await
	}

	pub async fn move_patient(&mut self, target_aet: &str, patient_id: &str) -> Result<(), RelayError> {
		let mut query = FindAnswer::new();
		query.set(tags::PATIENT_ID, patient_id);
		self.move_internal(target_aet, RetrieveLevel::Patient, &query, next_message_id())
			.await
	}

	pub async fn move_study(&mut self, target_aet: &str, study_uid: &str) -> Result<(), RelayError> {
		let mut query = FindAnswer::new();
		query.set(tags::STUDY_INSTANCE_UID, study_uid);
		self.move_internal(target_aet, RetrieveLevel::Study, &query, next_message_id())
			.await
	}

	pub async fn move_series(
		&mut self,
		target_aet: &str,
		study_uid: &str,
		series_uid: &str,
	) -> Result<(), RelayError> {
		let mut query = FindAnswer::new();
		query.set(tags::STUDY_INSTANCE_UID, study_uid);
		query.set(tags::SERIES_INSTANCE_UID, series_uid);
		self.move_internal(target_aet, RetrieveLevel::Series, &query, next_message_id())
			.await
	}

	pub async fn move_instance(
		&mut self,
		target_aet: &str,
		study_uid: &str,
		series_uid: &str,
		sop_instance_uid: &str,
	) -> Result<(), RelayError> {
		let mut query = FindAnswer::new();
		query.set(tags::STUDY_INSTANCE_UID, study_uid);
		query.set(tags::SERIES_INSTANCE_UID, series_uid);
		query.set(tags::SOP_INSTANCE_UID, sop_instance_uid);
		self.move_internal(target_aet, RetrieveLevel::Instance, &query, next_message_id())
			.await
	}

	#[instrument(skip(self, query), fields(remote_aet = self.params.remote_aet()))]
	async fn move_internal(
		&mut self,
		target_aet: &str,
		level: RetrieveLevel,
		query: &FindAnswer,
		message_id: US,
	) -> Result<(), RelayError> {
		self.association.open(&self.params).await?;

		// The Study Root model carries every level; the level itself
		// travels in the identifier.
		let sop_class = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
		let context_id = self.accepted_context(sop_class, "C-MOVE")?;

		let mut identifier =
			apply_manufacturer_quirks(query, self.params.remote.manufacturer);
		identifier.set(tags::QUERY_RETRIEVE_LEVEL, level.as_dicom_str());

		let transport = self.association.transport()?;
		let timeout = self.params.dimse_timeout();

		let request = CompositeMoveRequest {
			identifier: identifier.to_dataset(),
			message_id,
			priority: Priority::Medium as US,
			affected_sop_class_uid: UI::from(sop_class),
			destination: AE::from(target_aet),
		};
		Association::check(
			transport.write_message(request, Some(context_id), timeout).await,
			&self.params,
			"C-MOVE",
		)?;
		trace!("Sent C-MOVE-RQ");

		loop {
			let response = Association::check(
				transport.read_message(timeout).await,
				&self.params,
				"C-MOVE",
			)?;
			let response = Association::check(
				CompositeMoveResponse::try_from(response),
				&self.params,
				"C-MOVE",
			)?;
			trace!(status = response.status, "Received C-MOVE-RSP");

			if let Some(listener) = self.progress_listener.as_deref() {
				let counts = response.counts;
				listener.on_progress(counts.remaining, counts.completed, counts.failed, counts.warning);
			}

			match response.status {
				0x0000 => break,
				// Pending, sub-operations are continuing. Unlike C-FIND,
				// C-MOVE does not accept 0xFF01.
				0xFF00 => {}
				STATUS_MOVE_UNABLE_TO_PROCESS => {
					return Err(RelayError::dimse_failure(
						"C-MOVE",
						self.params.remote_aet(),
						response.status,
						"unable to process - resource not found ?",
					));
				}
				status => {
					return Err(RelayError::dimse_failure(
						"C-MOVE",
						self.params.remote_aet(),
						status,
						"",
					));
				}
			}
		}

		Ok(())
	}

	/// Runs a C-GET sub-session for one Find answer.
	///
	/// The same association interleaves C-GET responses with inbound
	/// C-STORE requests; each received data set is handed to `sink` and the
	/// returned status is placed verbatim in the C-STORE response. When a
	/// message registry is attached, stored instances are attributed to the
	/// `(local AET, message id)` pair of this call.
	///
	/// Terminating early on a receive or send failure leaves the
	/// association open; it is the owner's responsibility to `close`.
	#[instrument(skip(self, find_result, sink), fields(remote_aet = self.params.remote_aet()))]
	pub async fn get(
		&mut self,
		find_result: &FindAnswer,
		sink: &dyn InstanceSink,
		message_id: US,
	) -> Result<(), RelayError> {
		self.association.open(&self.params).await?;

		let Some(level) = find_result.level() else {
			return Err(RelayError::InternalError(String::from(
				"Find answer has no QueryRetrieveLevel",
			)));
		};
		let sop_class = match level {
			RetrieveLevel::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
			_ => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
		};
		let context_id = self.accepted_context(sop_class, "C-GET")?;

		let identifier =
			apply_manufacturer_quirks(find_result, self.params.remote.manufacturer);

		let transport = self.association.transport()?;
		let timeout = self.params.dimse_timeout();
		let origin = StoreOrigin {
			remote_aet: AE::from(self.params.remote_aet()),
			remote_ip: transport.peer_address(),
			called_aet: self.params.local_aet.clone(),
		};

		let request = CompositeGetRequest {
			identifier: identifier.to_dataset(),
			message_id,
			priority: Priority::Medium as US,
			affected_sop_class_uid: UI::from(sop_class),
		};
		Association::check(
			transport.write_message(request, Some(context_id), timeout).await,
			&self.params,
			"C-GET",
		)?;
		trace!("Sent C-GET-RQ");

		// As long as the final C-GET response has not arrived, the peer is
		// free to interleave C-STORE sub-operations.
		loop {
			let incoming = Association::check(
				read_message_parts(transport, timeout).await,
				&self.params,
				"C-GET",
			)?;
			let data = incoming.data;
			let message = DicomMessage {
				command: incoming.command,
				data: None,
				presentation_context_id: incoming.presentation_context_id,
			};
			let command_field = Association::check(
				message.command_field(),
				&self.params,
				"C-GET",
			)?;

			if command_field == COMMAND_FIELD_C_GET_RSP {
				let response = Association::check(
					CompositeGetResponse::try_from(&message),
					&self.params,
					"C-GET",
				)?;
				trace!(status = response.status, "Received C-GET-RSP");

				if let Some(listener) = self.progress_listener.as_deref() {
					let counts = response.counts;
					listener.on_progress(
						counts.remaining,
						counts.completed,
						counts.failed,
						counts.warning,
					);
				}

				if response.status == 0x0000 {
					break;
				}
			} else if command_field == COMMAND_FIELD_C_STORE_RQ {
				let store_request = Association::check(
					CompositeStoreRequest::try_from(&message),
					&self.params,
					"C-GET",
				)?;
				trace!(
					sop_instance_uid = %store_request.affected_sop_instance_uid,
					"Received C-STORE-RQ"
				);

				if !store_request.has_data_set {
					warn!("C-GET SCU handler: Incoming C-STORE with no dataset");
				}

				let status = match data {
					Some(Ok(dataset)) => {
						let outcome = sink.on_instance(dataset, &origin).await;
						if let (Some(registry), Some(instance_id)) =
							(&self.registry, &outcome.instance_id)
						{
							registry.add_received_instance_from_cstore(
								message_id,
								&self.params.local_aet,
								instance_id,
							);
						}
						outcome.status
					}
					Some(Err(err)) => {
						warn!("C-GET SCU handler: Failed to receive dataset: {err}");
						STATUS_STORE_CANNOT_UNDERSTAND
					}
					None => STATUS_STORE_CANNOT_UNDERSTAND,
				};

				let response = CompositeStoreResponse::answering(&store_request, status);
				Association::check(
					transport
						.write_message(response, message.presentation_context_id, timeout)
						.await,
					&self.params,
					"C-GET",
				)?;
				trace!("Sent C-STORE-RSP");
			} else {
				warn!(
					"Expected C-GET response or C-STORE request but received DIMSE command 0x{command_field:04X}"
				);
				return Err(RelayError::NetworkProtocol {
					operation: "C-GET",
					remote_aet: AE::from(self.params.remote_aet()),
					details: format!("Unexpected DIMSE command 0x{command_field:04X}"),
					dimse_status: None,
				});
			}
		}

		Ok(())
	}
}

/// Rewrites the `"*"` universal matcher into an empty match for peers that
/// reject it, either everywhere or only in date fields.
fn apply_manufacturer_quirks(
	fields: &FindAnswer,
	manufacturer: ManufacturerProfile,
) -> FindAnswer {
	match manufacturer {
		ManufacturerProfile::GenericNoUniversalWildcard
		| ManufacturerProfile::GenericNoWildcardInDates => {
			let mut fixed = FindAnswer::new();
			for (tag, value) in fields.iter() {
				let rewrite = value == "*"
					&& (manufacturer == ManufacturerProfile::GenericNoUniversalWildcard
						|| vr_of(*tag) == VR::DA);
				fixed.set(*tag, if rewrite { "" } else { value });
			}
			fixed
		}
		_ => fields.clone(),
	}
}

fn vr_of(tag: dicom::object::Tag) -> VR {
	StandardDataDictionary
		.by_tag(tag)
		.map_or(VR::UN, |entry| entry.vr().relaxed())
}

/// Inserts the identifier attributes expected at each level when the query
/// does not constrain them. GE peers want the `"*"` universal matcher,
/// everything else gets the empty string.
fn default_mandatory_identifiers(
	identifier: &mut FindAnswer,
	level: RetrieveLevel,
	manufacturer: ManufacturerProfile,
) {
	let universal = if manufacturer == ManufacturerProfile::GE {
		"*"
	} else {
		""
	};

	if level == RetrieveLevel::Instance && !identifier.contains(tags::SOP_INSTANCE_UID) {
		identifier.set(tags::SOP_INSTANCE_UID, universal);
	}
	if matches!(level, RetrieveLevel::Instance | RetrieveLevel::Series)
		&& !identifier.contains(tags::SERIES_INSTANCE_UID)
	{
		identifier.set(tags::SERIES_INSTANCE_UID, universal);
	}
	if matches!(
		level,
		RetrieveLevel::Instance | RetrieveLevel::Series | RetrieveLevel::Study
	) {
		if !identifier.contains(tags::ACCESSION_NUMBER) {
			identifier.set(tags::ACCESSION_NUMBER, universal);
		}
		if !identifier.contains(tags::STUDY_INSTANCE_UID) {
			identifier.set(tags::STUDY_INSTANCE_UID, universal);
		}
	}
	if !identifier.contains(tags::PATIENT_ID) {
		identifier.set(tags::PATIENT_ID, universal);
	}
}

/// Copies the mandatory identifier tags for the level out of a Find answer,
/// or reports which one is missing.
fn move_identifier(level: RetrieveLevel, answer: &FindAnswer) -> Result<FindAnswer, RelayError> {
	let required: &[dicom::object::Tag] = match level {
		RetrieveLevel::Patient => &[tags::PATIENT_ID],
		RetrieveLevel::Study => &[tags::STUDY_INSTANCE_UID],
		RetrieveLevel::Series => &[tags::STUDY_INSTANCE_UID, tags::SERIES_INSTANCE_UID],
		RetrieveLevel::Instance => &[
			tags::STUDY_INSTANCE_UID,
			tags::SERIES_INSTANCE_UID,
			tags::SOP_INSTANCE_UID,
		],
	};

	let mut identifier = FindAnswer::new();
	for tag in required {
		match answer.get(*tag) {
			Some(value) => identifier.set(*tag, value),
			None => {
				return Err(RelayError::BadRequest(format!("Missing tag {tag}")));
			}
		}
	}
	Ok(identifier)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::association::RemoteNode;

	fn params(manufacturer: ManufacturerProfile) -> AssociationParameters {
		AssociationParameters {
			local_aet: AE::from("RELAY"),
			remote: RemoteNode {
				aet: AE::from("REMOTE"),
				host: String::from("127.0.0.1"),
				port: 104,
				manufacturer,
			},
			timeout: Some(5),
		}
	}

	#[test]
	fn get_capable_connection_requires_storage_classes() {
		let err = ControlConnection::new(params(ManufacturerProfile::Generic), ScuOperations::GET)
			.unwrap_err();
		assert!(matches!(err, RelayError::BadSequenceOfCalls(_)));

		let err = ControlConnection::with_storage(
			params(ManufacturerProfile::Generic),
			ScuOperations::GET,
			&[],
			&[],
		)
		.unwrap_err();
		assert!(matches!(err, RelayError::BadSequenceOfCalls(_)));
	}

	#[test]
	fn operation_sets_compose() {
		let operations = ScuOperations::ECHO | ScuOperations::FIND_STUDY;
		assert!(operations.contains(ScuOperations::ECHO));
		assert!(operations.contains(ScuOperations::FIND_STUDY));
		assert!(!operations.contains(ScuOperations::GET));
		assert!(ScuOperations::ALL.contains(ScuOperations::MOVE_PATIENT));
	}

	#[test]
	fn ge_defaults_use_the_universal_matcher() {
		let mut identifier = FindAnswer::new();
		identifier.set(tags::PATIENT_ID, "X*");
		default_mandatory_identifiers(
			&mut identifier,
			RetrieveLevel::Study,
			ManufacturerProfile::GE,
		);

		assert_eq!(identifier.get(tags::PATIENT_ID), Some("X*"));
		assert_eq!(identifier.get(tags::STUDY_INSTANCE_UID), Some("*"));
		assert_eq!(identifier.get(tags::ACCESSION_NUMBER), Some("*"));
		assert!(!identifier.contains(tags::SERIES_INSTANCE_UID));
		assert!(!identifier.contains(tags::SOP_INSTANCE_UID));
	}

	#[test]
	fn generic_defaults_are_empty_strings() {
		let mut identifier = FindAnswer::new();
		default_mandatory_identifiers(
			&mut identifier,
			RetrieveLevel::Instance,
			ManufacturerProfile::Generic,
		);

		for tag in [
			tags::PATIENT_ID,
			tags::STUDY_INSTANCE_UID,
			tags::ACCESSION_NUMBER,
			tags::SERIES_INSTANCE_UID,
			tags::SOP_INSTANCE_UID,
		] {
			assert_eq!(identifier.get(tag), Some(""));
		}
	}

	#[test]
	fn universal_wildcard_is_rewritten_for_quirky_peers() {
		let mut query = FindAnswer::new();
		query.set(tags::PATIENT_NAME, "*");
		query.set(tags::STUDY_DATE, "*");
		query.set(tags::PATIENT_ID, "123");

		let fixed =
			apply_manufacturer_quirks(&query, ManufacturerProfile::GenericNoUniversalWildcard);
		assert_eq!(fixed.get(tags::PATIENT_NAME), Some(""));
		assert_eq!(fixed.get(tags::STUDY_DATE), Some(""));
		assert_eq!(fixed.get(tags::PATIENT_ID), Some("123"));
	}

	#[test]
	fn date_wildcard_rewrite_only_touches_date_fields() {
		let mut query = FindAnswer::new();
		query.set(tags::PATIENT_NAME, "*");
		query.set(tags::STUDY_DATE, "*");

		let fixed =
			apply_manufacturer_quirks(&query, ManufacturerProfile::GenericNoWildcardInDates);
		assert_eq!(fixed.get(tags::PATIENT_NAME), Some("*"));
		assert_eq!(fixed.get(tags::STUDY_DATE), Some(""));
	}

	#[test]
	fn move_identifier_keeps_exactly_the_mandatory_tags() {
		let mut answer = FindAnswer::new();
		answer.set(tags::QUERY_RETRIEVE_LEVEL, "SERIES");
		answer.set(tags::STUDY_INSTANCE_UID, "1.2");
		answer.set(tags::SERIES_INSTANCE_UID, "1.2.3");
		answer.set(tags::PATIENT_NAME, "DOE^JOHN");

		let identifier = move_identifier(RetrieveLevel::Series, &answer).unwrap();
		assert_eq!(identifier.get(tags::STUDY_INSTANCE_UID), Some("1.2"));
		assert_eq!(identifier.get(tags::SERIES_INSTANCE_UID), Some("1.2.3"));
		assert!(!identifier.contains(tags::PATIENT_NAME));
		assert!(!identifier.contains(tags::QUERY_RETRIEVE_LEVEL));
	}

	#[test]
	fn move_identifier_reports_missing_mandatory_tags() {
		let mut answer = FindAnswer::new();
		answer.set(tags::STUDY_INSTANCE_UID, "1.2");

		let err = move_identifier(RetrieveLevel::Instance, &answer).unwrap_err();
		assert!(matches!(err, RelayError::BadRequest(_)));
	}
}
