//! The retrieve job: a sequence of per-answer retrieval commands driven
//! over one control connection, in C-MOVE or C-GET flavor.
//!
//! The two flavors share everything but the actual transfer: the command
//! list, persistence, progress accounting and the message-id bookkeeping
//! live here once; the mode only decides how a single Find answer is
//! fetched.

use crate::connection::{ControlConnection, ScuOperations};
use crate::context::{InstanceSink, ProgressListener, SopClassDirectory};
use crate::dimse::association::{AssociationParameters, RemoteNode};
use crate::dimse::SubOperationCounts;
use crate::error::RelayError;
use crate::job::registry::{CommandState, MessageRegistry};
use crate::job::{Job, StepOutcome};
use crate::query::{FindAnswer, QueryAnswers, MAIN_RETRIEVE_TAGS};
use crate::types::{QueryFormat, AE, UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

const LOCAL_AET: &str = "LocalAet";
const QUERY: &str = "Query";
const QUERY_FORMAT: &str = "QueryFormat";
const COMMANDS: &str = "Commands";
const TARGET_AET: &str = "TargetAet";
const DIMSE_ERROR_STATUS: &str = "DimseErrorStatus";
const RECEIVED_INSTANCES_IDS: &str = "ReceivedInstancesIds";

/// When the Find answers carry no SOP class hints, propose the most common
/// storage SOP classes, bounded by the 128 presentation contexts an
/// association can carry.
const MAX_PROPOSED_STORAGE_CLASSES: usize = 120;

/// One sub-task of a retrieve job, wrapping a stored Find answer.
pub struct RetrieveCommand {
	answer: FindAnswer,
	state: Arc<Mutex<CommandState>>,
	registry: MessageRegistry,
}

impl RetrieveCommand {
	fn new(answer: FindAnswer, registry: MessageRegistry) -> Self {
		Self {
			answer,
			state: Arc::new(Mutex::new(CommandState::default())),
			registry,
		}
	}

	pub const fn answer(&self) -> &FindAnswer {
		&self.answer
	}

	pub fn dimse_status(&self) -> US {
		self.state.lock().expect("command state poisoned").dimse_status
	}

	fn set_dimse_status(&self, status: US) {
		self.state.lock().expect("command state poisoned").dimse_status = status;
	}

	pub fn received_instances(&self) -> Vec<String> {
		self.state
			.lock()
			.expect("command state poisoned")
			.received_instances
			.clone()
	}

	fn add_received_instance(&self, instance_id: &str) {
		self.state
			.lock()
			.expect("command state poisoned")
			.received_instances
			.push(String::from(instance_id));
	}

	const fn state(&self) -> &Arc<Mutex<CommandState>> {
		&self.state
	}
}

impl Drop for RetrieveCommand {
	fn drop(&mut self) {
		self.registry.remove_command(&self.state);
	}
}

/// What distinguishes the C-MOVE flavor from the C-GET flavor.
pub enum RetrieveMode {
	Move {
		target_aet: AE,
	},
	Get {
		/// SOP classes collected from the Find answers, used to narrow the
		/// storage proposal. Empty means "propose the most common ones".
		sop_class_hints: BTreeSet<UI>,
		sink: Arc<dyn InstanceSink>,
		sop_directory: Arc<dyn SopClassDirectory>,
	},
}

/// Shared sub-operation counters, written by the progress listener.
#[derive(Default)]
struct ProgressCounters {
	counts: Mutex<SubOperationCounts>,
}

impl ProgressListener for ProgressCounters {
	fn on_progress(&self, remaining: US, completed: US, failed: US, warning: US) {
		let mut counts = self.counts.lock().expect("progress counters poisoned");
		counts.remaining = remaining;
		counts.completed = completed;
		counts.failed = failed;
		counts.warning = warning;
	}
}

pub struct RetrieveJob {
	params: AssociationParameters,
	mode: RetrieveMode,
	query: QueryAnswers,
	query_format: QueryFormat,
	commands: Vec<RetrieveCommand>,
	next_command: usize,
	started: bool,
	connection: Option<ControlConnection>,
	registry: MessageRegistry,
	progress: Arc<ProgressCounters>,
}

impl RetrieveJob {
	/// A job that retrieves each answer via C-MOVE towards `target_aet`.
	pub fn new_move(
		params: AssociationParameters,
		target_aet: impl Into<AE>,
		registry: MessageRegistry,
	) -> Self {
		Self::new(
			params,
			RetrieveMode::Move {
				target_aet: target_aet.into(),
			},
			registry,
		)
	}

	/// A job that retrieves each answer via C-GET, delivering every
	/// received instance to `sink`.
	pub fn new_get(
		params: AssociationParameters,
		registry: MessageRegistry,
		sink: Arc<dyn InstanceSink>,
		sop_directory: Arc<dyn SopClassDirectory>,
	) -> Self {
		Self::new(
			params,
			RetrieveMode::Get {
				sop_class_hints: BTreeSet::new(),
				sink,
				sop_directory,
			},
			registry,
		)
	}

	fn new(params: AssociationParameters, mode: RetrieveMode, registry: MessageRegistry) -> Self {
		Self {
			params,
			mode,
			query: QueryAnswers::new(false),
			query_format: QueryFormat::Short,
			commands: Vec::new(),
			next_command: 0,
			started: false,
			connection: None,
			registry,
			progress: Arc::new(ProgressCounters::default()),
		}
	}

	/// Appends one Find answer, keeping only the main identifier tags.
	/// For the C-GET flavor, SOPClassesInStudy narrows the storage
	/// proposal.
	pub fn add_find_answer(&mut self, answer: &FindAnswer) {
		if let RetrieveMode::Get {
			sop_class_hints, ..
		} = &mut self.mode
		{
			for sop_class in answer.string_values(tags::SOP_CLASSES_IN_STUDY) {
				sop_class_hints.insert(sop_class);
			}
		}

		let item = answer.restricted_to(MAIN_RETRIEVE_TAGS);
		self.query.add(item.clone());
		self.commands
			.push(RetrieveCommand::new(item, self.registry.clone()));
	}

	/// Appends a raw query, keeping all of its tags. This is how an
	/// explicit C-MOVE request body is turned into a command.
	pub fn add_query(&mut self, query: &FindAnswer) {
		self.query.add(query.clone());
		self.commands
			.push(RetrieveCommand::new(query.clone(), self.registry.clone()));
	}

	pub fn set_local_aet(&mut self, aet: impl Into<AE>) -> Result<(), RelayError> {
		self.check_not_started()?;
		self.params.local_aet = aet.into();
		Ok(())
	}

	pub fn set_remote(&mut self, remote: RemoteNode) -> Result<(), RelayError> {
		self.check_not_started()?;
		self.params.remote = remote;
		Ok(())
	}

	pub fn set_timeout(&mut self, seconds: Option<u32>) -> Result<(), RelayError> {
		self.check_not_started()?;
		self.params.timeout = seconds;
		Ok(())
	}

	pub fn set_query_format(&mut self, format: QueryFormat) -> Result<(), RelayError> {
		self.check_not_started()?;
		self.query_format = format;
		Ok(())
	}

	fn check_not_started(&self) -> Result<(), RelayError> {
		if self.started {
			Err(RelayError::BadSequenceOfCalls(String::from(
				"The job has already started",
			)))
		} else {
			Ok(())
		}
	}

	pub const fn parameters(&self) -> &AssociationParameters {
		&self.params
	}

	pub fn commands(&self) -> &[RetrieveCommand] {
		&self.commands
	}

	/// Drops the control connection. A blocked DIMSE read is interrupted by
	/// the underlying socket shutdown.
	pub fn stop(&mut self) {
		self.connection = None;
	}

	async fn ensure_connection(&mut self) -> Result<(), RelayError> {
		if self.connection.is_some() {
			return Ok(());
		}

		let mut connection = match &self.mode {
			RetrieveMode::Move { .. } => {
				ControlConnection::new(self.params.clone(), ScuOperations::MOVE)?
			}
			RetrieveMode::Get {
				sop_class_hints,
				sop_directory,
				..
			} => {
				let classes = if sop_class_hints.is_empty() {
					sop_directory
						.accepted_storage_sop_classes(MAX_PROPOSED_STORAGE_CLASSES)
						.await
				} else {
					// Keep the hinted SOP classes only if the local side
					// accepts them, preserving the directory's ranking.
					sop_directory
						.accepted_storage_sop_classes(0)
						.await
						.into_iter()
						.filter(|sop_class| sop_class_hints.contains(sop_class))
						.collect()
				};

				if classes.is_empty() {
					return Err(RelayError::NoPresentationContext(String::from(
						"Cannot perform C-Get, no SOP Class UID has been accepted",
					)));
				}

				let transfer_syntaxes =
					sop_directory.proposed_storage_transfer_syntaxes().await;
				ControlConnection::with_storage(
					self.params.clone(),
					ScuOperations::GET,
					&classes,
					&transfer_syntaxes,
				)?
			}
		};

		connection.set_progress_listener(Arc::clone(&self.progress) as Arc<dyn ProgressListener>);
		connection.set_message_registry(self.registry.clone());
		self.connection = Some(connection);
		Ok(())
	}

	async fn retrieve_current(&mut self) -> Result<(), RelayError> {
		self.ensure_connection().await?;

		let command = &self.commands[self.next_command];
		let message_id = self
			.registry
			.allocate(&self.params.local_aet, command.state());
		debug!(
			message_id,
			command = self.next_command,
			"Executing retrieve command"
		);

		let connection = self.connection.as_mut().expect("connection was just set");
		match &self.mode {
			RetrieveMode::Move { target_aet } => {
				connection
					.move_answer(target_aet, command.answer(), message_id)
					.await
			}
			RetrieveMode::Get { sink, .. } => {
				connection
					.get(command.answer(), sink.as_ref(), message_id)
					.await
			}
		}
	}

	/// Serializes the job in its persistent shape.
	pub fn serialize(&self) -> Value {
		let mut target = serde_json::to_value(&self.params).expect("parameters are serializable");

		// "Short" has been the on-disk form since the first release.
		target[QUERY] = Value::Array(
			self.query
				.iter()
				.map(|answer| serde_json::to_value(answer).expect("answers are serializable"))
				.collect(),
		);
		target[QUERY_FORMAT] =
			serde_json::to_value(self.query_format).expect("format is serializable");
		target[COMMANDS] = Value::Array(
			self.commands
				.iter()
				.map(|command| {
					json!({
						QUERY: command.answer(),
						DIMSE_ERROR_STATUS: command.dimse_status(),
						RECEIVED_INSTANCES_IDS: command.received_instances(),
					})
				})
				.collect(),
		);

		if let RetrieveMode::Move { target_aet } = &self.mode {
			target[TARGET_AET] = Value::String(target_aet.clone());
		}

		target
	}

	/// Restores a C-MOVE flavored job.
	pub fn move_from_serialized(
		source: &Value,
		registry: MessageRegistry,
	) -> Result<Self, RelayError> {
		let target_aet = source
			.get(TARGET_AET)
			.and_then(Value::as_str)
			.ok_or_else(|| {
				RelayError::BadFileFormat(String::from("Missing TargetAet in serialized job"))
			})?;
		let mode = RetrieveMode::Move {
			target_aet: AE::from(target_aet),
		};
		Self::from_serialized(source, mode, registry)
	}

	/// Restores a C-GET flavored job. The SOP class hints are not
	/// persisted; a restarted job falls back to the common storage classes.
	pub fn get_from_serialized(
		source: &Value,
		registry: MessageRegistry,
		sink: Arc<dyn InstanceSink>,
		sop_directory: Arc<dyn SopClassDirectory>,
	) -> Result<Self, RelayError> {
		let mode = RetrieveMode::Get {
			sop_class_hints: BTreeSet::new(),
			sink,
			sop_directory,
		};
		Self::from_serialized(source, mode, registry)
	}

	fn from_serialized(
		source: &Value,
		mode: RetrieveMode,
		registry: MessageRegistry,
	) -> Result<Self, RelayError> {
		let params: AssociationParameters = serde_json::from_value(source.clone())
			.map_err(|err| RelayError::BadFileFormat(err.to_string()))?;

		let mut job = Self::new(params, mode, registry);

		if let Some(answers) = source.get(QUERY).and_then(Value::as_array) {
			for answer in answers {
				let answer: FindAnswer = serde_json::from_value(answer.clone())
					.map_err(|err| RelayError::BadFileFormat(err.to_string()))?;
				job.query.add(answer);
			}
		}

		if let Some(format) = source.get(QUERY_FORMAT) {
			job.query_format = serde_json::from_value(format.clone())
				.map_err(|err| RelayError::BadFileFormat(err.to_string()))?;
		}

		for serialized in source
			.get(COMMANDS)
			.and_then(Value::as_array)
			.map(Vec::as_slice)
			.unwrap_or_default()
		{
			job.commands
				.push(Self::command_from_serialized(serialized, &job.registry)?);
		}

		Ok(job)
	}

	fn command_from_serialized(
		source: &Value,
		registry: &MessageRegistry,
	) -> Result<RetrieveCommand, RelayError> {
		// Jobs written before the per-command bookkeeping stored the bare
		// Find answer; keep reading those.
		let Some(query) = source.get(QUERY) else {
			let answer: FindAnswer = serde_json::from_value(source.clone())
				.map_err(|err| RelayError::BadFileFormat(err.to_string()))?;
			return Ok(RetrieveCommand::new(answer, registry.clone()));
		};

		let answer: FindAnswer = serde_json::from_value(query.clone())
			.map_err(|err| RelayError::BadFileFormat(err.to_string()))?;
		let command = RetrieveCommand::new(answer, registry.clone());

		if let Some(status) = source.get(DIMSE_ERROR_STATUS).and_then(Value::as_u64) {
			command.set_dimse_status(US::try_from(status).map_err(|_| {
				RelayError::BadFileFormat(String::from("DimseErrorStatus out of range"))
			})?);
		}

		for instance in source
			.get(RECEIVED_INSTANCES_IDS)
			.and_then(Value::as_array)
			.map(Vec::as_slice)
			.unwrap_or_default()
		{
			if let Some(instance) = instance.as_str() {
				command.add_received_instance(instance);
			}
		}

		Ok(command)
	}
}

#[async_trait]
impl Job for RetrieveJob {
	async fn step(&mut self) -> Result<StepOutcome, RelayError> {
		self.started = true;

		if self.next_command >= self.commands.len() {
			return Ok(StepOutcome::Done);
		}

		match self.retrieve_current().await {
			Ok(()) => {
				self.next_command += 1;
				if self.next_command >= self.commands.len() {
					Ok(StepOutcome::Done)
				} else {
					Ok(StepOutcome::Continue)
				}
			}
			Err(err) => {
				// Keep the terminal DIMSE status on the failed command so
				// that it survives persistence.
				if let Some(status) = err.dimse_status() {
					self.commands[self.next_command].set_dimse_status(status);
				}
				Err(err)
			}
		}
	}

	fn progress(&self) -> f32 {
		let counts = *self
			.progress
			.counts
			.lock()
			.expect("progress counters poisoned");
		let total = u32::from(counts.remaining)
			+ u32::from(counts.completed)
			+ u32::from(counts.failed)
			+ u32::from(counts.warning);
		if total == 0 {
			return 0.0;
		}
		let done =
			u32::from(counts.completed) + u32::from(counts.failed) + u32::from(counts.warning);
		done as f32 / total as f32
	}

	fn public_content(&self) -> Value {
		let mut content = json!({
			LOCAL_AET: self.params.local_aet,
			"RemoteAet": self.params.remote.aet,
			QUERY: self.query.iter().collect::<Vec<_>>(),
			"Details": self.commands.iter().map(|command| {
				json!({
					DIMSE_ERROR_STATUS: command.dimse_status(),
					QUERY: command.answer(),
					RECEIVED_INSTANCES_IDS: command.received_instances(),
				})
			}).collect::<Vec<_>>(),
		});

		if let RetrieveMode::Move { target_aet } = &self.mode {
			content[TARGET_AET] = Value::String(target_aet.clone());
		}

		content
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::ManufacturerProfile;

	fn params() -> AssociationParameters {
		AssociationParameters {
			local_aet: AE::from("RELAY"),
			remote: RemoteNode {
				aet: AE::from("PACS"),
				host: String::from("pacs.example.org"),
				port: 104,
				manufacturer: ManufacturerProfile::Generic,
			},
			timeout: Some(30),
		}
	}

	fn study_answer(uid: &str) -> FindAnswer {
		let mut answer = FindAnswer::new();
		answer.set(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
		answer.set(tags::STUDY_INSTANCE_UID, uid);
		answer.set(tags::PATIENT_NAME, "DOE^JOHN");
		answer
	}

	#[test]
	fn find_answers_are_restricted_to_main_tags() {
		let mut job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		job.add_find_answer(&study_answer("1.2.3"));

		let stored = job.commands()[0].answer();
		assert_eq!(stored.get(tags::STUDY_INSTANCE_UID), Some("1.2.3"));
		assert_eq!(stored.get(tags::QUERY_RETRIEVE_LEVEL), Some("STUDY"));
		assert!(!stored.contains(tags::PATIENT_NAME));
	}

	#[test]
	fn raw_queries_keep_all_tags() {
		let mut job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		job.add_query(&study_answer("1.2.3"));
		assert!(job.commands()[0].answer().contains(tags::PATIENT_NAME));
	}

	#[test]
	fn mutators_fail_once_started() {
		let mut job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		job.started = true;

		assert!(matches!(
			job.set_local_aet("OTHER"),
			Err(RelayError::BadSequenceOfCalls(_))
		));
		assert!(matches!(
			job.set_timeout(None),
			Err(RelayError::BadSequenceOfCalls(_))
		));
		assert!(matches!(
			job.set_query_format(QueryFormat::Full),
			Err(RelayError::BadSequenceOfCalls(_))
		));
	}

	#[test]
	fn serialization_round_trip_is_stable() {
		let registry = MessageRegistry::new();
		let mut job = RetrieveJob::new_move(params(), "TARGET", registry.clone());
		job.add_find_answer(&study_answer("1.2.3"));
		job.add_find_answer(&study_answer("4.5.6"));
		job.commands()[1].set_dimse_status(0xA702);
		job.commands()[0].add_received_instance("instance-1");

		let first = job.serialize();
		let reloaded = RetrieveJob::move_from_serialized(&first, registry).unwrap();
		let second = reloaded.serialize();

		assert_eq!(first, second);
		assert_eq!(reloaded.commands()[1].dimse_status(), 0xA702);
		assert_eq!(
			reloaded.commands()[0].received_instances(),
			vec![String::from("instance-1")]
		);
	}

	#[test]
	fn serialized_shape_matches_the_on_disk_contract() {
		let mut job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		job.add_find_answer(&study_answer("1.2.3"));

		let value = job.serialize();
		assert_eq!(value["LocalAet"], "RELAY");
		assert_eq!(value["Remote"]["AET"], "PACS");
		assert_eq!(value["Timeout"], 30);
		assert_eq!(value["QueryFormat"], "Short");
		assert_eq!(value["TargetAet"], "TARGET");
		assert_eq!(value["Query"][0]["0020,000d"], "1.2.3");
		assert_eq!(value["Commands"][0]["Query"]["0020,000d"], "1.2.3");
		assert_eq!(value["Commands"][0]["DimseErrorStatus"], 0);
		assert!(value["Commands"][0]["ReceivedInstancesIds"]
			.as_array()
			.unwrap()
			.is_empty());
	}

	#[test]
	fn legacy_commands_without_wrapper_are_readable() {
		let registry = MessageRegistry::new();
		let job = RetrieveJob::new_move(params(), "TARGET", registry.clone());
		let mut serialized = job.serialize();

		// First-generation schema: a command was just the Find answer map.
		serialized["Commands"] = json!([{ "0008,0052": "STUDY", "0020,000d": "9.8.7" }]);

		let reloaded = RetrieveJob::move_from_serialized(&serialized, registry).unwrap();
		assert_eq!(
			reloaded.commands()[0].answer().get(tags::STUDY_INSTANCE_UID),
			Some("9.8.7")
		);
		assert_eq!(reloaded.commands()[0].dimse_status(), 0);
	}

	#[test]
	fn move_job_requires_target_aet_to_deserialize() {
		let registry = MessageRegistry::new();
		let sink_less = json!({
			"LocalAet": "RELAY",
			"Remote": { "AET": "PACS", "Host": "h", "Port": 104 },
			"Timeout": null,
		});
		assert!(matches!(
			RetrieveJob::move_from_serialized(&sink_less, registry),
			Err(RelayError::BadFileFormat(_))
		));
	}

	#[test]
	fn dropping_a_command_unregisters_it() {
		let registry = MessageRegistry::new();
		let mut job = RetrieveJob::new_move(params(), "TARGET", registry.clone());
		job.add_find_answer(&study_answer("1.2.3"));

		let id = registry.allocate("RELAY", job.commands()[0].state());
		assert!(registry.contains("RELAY", id));

		drop(job);
		assert!(!registry.contains("RELAY", id));
	}

	#[test]
	fn progress_is_zero_without_counters() {
		let job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		assert_eq!(job.progress(), 0.0);
	}

	#[test]
	fn progress_follows_the_peer_counters() {
		let job = RetrieveJob::new_move(params(), "TARGET", MessageRegistry::new());
		job.progress.on_progress(1, 1, 0, 0);
		assert!((job.progress() - 0.5).abs() < f32::EPSILON);
		job.progress.on_progress(0, 2, 0, 0);
		assert!((job.progress() - 1.0).abs() < f32::EPSILON);
	}
}
