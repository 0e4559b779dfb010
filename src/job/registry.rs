//! Correlation of inbound C-STORE sub-operations with the retrieve command
//! that initiated them.
//!
//! The registry is owned by the job engine and injected wherever it is
//! needed; keys are `(local AET, message id)` pairs and values are weak
//! references to the state of the currently executing command. The mutex is
//! never held across I/O.

use crate::types::{AE, US};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

/// Message ids at or above this value belong to retrieve commands; ids
/// below it are ad-hoc (C-ECHO, C-FIND).
const FIRST_RETRIEVE_MESSAGE_ID: US = 1000;

/// Mutable per-command state shared between the command and the registry.
#[derive(Debug, Default)]
pub struct CommandState {
	/// Last DIMSE status observed for this command.
	pub dimse_status: US,
	/// Resource ids of the instances stored on behalf of this command.
	pub received_instances: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
	current_id: US,
	entries: HashMap<(AE, US), Weak<Mutex<CommandState>>>,
}

/// Shared, mutex-protected table from `(local AET, message id)` to the
/// currently executing retrieve command.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
	inner: Arc<Mutex<RegistryInner>>,
}

impl MessageRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocates a message id for a retrieve command and records the
	/// `(local AET, id)` pair. Ids start at 1000 to clearly separate them
	/// from ad-hoc messages, wrap modulo 0xFFFF and never drop below 1000.
	pub fn allocate(&self, local_aet: &str, command: &Arc<Mutex<CommandState>>) -> US {
		let mut inner = self.inner.lock().expect("message registry poisoned");
		inner.current_id = ((inner.current_id + 1) % 0xFFFF).max(FIRST_RETRIEVE_MESSAGE_ID);
		let id = inner.current_id;
		inner
			.entries
			.insert((AE::from(local_aet), id), Arc::downgrade(command));
		id
	}

	/// Attributes a stored instance back to the command that requested it.
	/// Unknown pairs are ignored: the store may outlive the command.
	pub fn add_received_instance_from_cstore(
		&self,
		originator_message_id: US,
		originator_aet: &str,
		instance_id: &str,
	) {
		let inner = self.inner.lock().expect("message registry poisoned");
		let key = (AE::from(originator_aet), originator_message_id);
		if let Some(state) = inner.entries.get(&key).and_then(Weak::upgrade) {
			state
				.lock()
				.expect("command state poisoned")
				.received_instances
				.push(String::from(instance_id));
		} else {
			trace!(
				originator_aet,
				originator_message_id,
				"No retrieve command registered for received instance"
			);
		}
	}

	/// Removes every entry pointing at the given command state. Called from
	/// the command's `Drop`.
	pub fn remove_command(&self, command: &Arc<Mutex<CommandState>>) {
		let mut inner = self.inner.lock().expect("message registry poisoned");
		inner.entries.retain(|_, weak| {
			weak.upgrade()
				.is_some_and(|state| !Arc::ptr_eq(&state, command))
		});
	}

	/// Whether a `(local AET, message id)` pair is currently registered.
	pub fn contains(&self, local_aet: &str, message_id: US) -> bool {
		self.inner
			.lock()
			.expect("message registry poisoned")
			.entries
			.contains_key(&(AE::from(local_aet), message_id))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_start_at_1000_and_never_drop_below() {
		let registry = MessageRegistry::new();
		let state = Arc::new(Mutex::new(CommandState::default()));
		assert_eq!(registry.allocate("RELAY", &state), 1000);
		assert_eq!(registry.allocate("RELAY", &state), 1001);

		// Force a wrap-around.
		registry.inner.lock().unwrap().current_id = 0xFFFE;
		assert_eq!(registry.allocate("RELAY", &state), 1000);
	}

	#[test]
	fn received_instances_reach_the_registered_command() {
		let registry = MessageRegistry::new();
		let state = Arc::new(Mutex::new(CommandState::default()));
		let id = registry.allocate("RELAY", &state);

		registry.add_received_instance_from_cstore(id, "RELAY", "instance-1");
		registry.add_received_instance_from_cstore(id, "OTHER", "instance-2");

		let received = &state.lock().unwrap().received_instances;
		assert_eq!(received.as_slice(), ["instance-1"]);
	}

	#[test]
	fn remove_command_clears_all_its_entries() {
		let registry = MessageRegistry::new();
		let state = Arc::new(Mutex::new(CommandState::default()));
		let first = registry.allocate("RELAY", &state);
		let second = registry.allocate("RELAY", &state);

		registry.remove_command(&state);
		assert!(!registry.contains("RELAY", first));
		assert!(!registry.contains("RELAY", second));
	}

	#[test]
	fn dropped_commands_are_ignored() {
		let registry = MessageRegistry::new();
		let state = Arc::new(Mutex::new(CommandState::default()));
		let id = registry.allocate("RELAY", &state);
		drop(state);

		// Upgrade fails, the instance is discarded without panicking.
		registry.add_received_instance_from_cstore(id, "RELAY", "late");
	}
}
