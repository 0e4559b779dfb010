use crate::types::{AE, UI};
use serde::Deserialize;

/// Ambient settings of the relay core: what the association layer and the
/// archive path need to know, nothing of the outer surfaces.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	/// AET presented as the calling title on outgoing associations.
	pub local_aet: AE,
	/// DIMSE timeout in seconds; `None` means blocking reads.
	#[serde(default)]
	pub dimse_timeout: Option<u32>,
	#[serde(default)]
	pub archive: ArchiveConfig,
	/// Ordered transfer syntaxes proposed for storage presentation
	/// contexts (C-GET sub-operations).
	pub storage_transfer_syntaxes: Vec<UI>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveConfig {
	/// Capacity of the chunk queue between the archive job and the HTTP
	/// sender.
	pub chunk_queue_capacity: usize,
	/// Default quality for lossy transcoding, 1..=100.
	pub lossy_quality: u8,
}

impl Default for ArchiveConfig {
	fn default() -> Self {
		Self {
			chunk_queue_capacity: 16,
			lossy_quality: 90,
		}
	}
}

impl AppConfig {
	/// Loads the configuration from the following sources:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `relay.yaml` in the working directory
	/// 3. Environment variables, prefixed with `DICOM_RELAY`
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("relay.yaml").required(false))
			.add_source(Environment::with_prefix("DICOM_RELAY").separator("_"))
			.build()?
			.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_complete() {
		let config = AppConfig::new().unwrap();
		assert_eq!(config.local_aet, "DICOM-RELAY");
		assert_eq!(config.dimse_timeout, Some(60));
		assert_eq!(config.archive.chunk_queue_capacity, 16);
		assert_eq!(config.storage_transfer_syntaxes.len(), 2);
		// Uncompressed syntaxes first, Explicit VR preferred.
		assert_eq!(config.storage_transfer_syntaxes[0], "1.2.840.10008.1.2.1");
	}
}
