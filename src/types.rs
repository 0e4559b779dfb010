use crate::error::RelayError;
use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

/// The four levels of the query/retrieve resource hierarchy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrieveLevel {
	Patient,
	Study,
	Series,
	Instance,
}

impl RetrieveLevel {
	/// The value carried by the QueryRetrieveLevel (0008,0052) attribute.
	pub const fn as_dicom_str(self) -> &'static str {
		match self {
			Self::Patient => "PATIENT",
			Self::Study => "STUDY",
			Self::Series => "SERIES",
			Self::Instance => "IMAGE",
		}
	}
}

impl Display for RetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_dicom_str())
	}
}

impl FromStr for RetrieveLevel {
	type Err = RelayError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value.trim() {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"IMAGE" | "INSTANCE" => Ok(Self::Instance),
			other => Err(RelayError::InternalError(format!(
				"Unsupported query retrieve level '{other}'"
			))),
		}
	}
}

impl From<RetrieveLevel> for PrimitiveValue {
	fn from(level: RetrieveLevel) -> Self {
		Self::from(level.as_dicom_str())
	}
}

/// Information models for the C-FIND service.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryInformationModel {
	PatientRoot,
	StudyRoot,
	Worklist,
}

impl QueryInformationModel {
	pub const fn as_sop_class(self) -> &'static str {
		match self {
			Self::PatientRoot => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::StudyRoot => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Worklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
		}
	}
}

/// Behavioral quirks of the remote peer that change how outgoing
/// identifiers are prepared.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManufacturerProfile {
	#[default]
	Generic,
	/// Peers that reject the `"*"` universal matcher in any field.
	GenericNoUniversalWildcard,
	/// Peers that reject the `"*"` universal matcher in date fields.
	GenericNoWildcardInDates,
	/// GE peers expect missing mandatory identifier fields as `"*"`.
	GE,
}

/// Rendering formats for the persisted query of a retrieve job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryFormat {
	#[default]
	Short,
	Human,
	Full,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retrieve_level_round_trip() {
		for level in [
			RetrieveLevel::Patient,
			RetrieveLevel::Study,
			RetrieveLevel::Series,
			RetrieveLevel::Instance,
		] {
			assert_eq!(level, level.as_dicom_str().parse().unwrap());
		}
	}

	#[test]
	fn instance_level_parses_both_spellings() {
		assert_eq!(
			RetrieveLevel::from_str("INSTANCE").unwrap(),
			RetrieveLevel::Instance
		);
		assert_eq!(
			RetrieveLevel::from_str("IMAGE").unwrap(),
			RetrieveLevel::Instance
		);
	}

	#[test]
	fn unknown_level_is_an_internal_error() {
		assert!(RetrieveLevel::from_str("VOLUME").is_err());
	}
}
