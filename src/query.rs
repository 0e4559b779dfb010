//! Typed collections of C-FIND answers and the tag tables used to
//! normalize outgoing queries.
//!
//! Answers are kept as flat tag→string maps so that they can be persisted
//! in the short-tag JSON form (`"0008,0052": "STUDY"`) that retrieve jobs
//! have always used on disk.

use crate::types::{RetrieveLevel, UI};
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Tags of the Patient module usable in a C-FIND identifier.
const PATIENT_MODULE_TAGS: &[Tag] = &[
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::ISSUER_OF_PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_BIRTH_TIME,
	tags::PATIENT_SEX,
	tags::PATIENT_ADDRESS,
	tags::ETHNIC_GROUP,
	tags::PATIENT_COMMENTS,
];

/// Tags of the Study (and Patient Study) modules.
const STUDY_MODULE_TAGS: &[Tag] = &[
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::ACCESSION_NUMBER,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::NAME_OF_PHYSICIANS_READING_STUDY,
	tags::PATIENT_AGE,
	tags::PATIENT_SIZE,
	tags::PATIENT_WEIGHT,
	tags::OCCUPATION,
	tags::ADDITIONAL_PATIENT_HISTORY,
];

/// Tags of the Series module.
const SERIES_MODULE_TAGS: &[Tag] = &[
	tags::SERIES_INSTANCE_UID,
	tags::MODALITY,
	tags::SERIES_NUMBER,
	tags::SERIES_DATE,
	tags::SERIES_TIME,
	tags::SERIES_DESCRIPTION,
	tags::LATERALITY,
	tags::BODY_PART_EXAMINED,
	tags::PATIENT_POSITION,
	tags::PROTOCOL_NAME,
	tags::OPERATORS_NAME,
	tags::PERFORMING_PHYSICIAN_NAME,
	tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
];

/// Tags of the composite instance (image) module.
const INSTANCE_MODULE_TAGS: &[Tag] = &[
	tags::SOP_INSTANCE_UID,
	tags::SOP_CLASS_UID,
	tags::INSTANCE_NUMBER,
	tags::ACQUISITION_NUMBER,
	tags::IMAGE_TYPE,
	tags::ACQUISITION_DATE,
	tags::ACQUISITION_TIME,
	tags::CONTENT_DATE,
	tags::CONTENT_TIME,
	tags::NUMBER_OF_FRAMES,
	tags::IMAGE_COMMENTS,
];

/// The attributes a retrieve command keeps from a Find answer: enough to
/// address the resource at any level, nothing more.
pub const MAIN_RETRIEVE_TAGS: &[Tag] = &[
	tags::QUERY_RETRIEVE_LEVEL,
	tags::PATIENT_ID,
	tags::STUDY_INSTANCE_UID,
	tags::SERIES_INSTANCE_UID,
	tags::SOP_INSTANCE_UID,
	tags::ACCESSION_NUMBER,
];

/// The set of tags allowed in a normalized C-FIND identifier for `level`:
/// all module tags at and above the level, the counting attributes defined
/// for the level, and SpecificCharacterSet.
pub fn allowed_query_tags(level: RetrieveLevel) -> BTreeSet<Tag> {
	let mut allowed = BTreeSet::new();

	// Cumulative: each level includes every module above it.
	if level == RetrieveLevel::Instance {
		allowed.extend(INSTANCE_MODULE_TAGS);
	}
	if matches!(level, RetrieveLevel::Instance | RetrieveLevel::Series) {
		allowed.extend(SERIES_MODULE_TAGS);
	}
	if matches!(
		level,
		RetrieveLevel::Instance | RetrieveLevel::Series | RetrieveLevel::Study
	) {
		allowed.extend(STUDY_MODULE_TAGS);
	}
	allowed.extend(PATIENT_MODULE_TAGS);

	match level {
		RetrieveLevel::Patient => {
			allowed.insert(tags::NUMBER_OF_PATIENT_RELATED_STUDIES);
			allowed.insert(tags::NUMBER_OF_PATIENT_RELATED_SERIES);
			allowed.insert(tags::NUMBER_OF_PATIENT_RELATED_INSTANCES);
		}
		RetrieveLevel::Study => {
			allowed.insert(tags::MODALITIES_IN_STUDY);
			allowed.insert(tags::NUMBER_OF_STUDY_RELATED_SERIES);
			allowed.insert(tags::NUMBER_OF_STUDY_RELATED_INSTANCES);
			allowed.insert(tags::SOP_CLASSES_IN_STUDY);
		}
		RetrieveLevel::Series => {
			allowed.insert(tags::NUMBER_OF_SERIES_RELATED_INSTANCES);
		}
		RetrieveLevel::Instance => {}
	}

	allowed.insert(tags::SPECIFIC_CHARACTER_SET);
	allowed
}

/// One response data set from a C-FIND, flattened to a tag→string map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindAnswer {
	values: BTreeMap<Tag, String>,
}

impl FindAnswer {
	pub const fn new() -> Self {
		Self {
			values: BTreeMap::new(),
		}
	}

	pub fn from_pairs<I>(pairs: I) -> Self
	where
		I: IntoIterator<Item = (Tag, String)>,
	{
		Self {
			values: pairs.into_iter().collect(),
		}
	}

	/// Flattens a received identifier data set. Sequences and binary
	/// attributes have no place in a retrieve identifier and are skipped.
	pub fn from_dataset(dataset: &InMemDicomObject) -> Self {
		let mut values = BTreeMap::new();
		for element in dataset {
			if element.vr() == VR::SQ {
				continue;
			}
			if let Ok(text) = element.to_str() {
				values.insert(
					element.header().tag,
					String::from(text.trim_end_matches(['\0', ' '])),
				);
			}
		}
		Self { values }
	}

	/// Builds a wire identifier, resolving each VR through the standard
	/// dictionary.
	pub fn to_dataset(&self) -> InMemDicomObject {
		let mut dataset = InMemDicomObject::new_empty();
		for (tag, value) in &self.values {
			dataset.put(element_for(*tag, value));
		}
		dataset
	}

	pub fn get(&self, tag: Tag) -> Option<&str> {
		self.values.get(&tag).map(String::as_str)
	}

	pub fn set(&mut self, tag: Tag, value: impl Into<String>) {
		self.values.insert(tag, value.into());
	}

	pub fn remove(&mut self, tag: Tag) -> Option<String> {
		self.values.remove(&tag)
	}

	pub fn contains(&self, tag: Tag) -> bool {
		self.values.contains_key(&tag)
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Tag, &String)> {
		self.values.iter()
	}

	/// The QueryRetrieveLevel of this answer, if present and recognized.
	pub fn level(&self) -> Option<RetrieveLevel> {
		self.get(tags::QUERY_RETRIEVE_LEVEL)
			.and_then(|value| RetrieveLevel::from_str(value).ok())
	}

	/// A copy containing only the given tags.
	pub fn restricted_to(&self, keep: &[Tag]) -> Self {
		Self {
			values: self
				.values
				.iter()
				.filter(|(tag, _)| keep.contains(tag))
				.map(|(tag, value)| (*tag, value.clone()))
				.collect(),
		}
	}

	/// Splits a backslash-separated multi-value attribute.
	pub fn string_values(&self, tag: Tag) -> Vec<UI> {
		self.get(tag)
			.map(|value| {
				value
					.split('\\')
					.map(str::trim)
					.filter(|part| !part.is_empty())
					.map(UI::from)
					.collect()
			})
			.unwrap_or_default()
	}
}

fn element_for(tag: Tag, value: &str) -> InMemElement {
	let vr = StandardDataDictionary
		.by_tag(tag)
		.map_or(VR::LO, |entry| entry.vr().relaxed());
	DataElement::new(tag, vr, dicom::core::PrimitiveValue::from(value))
}

fn short_tag(tag: Tag) -> String {
	format!("{:04x},{:04x}", tag.group(), tag.element())
}

impl Serialize for FindAnswer {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(self.values.len()))?;
		for (tag, value) in &self.values {
			map.serialize_entry(&short_tag(*tag), value)?;
		}
		map.end()
	}
}

struct FindAnswerVisitor;

impl<'de> Visitor<'de> for FindAnswerVisitor {
	type Value = FindAnswer;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		formatter.write_str("a map of short DICOM tags to string values")
	}

	fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
		let mut answer = FindAnswer::new();
		while let Some((key, value)) = access.next_entry::<String, String>()? {
			let tag = Tag::from_str(&key)
				.map_err(|_| serde::de::Error::custom(format!("invalid DICOM tag '{key}'")))?;
			answer.set(tag, value);
		}
		Ok(answer)
	}
}

impl<'de> Deserialize<'de> for FindAnswer {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		deserializer.deserialize_map(FindAnswerVisitor)
	}
}

/// An ordered, append-only sequence of Find answers. Positional indices are
/// stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnswers {
	answers: Vec<FindAnswer>,
	worklist: bool,
}

impl QueryAnswers {
	pub const fn new(worklist: bool) -> Self {
		Self {
			answers: Vec::new(),
			worklist,
		}
	}

	pub fn add(&mut self, answer: FindAnswer) {
		self.answers.push(answer);
	}

	pub fn get(&self, index: usize) -> Option<&FindAnswer> {
		self.answers.get(index)
	}

	pub fn len(&self) -> usize {
		self.answers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.answers.is_empty()
	}

	pub const fn is_worklist(&self) -> bool {
		self.worklist
	}

	pub fn iter(&self) -> impl Iterator<Item = &FindAnswer> {
		self.answers.iter()
	}
}

/// Drops every attribute not allowed at the requested level, warning once
/// per dropped tag.
pub fn normalize_query(answer: &FindAnswer, level: RetrieveLevel) -> FindAnswer {
	let allowed = allowed_query_tags(level);
	let mut normalized = FindAnswer::new();
	for (tag, value) in answer.iter() {
		if allowed.contains(tag) {
			normalized.set(*tag, value.clone());
		} else {
			warn!("Tag not allowed for this C-Find level, will be ignored: {tag}");
		}
	}
	normalized
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[test]
	fn short_tag_form_round_trips() {
		let mut answer = FindAnswer::new();
		answer.set(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
		answer.set(tags::STUDY_INSTANCE_UID, "1.2.3");
		let json = serde_json::to_string(&answer).unwrap();
		assert!(json.contains("\"0008,0052\":\"STUDY\""));
		assert!(json.contains("\"0020,000d\":\"1.2.3\""));

		let parsed: FindAnswer = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed, answer);
	}

	#[test]
	fn dataset_round_trip_preserves_values() {
		let mut answer = FindAnswer::new();
		answer.set(tags::PATIENT_ID, "X*");
		answer.set(tags::QUERY_RETRIEVE_LEVEL, "STUDY");
		let dataset = answer.to_dataset();
		assert_eq!(FindAnswer::from_dataset(&dataset), answer);
	}

	#[test]
	fn body_part_examined_is_series_scoped() {
		assert!(!allowed_query_tags(RetrieveLevel::Study).contains(&tags::BODY_PART_EXAMINED));
		assert!(allowed_query_tags(RetrieveLevel::Series).contains(&tags::BODY_PART_EXAMINED));
		assert!(allowed_query_tags(RetrieveLevel::Instance).contains(&tags::BODY_PART_EXAMINED));
	}

	#[rstest]
	#[case(RetrieveLevel::Patient, tags::NUMBER_OF_PATIENT_RELATED_STUDIES)]
	#[case(RetrieveLevel::Study, tags::MODALITIES_IN_STUDY)]
	#[case(RetrieveLevel::Study, tags::SOP_CLASSES_IN_STUDY)]
	#[case(RetrieveLevel::Series, tags::NUMBER_OF_SERIES_RELATED_INSTANCES)]
	fn counting_tags_are_level_bound(#[case] level: RetrieveLevel, #[case] tag: Tag) {
		assert!(allowed_query_tags(level).contains(&tag));
	}

	#[test]
	fn specific_character_set_is_always_allowed() {
		for level in [
			RetrieveLevel::Patient,
			RetrieveLevel::Study,
			RetrieveLevel::Series,
			RetrieveLevel::Instance,
		] {
			assert!(allowed_query_tags(level).contains(&tags::SPECIFIC_CHARACTER_SET));
		}
	}

	#[test]
	fn normalize_drops_out_of_level_tags() {
		let mut query = FindAnswer::new();
		query.set(tags::PATIENT_ID, "123");
		query.set(tags::BODY_PART_EXAMINED, "CHEST");
		let normalized = normalize_query(&query, RetrieveLevel::Study);
		assert!(normalized.contains(tags::PATIENT_ID));
		assert!(!normalized.contains(tags::BODY_PART_EXAMINED));
	}

	#[test]
	fn answers_keep_insertion_order() {
		let mut answers = QueryAnswers::new(false);
		for uid in ["1.1", "1.2", "1.3"] {
			let mut answer = FindAnswer::new();
			answer.set(tags::STUDY_INSTANCE_UID, uid);
			answers.add(answer);
		}
		assert_eq!(answers.len(), 3);
		assert_eq!(
			answers.get(1).unwrap().get(tags::STUDY_INSTANCE_UID),
			Some("1.2")
		);
	}

	#[test]
	fn multi_valued_attributes_split_on_backslash() {
		let mut answer = FindAnswer::new();
		answer.set(tags::SOP_CLASSES_IN_STUDY, "1.2.840.10008.5.1.4.1.1.2\\1.2.840.10008.5.1.4.1.1.4");
		assert_eq!(answer.string_values(tags::SOP_CLASSES_IN_STUDY).len(), 2);
	}
}
