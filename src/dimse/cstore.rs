use super::{
	DicomMessage, ReadError, COMMAND_FIELD_C_STORE_RSP, DATA_SET_MISSING,
};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

/// The command set of an inbound C-STORE-RQ, as received during a C-GET
/// sub-session. The data set travels separately and may be missing.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.1.html>
#[derive(Debug)]
pub struct CompositeStoreRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub has_data_set: bool,
}

impl TryFrom<&DicomMessage> for CompositeStoreRequest {
	type Error = ReadError;

	fn try_from(message: &DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: message
				.ushort(tags::MESSAGE_ID)
				.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?,
			affected_sop_class_uid: message
				.string(tags::AFFECTED_SOP_CLASS_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?,
			affected_sop_instance_uid: message
				.string(tags::AFFECTED_SOP_INSTANCE_UID)
				.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?,
			move_originator_aet: message
				.string(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE),
			move_originator_message_id: message.ushort(tags::MOVE_ORIGINATOR_MESSAGE_ID),
			has_data_set: message
				.ushort(tags::COMMAND_DATA_SET_TYPE)
				.is_some_and(|value| value != DATA_SET_MISSING),
		})
	}
}

/// C-STORE-RSP. The status is whatever the instance-received callback
/// returned, placed verbatim; the SOP class and instance UIDs echo the
/// request.
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub status: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl CompositeStoreResponse {
	/// Builds the response for a given request, echoing its identifiers.
	pub fn answering(request: &CompositeStoreRequest, status: US) -> Self {
		Self {
			message_id: request.message_id,
			status,
			sop_class_uid: request.affected_sop_class_uid.clone(),
			sop_instance_uid: request.affected_sop_instance_uid.clone(),
		}
	}
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid))
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: None
        }
    }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::COMMAND_FIELD_C_STORE_RQ;

	fn store_rq_message() -> DicomMessage {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_C_STORE_RQ]),
			),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [7])),
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
			),
			DataElement::new(
				tags::AFFECTED_SOP_INSTANCE_UID,
				VR::UI,
				dicom_value!(Str, "1.2.3.4"),
			),
			DataElement::new(
				tags::COMMAND_DATA_SET_TYPE,
				VR::US,
				dicom_value!(U16, [super::super::DATA_SET_EXISTS]),
			),
		]);
		DicomMessage {
			command,
			data: None,
			presentation_context_id: Some(1),
		}
	}

	#[test]
	fn parses_store_request_fields() {
		let request = CompositeStoreRequest::try_from(&store_rq_message()).unwrap();
		assert_eq!(request.message_id, 7);
		assert_eq!(request.affected_sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
		assert_eq!(request.affected_sop_instance_uid, "1.2.3.4");
		assert!(request.has_data_set);
		assert_eq!(request.move_originator_aet, None);
	}

	#[test]
	fn response_echoes_request_identifiers() {
		let request = CompositeStoreRequest::try_from(&store_rq_message()).unwrap();
		let response = CompositeStoreResponse::answering(&request, 0x0000);
		let message = DicomMessage::from(response);
		assert_eq!(
			message.string(tags::AFFECTED_SOP_INSTANCE_UID).as_deref(),
			Some("1.2.3.4")
		);
		assert_eq!(
			message.ushort(tags::MESSAGE_ID_BEING_RESPONDED_TO),
			Some(7)
		);
		assert_eq!(message.ushort(tags::STATUS), Some(0x0000));
		assert_eq!(
			message.ushort(tags::COMMAND_DATA_SET_TYPE),
			Some(DATA_SET_MISSING)
		);
	}
}
