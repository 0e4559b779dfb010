use super::{
	DicomMessage, ReadError, SubOperationCounts, COMMAND_FIELD_C_MOVE_RQ, DATA_SET_EXISTS,
};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

/// C-MOVE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.4.html>
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub destination: AE,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_MOVE_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
            DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
        ]);

        Self {
            command,
            data: Some(request.identifier),
            presentation_context_id: None
        }
    }
}

/// C-MOVE-RSP, including the sub-operation counters used for progress
/// reporting.
#[derive(Debug)]
pub struct CompositeMoveResponse {
	pub status: US,
	pub counts: SubOperationCounts,
}

impl TryFrom<DicomMessage> for CompositeMoveResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			status: message.status()?,
			counts: SubOperationCounts::read_from(&message),
		})
	}
}
