//! Outbound DICOM C-STORE (spec.md §4.5): forward an unpacked output
//! directory to one Destination. Built on `dicom-ul`'s synchronous client
//! association API, the same way the teacher's `findscu.rs` drives a
//! C-FIND — run from inside `tokio::task::spawn_blocking` by the caller.

use camino::Utf8Path;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject, StandardDataDictionary};
use dicom::transfer_syntax::{entries, TransferSyntaxRegistry};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{ClientAssociationOptions, Pdu};

use crate::error::DicomSenderError;
use crate::ids::AeTitle;
use crate::sop_classes::ABSTRACT_SYNTAXES;

/// `send(host, port, ae_title, directory)` (spec.md §4.5): associates,
/// walks `directory` recursively, C-STOREs every file found, releases.
/// Returns `true` only if the association established; individual C-STORE
/// failures are logged but never flip the return value (best-effort per
/// file, per spec.md §7).
pub fn send(host: &str, port: u16, ae_title: &AeTitle, calling_ae_title: &AeTitle, directory: &Utf8Path) -> bool {
    let address = format!("{host}:{port}");
    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title.as_str())
        .called_ae_title(ae_title.as_str());
    for uid in ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = match options.establish_with(&address) {
        Ok(association) => association,
        Err(e) => {
            tracing::warn!(%host, port, ae_title = ae_title.as_str(), error = %e, "could not establish association with destination");
            return false;
        }
    };

    let mut message_id = 1u16;
    for entry in walkdir::WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(path) = camino::Utf8PathBuf::from_path_buf(entry.into_path()) else {
            continue;
        };
        match store_one(&path, message_id, &mut association) {
            Ok(()) => {}
            Err(e) => tracing::warn!(path = path.as_str(), error = %e, "failed to store instance at destination"),
        }
        message_id = message_id.wrapping_add(1).max(1);
    }

    let _ = association.release();
    true
}

fn store_one(
    path: &Utf8Path,
    message_id: u16,
    association: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
) -> Result<(), DicomSenderError> {
    let file_obj = open_file(path)?;
    let sop_class_uid = required_str(&file_obj, tags::SOP_CLASS_UID)?;
    let sop_instance_uid = required_str(&file_obj, tags::SOP_INSTANCE_UID)?;

    let contexts = association.presentation_contexts();
    let presentation_context = contexts
        .iter()
        .find(|pc| pc.abstract_syntax == sop_class_uid)
        .or_else(|| contexts.first())
        .cloned()
        .ok_or_else(|| {
            DicomSenderError::Io(std::io::Error::new(std::io::ErrorKind::Other, "no presentation context negotiated"))
        })?;
    let pc_id = presentation_context.id;
    let ts = TransferSyntaxRegistry
        .get(&presentation_context.transfer_syntax)
        .ok_or_else(|| {
            DicomSenderError::Io(std::io::Error::new(std::io::ErrorKind::Other, "unsupported transfer syntax negotiated"))
        })?;

    let cmd = store_request_command(&sop_class_uid, &sop_instance_uid, message_id);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

    let mut object_data = Vec::new();
    file_obj.write_dataset_with_ts(&mut object_data, ts)?;

    let pdu = Pdu::PData {
        data: vec![
            PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Command, is_last: true, data: cmd_data },
            PDataValue { presentation_context_id: pc_id, value_type: PDataValueType::Data, is_last: true, data: object_data },
        ],
    };
    association.send(&pdu).map_err(|e| DicomSenderError::CouldNotEstablish(sop_class_uid.clone(), e))?;
    let response = association.receive().map_err(|e| DicomSenderError::CouldNotEstablish(sop_class_uid.clone(), e))?;
    check_store_response(&response, &sop_instance_uid)
}

/// C-STORE response status (DICOM PS3.7 Annex C): 0x0000 is success, anything
/// else is a warning or failure the caller must not treat as delivered.
fn check_store_response(pdu: &Pdu, sop_instance_uid: &str) -> Result<(), DicomSenderError> {
    let Pdu::PData { data } = pdu else {
        return Err(DicomSenderError::StoreFailed(sop_instance_uid.to_string(), 0xFFFF));
    };
    let Some(data_value) = data.first() else {
        return Err(DicomSenderError::StoreFailed(sop_instance_uid.to_string(), 0xFFFF));
    };
    let cmd_obj = InMemDicomObject::read_dataset_with_ts(&data_value.data[..], &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
    let status = cmd_obj
        .element(tags::STATUS)
        .map_err(DicomSenderError::Read)?
        .to_int::<u16>()
        .map_err(DicomSenderError::Read)?;
    if status == 0x0000 {
        Ok(())
    } else {
        Err(DicomSenderError::StoreFailed(sop_instance_uid.to_string(), status))
    }
}

fn required_str(obj: &DefaultDicomObject, tag: dicom::core::Tag) -> Result<String, DicomSenderError> {
    obj.element(tag)
        .map_err(DicomSenderError::Read)
        .and_then(|e| e.to_str().map_err(DicomSenderError::Read))
        .map(|s| s.trim_end_matches('\0').to_string())
}

fn store_request_command(sop_class_uid: &str, sop_instance_uid: &str, message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_request_command_carries_expected_tags() {
        let cmd = store_request_command("1.2.840.10008.5.1.4.1.1.2", "1.2.3.4.5", 7);
        let affected_class = cmd.element(tags::AFFECTED_SOP_CLASS_UID).unwrap().to_str().unwrap();
        assert_eq!(affected_class, "1.2.840.10008.5.1.4.1.1.2");
        let message_id = cmd.element(tags::MESSAGE_ID).unwrap().to_int::<u16>().unwrap();
        assert_eq!(message_id, 7);
    }

    fn response_pdu_with_status(status: u16) -> Pdu {
        let cmd = InMemDicomObject::command_from_element_iter([DataElement::new(
            tags::STATUS,
            VR::US,
            dicom_value!(U16, [status]),
        )]);
        let mut cmd_data = Vec::new();
        cmd.write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()).unwrap();
        Pdu::PData { data: vec![PDataValue { presentation_context_id: 1, value_type: PDataValueType::Command, is_last: true, data: cmd_data }] }
    }

    #[test]
    fn test_check_store_response_accepts_success_status() {
        let response = response_pdu_with_status(0x0000);
        assert!(check_store_response(&response, "1.2.3.4.5").is_ok());
    }

    #[test]
    fn test_check_store_response_rejects_processing_failure_status() {
        let response = response_pdu_with_status(0x0110);
        let err = check_store_response(&response, "1.2.3.4.5").unwrap_err();
        assert!(matches!(err, DicomSenderError::StoreFailed(uid, 0x0110) if uid == "1.2.3.4.5"));
    }
}
