//! Low-level PDU handling for one association: negotiate, receive C-STORE
//! and C-ECHO requests, persist instances. Adapted from the teacher's
//! `scp.rs` (itself adapted from dicom-rs's `storescp`), generalized to
//! accumulate a [`StudyGroup`] instead of forwarding to *CUBE*.

use std::net::TcpStream;

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::PDataValueType;
use dicom::ul::Pdu;

use super::association::StudyGroup;
use super::ScpConfig;
use crate::error::AssociationError;
use crate::error::AssociationError::*;
use crate::sop_classes::ABSTRACT_SYNTAXES;

/// Status the SCP reports to the peer for a C-STORE it could not persist
/// ("Out of Resources", the closest standard general-failure code).
const CSTORE_STATUS_CANNOT_STORE: u16 = 0xA700;

/// Run one association to completion: negotiate, loop over PDUs, and on
/// release return the accumulated [`StudyGroup`] (`None` if the association
/// never stored anything, e.g. a lone C-ECHO).
pub fn handle_association(
    scu_stream: TcpStream,
    config: &ScpConfig,
    association_id: String,
) -> Result<Option<StudyGroup>, AssociationError> {
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();
    let mut cstore_status = 0x0000u16;

    let mut options = dicom::ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(config.ae_title.as_str())
        .max_pdu_length(config.max_pdu_length);

    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }
    for uid in ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = options.establish(scu_stream).map_err(CouldNotEstablish)?;
    tracing::info!(association_id, aet = %association.client_ae_title(), "association established");

    let storage_root = config.storage_root.join(&association_id);
    let mut study_group = StudyGroup::new(association_id.clone(), storage_root);

    while let Some(mut pdu) = bubble_no_pdu(association.receive())? {
        match pdu {
            Pdu::PData { ref mut data } => {
                if data.is_empty() {
                    continue;
                }
                if data[0].value_type == PDataValueType::Data && !data[0].is_last {
                    instance_buffer.append(&mut data[0].data);
                } else if data[0].value_type == PDataValueType::Command && data[0].is_last {
                    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                    let data_value = &data[0];
                    let obj = InMemDicomObject::read_dataset_with_ts(data_value.data.as_slice(), &ts)
                        .map_err(FailedToReadCommand)?;
                    let command_field = obj
                        .element(tags::COMMAND_FIELD)
                        .map_err(|_| MissingTag(tags::COMMAND_FIELD))?
                        .uint16()
                        .map_err(|_| InvalidNumber(tags::COMMAND_FIELD))?;

                    if command_field == 0x0030 {
                        respond_cecho(&mut association, msgid, data_value.presentation_context_id)?;
                    } else {
                        msgid = obj
                            .element(tags::MESSAGE_ID)
                            .map_err(|_| MissingTag(tags::MESSAGE_ID))?
                            .to_int()
                            .map_err(|_| InvalidNumber(tags::MESSAGE_ID))?;
                        sop_class_uid = obj
                            .element(tags::AFFECTED_SOP_CLASS_UID)
                            .map_err(|_| MissingTag(tags::AFFECTED_SOP_CLASS_UID))?
                            .to_str()
                            .map_err(|_| CouldNotRetrieve(tags::AFFECTED_SOP_CLASS_UID))?
                            .to_string();
                        sop_instance_uid = obj
                            .element(tags::AFFECTED_SOP_INSTANCE_UID)
                            .map_err(|_| MissingTag(tags::AFFECTED_SOP_INSTANCE_UID))?
                            .to_str()
                            .map_err(|_| CouldNotRetrieve(tags::AFFECTED_SOP_INSTANCE_UID))?
                            .to_string();
                        cstore_status = 0x0000;
                    }
                    instance_buffer.clear();
                } else if data[0].value_type == PDataValueType::Data && data[0].is_last {
                    instance_buffer.append(&mut data[0].data);

                    let presentation_context_id = data[0].presentation_context_id;
                    let store_result = store_instance(
                        &mut study_group,
                        &association,
                        presentation_context_id,
                        &instance_buffer,
                    );
                    cstore_status = match store_result {
                        Ok(()) => 0x0000,
                        Err(e) => {
                            tracing::warn!(association_id = %study_group.association_id, sop_instance_uid, error = %e, "failed to persist instance");
                            CSTORE_STATUS_CANNOT_STORE
                        }
                    };

                    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                    let response = create_cstore_response(msgid, &sop_class_uid, &sop_instance_uid, cstore_status);
                    let mut response_data = Vec::new();
                    response
                        .write_dataset_with_ts(&mut response_data, &ts)
                        .map_err(|_| CannotRespond("could not write C-STORE response object"))?;
                    let pdu_response = Pdu::PData {
                        data: vec![dicom::ul::pdu::PDataValue {
                            presentation_context_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: response_data,
                        }],
                    };
                    association
                        .send(&pdu_response)
                        .map_err(|_| CannotRespond("failed to send C-STORE response to SCU"))?;
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).unwrap_or_else(|e| {
                    tracing::warn!(association_id = %study_group.association_id, error = %e, "failed to send association release");
                });
                break;
            }
            _ => {}
        }
    }

    tracing::info!(association_id = %study_group.association_id, series = study_group.series.len(), "association released");
    if study_group.is_empty() {
        Ok(None)
    } else {
        Ok(Some(study_group))
    }
}

/// Decode and persist one DICOM instance under its StudyGroup (spec.md §4.1
/// steps 1-4). Absent StudyDescription/SeriesDescription/SOPClassUID default
/// to the literal string `"None"`.
fn store_instance(
    study_group: &mut StudyGroup,
    association: &dicom::ul::association::ServerAssociation<TcpStream>,
    presentation_context_id: u8,
    instance_buffer: &[u8],
) -> Result<(), AssociationError> {
    let presentation_context = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .ok_or(MissingPresentationContext)?;
    let ts = &presentation_context.transfer_syntax;
    let registered_ts = TransferSyntaxRegistry.get(ts).ok_or(MissingPresentationContext)?;

    let obj = InMemDicomObject::read_dataset_with_ts(instance_buffer, registered_ts)
        .map_err(FailedToReadObject)?;

    let sop_class_uid = required_str(&obj, tags::SOP_CLASS_UID)?;
    let sop_instance_uid = required_str(&obj, tags::SOP_INSTANCE_UID)?;
    let series_instance_uid = required_str(&obj, tags::SERIES_INSTANCE_UID)?;
    let study_description = optional_str(&obj, tags::STUDY_DESCRIPTION);
    let series_description = optional_str(&obj, tags::SERIES_DESCRIPTION);

    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid.clone())
        .media_storage_sop_instance_uid(sop_instance_uid.clone())
        .transfer_syntax(ts)
        .build()
        .map_err(FailedToBuildMeta)?;

    let directory = study_group
        .series_directory(&series_instance_uid, &study_description, &series_description, &sop_class_uid)
        .map_err(|e| AssociationError::Storage(e.into()))?;

    let file_path = directory.join(format!("{sop_instance_uid}.dcm"));
    let file_obj = obj.with_exact_meta(file_meta);
    file_obj
        .write_to_file(&file_path)
        .map_err(|e| AssociationError::Storage(e.into()))?;

    Ok(())
}

fn required_str(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Result<String, AssociationError> {
    obj.element(tag)
        .map_err(|_| MissingTag(tag))?
        .to_str()
        .map_err(|_| CouldNotRetrieve(tag))
        .map(|s| s.trim_end_matches('\0').to_string())
}

/// Absent tags default to the literal string `"None"` (spec.md §4.1 step 1).
fn optional_str(obj: &InMemDicomObject, tag: dicom::core::Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "None".to_string())
}

fn respond_cecho(
    association: &mut dicom::ul::association::ServerAssociation<TcpStream>,
    msgid: u16,
    presentation_context_id: u8,
) -> Result<(), AssociationError> {
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let cecho_response = create_cecho_response(msgid);
    let mut cecho_data = Vec::new();
    cecho_response
        .write_dataset_with_ts(&mut cecho_data, &ts)
        .map_err(|_| CannotRespond("could not write C-ECHO response object"))?;
    let pdu_response = Pdu::PData {
        data: vec![dicom::ul::pdu::PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: cecho_data,
        }],
    };
    association
        .send(&pdu_response)
        .map_err(|_| CannotRespond("failed to send C-ECHO response object to SCU"))
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
    ])
}

fn create_cecho_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}

/// Returns `None` if source is [dicom::ul::pdu::reader::Error::NoPduAvailable].
fn bubble_no_pdu(
    pdu: Result<Pdu, dicom::ul::association::server::Error>,
) -> Result<Option<Pdu>, dicom::ul::association::server::Error> {
    pdu.map(Some).or_else(|e| {
        if let dicom::ul::association::server::Error::Receive { source } = &e {
            if matches!(source, dicom::ul::pdu::reader::Error::NoPduAvailable { .. }) {
                return Ok(None);
            }
        }
        Err(e)
    })
}
