//! End-to-end scenarios driving real DICOM sockets (spec.md §8): a real SCU
//! pushes instances into this gateway's real SCP, the Coordinator's phases
//! run against a real sqlite catalog and a mocked inference server, and a
//! real downstream SCP receives the forwarded result. Grounded in the
//! teacher's own wire-level test harness (`tests/util/send_dicom.rs`), but
//! using this repo's own `dicom_sender::send` as the SCU rather than
//! hand-assembling PDUs, since it is already the gateway's tested client.

use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use tokio::sync::mpsc;

use inference_gateway::catalog::Catalog;
use inference_gateway::config::TlsTrust;
use inference_gateway::coordinator::phases;
use inference_gateway::dicom_sender;
use inference_gateway::ids::{AeTitle, HumanReadableId};
use inference_gateway::inference_client::InferenceClient;
use inference_gateway::scp::association::StudyGroup;
use inference_gateway::scp::{self, ScpConfig};

/// Explicit VR Little Endian: the transfer syntax every fixture file below
/// declares in its file meta group.
const FIXTURE_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

fn write_test_dicom_file(
    path: &Utf8Path,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    series_instance_uid: &str,
    study_description: &str,
    series_description: &str,
) {
    let dataset = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, sop_class_uid),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid),
        DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, study_description),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, series_description),
        DataElement::new(tags::PATIENT_ID, VR::LO, "TEST123"),
    ]);
    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(FIXTURE_TRANSFER_SYNTAX)
        .build()
        .expect("fixture file meta should build");
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).unwrap();
    }
    dataset.with_exact_meta(file_meta).write_to_file(path).expect("fixture file should write");
}

/// Starts the gateway's real SCP listener on its own OS thread (it blocks
/// forever on `TcpListener::incoming`, so it must never run on the tokio
/// runtime) and waits for the port to accept connections.
fn start_scp(port: u16, ae_title: &str, storage_root: Utf8PathBuf) -> mpsc::Receiver<StudyGroup> {
    let (tx, rx) = mpsc::channel(8);
    let config = ScpConfig { ae_title: AeTitle::new(ae_title.to_string()), max_pdu_length: 16384, storage_root };
    let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    std::thread::spawn(move || {
        if let Err(e) = scp::run(address, config, tx, 4) {
            panic!("test scp listener failed: {e}");
        }
    });
    wait_for_port(port);
    rx
}

fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("scp listener on port {port} did not come up in time");
}

async fn test_catalog() -> Catalog {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::connect(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).await.unwrap();
    std::mem::forget(dir);
    catalog
}

// Scenario: happy path, single destination (spec.md §8) — a real C-STORE
// into the gateway's SCP produces a Task that flows PENDING -> POSTED ->
// RETRIEVED -> FORWARDED -> SUCCEEDED, and the forwarded instance actually
// lands on a second, independent SCP.
#[tokio::test]
async fn test_happy_path_single_destination_wire_to_wire() {
    let gateway_storage = tempfile::tempdir().unwrap();
    let mut handoff_rx = start_scp(
        52101,
        "GATEWAY",
        Utf8PathBuf::from_path_buf(gateway_storage.path().to_path_buf()).unwrap(),
    );

    let dest_storage = tempfile::tempdir().unwrap();
    let mut dest_rx = start_scp(52102, "DEST", Utf8PathBuf::from_path_buf(dest_storage.path().to_path_buf()).unwrap());

    let src = tempfile::tempdir().unwrap();
    let src_path = Utf8PathBuf::from_path_buf(src.path().to_path_buf()).unwrap();
    write_test_dicom_file(
        &src_path.join("1.dcm"),
        uids::CT_IMAGE_STORAGE,
        "1.2.3.4.5",
        "1.2.3.4",
        "Chest CT",
        "Axial",
    );

    let delivered = dicom_sender::send(
        "127.0.0.1",
        52101,
        &AeTitle::from_static("GATEWAY"),
        &AeTitle::from_static("TESTSCU"),
        &src_path,
    );
    assert!(delivered, "test SCU should establish an association with the gateway SCP");

    let study_group = tokio::time::timeout(Duration::from_secs(5), handoff_rx.recv())
        .await
        .expect("gateway should hand off the completed study group")
        .expect("handoff channel should not be closed");
    assert_eq!(study_group.series.len(), 1);

    let catalog = test_catalog().await;
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_json("uid-1"))
        .mount(&server)
        .await;

    let fp = catalog
        .add_fingerprint(HumanReadableId::from_static("ct-router"), server.uri(), None, None, true, true)
        .await
        .unwrap();
    catalog
        .add_trigger(
            fp.id,
            inference_gateway::catalog::NewTrigger { sop_class_uid_exact: Some(uids::CT_IMAGE_STORAGE.to_string()), ..Default::default() },
        )
        .await
        .unwrap();
    catalog.add_destination("127.0.0.1", 52102, AeTitle::from_static("DEST"), Some(fp.id)).await.unwrap();

    // Phase B: match the received StudyGroup and pack its series into a Task.
    let (tx, mut rx) = mpsc::channel(1);
    tx.send(study_group).await.unwrap();
    drop(tx);
    phases::fingerprint(&catalog, &mut rx, Duration::from_millis(50)).await;

    let pending = catalog.tasks_by_status(inference_gateway::catalog::models::TaskStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    let task = &pending[0];

    // Stand in for the inference server's output: reuse the same archive
    // bytes the gateway just posted, so Phase E has a real tar to unpack
    // and forward.
    let output_tar = fs_err::read(&task.input_archive_path).unwrap();
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/outputs/"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(output_tar))
        .mount(&server)
        .await;
    wiremock::Mock::given(wiremock::matchers::method("DELETE"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = InferenceClient::new(&TlsTrust::System, Duration::from_secs(5), 0).unwrap();

    phases::post(&catalog, &client).await;
    phases::get(&catalog, &client, 4).await;
    phases::forward(&catalog, &AeTitle::from_static("GATEWAY")).await;
    phases::cleanup(&catalog, &client).await;

    let succeeded = catalog.tasks_by_status(inference_gateway::catalog::models::TaskStatus::Succeeded).await.unwrap();
    assert_eq!(succeeded.len(), 1, "task should reach SUCCEEDED after a full round trip");

    let forwarded_group = tokio::time::timeout(Duration::from_secs(5), dest_rx.recv())
        .await
        .expect("destination scp should receive the forwarded instance")
        .expect("destination handoff channel should not be closed");
    assert_eq!(forwarded_group.series.len(), 1);
}

// A single association carrying two instances of the same series is
// accumulated into one SeriesInstance, not two (spec.md §4.1 step 3).
#[tokio::test]
async fn test_scp_groups_multiple_instances_into_one_series() {
    let storage = tempfile::tempdir().unwrap();
    let mut handoff_rx = start_scp(52103, "GATEWAY", Utf8PathBuf::from_path_buf(storage.path().to_path_buf()).unwrap());

    let src = tempfile::tempdir().unwrap();
    let src_path = Utf8PathBuf::from_path_buf(src.path().to_path_buf()).unwrap();
    write_test_dicom_file(&src_path.join("1.dcm"), uids::CT_IMAGE_STORAGE, "1.2.3.4.5", "1.2.3.4", "Chest CT", "Axial");
    write_test_dicom_file(&src_path.join("2.dcm"), uids::CT_IMAGE_STORAGE, "1.2.3.4.6", "1.2.3.4", "Chest CT", "Axial");

    let delivered =
        dicom_sender::send("127.0.0.1", 52103, &AeTitle::from_static("GATEWAY"), &AeTitle::from_static("TESTSCU"), &src_path);
    assert!(delivered);

    let study_group = tokio::time::timeout(Duration::from_secs(5), handoff_rx.recv())
        .await
        .expect("gateway should hand off the completed study group")
        .expect("handoff channel should not be closed");

    assert_eq!(study_group.series.len(), 1);
    let series = study_group.series.get("1.2.3.4").expect("series 1.2.3.4 should be present");
    let stored_files: Vec<_> = fs_err::read_dir(&series.directory).unwrap().collect();
    assert_eq!(stored_files.len(), 2);
}
