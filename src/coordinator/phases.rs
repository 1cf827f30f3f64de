//! Phases A-F of one Coordinator iteration (spec.md §4.6). Each phase is a
//! free function over the shared state the supervisor in `coordinator::mod`
//! owns, so that a failure in one Task never aborts the others — mirrors the
//! teacher's `registration_synchronizer.rs`, which logs per-item failures and
//! keeps walking its work list rather than bailing out of the whole pass.

use std::time::Duration;

use camino::Utf8PathBuf;
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::archive;
use crate::catalog::models::{Task, TaskStatus, TaskUpdate};
use crate::catalog::Catalog;
use crate::dicom_sender;
use crate::error::InferenceClientError;
use crate::ids::AeTitle;
use crate::inference_client::{GetOutcome, InferenceClient};
use crate::matcher;
use crate::scp::association::StudyGroup;

/// Phase A — Retire: any non-terminal Task older than `task_timeout` fails.
pub async fn retire(catalog: &Catalog, task_timeout: Duration) {
    let tasks = match catalog.tasks_not_retired().await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "phase A: failed to list tasks");
            return;
        }
    };
    let now = OffsetDateTime::now_utc();
    for task in tasks {
        let age = now - task.created_timestamp;
        if age > time::Duration::try_from(task_timeout).unwrap_or(time::Duration::MAX) {
            if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await {
                tracing::error!(task_id = task.id, error = %e, "phase A: failed to retire task");
            } else {
                tracing::warn!(task_id = task.id, "task exceeded timeout, marked failed");
            }
        }
    }
}

/// Phase B — Fingerprint: drain the handoff queue (bounded by `interval`),
/// match each StudyGroup against the catalog, create and archive one Task
/// per matching Fingerprint.
pub async fn fingerprint(catalog: &Catalog, handoff_rx: &mut mpsc::Receiver<StudyGroup>, interval: Duration) {
    loop {
        let study_group = match tokio::time::timeout(interval, handoff_rx.recv()).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                tracing::warn!("handoff queue closed");
                return;
            }
            Err(_elapsed) => return,
        };

        let fingerprints = match catalog.list_fingerprints().await {
            Ok(fingerprints) => fingerprints,
            Err(e) => {
                tracing::error!(error = %e, "phase B: failed to list fingerprints");
                continue;
            }
        };

        let matches = match matcher::matches(&study_group, &fingerprints) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(association_id = study_group.association_id, error = %e, "phase B: invalid trigger pattern");
                continue;
            }
        };

        for matched in matches {
            let task = match catalog.add_task(matched.fingerprint.id).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(fingerprint_id = matched.fingerprint.id, error = %e, "phase B: failed to create task");
                    continue;
                }
            };
            let directories: Vec<Utf8PathBuf> = matched.series.iter().map(|s| s.directory.clone()).collect();
            if let Err(e) = archive::pack(&directories, &task.input_archive_path).await {
                tracing::error!(task_id = task.id, error = %e, "phase B: failed to pack input archive");
                if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await {
                    tracing::error!(task_id = task.id, error = %e, "phase B: failed to mark task failed after archive error");
                }
            }
        }
    }
}

/// Phase C — Post: every PENDING Task is posted to its Fingerprint's
/// inference endpoint.
pub async fn post(catalog: &Catalog, inference_client: &InferenceClient) {
    let tasks = match catalog.tasks_by_status(TaskStatus::Pending).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "phase C: failed to list pending tasks");
            return;
        }
    };
    for task in tasks {
        post_one(catalog, inference_client, task).await;
    }
}

async fn post_one(catalog: &Catalog, inference_client: &InferenceClient, task: Task) {
    let fingerprint = match catalog.get_fingerprint(task.fingerprint_id).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::error!(task_id = task.id, error = %e, "phase C: failed to load fingerprint");
            return;
        }
    };
    match inference_client.post(&fingerprint.inference_server_url, &fingerprint.human_readable_id, &task).await {
        Ok(uid) => {
            record_audit(catalog, task.id, "post", 200).await;
            let update = TaskUpdate {
                status: Some(TaskStatus::Posted),
                inference_server_uid: Some(uid),
                ..Default::default()
            };
            if let Err(e) = catalog.update_task(task.id, update).await {
                tracing::error!(task_id = task.id, error = %e, "phase C: failed to record post result");
            }
        }
        Err(e) => {
            tracing::warn!(task_id = task.id, error = %e, "phase C: post failed");
            if let InferenceClientError::UnexpectedStatus(status) = &e {
                record_audit(catalog, task.id, "post", status.as_u16()).await;
            }
            if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await {
                tracing::error!(task_id = task.id, error = %e, "phase C: failed to mark task failed");
            }
        }
    }
}

/// Appends one row to the inference-server-response audit log
/// (SPEC_FULL.md §3); failures here are logged but never affect a Task's
/// state, since the log is an ambient observability feature.
async fn record_audit(catalog: &Catalog, task_id: i64, operation: &str, status_code: u16) {
    if let Err(e) = catalog.record_inference_response(task_id, operation, status_code).await {
        tracing::warn!(task_id, operation, error = %e, "failed to append inference-response audit row");
    }
}

/// Phase D — Get: every POSTED Task is polled, up to `fanout` at a time.
pub async fn get(catalog: &Catalog, inference_client: &InferenceClient, fanout: usize) {
    let tasks = match catalog.tasks_by_status(TaskStatus::Posted).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "phase D: failed to list posted tasks");
            return;
        }
    };
    futures::stream::iter(tasks)
        .for_each_concurrent(fanout, |task| async move {
            get_one(catalog, inference_client, task).await;
        })
        .await;
}

async fn get_one(catalog: &Catalog, inference_client: &InferenceClient, task: Task) {
    let fingerprint = match catalog.get_fingerprint(task.fingerprint_id).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::error!(task_id = task.id, error = %e, "phase D: failed to load fingerprint");
            return;
        }
    };
    let Some(uid) = &task.inference_server_uid else {
        tracing::error!(task_id = task.id, "phase D: posted task is missing its inference_server_uid");
        return;
    };
    match inference_client.get(&fingerprint.inference_server_url, uid).await {
        GetOutcome::Bytes(bytes) => {
            record_audit(catalog, task.id, "get", 200).await;
            if let Err(e) = fs_err::tokio::write(&task.output_archive_path, &bytes).await {
                tracing::error!(task_id = task.id, error = %e, "phase D: failed to write output archive");
                let _ = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await;
                return;
            }
            if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Retrieved)).await {
                tracing::error!(task_id = task.id, error = %e, "phase D: failed to record retrieval");
            }
        }
        GetOutcome::Pending(code) => {
            record_audit(catalog, task.id, "get", code).await;
        }
        // A 404 from the inference server's output endpoint is not named in
        // spec.md's status table; treated the same as an explicit failure
        // status (551/554/500/405/552/553 -> FAILED).
        GetOutcome::Failed(code) => {
            record_audit(catalog, task.id, "get", code).await;
            tracing::warn!(task_id = task.id, "phase D: inference server reported failure");
            if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await {
                tracing::error!(task_id = task.id, error = %e, "phase D: failed to mark task failed");
            }
        }
        GetOutcome::NotFound => {
            record_audit(catalog, task.id, "get", 404).await;
            tracing::warn!(task_id = task.id, "phase D: inference server reported failure");
            if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await {
                tracing::error!(task_id = task.id, error = %e, "phase D: failed to mark task failed");
            }
        }
        GetOutcome::Error(e) => {
            if let InferenceClientError::UnexpectedStatus(status) = &e {
                record_audit(catalog, task.id, "get", status.as_u16()).await;
            }
            tracing::warn!(task_id = task.id, error = %e, "phase D: transient error polling output, will retry");
        }
    }
}

/// Phase E — Forward: unpack the output archive and hand it to the DICOM
/// Sender for every Destination.
pub async fn forward(catalog: &Catalog, gateway_ae_title: &AeTitle) {
    let tasks = match catalog.tasks_by_status(TaskStatus::Retrieved).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "phase E: failed to list retrieved tasks");
            return;
        }
    };
    for task in tasks {
        forward_one(catalog, gateway_ae_title, task).await;
    }
}

async fn forward_one(catalog: &Catalog, gateway_ae_title: &AeTitle, task: Task) {
    let fingerprint = match catalog.get_fingerprint(task.fingerprint_id).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::error!(task_id = task.id, error = %e, "phase E: failed to load fingerprint");
            return;
        }
    };

    if fingerprint.destinations.is_empty() {
        tracing::warn!(task_id = task.id, "phase E: fingerprint has no destinations, task failed");
        let _ = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await;
        return;
    }

    let scratch_dir = task.output_archive_path.parent().unwrap_or(&task.output_archive_path).join("output");
    if let Err(e) = archive::unpack(&task.output_archive_path, &scratch_dir).await {
        tracing::error!(task_id = task.id, error = %e, "phase E: failed to unpack output archive");
        let _ = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Failed)).await;
        return;
    }

    // Destination counts are small, so fan-out here is unbounded (spec.md
    // §5) rather than sharing Phase D's `poll_fanout` bound.
    let deliveries = fingerprint.destinations.iter().map(|destination| {
        let scratch_dir = scratch_dir.clone();
        let ae_title = destination.ae_title.clone();
        let gateway_ae_title = gateway_ae_title.clone();
        let host = destination.host.clone();
        let port = destination.port;
        async move {
            let delivered = tokio::task::spawn_blocking(move || {
                dicom_sender::send(&host, port, &ae_title, &gateway_ae_title, &scratch_dir)
            })
            .await
            .unwrap_or(false);
            (destination, delivered)
        }
    });
    for (destination, delivered) in futures::future::join_all(deliveries).await {
        if !delivered {
            tracing::warn!(task_id = task.id, host = %destination.host, port = destination.port, "phase E: failed to deliver to destination");
        }
    }

    if let Err(e) = catalog.update_task(task.id, TaskUpdate::status(TaskStatus::Forwarded)).await {
        tracing::error!(task_id = task.id, error = %e, "phase E: failed to record forwarding");
    }
}

/// Phase F — Cleanup: honor the Fingerprint's deletion policy for every
/// FORWARDED or FAILED Task, then finalize its terminal status.
pub async fn cleanup(catalog: &Catalog, inference_client: &InferenceClient) {
    let forwarded = catalog.tasks_by_status(TaskStatus::Forwarded).await.unwrap_or_default();
    let failed = catalog.tasks_by_status(TaskStatus::Failed).await.unwrap_or_default();
    for task in forwarded.into_iter().chain(failed) {
        cleanup_one(catalog, inference_client, task).await;
    }
}

async fn cleanup_one(catalog: &Catalog, inference_client: &InferenceClient, task: Task) {
    let fingerprint = match catalog.get_fingerprint(task.fingerprint_id).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::error!(task_id = task.id, error = %e, "phase F: failed to load fingerprint");
            return;
        }
    };

    let mut deleted_local = task.deleted_local;
    if fingerprint.delete_locally && !deleted_local {
        remove_if_present(&task.input_archive_path);
        remove_if_present(&task.output_archive_path);
        deleted_local = true;
    }

    let mut deleted_remote = task.deleted_remote;
    if fingerprint.delete_remotely && !deleted_remote {
        match &task.inference_server_uid {
            Some(uid) => match inference_client.delete(&fingerprint.inference_server_url, uid).await {
                Ok(()) => {
                    record_audit(catalog, task.id, "delete", 200).await;
                    deleted_remote = true;
                }
                Err(e) => {
                    if let InferenceClientError::UnexpectedStatus(status) = &e {
                        record_audit(catalog, task.id, "delete", status.as_u16()).await;
                    }
                    tracing::warn!(task_id = task.id, error = %e, "phase F: remote delete failed, will retry");
                }
            },
            None => deleted_remote = true,
        }
    }

    let remote_satisfied = !fingerprint.delete_remotely || deleted_remote;
    let next_status = if remote_satisfied {
        Some(if task.status == TaskStatus::Forwarded { TaskStatus::Succeeded } else { TaskStatus::FailedCleaned })
    } else {
        None
    };

    let update = TaskUpdate { status: next_status, deleted_local: Some(deleted_local), deleted_remote: Some(deleted_remote), ..Default::default() };
    if let Err(e) = catalog.update_task(task.id, update).await {
        tracing::error!(task_id = task.id, error = %e, "phase F: failed to record cleanup");
    }
}

/// Missing files at cleanup are already-deleted, not an error (spec.md §7).
fn remove_if_present(path: &Utf8PathBuf) {
    match fs_err::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = path.as_str(), error = %e, "phase F: failed to delete archive file"),
    }
}
