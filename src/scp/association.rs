//! In-memory state accumulated over the lifetime of one DICOM association
//! (spec.md §3 StudyGroup/SeriesInstance, §4.1).
//!
//! Unlike the teacher's `series_key_set.rs`/`association_series_state_loop.rs`,
//! which key a shared map by a thread-local association id because instances
//! for one association can arrive through separately-dispatched channel
//! messages, here one association is handled start-to-finish by a single
//! worker thread (DESIGN NOTES §9: "do not rely on thread identity"). So the
//! StudyGroup is just a local value owned by that thread, tagged with an
//! association id generated explicitly at accept time and carried in its own
//! field, not recovered from the environment.

use camino::Utf8PathBuf;
use std::collections::HashMap;
use time::OffsetDateTime;

/// A single series within a StudyGroup (spec.md §3).
#[derive(Debug, Clone)]
pub struct SeriesInstance {
    pub series_instance_uid: String,
    pub study_description: String,
    pub series_description: String,
    pub sop_class_uid: String,
    pub directory: Utf8PathBuf,
}

/// One accepted association's worth of received series (spec.md §3).
#[derive(Debug)]
pub struct StudyGroup {
    pub association_id: String,
    pub storage_root: Utf8PathBuf,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub series: HashMap<String, SeriesInstance>,
}

impl StudyGroup {
    pub fn new(association_id: String, storage_root: Utf8PathBuf) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            association_id,
            storage_root,
            first_seen: now,
            last_seen: now,
            series: HashMap::new(),
        }
    }

    /// Resolve or create the directory a given series' instances are stored
    /// under (spec.md §4.1 step 3): `<storage_root>/<SOPClassUID>/<SeriesInstanceUID>/`.
    pub fn series_directory(
        &mut self,
        series_instance_uid: &str,
        study_description: &str,
        series_description: &str,
        sop_class_uid: &str,
    ) -> Result<Utf8PathBuf, std::io::Error> {
        self.last_seen = OffsetDateTime::now_utc();
        if let Some(existing) = self.series.get(series_instance_uid) {
            return Ok(existing.directory.clone());
        }
        let directory = self.storage_root.join(sop_class_uid).join(series_instance_uid);
        fs_err::create_dir_all(&directory)?;
        self.series.insert(
            series_instance_uid.to_string(),
            SeriesInstance {
                series_instance_uid: series_instance_uid.to_string(),
                study_description: study_description.to_string(),
                series_description: series_description.to_string(),
                sop_class_uid: sop_class_uid.to_string(),
                directory: directory.clone(),
            },
        );
        Ok(directory)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_directory_is_stable_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut group = StudyGroup::new("assoc-1".to_string(), root);
        let first = group
            .series_directory("1.2.3", "CHEST", "AXIAL", "1.2.840.10008.5.1.4.1.1.2")
            .unwrap();
        let second = group
            .series_directory("1.2.3", "CHEST", "AXIAL", "1.2.840.10008.5.1.4.1.1.2")
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(group.series.len(), 1);
    }
}
