//! Fingerprint matcher (spec.md §4.3): decides which Fingerprints a
//! StudyGroup's series satisfy, and which of its series satisfied each one.
//!
//! Grounded in the same case-insensitive substring-matching idea the
//! teacher's `sanitize.rs` applies to filenames, but expressed here as
//! `regex::Regex` searches since the patterns are user-authored (spec.md
//! §3 Trigger fields are regular expressions, not fixed strings).

use regex::Regex;

use crate::catalog::models::{Fingerprint, Trigger};
use crate::error::TriggerPatternError;
use crate::scp::association::{SeriesInstance, StudyGroup};

/// A Fingerprint that matched, together with the series (in the
/// StudyGroup's insertion order) that satisfied it.
#[derive(Debug)]
pub struct FingerprintMatch<'a> {
    pub fingerprint: &'a Fingerprint,
    pub series: Vec<&'a SeriesInstance>,
}

/// Evaluates every Fingerprint against every series in `study_group`
/// (spec.md §4.3): a Fingerprint matches if at least one of its Triggers
/// hits at least one SeriesInstance. Match order follows `fingerprints`'
/// own order (catalog insertion order); a series is never deduplicated
/// across matches, so the same series can appear under more than one
/// matching Fingerprint with a distinct inference endpoint.
pub fn matches<'a>(
    study_group: &'a StudyGroup,
    fingerprints: &'a [Fingerprint],
) -> Result<Vec<FingerprintMatch<'a>>, TriggerPatternError> {
    let mut results = Vec::new();
    for fingerprint in fingerprints {
        results.push(evaluate_fingerprint(fingerprint, study_group)?);
    }
    Ok(results.into_iter().filter(|m| !m.series.is_empty()).collect())
}

fn evaluate_fingerprint<'a>(
    fingerprint: &'a Fingerprint,
    study_group: &'a StudyGroup,
) -> Result<FingerprintMatch<'a>, TriggerPatternError> {
    let mut series: Vec<&SeriesInstance> = Vec::new();
    for instance in study_group.series.values() {
        let mut hit = false;
        for trigger in &fingerprint.triggers {
            if trigger_hits(trigger, instance)? {
                hit = true;
                break;
            }
        }
        if hit {
            series.push(instance);
        }
    }
    Ok(FingerprintMatch { fingerprint, series })
}

/// One Trigger's verdict on one SeriesInstance (spec.md §4.3): every
/// present clause must pass, and a present `exclude_pattern` hit vetoes the
/// whole Trigger regardless of the other clauses. An absent clause passes
/// unconditionally.
fn trigger_hits(trigger: &Trigger, series: &SeriesInstance) -> Result<bool, TriggerPatternError> {
    if let Some(pattern) = &trigger.exclude_pattern {
        let re = compile(pattern, "exclude_pattern")?;
        let excluded = re.is_match(&series.study_description)
            || re.is_match(&series.series_description)
            || re.is_match(&series.sop_class_uid)
            || re.is_match(&series.series_instance_uid);
        if excluded {
            return Ok(false);
        }
    }

    if let Some(pattern) = &trigger.study_description_pattern {
        if !compile(pattern, "study_description_pattern")?.is_match(&series.study_description) {
            return Ok(false);
        }
    }

    if let Some(pattern) = &trigger.series_description_pattern {
        if !compile(pattern, "series_description_pattern")?.is_match(&series.series_description) {
            return Ok(false);
        }
    }

    if let Some(exact) = &trigger.sop_class_uid_exact {
        if exact != &series.sop_class_uid {
            return Ok(false);
        }
    }

    Ok(true)
}

fn compile(pattern: &str, field: &'static str) -> Result<Regex, TriggerPatternError> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| TriggerPatternError { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::HumanReadableId;
    use camino::Utf8PathBuf;
    use time::OffsetDateTime;

    fn fingerprint(id: i64, triggers: Vec<Trigger>) -> Fingerprint {
        Fingerprint {
            id,
            human_readable_id: HumanReadableId::from_static("demo"),
            inference_server_url: "https://inference.example".to_string(),
            version: None,
            description: None,
            delete_locally: false,
            delete_remotely: false,
            created_timestamp: OffsetDateTime::now_utc(),
            triggers,
            destinations: Vec::new(),
        }
    }

    fn trigger(
        study: Option<&str>,
        series: Option<&str>,
        sop_class: Option<&str>,
        exclude: Option<&str>,
    ) -> Trigger {
        Trigger {
            id: 1,
            fingerprint_id: 1,
            study_description_pattern: study.map(str::to_string),
            series_description_pattern: series.map(str::to_string),
            sop_class_uid_exact: sop_class.map(str::to_string),
            exclude_pattern: exclude.map(str::to_string),
        }
    }

    fn study_group_with(series: &[(&str, &str, &str, &str)]) -> StudyGroup {
        let mut group = StudyGroup::new("assoc-1".to_string(), Utf8PathBuf::from("/tmp/assoc-1"));
        for (uid, study_desc, series_desc, sop_class) in series {
            group.series.insert(
                uid.to_string(),
                SeriesInstance {
                    series_instance_uid: uid.to_string(),
                    study_description: study_desc.to_string(),
                    series_description: series_desc.to_string(),
                    sop_class_uid: sop_class.to_string(),
                    directory: Utf8PathBuf::from(format!("/tmp/assoc-1/{sop_class}/{uid}")),
                },
            );
        }
        group
    }

    #[test]
    fn test_matches_on_case_insensitive_substring() {
        let group = study_group_with(&[("1.2.3", "Chest CT", "Axial", "1.2.840.10008.5.1.4.1.1.2")]);
        let fp = fingerprint(1, vec![trigger(Some("chest"), None, None, None)]);
        let result = matches(&group, std::slice::from_ref(&fp)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].series.len(), 1);
    }

    #[test]
    fn test_absent_pattern_passes() {
        let group = study_group_with(&[("1.2.3", "None", "None", "1.2.840.10008.5.1.4.1.1.2")]);
        let fp = fingerprint(1, vec![trigger(None, None, None, None)]);
        let result = matches(&group, std::slice::from_ref(&fp)).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_exclude_pattern_dominates() {
        let group = study_group_with(&[("1.2.3", "Chest CT research", "Axial", "1.2.840.10008.5.1.4.1.1.2")]);
        let fp = fingerprint(1, vec![trigger(Some("chest"), None, None, Some("research"))]);
        let result = matches(&group, std::slice::from_ref(&fp)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_sop_class_exact_requires_equality() {
        let group = study_group_with(&[("1.2.3", "Chest CT", "Axial", "1.2.840.10008.5.1.4.1.1.4")]);
        let fp = fingerprint(1, vec![trigger(None, None, Some("1.2.840.10008.5.1.4.1.1.2"), None)]);
        let result = matches(&group, std::slice::from_ref(&fp)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_fingerprint_matches_if_any_trigger_hits_any_series() {
        let group = study_group_with(&[
            ("1.2.3", "Chest CT", "Axial", "1.2.840.10008.5.1.4.1.1.2"),
            ("1.2.4", "Brain MR", "Sagittal", "1.2.840.10008.5.1.4.1.1.4"),
        ]);
        let fp = fingerprint(1, vec![trigger(Some("brain"), None, None, None)]);
        let result = matches(&group, std::slice::from_ref(&fp)).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].series[0].series_instance_uid, "1.2.4");
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let group = study_group_with(&[("1.2.3", "Chest CT", "Axial", "1.2.840.10008.5.1.4.1.1.2")]);
        let fp = fingerprint(1, vec![trigger(Some("["), None, None, None)]);
        assert!(matches(&group, std::slice::from_ref(&fp)).is_err());
    }
}
