//! `IdentityMapping`: the four auxiliary original-identifier to
//! freshly-generated-replacement tables the anonymization collaborator
//! consults (ported from `dicomnode.lib.anonymization`'s `UIDMapping`).

use std::collections::HashMap;

use crate::dicom::gen_uid;

/// One original-to-replacement UID table.
#[derive(Default, Debug, Clone)]
struct Mapping {
    entries: HashMap<String, String>,
}

impl Mapping {
    fn get_or_create(&mut self, original: &str) -> String {
        self.entries
            .entry(original.to_string())
            .or_insert_with(gen_uid)
            .clone()
    }

    fn get(&self, original: &str) -> Option<&String> {
        self.entries.get(original)
    }
}

/// Number of trailing characters of a replacement UID used as the
/// human-readable "patient number" in anonymized names, matching the
/// source's `UIDMapping.prefixSize`.
const DEFAULT_PREFIX_SIZE: usize = 8;

/// Four independent identifier mappings (Patient, Study, Series,
/// SOPInstance), each lazily assigning a fresh UID the first time an
/// original identifier is seen so that repeated occurrences of the same
/// patient/study/series/instance anonymize consistently.
#[derive(Debug, Clone)]
pub struct IdentityMapping {
    patient: Mapping,
    study: Mapping,
    series: Mapping,
    instance: Mapping,
    prefix_size: usize,
}

impl Default for IdentityMapping {
    fn default() -> Self {
        Self {
            patient: Mapping::default(),
            study: Mapping::default(),
            series: Mapping::default(),
            instance: Mapping::default(),
            prefix_size: DEFAULT_PREFIX_SIZE,
        }
    }
}

impl IdentityMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix_size(mut self, prefix_size: usize) -> Self {
        self.prefix_size = prefix_size;
        self
    }

    pub fn prefix_size(&self) -> usize {
        self.prefix_size
    }

    pub fn patient_mapping(&mut self, original: &str) -> String {
        self.patient.get_or_create(original)
    }

    pub fn study_mapping(&mut self, original: &str) -> String {
        self.study.get_or_create(original)
    }

    pub fn series_mapping(&mut self, original: &str) -> String {
        self.series.get_or_create(original)
    }

    pub fn instance_mapping(&mut self, original: &str) -> String {
        self.instance.get_or_create(original)
    }

    /// Probe all four tables in order (Patient, Study, Series, SOPInstance)
    /// and return the first hit, without creating a new entry.
    pub fn get(&self, original: &str) -> Option<&String> {
        self.patient
            .get(original)
            .or_else(|| self.study.get(original))
            .or_else(|| self.series.get(original))
            .or_else(|| self.instance.get(original))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_original_maps_consistently() {
        let mut mapping = IdentityMapping::new();
        let first = mapping.patient_mapping("12345");
        let second = mapping.patient_mapping("12345");
        assert_eq!(first, second);
    }

    #[test]
    fn get_probes_all_tables() {
        let mut mapping = IdentityMapping::new();
        let replacement = mapping.series_mapping("1.2.3");
        assert_eq!(mapping.get("1.2.3"), Some(&replacement));
        assert_eq!(mapping.get("unknown"), None);
    }
}
