//! `InputContainer`: the read-only view over a single patient slot handed
//! to user `process` at dispatch time.

use std::collections::HashMap;

use dicom_object::InMemDicomObject;

use crate::grinders::Ground;

/// A snapshot of one patient's buffered inputs, ground down to user-domain
/// values, plus the shared header dataset used as a template by output
/// synthesis.
pub struct InputContainer {
    pub header: Option<InMemDicomObject>,
    grounds: HashMap<String, Ground>,
}

impl InputContainer {
    pub fn new(header: Option<InMemDicomObject>, grounds: HashMap<String, Ground>) -> Self {
        Self { header, grounds }
    }

    /// The ground value produced by the declared input named `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Ground> {
        self.grounds.get(name)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &String> {
        self.grounds.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_is_none() {
        let container = InputContainer::new(None, HashMap::new());
        assert!(container.get("nonexistent").is_none());
    }
}
