//! Downstream consumers of discovery output
//!
//! Discovery stages an endpoint's description records and hands the complete
//! set to a [`Repository`] in one commit, so readers never observe a
//! half-loaded endpoint. Sensors and effecters named by those records are
//! materialized through an [`ObjectFactory`] supplied by the embedding
//! application.

use std::collections::HashMap;
use std::sync::Mutex;

use termlink_proto::{
    AssociationRecord, CompactSensorRecord, DescriptionRecord, EndpointId,
    NumericEffecterRecord, RecordHeader,
};

/// Store for an endpoint's description records.
pub trait Repository: Send + Sync {
    /// Replace the endpoint's record set atomically with a fully staged one.
    fn commit(&self, endpoint: EndpointId, records: Vec<(RecordHeader, DescriptionRecord)>);

    /// Association records are merged as they arrive rather than staged, so
    /// containment links are visible while the rest of the fetch proceeds.
    fn merge_association(&self, endpoint: EndpointId, record: &AssociationRecord);

    /// A locator record arrived marked invalid; anything previously keyed by
    /// its terminus handle must no longer be trusted.
    fn invalidate_locator(&self, endpoint: EndpointId, terminus_handle: u16);

    /// Drop everything known about the endpoint (removal or re-discovery).
    fn invalidate(&self, endpoint: EndpointId);
}

/// Builds the application-facing objects a record describes.
pub trait ObjectFactory: Send + Sync {
    /// `name` is already decorated with the endpoint's configured text.
    fn build_sensor(&self, endpoint: EndpointId, name: &str, record: &CompactSensorRecord);

    fn build_effecter(&self, endpoint: EndpointId, name: &str, record: &NumericEffecterRecord);
}

/// In-memory [`Repository`] used by the bundled tooling and tests.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<EndpointId, Vec<(RecordHeader, DescriptionRecord)>>,
    associations: HashMap<EndpointId, Vec<AssociationRecord>>,
    invalid_locators: HashMap<EndpointId, Vec<u16>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, endpoint: EndpointId) -> Vec<(RecordHeader, DescriptionRecord)> {
        let inner = self.lock();
        inner.records.get(&endpoint).cloned().unwrap_or_default()
    }

    pub fn associations(&self, endpoint: EndpointId) -> Vec<AssociationRecord> {
        let inner = self.lock();
        inner
            .associations
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn invalid_locators(&self, endpoint: EndpointId) -> Vec<u16> {
        let inner = self.lock();
        inner
            .invalid_locators
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Repository for MemoryRepository {
    fn commit(&self, endpoint: EndpointId, records: Vec<(RecordHeader, DescriptionRecord)>) {
        let count = records.len();
        let mut inner = self.lock();
        inner.records.insert(endpoint, records);
        tracing::info!(endpoint, records = count, "description records committed");
    }

    fn merge_association(&self, endpoint: EndpointId, record: &AssociationRecord) {
        let mut inner = self.lock();
        inner
            .associations
            .entry(endpoint)
            .or_default()
            .push(record.clone());
    }

    fn invalidate_locator(&self, endpoint: EndpointId, terminus_handle: u16) {
        let mut inner = self.lock();
        inner
            .invalid_locators
            .entry(endpoint)
            .or_default()
            .push(terminus_handle);
    }

    fn invalidate(&self, endpoint: EndpointId) {
        let mut inner = self.lock();
        inner.records.remove(&endpoint);
        inner.associations.remove(&endpoint);
        inner.invalid_locators.remove(&endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termlink_proto::{record_type, Entity};

    fn header(handle: u32, record_type: u8) -> RecordHeader {
        RecordHeader {
            record_handle: handle,
            version: 1,
            record_type,
            change_number: 0,
            data_length: 0,
        }
    }

    #[test]
    fn commit_replaces_previous_record_set() {
        let repo = MemoryRepository::new();
        repo.commit(
            1,
            vec![(
                header(1, record_type::TERMINUS_LOCATOR),
                DescriptionRecord::Other {
                    record_type: record_type::TERMINUS_LOCATOR,
                    body: Default::default(),
                },
            )],
        );
        repo.commit(1, Vec::new());
        assert!(repo.records(1).is_empty());
    }

    #[test]
    fn associations_accumulate_per_endpoint() {
        let repo = MemoryRepository::new();
        let record = AssociationRecord {
            terminus_handle: 1,
            association_kind: 0,
            container: Entity {
                kind: 1,
                instance: 0,
                container: 0,
            },
            children: Vec::new(),
        };
        repo.merge_association(1, &record);
        repo.merge_association(1, &record);
        repo.merge_association(2, &record);
        assert_eq!(repo.associations(1).len(), 2);
        assert_eq!(repo.associations(2).len(), 1);
    }

    #[test]
    fn invalidate_clears_both_stores() {
        let repo = MemoryRepository::new();
        repo.commit(3, Vec::new());
        repo.merge_association(
            3,
            &AssociationRecord {
                terminus_handle: 1,
                association_kind: 0,
                container: Entity {
                    kind: 1,
                    instance: 0,
                    container: 0,
                },
                children: Vec::new(),
            },
        );
        repo.invalidate(3);
        assert!(repo.records(3).is_empty());
        assert!(repo.associations(3).is_empty());
    }
}
