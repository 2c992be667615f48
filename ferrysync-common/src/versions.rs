use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Version Record ──

/// One version of one object key as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    /// Hex content digest. Always `None` for delete markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub is_latest: bool,
    #[serde(default)]
    pub is_delete_marker: bool,
    #[serde(default)]
    pub size: u64,
}

impl VersionRecord {
    pub fn content(
        version_id: impl Into<String>,
        created_at: DateTime<Utc>,
        fingerprint: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            version_id: version_id.into(),
            created_at,
            fingerprint: Some(fingerprint.into()),
            is_latest: false,
            is_delete_marker: false,
            size,
        }
    }

    pub fn delete_marker(version_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            version_id: version_id.into(),
            created_at,
            fingerprint: None,
            is_latest: false,
            is_delete_marker: true,
            size: 0,
        }
    }

    pub fn with_latest(mut self, is_latest: bool) -> Self {
        self.is_latest = is_latest;
        self
    }

    /// True for the current version of a key that still has content.
    pub fn is_live_latest(&self) -> bool {
        self.is_latest && !self.is_delete_marker
    }

    /// Compare two records occupying the same position in their chains.
    ///
    /// Delete markers only match delete markers. Content versions match when
    /// both fingerprints are known and equal; an unknown fingerprint never
    /// matches.
    pub fn same_content(&self, other: &VersionRecord) -> bool {
        match (self.is_delete_marker, other.is_delete_marker) {
            (true, true) => true,
            (false, false) => match (&self.fingerprint, &other.fingerprint) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }

    fn chain_order(&self, other: &VersionRecord) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.version_id.cmp(&other.version_id))
    }
}

// ── Version Chain ──

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ChainError {
    #[error("more than one version is flagged latest")]
    MultipleLatest,
    #[error("latest version {0} is not the newest record")]
    LatestNotLast(String),
    #[error("delete marker {0} is followed by a content version")]
    DeleteMarkerNotNewest(String),
}

/// The ordered history of one key, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionChain {
    records: Vec<VersionRecord>,
}

impl VersionChain {
    /// Build a chain, ordering by creation time with version id as tie-break.
    pub fn new(mut records: Vec<VersionRecord>) -> Self {
        records.sort_by(VersionRecord::chain_order);
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[VersionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VersionRecord> {
        self.records.iter()
    }

    /// The newest record, whatever its flags.
    pub fn newest(&self) -> Option<&VersionRecord> {
        self.records.last()
    }

    /// The newest record if the backend flagged it as latest.
    pub fn latest(&self) -> Option<&VersionRecord> {
        self.records.last().filter(|r| r.is_latest)
    }

    /// Records that must be replayed as history: everything except a live
    /// latest version, which is written through the ordinary object path.
    pub fn history(&self) -> &[VersionRecord] {
        match self.records.last() {
            Some(last) if last.is_live_latest() => &self.records[..self.records.len() - 1],
            _ => &self.records,
        }
    }

    /// Positional content equality, ignoring version ids and timestamps.
    pub fn matches(&self, other: &VersionChain) -> bool {
        self.len() == other.len()
            && self
                .records
                .iter()
                .zip(other.records.iter())
                .all(|(a, b)| a.same_content(b))
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        let latest_count = self.records.iter().filter(|r| r.is_latest).count();
        if latest_count > 1 {
            return Err(ChainError::MultipleLatest);
        }
        if let Some(pos) = self.records.iter().position(|r| r.is_latest) {
            if pos != self.records.len() - 1 {
                return Err(ChainError::LatestNotLast(self.records[pos].version_id.clone()));
            }
        }
        if let Some(first_marker) = self.records.iter().position(|r| r.is_delete_marker) {
            if self.records[first_marker..].iter().any(|r| !r.is_delete_marker) {
                return Err(ChainError::DeleteMarkerNotNewest(
                    self.records[first_marker].version_id.clone(),
                ));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a VersionChain {
    type Item = &'a VersionRecord;
    type IntoIter = std::slice::Iter<'a, VersionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl From<Vec<VersionRecord>> for VersionChain {
    fn from(records: Vec<VersionRecord>) -> Self {
        Self::new(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_chain_sorted_by_time_then_id() {
        let chain = VersionChain::new(vec![
            VersionRecord::content("b", at(5), "fp2", 2),
            VersionRecord::content("z", at(1), "fp1", 1),
            VersionRecord::content("a", at(5), "fp3", 3),
        ]);
        let ids: Vec<&str> = chain.iter().map(|r| r.version_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_history_excludes_live_latest_only() {
        let chain = VersionChain::new(vec![
            VersionRecord::content("v1", at(1), "A", 1),
            VersionRecord::content("v2", at(2), "B", 1).with_latest(true),
        ]);
        assert_eq!(chain.history().len(), 1);

        let deleted = VersionChain::new(vec![
            VersionRecord::content("v1", at(1), "A", 1),
            VersionRecord::delete_marker("v2", at(2)).with_latest(true),
        ]);
        assert_eq!(deleted.history().len(), 2);
    }

    #[test]
    fn test_same_content() {
        let a = VersionRecord::content("v1", at(1), "A", 1);
        let b = VersionRecord::content("other", at(9), "A", 1);
        let c = VersionRecord::content("v1", at(1), "C", 1);
        let dm = VersionRecord::delete_marker("d", at(2));
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
        assert!(!a.same_content(&dm));
        assert!(dm.same_content(&VersionRecord::delete_marker("e", at(3))));

        let mut unknown = a.clone();
        unknown.fingerprint = None;
        assert!(!unknown.same_content(&unknown.clone()));
    }

    #[test]
    fn test_validate() {
        let ok = VersionChain::new(vec![
            VersionRecord::content("v1", at(1), "A", 1),
            VersionRecord::delete_marker("v2", at(2)),
            VersionRecord::delete_marker("v3", at(3)).with_latest(true),
        ]);
        assert_eq!(ok.validate(), Ok(()));

        let latest_first = VersionChain::new(vec![
            VersionRecord::content("v1", at(1), "A", 1).with_latest(true),
            VersionRecord::content("v2", at(2), "B", 1),
        ]);
        assert_eq!(latest_first.validate(), Err(ChainError::LatestNotLast("v1".into())));

        let marker_in_middle = VersionChain::new(vec![
            VersionRecord::delete_marker("v1", at(1)),
            VersionRecord::content("v2", at(2), "B", 1),
        ]);
        assert!(matches!(
            marker_in_middle.validate(),
            Err(ChainError::DeleteMarkerNotNewest(_))
        ));
    }

    #[test]
    fn test_serde_shape() {
        let chain = VersionChain::new(vec![VersionRecord::delete_marker("v1", at(1))]);
        let json = serde_json::to_value(&chain).unwrap();
        assert!(json.is_array());
        assert!(json[0].get("fingerprint").is_none());
        let back: VersionChain = serde_json::from_value(json).unwrap();
        assert_eq!(back, chain);
    }
}
