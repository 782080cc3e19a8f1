use anyhow::{bail, Error};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Cluster identifier as produced by community detection
pub type ClusterId = u32;

/// Curated assignment of cell-type labels to clusters, kept in the order it was written.
/// Serialized as a JSON object `{"label": [cluster, ...], ...}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelMapping {
    entries: Vec<(String, Vec<ClusterId>)>,
}

impl LabelMapping {
    /// Build a mapping from (label, clusters) pairs
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = (S, Vec<ClusterId>)>) -> LabelMapping {
        LabelMapping {
            entries: entries.into_iter().map(|(l, c)| (l.into(), c)).collect(),
        }
    }

    /// Labels in mapping order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(l, _)| l.as_str())
    }

    /// (label, clusters) pairs in mapping order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ClusterId])> {
        self.entries.iter().map(|(l, c)| (l.as_str(), c.as_slice()))
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no label is defined
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that no label is listed twice and no cluster is assigned to two labels.
    pub fn validate(&self) -> Result<(), Error> {
        let mut owner: HashMap<ClusterId, &str> = HashMap::new();
        for (i, (label, clusters)) in self.entries.iter().enumerate() {
            if self.entries[..i].iter().any(|(l, _)| l == label) {
                bail!("label '{label}' is listed more than once");
            }
            for &c in clusters {
                if let Some(prev) = owner.insert(c, label.as_str()) {
                    if prev != label.as_str() {
                        bail!("cluster {c} is assigned to both '{prev}' and '{label}'");
                    }
                }
            }
        }
        Ok(())
    }

    /// Lookup table from cluster to label. Fails on an invalid mapping.
    pub fn lookup(&self) -> Result<HashMap<ClusterId, &str>, Error> {
        self.validate()?;
        Ok(self
            .entries
            .iter()
            .flat_map(|(l, cs)| cs.iter().map(move |&c| (c, l.as_str())))
            .collect())
    }
}

impl Serialize for LabelMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, clusters) in &self.entries {
            map.serialize_entry(label, clusters)?;
        }
        map.end()
    }
}

struct MappingVisitor;

impl<'de> Visitor<'de> for MappingVisitor {
    type Value = LabelMapping;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map from cell-type label to a list of cluster ids")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<LabelMapping, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((label, clusters)) = access.next_entry::<String, Vec<ClusterId>>()? {
            entries.push((label, clusters));
        }
        Ok(LabelMapping { entries })
    }
}

impl<'de> Deserialize<'de> for LabelMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<LabelMapping, D::Error> {
        deserializer.deserialize_map(MappingVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_json_order_kept() {
        let m: LabelMapping = serde_json::from_str(r#"{"NK cells": [7, 0], "B cells": [20], "A": []}"#).unwrap();
        assert_eq!(m.labels().collect::<Vec<_>>(), vec!["NK cells", "B cells", "A"]);
        let lookup = m.lookup().unwrap();
        assert_eq!(lookup.get(&0), Some(&"NK cells"));
        assert_eq!(lookup.get(&3), None);
        let back = serde_json::to_string(&m).unwrap();
        assert_eq!(back, r#"{"NK cells":[7,0],"B cells":[20],"A":[]}"#);
    }

    #[test]
    fn test_conflicts() {
        assert!(LabelMapping::new([("A", vec![0]), ("B", vec![1, 2])]).validate().is_ok());
        assert!(LabelMapping::new([("A", vec![0, 0])]).validate().is_ok());
        assert!(LabelMapping::new([("A", vec![0]), ("B", vec![0])]).validate().is_err());
        assert!(LabelMapping::new([("A", vec![0]), ("A", vec![1])]).validate().is_err());
        assert!(serde_json::from_str::<LabelMapping>(r#"{"A": [-1]}"#).is_err());
    }
}
