//! Structural comparison of desired and current materialized resource
//! state. Pure and synchronous; an absent current state is a valid input
//! meaning "resource does not exist yet".

#![forbid(unsafe_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn total(&self) -> usize {
        self.adds + self.updates + self.removes
    }
}

/// An ephemeral pairing of desired and (nullable) current state. Never
/// persisted; the delta payload recorded in history is [`Self::to_delta_json`].
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    desired: Json,
    current: Option<Json>,
}

impl ResourceDiff {
    pub fn new(desired: Json, current: Option<Json>) -> Self {
        Self { desired, current }
    }

    pub fn desired(&self) -> &Json {
        &self.desired
    }

    pub fn current(&self) -> Option<&Json> {
        self.current.as_ref()
    }

    /// Deep value equality over all fields. A missing current state always
    /// counts as a change; the actuator distinguishes its missing-resource
    /// branch before consulting this.
    pub fn has_changes(&self) -> bool {
        match &self.current {
            Some(current) => *current != self.desired,
            None => true,
        }
    }

    /// Top-level field names whose values differ, including fields present
    /// on only one side. Lets callers apply coarse policy such as "only the
    /// region set changed".
    pub fn affected_root_properties(&self) -> SmallVec<[String; 8]> {
        let mut out: SmallVec<[String; 8]> = SmallVec::new();
        let empty = Json::Object(serde_json::Map::new());
        let current = self.current.as_ref().unwrap_or(&empty);
        match (&self.desired, current) {
            (Json::Object(d), Json::Object(c)) => {
                for (k, dv) in d {
                    if c.get(k) != Some(dv) {
                        out.push(k.clone());
                    }
                }
                for k in c.keys() {
                    if !d.contains_key(k) {
                        out.push(k.clone());
                    }
                }
            }
            (d, c) => {
                if d != c {
                    out.push(String::new());
                }
            }
        }
        out
    }

    /// Structured per-property delta recorded with `DeltaDetected` events.
    pub fn to_delta_json(&self) -> Json {
        let mut delta = serde_json::Map::new();
        for prop in self.affected_root_properties() {
            delta.insert(
                prop.clone(),
                serde_json::json!({
                    "desired": self.desired.get(&prop).cloned().unwrap_or(Json::Null),
                    "current": self
                        .current
                        .as_ref()
                        .and_then(|c| c.get(&prop))
                        .cloned()
                        .unwrap_or(Json::Null),
                }),
            );
        }
        Json::Object(delta)
    }

    /// Recursive add/update/remove counts, desired relative to current.
    pub fn summary(&self) -> DiffSummary {
        fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
            use serde_json::Value as V;
            match (a, b) {
                (V::Object(ao), V::Object(bo)) => {
                    for (k, av) in ao.iter() {
                        if let Some(bv) = bo.get(k) {
                            if av == bv {
                                continue;
                            }
                            walk(av, bv, adds, ups, rems);
                        } else {
                            *adds += 1;
                        }
                    }
                    for (k, _bv) in bo.iter() {
                        if !ao.contains_key(k) {
                            *rems += 1;
                        }
                    }
                }
                (V::Array(aa), V::Array(bb)) => {
                    let min_len = aa.len().min(bb.len());
                    for i in 0..min_len {
                        if aa[i] != bb[i] {
                            *ups += 1;
                        }
                    }
                    if aa.len() > bb.len() {
                        *adds += aa.len() - bb.len();
                    }
                    if bb.len() > aa.len() {
                        *rems += bb.len() - aa.len();
                    }
                }
                // Scalars differ or type differs
                (av, bv) => {
                    if av != bv {
                        *ups += 1;
                    }
                }
            }
        }
        let mut adds = 0usize;
        let mut ups = 0usize;
        let mut rems = 0usize;
        let base = self.current.clone().unwrap_or(Json::Null);
        walk(&self.desired, &base, &mut adds, &mut ups, &mut rems);
        DiffSummary { adds, updates: ups, removes: rems }
    }

    /// Stable fingerprint of the delta, used to detect "still flapping on
    /// the same diff" across checks.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.to_delta_json().to_string().hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_changes_when_states_are_equal() {
        let state = json!({ "regions": ["us-east-1"], "capacity": 3 });
        let diff = ResourceDiff::new(state.clone(), Some(state));
        assert!(!diff.has_changes());
        assert!(diff.affected_root_properties().is_empty());
        assert_eq!(diff.summary().total(), 0);
    }

    #[test]
    fn missing_current_counts_as_change() {
        let diff = ResourceDiff::new(json!({ "a": 1 }), None);
        assert!(diff.has_changes());
        assert!(diff.current().is_none());
    }

    #[test]
    fn affected_root_properties_cover_both_sides() {
        let diff = ResourceDiff::new(
            json!({ "regions": ["us-east-1", "us-west-2"], "capacity": 3 }),
            Some(json!({ "regions": ["us-east-1"], "capacity": 3, "legacy": true })),
        );
        let mut props = diff.affected_root_properties().to_vec();
        props.sort();
        assert_eq!(props, ["legacy", "regions"]);
    }

    #[test]
    fn delta_json_carries_both_sides_per_property() {
        let diff = ResourceDiff::new(json!({ "capacity": 4 }), Some(json!({ "capacity": 3 })));
        assert_eq!(
            diff.to_delta_json(),
            json!({ "capacity": { "desired": 4, "current": 3 } })
        );
    }

    #[test]
    fn summary_counts_adds_updates_removes() {
        let diff = ResourceDiff::new(
            json!({
                "a": 2,                  // scalar update
                "b": { "x": 1, "y": 2 }, // nested add
                "c": [1, 9],             // element update + shrink
                "d": true                // key add
            }),
            Some(json!({
                "a": 1,
                "b": { "x": 1 },
                "c": [1, 2, 3]
            })),
        );
        let s = diff.summary();
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
    }

    #[test]
    fn fingerprint_is_stable_for_same_delta() {
        let a = ResourceDiff::new(json!({ "capacity": 4 }), Some(json!({ "capacity": 3 })));
        let b = ResourceDiff::new(json!({ "capacity": 4 }), Some(json!({ "capacity": 3 })));
        let c = ResourceDiff::new(json!({ "capacity": 5 }), Some(json!({ "capacity": 3 })));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
