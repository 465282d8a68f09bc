//! The property stream's delta algebra: a last-writer-wins key/value map.
//! Values are opaque scalars (§6); we represent them as strings, mirroring
//! how the storage layer treats stream payloads as opaque bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{DeltaAlgebra, DeltaError, Priority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyOp {
    Set { name: String, value: String },
    Delete { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PropertyDelta {
    pub ops: Vec<PropertyOp>,
}

impl PropertyDelta {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { ops: vec![PropertyOp::Set { name: name.into(), value: value.into() }] }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self { ops: vec![PropertyOp::Delete { name: name.into() }] }
    }

    pub fn table(&self) -> Result<BTreeMap<String, String>, DeltaError> {
        if !self.is_document() {
            return Err(DeltaError("table() called on a non-document property delta".into()));
        }
        Ok(self
            .ops
            .iter()
            .map(|op| match op {
                PropertyOp::Set { name, value } => (name.clone(), value.clone()),
                PropertyOp::Delete { .. } => unreachable!("filtered by is_document"),
            })
            .collect())
    }

    fn from_table(table: &BTreeMap<String, String>) -> Self {
        Self {
            ops: table
                .iter()
                .map(|(name, value)| PropertyOp::Set { name: name.clone(), value: value.clone() })
                .collect(),
        }
    }

    fn apply_ops_to_table(table: &mut BTreeMap<String, String>, ops: &[PropertyOp]) {
        for op in ops {
            match op {
                PropertyOp::Set { name, value } => {
                    table.insert(name.clone(), value.clone());
                }
                PropertyOp::Delete { name } => {
                    table.remove(name);
                }
            }
        }
    }
}

impl DeltaAlgebra for PropertyDelta {
    fn identity() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, PropertyOp::Set { .. }))
    }

    fn compose(&self, other: &Self) -> Result<Self, DeltaError> {
        if self.is_document() {
            let mut table = self.table()?;
            PropertyDelta::apply_ops_to_table(&mut table, &other.ops);
            Ok(PropertyDelta::from_table(&table))
        } else {
            let mut ops = self.ops.clone();
            ops.extend(other.ops.iter().cloned());
            Ok(Self { ops })
        }
    }

    fn transform(&self, other: &Self, priority: Priority) -> Result<Self, DeltaError> {
        let touched: std::collections::HashSet<&str> = self
            .ops
            .iter()
            .map(|op| match op {
                PropertyOp::Set { name, .. } | PropertyOp::Delete { name } => name.as_str(),
            })
            .collect();
        let mut ops = Vec::new();
        for op in &other.ops {
            let name = match op {
                PropertyOp::Set { name, .. } | PropertyOp::Delete { name } => name.as_str(),
            };
            if touched.contains(name) && matches!(priority, Priority::Left) {
                continue;
            }
            ops.push(op.clone());
        }
        Ok(Self { ops })
    }

    fn diff(&self, other: &Self) -> Result<Self, DeltaError> {
        let a = self.table()?;
        let b = other.table()?;
        let mut ops = Vec::new();
        for (name, value) in &b {
            if a.get(name) != Some(value) {
                ops.push(PropertyOp::Set { name: name.clone(), value: value.clone() });
            }
        }
        for name in a.keys() {
            if !b.contains_key(name) {
                ops.push(PropertyOp::Delete { name: name.clone() });
            }
        }
        Ok(Self { ops })
    }

    fn invert(&self, base: &Self) -> Result<Self, DeltaError> {
        let table = base.table()?;
        let mut ops = Vec::new();
        for op in &self.ops {
            match op {
                PropertyOp::Set { name, .. } => match table.get(name) {
                    Some(prev) => ops.push(PropertyOp::Set { name: name.clone(), value: prev.clone() }),
                    None => ops.push(PropertyOp::Delete { name: name.clone() }),
                },
                PropertyOp::Delete { name } => {
                    let prev = table
                        .get(name)
                        .ok_or_else(|| DeltaError(format!("invert: unknown property {name} in base")))?;
                    ops.push(PropertyOp::Set { name: name.clone(), value: prev.clone() });
                }
            }
        }
        Ok(Self { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_delete_round_trip() {
        let doc = PropertyDelta::identity();
        let after_set = doc.compose(&PropertyDelta::set("title", "Bayou")).unwrap();
        assert_eq!(after_set.table().unwrap()["title"], "Bayou");
        let after_delete = after_set.compose(&PropertyDelta::delete("title")).unwrap();
        assert!(after_delete.table().unwrap().is_empty());
    }

    #[test]
    fn diff_and_invert_round_trip() {
        let a = PropertyDelta::set("title", "A");
        let b = a.compose(&PropertyDelta::set("title", "B")).unwrap();
        let delta = a.diff(&b).unwrap();
        assert_eq!(a.compose(&delta).unwrap(), b);
        let inverse = delta.invert(&a).unwrap();
        assert_eq!(b.compose(&inverse).unwrap(), a);
    }
}
