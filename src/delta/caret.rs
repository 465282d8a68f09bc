//! The caret stream's delta algebra: a small CRDT-like register-per-caret
//! structure rather than a positional text algebra. Concurrent edits from
//! different sessions touch disjoint `caret_id`s in practice (each author
//! owns exactly one live caret at a time via [`crate::session`]), so
//! `transform` only has real work to do when two ops name the same id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{DeltaAlgebra, DeltaError, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretField {
    Index,
    Length,
    DocRev,
    Color,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretFieldValue {
    Index(u64),
    Length(u64),
    DocRev(u64),
    Color(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaretRecord {
    pub author_id: String,
    pub doc_rev: u64,
    pub index: u64,
    pub length: u64,
    pub color: String,
}

impl CaretRecord {
    fn apply_field(&mut self, field: CaretField, value: &CaretFieldValue) -> Result<(), DeltaError> {
        match (field, value) {
            (CaretField::Index, CaretFieldValue::Index(v)) => self.index = *v,
            (CaretField::Length, CaretFieldValue::Length(v)) => self.length = *v,
            (CaretField::DocRev, CaretFieldValue::DocRev(v)) => {
                if *v < self.doc_rev {
                    return Err(DeltaError("docRev must be monotonically non-decreasing".into()));
                }
                self.doc_rev = *v;
            }
            (CaretField::Color, CaretFieldValue::Color(v)) => self.color = v.clone(),
            _ => return Err(DeltaError("caret field/value kind mismatch".into())),
        }
        Ok(())
    }

    fn field_value(&self, field: CaretField) -> CaretFieldValue {
        match field {
            CaretField::Index => CaretFieldValue::Index(self.index),
            CaretField::Length => CaretFieldValue::Length(self.length),
            CaretField::DocRev => CaretFieldValue::DocRev(self.doc_rev),
            CaretField::Color => CaretFieldValue::Color(self.color.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretOp {
    Begin { caret_id: String, record: CaretRecord },
    Set { caret_id: String, field: CaretField, value: CaretFieldValue },
    End { caret_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CaretDelta {
    pub ops: Vec<CaretOp>,
}

impl CaretDelta {
    pub fn begin(caret_id: impl Into<String>, record: CaretRecord) -> Self {
        Self { ops: vec![CaretOp::Begin { caret_id: caret_id.into(), record }] }
    }

    pub fn set(caret_id: impl Into<String>, field: CaretField, value: CaretFieldValue) -> Self {
        Self { ops: vec![CaretOp::Set { caret_id: caret_id.into(), field, value }] }
    }

    pub fn end(caret_id: impl Into<String>) -> Self {
        Self { ops: vec![CaretOp::End { caret_id: caret_id.into() }] }
    }

    /// The live caret table described by a document delta.
    pub fn table(&self) -> Result<BTreeMap<String, CaretRecord>, DeltaError> {
        if !self.is_document() {
            return Err(DeltaError("table() called on a non-document caret delta".into()));
        }
        let mut table = BTreeMap::new();
        for op in &self.ops {
            if let CaretOp::Begin { caret_id, record } = op {
                table.insert(caret_id.clone(), record.clone());
            }
        }
        Ok(table)
    }

    fn from_table(table: &BTreeMap<String, CaretRecord>) -> Self {
        Self {
            ops: table
                .iter()
                .map(|(id, record)| CaretOp::Begin { caret_id: id.clone(), record: record.clone() })
                .collect(),
        }
    }

    fn apply_ops_to_table(
        table: &mut BTreeMap<String, CaretRecord>,
        ops: &[CaretOp],
    ) -> Result<(), DeltaError> {
        for op in ops {
            match op {
                CaretOp::Begin { caret_id, record } => {
                    table.insert(caret_id.clone(), record.clone());
                }
                CaretOp::Set { caret_id, field, value } => {
                    let record = table
                        .get_mut(caret_id)
                        .ok_or_else(|| DeltaError(format!("set on unknown caret {caret_id}")))?;
                    record.apply_field(*field, value)?;
                }
                CaretOp::End { caret_id } => {
                    table.remove(caret_id);
                }
            }
        }
        Ok(())
    }
}

impl DeltaAlgebra for CaretDelta {
    fn identity() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, CaretOp::Begin { .. }))
    }

    fn compose(&self, other: &Self) -> Result<Self, DeltaError> {
        if self.is_document() {
            let mut table = self.table()?;
            CaretDelta::apply_ops_to_table(&mut table, &other.ops)?;
            Ok(CaretDelta::from_table(&table))
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
                CaretOp::Begin { caret_id, .. }
                | CaretOp::Set { caret_id, .. }
                | CaretOp::End { caret_id } => caret_id.as_str(),
            })
            .collect();

        let mut ops = Vec::new();
        for op in &other.ops {
            let id = match op {
                CaretOp::Begin { caret_id, .. }
                | CaretOp::Set { caret_id, .. }
                | CaretOp::End { caret_id } => caret_id.as_str(),
            };
            if touched.contains(id) && matches!(priority, Priority::Left) {
                // self already committed an op for this caret; drop the
                // conflicting op from the rebased result.
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

        for (id, b_record) in &b {
            match a.get(id) {
                None => ops.push(CaretOp::Begin { caret_id: id.clone(), record: b_record.clone() }),
                Some(a_record) if a_record != b_record => {
                    for field in [CaretField::Index, CaretField::Length, CaretField::DocRev, CaretField::Color] {
                        if a_record.field_value(field) != b_record.field_value(field) {
                            ops.push(CaretOp::Set {
                                caret_id: id.clone(),
                                field,
                                value: b_record.field_value(field),
                            });
                        }
                    }
                }
                Some(_) => {}
            }
        }
        for id in a.keys() {
            if !b.contains_key(id) {
                ops.push(CaretOp::End { caret_id: id.clone() });
            }
        }
        Ok(Self { ops })
    }

    fn invert(&self, base: &Self) -> Result<Self, DeltaError> {
        let table = base.table()?;
        let mut ops = Vec::new();
        for op in &self.ops {
            match op {
                CaretOp::Begin { caret_id, .. } => ops.push(CaretOp::End { caret_id: caret_id.clone() }),
                CaretOp::Set { caret_id, field, .. } => {
                    let record = table
                        .get(caret_id)
                        .ok_or_else(|| DeltaError(format!("invert: unknown caret {caret_id} in base")))?;
                    ops.push(CaretOp::Set { caret_id: caret_id.clone(), field: *field, value: record.field_value(*field) });
                }
                CaretOp::End { caret_id } => {
                    let record = table
                        .get(caret_id)
                        .ok_or_else(|| DeltaError(format!("invert: unknown caret {caret_id} in base")))?;
                    ops.push(CaretOp::Begin { caret_id: caret_id.clone(), record: record.clone() });
                }
            }
        }
        Ok(Self { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(author: &str, color: &str) -> CaretRecord {
        CaretRecord { author_id: author.into(), doc_rev: 0, index: 0, length: 0, color: color.into() }
    }

    #[test]
    fn begin_then_set_updates_table() {
        let doc = CaretDelta::identity();
        let begin = CaretDelta::begin("c1", rec("a1", "#ff0000"));
        let after_begin = doc.compose(&begin).unwrap();
        let set = CaretDelta::set("c1", CaretField::Index, CaretFieldValue::Index(5));
        let after_set = after_begin.compose(&set).unwrap();
        let table = after_set.table().unwrap();
        assert_eq!(table["c1"].index, 5);
    }

    #[test]
    fn end_removes_caret_from_table() {
        let doc = CaretDelta::begin("c1", rec("a1", "#ff0000"));
        let ended = doc.compose(&CaretDelta::end("c1")).unwrap();
        assert!(ended.table().unwrap().is_empty());
    }

    #[test]
    fn diff_and_invert_round_trip() {
        let a = CaretDelta::begin("c1", rec("a1", "#ff0000"));
        let b = a.compose(&CaretDelta::set("c1", CaretField::Index, CaretFieldValue::Index(3))).unwrap();
        let delta = a.diff(&b).unwrap();
        assert_eq!(a.compose(&delta).unwrap(), b);
        let inverse = delta.invert(&a).unwrap();
        assert_eq!(b.compose(&inverse).unwrap(), a);
    }
}
