//! Field model (C1).
//!
//! Typed field descriptors, string-to-cell parsing and a storable mutable
//! cell used by the write pipeline's per-worker document templates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The kind of value a field stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    Long,
    Double,
    Bool,
    Date,
    DateTime,
    ExactText,
    Text,
    Highlight,
    Custom,
    Stored,
}

impl FieldKind {
    /// Numeric kinds admit range queries; everything else does not.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldKind::Int | FieldKind::Long | FieldKind::Double | FieldKind::Date | FieldKind::DateTime
        )
    }
}

/// The underlying primitive sort codec a field kind maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    String,
    Int,
    Long,
    Double,
}

/// A function computing a field's value from the rest of a document's input
/// fields. Must be pure and side-effect free.
pub type ValueSource = std::sync::Arc<dyn Fn(&hashbrown::HashMap<String, String>) -> String + Send + Sync>;

/// Postings storage options for an indexed field.
///
/// Two members of the source enumeration shared the same numeric
/// discriminator; we pick distinct values here and fold the duplicate into
/// `DocsAndFreqsAndPositionsAndOffsets` per §9 open question (c).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingsOptions {
    Basic,
    DocsAndFreqs,
    DocsAndFreqsAndPositions,
    DocsAndFreqsAndPositionsAndOffsets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermVectorOptions {
    pub store: bool,
    pub positions: bool,
    pub offsets: bool,
}

impl Default for TermVectorOptions {
    fn default() -> Self {
        Self {
            store: false,
            positions: false,
            offsets: false,
        }
    }
}

/// A typed field descriptor as found in an index setting.
#[derive(Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub stored_only: bool,
    pub index_analyzer: String,
    pub search_analyzer: String,
    pub postings: PostingsOptions,
    pub term_vectors: TermVectorOptions,
    pub value_source: Option<ValueSource>,
}

impl FieldDescriptor {
    pub fn sort_type(&self) -> SortType {
        match self.kind {
            FieldKind::Int | FieldKind::Date => SortType::Int,
            FieldKind::Long | FieldKind::DateTime => SortType::Long,
            FieldKind::Double => SortType::Double,
            _ => SortType::String,
        }
    }
}

/// A single typed, storable value. Mirrors tantivy's `Value` but kept small
/// and crate-local so the write pipeline does not need a live schema handle
/// to build a template.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Int(i64),
    Long(i64),
    Double(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

/// The stored/indexed/term-vector attributes a cell's field was configured
/// with, carried alongside the value so a cell is self-describing without a
/// live schema handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellAttributes {
    pub stored: bool,
    pub indexed: bool,
    pub term_vectors: TermVectorOptions,
}

/// A mutable storage slot carrying a single typed value plus the
/// stored/indexed/term-vector attributes of the field it belongs to.
#[derive(Debug, Clone)]
pub struct Cell {
    pub value: CellValue,
    pub attributes: CellAttributes,
}

/// Creates a fresh, default-valued cell for a field.
pub fn create_cell(field: &FieldDescriptor) -> Cell {
    Cell {
        value: default_value(field.kind),
        attributes: CellAttributes {
            stored: true,
            indexed: !field.stored_only && field.kind != FieldKind::Stored,
            term_vectors: field.term_vectors,
        },
    }
}

fn default_value(kind: FieldKind) -> CellValue {
    match kind {
        FieldKind::Int | FieldKind::Date => CellValue::Int(0),
        FieldKind::Long | FieldKind::DateTime => CellValue::Long(0),
        FieldKind::Double => CellValue::Double(0.0),
        FieldKind::Bool => CellValue::Bool(false),
        _ => CellValue::Text(String::new()),
    }
}

/// Parses `value` per the field's kind and writes it into `cell`.
///
/// On parse failure the caller must fall back to [`write_default`] instead
/// of propagating the error, so a single bad field never fails the whole
/// document (§4.1, §7).
pub fn write_cell(field: &FieldDescriptor, cell: &mut Cell, value: &str) -> Result<(), ()> {
    cell.value = match field.kind {
        FieldKind::Int => value.parse::<i32>().map(|v| CellValue::Int(v as i64)).map_err(|_| ())?,
        FieldKind::Long => value.parse::<i64>().map(CellValue::Long).map_err(|_| ())?,
        FieldKind::Double => value.parse::<f64>().map(CellValue::Double).map_err(|_| ())?,
        FieldKind::Bool => value.parse::<bool>().map(CellValue::Bool).map_err(|_| ())?,
        FieldKind::Date => parse_date(value).map(CellValue::Int).map_err(|_| ())?,
        FieldKind::DateTime => parse_date_time(value).map(CellValue::Long).map_err(|_| ())?,
        _ => CellValue::Text(value.to_string()),
    };
    Ok(())
}

fn parse_date(value: &str) -> Result<i64, ()> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|d| d.and_hms(0, 0, 0).timestamp())
        .map_err(|_| ())
}

fn parse_date_time(value: &str) -> Result<i64, ()> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.timestamp_millis())
        .map_err(|_| ())
}

/// Resets a cell to its field's default value. Used whenever parsing fails
/// or an input field is absent.
pub fn write_default(field: &FieldDescriptor, cell: &mut Cell) {
    cell.value = default_value(field.kind);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_field(kind: FieldKind) -> FieldDescriptor {
        FieldDescriptor {
            name: "f".into(),
            kind,
            stored_only: false,
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            postings: PostingsOptions::DocsAndFreqsAndPositions,
            term_vectors: TermVectorOptions::default(),
            value_source: None,
        }
    }

    #[test]
    fn numeric_kinds_admit_range_queries() {
        assert!(FieldKind::Int.is_numeric());
        assert!(FieldKind::DateTime.is_numeric());
        assert!(!FieldKind::Text.is_numeric());
        assert!(!FieldKind::ExactText.is_numeric());
    }

    #[test]
    fn bad_numeric_value_falls_back_to_default_not_error() {
        let field = text_field(FieldKind::Int);
        let mut cell = create_cell(&field);
        let res = write_cell(&field, &mut cell, "not-a-number");
        assert!(res.is_err());
        write_default(&field, &mut cell);
        assert_eq!(cell.value, CellValue::Int(0));
    }

    #[test]
    fn cell_attributes_reflect_stored_only_and_term_vectors() {
        let indexed = text_field(FieldKind::Text);
        let cell = create_cell(&indexed);
        assert!(cell.attributes.indexed);
        assert_eq!(cell.attributes.term_vectors, indexed.term_vectors);

        let stored_only = FieldDescriptor {
            stored_only: true,
            ..text_field(FieldKind::Text)
        };
        let cell = create_cell(&stored_only);
        assert!(!cell.attributes.indexed);
    }

    #[test]
    fn sort_type_maps_to_primitive_codec() {
        assert_eq!(text_field(FieldKind::Int).sort_type(), SortType::Int);
        assert_eq!(text_field(FieldKind::Long).sort_type(), SortType::Long);
        assert_eq!(text_field(FieldKind::Double).sort_type(), SortType::Double);
        assert_eq!(text_field(FieldKind::Text).sort_type(), SortType::String);
    }

    #[test]
    fn value_source_is_pure_fn_over_map() {
        let field = FieldDescriptor {
            value_source: Some(std::sync::Arc::new(|m: &hashbrown::HashMap<String, String>| {
                format!("{}-{}", m.get("a").cloned().unwrap_or_default(), m.get("b").cloned().unwrap_or_default())
            })),
            ..text_field(FieldKind::Custom)
        };
        let mut input = hashbrown::HashMap::new();
        input.insert("a".to_string(), "x".to_string());
        input.insert("b".to_string(), "y".to_string());
        let computed = (field.value_source.as_ref().unwrap())(&input);
        assert_eq!(computed, "x-y");
    }
}
