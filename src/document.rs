//! External document representation (§3).

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Field names reserved by the engine; a settings definition may not
/// redefine them (§4.9, §6).
pub const RESERVED_FIELDS: [&str; 4] = ["id", "type", "lastmodified", "version"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// A document as submitted by a caller, before it is routed through the
/// write pipeline's per-index template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub index_name: String,
    pub version: i32,
    pub fields: HashMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index_name: index_name.into(),
            version: 0,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}
