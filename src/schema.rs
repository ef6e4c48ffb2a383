//! Translates a validated [`IndexSetting`] into a tantivy [`Schema`].
//!
//! The inverted-index library itself is treated as an external low-level
//! primitive (§1); this module is the one seam where the engine's typed
//! field model (C1) is lowered into that primitive's schema type.

use tantivy::schema::{
    Cardinality, FAST, INDEXED, IndexRecordOption, IntOptions, Schema, STORED, STRING, TEXT,
    TextFieldIndexing, TextOptions,
};

use crate::field::{FieldDescriptor, FieldKind, PostingsOptions};
use crate::settings::IndexSetting;

fn indexing_options(postings: PostingsOptions) -> IndexRecordOption {
    match postings {
        PostingsOptions::Basic => IndexRecordOption::Basic,
        PostingsOptions::DocsAndFreqs => IndexRecordOption::WithFreqs,
        PostingsOptions::DocsAndFreqsAndPositions
        | PostingsOptions::DocsAndFreqsAndPositionsAndOffsets => {
            IndexRecordOption::WithFreqsAndPositions
        }
    }
}

/// The index record option for a text field, accounting for both its
/// `postings` setting and an explicit term-vector request. tantivy has no
/// separate term-vector storage structure the way Lucene does: positions
/// and offsets are both carried on the positional postings list, so a
/// field that asks for term-vector positions or offsets without asking for
/// positional postings still needs to be bumped up to
/// `WithFreqsAndPositions` for that request to mean anything.
fn text_index_option(field: &FieldDescriptor) -> IndexRecordOption {
    let base = indexing_options(field.postings);
    if field.term_vectors.positions || field.term_vectors.offsets {
        IndexRecordOption::WithFreqsAndPositions
    } else {
        base
    }
}

/// Builds the tantivy schema for an index, including the four reserved
/// fields (§6) ahead of the user-defined ones, in declared order (§3).
pub fn build_schema(setting: &IndexSetting) -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("type", STRING | STORED);
    builder.add_i64_field("lastmodified", INDEXED | STORED | FAST);
    builder.add_i64_field("version", STORED | FAST);

    for name in &setting.field_order {
        let field = &setting.fields[name];

        if field.stored_only {
            builder.add_text_field(name, STORED);
            continue;
        }

        match field.kind {
            FieldKind::Int => {
                builder.add_i64_field(name, numeric_options(field.postings));
            }
            FieldKind::Long | FieldKind::Date | FieldKind::DateTime => {
                builder.add_i64_field(name, numeric_options(field.postings));
            }
            FieldKind::Double => {
                builder.add_f64_field(name, numeric_options(field.postings));
            }
            FieldKind::Bool => {
                builder.add_u64_field(name, INDEXED | STORED | FAST);
            }
            FieldKind::ExactText => {
                builder.add_text_field(name, STRING | STORED);
            }
            FieldKind::Text | FieldKind::Highlight | FieldKind::Custom => {
                let indexing = TextFieldIndexing::default()
                    .set_tokenizer(&field.index_analyzer)
                    .set_index_option(text_index_option(field));
                let options = TextOptions::default().set_indexing_options(indexing).set_stored();
                builder.add_text_field(name, options);
            }
            FieldKind::Stored => {
                builder.add_text_field(name, STORED);
            }
        }
    }

    builder.build()
}

fn numeric_options(postings: PostingsOptions) -> IntOptions {
    let _ = postings;
    IntOptions::default()
        .set_indexed()
        .set_stored()
        .set_fast(Cardinality::SingleValue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{PostingsOptions, TermVectorOptions};
    use crate::settings::{DefaultAnalyzerResolver, DirectoryKind, FieldInput, IndexDefinition, SettingsBuilder};

    #[test]
    fn reserved_fields_always_present() {
        let def = IndexDefinition {
            name: "t".into(),
            fields: vec![],
            custom_analyzers: vec![],
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            shard_count: 1,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 15,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/x"),
        };
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        let setting = SettingsBuilder::build_setting(&def, &resolver).unwrap();
        let schema = build_schema(&setting);

        assert!(schema.get_field("id").is_some());
        assert!(schema.get_field("type").is_some());
        assert!(schema.get_field("lastmodified").is_some());
        assert!(schema.get_field("version").is_some());
    }

    #[test]
    fn numeric_field_kinds_get_a_tantivy_field() {
        let def = IndexDefinition {
            name: "t".into(),
            fields: vec![FieldInput {
                name: "price".into(),
                kind: crate::field::FieldKind::Double,
                stored_only: false,
                index_analyzer: "default".into(),
                search_analyzer: "default".into(),
                postings: PostingsOptions::Basic,
                term_vectors: TermVectorOptions::default(),
            }],
            custom_analyzers: vec![],
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            shard_count: 1,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 15,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/x"),
        };
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        let setting = SettingsBuilder::build_setting(&def, &resolver).unwrap();
        let schema = build_schema(&setting);
        assert!(schema.get_field("price").is_some());
    }

    #[test]
    fn term_vector_positions_upgrade_a_basic_postings_field() {
        let def = IndexDefinition {
            name: "t".into(),
            fields: vec![FieldInput {
                name: "body".into(),
                kind: FieldKind::Text,
                stored_only: false,
                index_analyzer: "default".into(),
                search_analyzer: "default".into(),
                postings: PostingsOptions::Basic,
                term_vectors: TermVectorOptions {
                    store: true,
                    positions: true,
                    offsets: false,
                },
            }],
            custom_analyzers: vec![],
            index_analyzer: "default".into(),
            search_analyzer: "default".into(),
            shard_count: 1,
            directory_kind: DirectoryKind::Ram,
            ram_buffer_mb: 15,
            commit_period_secs: 30,
            refresh_period_ms: 25,
            base_directory: std::path::PathBuf::from("/tmp/x"),
        };
        let resolver = DefaultAnalyzerResolver::new(vec![]);
        let setting = SettingsBuilder::build_setting(&def, &resolver).unwrap();
        let schema = build_schema(&setting);

        let field = schema.get_field("body").unwrap();
        let entry = schema.get_field_entry(field);
        let record_option = match entry.field_type() {
            tantivy::schema::FieldType::Str(text_options) => {
                text_options.get_indexing_options().unwrap().index_option()
            }
            _ => panic!("expected a text field"),
        };
        assert_eq!(record_option, IndexRecordOption::WithFreqsAndPositions);
    }
}
