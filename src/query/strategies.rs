//! The named query strategies of §4.7's registry table.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, PhraseQuery, Query, RangeQuery, RegexQuery};
use tantivy::schema::Field;
use tantivy::tokenizer::TokenizerManager;
use tantivy::Term;

use crate::error::{FlexError, FlexResult};
use crate::field::{FieldDescriptor, FieldKind};

use super::tokenize;

/// A named builder compiling one condition's values into an executable
/// query, or `None` if the condition resolves to no clause (e.g. an
/// analyzer emitting zero tokens).
pub trait QueryStrategy: Send + Sync {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>>;
}

pub fn default_registry() -> HashMap<String, Arc<dyn QueryStrategy>> {
    let mut registry: HashMap<String, Arc<dyn QueryStrategy>> = HashMap::new();
    registry.insert("term_match".into(), Arc::new(TermMatch));
    registry.insert("fuzzy_match".into(), Arc::new(FuzzyMatch));
    registry.insert("phrase_match".into(), Arc::new(PhraseMatch));
    registry.insert("like".into(), Arc::new(Like));
    registry.insert("string_range".into(), Arc::new(StringRange));
    registry.insert("numeric_range".into(), Arc::new(NumericRange));
    registry
}

fn boolean_of(occur: Occur, queries: Vec<Box<dyn Query>>) -> Box<dyn Query> {
    Box::new(BooleanQuery::from(
        queries.into_iter().map(|q| (occur, q)).collect::<Vec<_>>(),
    ))
}

fn clause_type_occur(parameters: &HashMap<String, String>) -> Occur {
    match parameters.get("clausetype").map(|s| s.as_str()) {
        Some("or") => Occur::Should,
        _ => Occur::Must,
    }
}

/// Parses a single numeric literal into the field's stored representation,
/// matching the mapping §3 uses for numeric kinds (Int/Long/Date/DateTime
/// -> i64, Double -> f64).
#[derive(Clone, Copy, PartialEq)]
enum NumericPoint {
    I64(i64),
    F64(f64),
}

fn parse_numeric(field: &FieldDescriptor, value: &str) -> FlexResult<NumericPoint> {
    let invalid = || FlexError::InvalidCondition(format!("'{}' is not a valid {:?} value", value, field.kind));
    match field.kind {
        FieldKind::Double => value.parse::<f64>().map(NumericPoint::F64).map_err(|_| invalid()),
        FieldKind::Int => value.parse::<i32>().map(|v| NumericPoint::I64(v as i64)).map_err(|_| invalid()),
        FieldKind::Long => value.parse::<i64>().map(NumericPoint::I64).map_err(|_| invalid()),
        FieldKind::Date => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|d| NumericPoint::I64(d.and_hms(0, 0, 0).timestamp()))
            .map_err(|_| invalid()),
        FieldKind::DateTime => chrono::DateTime::parse_from_rfc3339(value)
            .map(|d| NumericPoint::I64(d.timestamp_millis()))
            .map_err(|_| invalid()),
        _ => Err(FlexError::InvalidCondition(format!("field '{}' is not numeric", field.name))),
    }
}

fn numeric_point_query(field: Field, point: NumericPoint) -> Box<dyn Query> {
    match point {
        NumericPoint::I64(v) => Box::new(RangeQuery::new_i64_bounds(
            field,
            Bound::Included(v),
            Bound::Included(v),
        )),
        NumericPoint::F64(v) => Box::new(RangeQuery::new_f64_bounds(
            field,
            Bound::Included(v),
            Bound::Included(v),
        )),
    }
}

struct TermMatch;

impl QueryStrategy for TermMatch {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        if field.kind.is_numeric() {
            let point = parse_numeric(field, &values[0])?;
            return Ok(Some(numeric_point_query(tantivy_field, point)));
        }

        let tokens = tokenize(tokenizers, &field.search_analyzer, &values[0]);
        match tokens.len() {
            0 => Ok(None),
            1 => Ok(Some(term_query(tantivy_field, &tokens[0]))),
            _ => {
                let occur = clause_type_occur(parameters);
                let queries = tokens.iter().map(|t| term_query(tantivy_field, t)).collect();
                Ok(Some(boolean_of(occur, queries)))
            }
        }
    }
}

fn term_query(field: Field, token: &str) -> Box<dyn Query> {
    use tantivy::query::TermQuery;
    use tantivy::schema::IndexRecordOption;
    Box::new(TermQuery::new(
        Term::from_field_text(field, token),
        IndexRecordOption::WithFreqsAndPositions,
    ))
}

struct FuzzyMatch;

impl QueryStrategy for FuzzyMatch {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        let slop: u8 = parameters.get("slop").and_then(|v| v.parse().ok()).unwrap_or(1);
        let prefix_length: usize = parameters.get("prefixlength").and_then(|v| v.parse().ok()).unwrap_or(0);

        let tokens = tokenize(tokenizers, &field.search_analyzer, &values[0]);
        if tokens.is_empty() {
            return Ok(None);
        }

        let queries: Vec<Box<dyn Query>> = tokens
            .iter()
            .map(|token| {
                let term = Term::from_field_text(tantivy_field, token);
                if prefix_length > 0 {
                    Box::new(FuzzyTermQuery::new_prefix(term, slop, true)) as Box<dyn Query>
                } else {
                    Box::new(FuzzyTermQuery::new(term, slop, true)) as Box<dyn Query>
                }
            })
            .collect();

        if queries.len() == 1 {
            Ok(queries.into_iter().next())
        } else {
            Ok(Some(boolean_of(Occur::Must, queries)))
        }
    }
}

struct PhraseMatch;

impl QueryStrategy for PhraseMatch {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        let slop: u32 = parameters.get("slop").and_then(|v| v.parse().ok()).unwrap_or(0);
        let tokens = tokenize(tokenizers, &field.search_analyzer, &values[0]);

        if tokens.is_empty() {
            return Ok(None);
        }
        if tokens.len() == 1 {
            return Ok(Some(term_query(tantivy_field, &tokens[0])));
        }

        let terms: Vec<Term> = tokens.iter().map(|t| Term::from_field_text(tantivy_field, t)).collect();
        let mut query = PhraseQuery::new(terms);
        query.set_slop(slop);
        Ok(Some(Box::new(query)))
    }
}

struct Like;

impl QueryStrategy for Like {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        _parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        let tokens = tokenize(tokenizers, &field.search_analyzer, &values[0]);
        if tokens.is_empty() {
            return Ok(None);
        }

        let queries: Vec<Box<dyn Query>> = tokens
            .iter()
            .map(|token| wildcard_query(tantivy_field, token))
            .collect::<FlexResult<Vec<_>>>()?;

        if queries.len() == 1 {
            Ok(queries.into_iter().next())
        } else {
            Ok(Some(boolean_of(Occur::Must, queries)))
        }
    }
}

/// tantivy 0.16 has no dedicated wildcard query, so `*`/`?` glob syntax is
/// lowered into an anchored `RegexQuery`, the nearest primitive the
/// underlying library exposes.
fn wildcard_query(field: Field, pattern: &str) -> FlexResult<Box<dyn Query>> {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');

    RegexQuery::from_pattern(&regex, field)
        .map(|q| Box::new(q) as Box<dyn Query>)
        .map_err(|e| FlexError::InvalidCondition(e.to_string()))
}

struct StringRange;

impl QueryStrategy for StringRange {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        if values.len() < 2 {
            return Err(FlexError::InvalidCondition("string_range requires two values".into()));
        }

        let lower_tokens = tokenize(tokenizers, &field.search_analyzer, &values[0]);
        let upper_tokens = tokenize(tokenizers, &field.search_analyzer, &values[1]);
        let lower = lower_tokens.first().cloned().unwrap_or_else(|| values[0].clone());
        let upper = upper_tokens.first().cloned().unwrap_or_else(|| values[1].clone());

        if lower == upper {
            return Err(FlexError::InvalidCondition("string_range bounds must differ".into()));
        }

        let include_lower = parameters.get("includelower").map(|v| v == "true").unwrap_or(false);
        let include_upper = parameters.get("includeupper").map(|v| v == "true").unwrap_or(false);

        let lower_bound = if include_lower { Bound::Included(lower.as_str()) } else { Bound::Excluded(lower.as_str()) };
        let upper_bound = if include_upper { Bound::Included(upper.as_str()) } else { Bound::Excluded(upper.as_str()) };

        Ok(Some(Box::new(RangeQuery::new_str_bounds(tantivy_field, lower_bound, upper_bound))))
    }
}

struct NumericRange;

impl QueryStrategy for NumericRange {
    fn build(
        &self,
        field: &FieldDescriptor,
        tantivy_field: Field,
        values: &[String],
        parameters: &HashMap<String, String>,
        _tokenizers: &TokenizerManager,
    ) -> FlexResult<Option<Box<dyn Query>>> {
        if values.len() < 2 {
            return Err(FlexError::InvalidCondition("numeric_range requires two values".into()));
        }

        let lower = parse_numeric(field, &values[0])?;
        let upper = parse_numeric(field, &values[1])?;

        if lower == upper {
            return Err(FlexError::InvalidCondition("numeric_range bounds must differ".into()));
        }

        let include_lower = parameters.get("includelower").map(|v| v == "true").unwrap_or(false);
        let include_upper = parameters.get("includeupper").map(|v| v == "true").unwrap_or(false);

        let query: Box<dyn Query> = match (lower, upper) {
            (NumericPoint::I64(lo), NumericPoint::I64(hi)) => Box::new(RangeQuery::new_i64_bounds(
                tantivy_field,
                bound(lo, include_lower),
                bound(hi, include_upper),
            )),
            (NumericPoint::F64(lo), NumericPoint::F64(hi)) => Box::new(RangeQuery::new_f64_bounds(
                tantivy_field,
                bound(lo, include_lower),
                bound(hi, include_upper),
            )),
            _ => return Err(FlexError::InvalidCondition("numeric_range bounds must be the same type".into())),
        };

        Ok(Some(query))
    }
}

fn bound<T>(value: T, inclusive: bool) -> Bound<T> {
    if inclusive {
        Bound::Included(value)
    } else {
        Bound::Excluded(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{PostingsOptions, TermVectorOptions};

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
    fn term_match_with_no_tokens_returns_none() {
        let field = text_field(FieldKind::Text);
        let tokenizers = TokenizerManager::default();
        let strategy = TermMatch;
        let result = strategy
            .build(&field, Field::from_field_id(0), &["   ".to_string()], &HashMap::new(), &tokenizers)
            .unwrap();
        // "default" tokenizer lowercases and splits on non-alnum; all-whitespace yields no tokens.
        assert!(result.is_none());
    }

    #[test]
    fn numeric_range_rejects_equal_bounds() {
        let field = text_field(FieldKind::Int);
        let tokenizers = TokenizerManager::default();
        let strategy = NumericRange;
        let err = strategy
            .build(&field, Field::from_field_id(0), &["5".to_string(), "5".to_string()], &HashMap::new(), &tokenizers)
            .unwrap_err();
        assert!(matches!(err, FlexError::InvalidCondition(_)));
    }

    #[test]
    fn numeric_range_rejects_bounds_equal_after_parsing() {
        let field = text_field(FieldKind::Double);
        let tokenizers = TokenizerManager::default();
        let strategy = NumericRange;
        let err = strategy
            .build(&field, Field::from_field_id(0), &["5.0".to_string(), "5".to_string()], &HashMap::new(), &tokenizers)
            .unwrap_err();
        assert!(matches!(err, FlexError::InvalidCondition(_)));
    }

    #[test]
    fn numeric_range_rejects_unparseable_value() {
        let field = text_field(FieldKind::Int);
        let tokenizers = TokenizerManager::default();
        let strategy = NumericRange;
        let err = strategy
            .build(&field, Field::from_field_id(0), &["abc".to_string(), "5".to_string()], &HashMap::new(), &tokenizers)
            .unwrap_err();
        assert!(matches!(err, FlexError::InvalidCondition(_)));
    }

    #[test]
    fn wildcard_pattern_escapes_regex_metacharacters() {
        let field = text_field(FieldKind::ExactText);
        let tantivy_field = Field::from_field_id(0);
        let query = wildcard_query(tantivy_field, "a.b*c?d");
        assert!(query.is_ok());
        let _ = field;
    }
}
