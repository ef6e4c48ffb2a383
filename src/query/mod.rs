//! Query compiler (C7).
//!
//! Compiles a declarative filter tree into an executable tantivy query
//! using a registry of named query strategies resolved per field, the six
//! named operators of §4.7's strategy table, plus a profile/selector layer
//! for resolving named search profiles.

mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use tantivy::query::{BooleanQuery, BoostQuery, ConstScoreQuery, Occur, Query};
use tantivy::schema::Field;
use tantivy::tokenizer::TokenizerManager;

use crate::error::{FlexError, FlexResult};
use crate::field::FieldDescriptor;
use crate::runtime::IndexRuntime;

pub use strategies::{default_registry, QueryStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingValueOption {
    ThrowError,
    Default,
    Ignore,
}

/// A single leaf condition in a filter tree (§4.7).
#[derive(Debug, Clone)]
pub struct Condition {
    pub field_name: String,
    pub operator: String,
    pub values: Vec<String>,
    pub parameters: HashMap<String, String>,
    pub boost: i32,
    pub missing_value_option: MissingValueOption,
}

/// A nested conjunction/disjunction of conditions (§4.7).
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub filter_type: FilterTypeOrDefault,
    pub conditions: Vec<Condition>,
    pub sub_filters: Vec<SearchFilter>,
    pub constant_score: i32,
}

/// Wrapper purely so `SearchFilter` can derive `Default` without picking an
/// arbitrary default for `FilterType` silently — callers must set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterTypeOrDefault(pub FilterType);

impl Default for FilterTypeOrDefault {
    fn default() -> Self {
        FilterTypeOrDefault(FilterType::And)
    }
}

/// Registry of named query-building strategies (`term_match`, `fuzzy_match`, …).
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn QueryStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: default_registry(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn QueryStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn resolve(&self, operator: &str) -> Option<&Arc<dyn QueryStrategy>> {
        self.strategies.get(operator)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The pre-built filter trees a search profile maps a name to (§4.7).
pub type SearchProfiles = HashMap<String, SearchFilter>;

/// Resolves a search profile's name by invoking a named selector script
/// against the request's fields. An external collaborator (§1 scope: script
/// hosting); only the trait boundary lives here.
pub trait ProfileSelector: Send + Sync {
    fn select(&self, selector_name: &str, fields: &HashMap<String, String>) -> FlexResult<String>;
}

/// `SearchProfileQuery { profile_selector?, profile_name?, fields }` (§4.7).
pub struct SearchProfileQuery {
    pub profile_selector: Option<String>,
    pub profile_name: Option<String>,
    pub fields: HashMap<String, String>,
}

/// Resolves `tokenize(analyzer, field, text)`: opens the token stream,
/// drains it to exhaustion, then ends it — matching tantivy's own
/// stream lifecycle (open/reset-implicit/advance-to-exhaustion).
pub fn tokenize(tokenizers: &TokenizerManager, analyzer: &str, text: &str) -> Vec<String> {
    let tokenizer = match tokenizers.get(analyzer) {
        Some(t) => t,
        None => return Vec::new(),
    };

    let mut stream = tokenizer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    tokens
}

fn resolve_field<'a>(
    runtime: &'a IndexRuntime,
    field_name: &str,
) -> FlexResult<(&'a Arc<FieldDescriptor>, Field)> {
    let descriptor = runtime
        .setting
        .field(field_name)
        .ok_or_else(|| FlexError::UnknownField(field_name.to_string()))?;

    if descriptor.stored_only {
        return Err(FlexError::StoreOnlyField(field_name.to_string()));
    }

    let tantivy_field = runtime.shards[0]
        .schema()
        .get_field(field_name)
        .ok_or_else(|| FlexError::UnknownField(field_name.to_string()))?;

    Ok((descriptor, tantivy_field))
}

fn occur_for(filter_type: FilterType) -> Occur {
    match filter_type {
        FilterType::And => Occur::Must,
        FilterType::Or => Occur::Should,
    }
}

/// Compiles one condition into zero or one boosted clause, honoring the
/// profile-binding / missing-value rules of §4.7 step 3.
fn compile_condition(
    runtime: &IndexRuntime,
    condition: &Condition,
    registry: &StrategyRegistry,
    tokenizers: &TokenizerManager,
    profile_bindings: Option<&HashMap<String, String>>,
) -> FlexResult<Option<Box<dyn Query>>> {
    let strategy = registry
        .resolve(&condition.operator)
        .ok_or_else(|| FlexError::UnknownQueryOperator(condition.operator.clone()))?;

    let (descriptor, tantivy_field) = resolve_field(runtime, &condition.field_name)?;

    let mut values = condition.values.clone();

    if let Some(bindings) = profile_bindings {
        match bindings.get(&condition.field_name) {
            Some(bound_value) => {
                if values.is_empty() {
                    values.push(bound_value.clone());
                } else {
                    values[0] = bound_value.clone();
                }
            }
            None => match condition.missing_value_option {
                MissingValueOption::Ignore => return Ok(None),
                MissingValueOption::ThrowError => {
                    return Err(FlexError::InvalidCondition(format!(
                        "profile binding missing for field '{}'",
                        condition.field_name
                    )))
                }
                MissingValueOption::Default => {}
            },
        }
    }

    if values.is_empty() || values.iter().any(|v| v.is_empty()) {
        return Err(FlexError::InvalidCondition(format!(
            "condition on '{}' has empty values",
            condition.field_name
        )));
    }

    let built = strategy.build(descriptor, tantivy_field, &values, &condition.parameters, tokenizers)?;

    Ok(built.map(|query| {
        if condition.boost > 1 {
            Box::new(BoostQuery::new(query, condition.boost as f32)) as Box<dyn Query>
        } else {
            query
        }
    }))
}

/// Compiles `(index runtime, filter tree, is_top_level, profile_bindings)`
/// into an executable query (§4.7).
pub fn compile(
    runtime: &IndexRuntime,
    filter: &SearchFilter,
    is_top_level: bool,
    registry: &StrategyRegistry,
    tokenizers: &TokenizerManager,
    profile_bindings: Option<&HashMap<String, String>>,
) -> FlexResult<Box<dyn Query>> {
    let occur = occur_for(filter.filter_type.0);
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

    for condition in &filter.conditions {
        if let Some(query) = compile_condition(runtime, condition, registry, tokenizers, profile_bindings)? {
            clauses.push((occur, query));
        }
    }

    for sub_filter in &filter.sub_filters {
        let nested = compile(runtime, sub_filter, false, registry, tokenizers, profile_bindings)?;
        clauses.push((occur, nested));
    }

    let boolean: Box<dyn Query> = Box::new(BooleanQuery::from(clauses));

    if filter.constant_score > 1 && !is_top_level {
        Ok(Box::new(ConstScoreQuery::new(boolean, filter.constant_score as f32)))
    } else {
        Ok(boolean)
    }
}

/// Resolves and compiles a search-profile query (§4.7).
pub fn compile_profile(
    runtime: &IndexRuntime,
    profiles: &SearchProfiles,
    query: &SearchProfileQuery,
    selector: Option<&dyn ProfileSelector>,
    registry: &StrategyRegistry,
    tokenizers: &TokenizerManager,
) -> FlexResult<Box<dyn Query>> {
    let profile_name = match (&query.profile_selector, &query.profile_name) {
        (Some(selector_name), _) => {
            let selector = selector
                .ok_or_else(|| FlexError::ValidationFailed("no profile selector registered".into()))?;
            selector.select(selector_name, &query.fields)?
        }
        (None, Some(name)) => name.clone(),
        (None, None) => {
            return Err(FlexError::ValidationFailed(
                "search profile query has neither a selector nor a name".into(),
            ))
        }
    };

    let filter = profiles
        .get(&profile_name)
        .ok_or_else(|| FlexError::UnknownSearchProfile(profile_name))?;

    compile(runtime, filter, true, registry, tokenizers, Some(&query.fields))
}
