//! Cascade plans.
//!
//! A [`Planner`] is compiled once per run from the configured
//! [`PlanDefinition`] and the physical collection names found at setup. For
//! each eligible entity it renders a [`CascadePlan`]: the concrete filters
//! and actions the executor applies in one transaction.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::error::{PlanError, RetentionError, TemplateError};
use crate::{
    config::{ActionConfig, GuardConfig, PlanDefinition},
    db::DocumentStore,
    models::{Document, Entity, EntityError, Filter, document},
};

/// A configured value that may reference the entity being retired.
///
/// Strings of the form `{{id}}`, `{{now}}`, `{{retirement_id}}` or
/// `{{entity.<path>}}` are placeholders; every other value is a literal.
/// Placeholders joined with `|` (`{{entity.accessid | retirement_id}}`)
/// render the first one that yields a value other than null or `""`.
/// Arrays and objects are walked recursively.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Literal(Value),
    Id,
    Now,
    RetirementId,
    Field(String),
    Fallback(Vec<Template>),
    Array(Vec<Template>),
    Object(Vec<(String, Template)>),
}

/// Values a template can draw from.
pub struct RenderContext<'a> {
    pub entity: &'a Entity,
    pub now: DateTime<Utc>,
    pub retirement_id: &'a str,
}

impl Template {
    pub fn parse(value: &Value) -> Result<Self, TemplateError> {
        match value {
            Value::String(s) => Self::parse_str(s),
            Value::Array(items) => Ok(Template::Array(
                items.iter().map(Self::parse).collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(Template::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                    .collect::<Result<_, TemplateError>>()?,
            )),
            other => Ok(Template::Literal(other.clone())),
        }
    }

    fn parse_str(s: &str) -> Result<Self, TemplateError> {
        let trimmed = s.trim();
        if let Some(inner) = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
        {
            if inner.contains('|') {
                return inner
                    .split('|')
                    .map(Self::parse_placeholder)
                    .collect::<Result<_, _>>()
                    .map(Template::Fallback);
            }
            return Self::parse_placeholder(inner);
        }
        if s.contains("{{") {
            return Err(TemplateError::Embedded(s.to_string()));
        }
        Ok(Template::Literal(Value::String(s.to_string())))
    }

    fn parse_placeholder(inner: &str) -> Result<Self, TemplateError> {
        let inner = inner.trim();
        match inner {
            "id" => Ok(Template::Id),
            "now" => Ok(Template::Now),
            "retirement_id" => Ok(Template::RetirementId),
            _ => match inner.strip_prefix("entity.") {
                Some(path) if !path.is_empty() => Ok(Template::Field(path.to_string())),
                _ => Err(TemplateError::UnknownPlaceholder(inner.to_string())),
            },
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<Value, PlanError> {
        Ok(match self {
            Template::Literal(v) => v.clone(),
            Template::Id => ctx.entity.raw_id.clone(),
            Template::Now => Value::String(ctx.now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Template::RetirementId => Value::String(ctx.retirement_id.to_string()),
            Template::Field(path) => document::get_path(&ctx.entity.document, path)
                .cloned()
                .ok_or_else(|| PlanError::MissingField(path.clone()))?,
            Template::Fallback(alternatives) => {
                let mut result = Ok(Value::Null);
                for alternative in alternatives {
                    result = alternative.render(ctx);
                    match &result {
                        Ok(Value::Null) | Err(PlanError::MissingField(_)) => continue,
                        Ok(Value::String(s)) if s.is_empty() => continue,
                        _ => break,
                    }
                }
                result?
            }
            Template::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|t| t.render(ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Template::Object(fields) => {
                let mut map = Map::new();
                for (key, t) in fields {
                    map.insert(key.clone(), t.render(ctx)?);
                }
                Value::Object(map)
            }
        })
    }

    fn as_literal(&self) -> Option<&Value> {
        match self {
            Template::Literal(v) => Some(v),
            _ => None,
        }
    }
}

/// Rendered action for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    HardDelete,
    SoftDelete {
        set: Document,
    },
    ArchiveCopy {
        target: String,
        wrap_field: Option<String>,
        extra: Document,
    },
    PullReference {
        field: String,
        value: Value,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::HardDelete => "hard_delete",
            StepAction::SoftDelete { .. } => "soft_delete",
            StepAction::ArchiveCopy { .. } => "archive_copy",
            StepAction::PullReference { .. } => "pull_reference",
        }
    }
}

/// One rendered step against a physical collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeStep {
    pub collection: String,
    pub filter: Filter,
    pub action: StepAction,
}

/// Everything that must change, atomically, to retire one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadePlan {
    pub entity_id: String,
    pub retirement_id: String,
    pub steps: Vec<CascadeStep>,
    /// Configured steps left out because their guard did not hold (1-based).
    pub omitted: Vec<usize>,
}

/// Resolve every collection the plan references to a physical name.
///
/// Each reference maps to its configured alternatives (or itself); the first
/// alternative present in `existing` wins. Missing references are returned
/// together so setup can report all of them at once.
pub fn resolve_collections(
    definition: &PlanDefinition,
    existing: &[String],
) -> Result<BTreeMap<String, String>, RetentionError> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();

    for reference in definition.referenced_collections() {
        let alternatives = definition.alternatives(&reference);
        match alternatives.iter().find(|name| existing.contains(name)) {
            Some(found) => {
                resolved.insert(reference, found.clone());
            }
            None => missing.push(alternatives.join(" | ")),
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(RetentionError::MissingCollections(missing))
    }
}

type FieldTemplates = Vec<(String, Template)>;

#[derive(Debug)]
enum CompiledAction {
    HardDelete,
    SoftDelete(FieldTemplates),
    ArchiveCopy {
        target: String,
        wrap_field: Option<String>,
        extra: FieldTemplates,
    },
    PullReference {
        field: String,
        value: Template,
    },
}

#[derive(Debug)]
struct CompiledGuard {
    field: String,
    equals: Template,
    lookup: Option<(String, FieldTemplates)>,
}

#[derive(Debug)]
struct CompiledStep {
    collection: String,
    filter: FieldTemplates,
    action: CompiledAction,
    guard: Option<CompiledGuard>,
}

/// Builds per-entity cascade plans.
pub struct Planner {
    name: String,
    collection: String,
    id_field: String,
    end_period_field: String,
    steps: Vec<CompiledStep>,
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("steps", &self.steps.len())
            .finish()
    }
}

fn compile_fields<'a>(
    fields: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Result<FieldTemplates, TemplateError> {
    fields
        .into_iter()
        .map(|(k, v)| Ok((k.clone(), Template::parse(v)?)))
        .collect()
}

impl Planner {
    /// Compile a plan definition against resolved physical collection names.
    ///
    /// `store` serves the guard lookups performed while planning.
    pub fn new(
        definition: &PlanDefinition,
        collections: &BTreeMap<String, String>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, RetentionError> {
        let physical = |name: &str| {
            collections
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string())
        };
        let invalid = |index: usize, e: TemplateError| {
            RetentionError::InvalidPlan(format!("step {}: {}", index + 1, e))
        };

        let mut steps = Vec::with_capacity(definition.steps.len());
        for (index, step) in definition.steps.iter().enumerate() {
            let action = match &step.action {
                ActionConfig::HardDelete => CompiledAction::HardDelete,
                ActionConfig::SoftDelete { set } => {
                    CompiledAction::SoftDelete(compile_fields(set).map_err(|e| invalid(index, e))?)
                }
                ActionConfig::ArchiveCopy {
                    target,
                    wrap_field,
                    extra,
                } => CompiledAction::ArchiveCopy {
                    target: physical(target),
                    wrap_field: wrap_field.clone(),
                    extra: compile_fields(extra).map_err(|e| invalid(index, e))?,
                },
                ActionConfig::PullReference { field, value } => CompiledAction::PullReference {
                    field: field.clone(),
                    value: Template::parse(value).map_err(|e| invalid(index, e))?,
                },
            };

            let guard = match &step.when {
                Some(GuardConfig {
                    field,
                    equals,
                    lookup,
                }) => Some(CompiledGuard {
                    field: field.clone(),
                    equals: Template::parse(equals).map_err(|e| invalid(index, e))?,
                    lookup: match lookup {
                        Some(l) => Some((
                            physical(&l.collection),
                            compile_fields(&l.filter).map_err(|e| invalid(index, e))?,
                        )),
                        None => None,
                    },
                }),
                None => None,
            };

            steps.push(CompiledStep {
                collection: physical(&step.collection),
                filter: compile_fields(&step.filter).map_err(|e| invalid(index, e))?,
                action,
                guard,
            });
        }

        Ok(Self {
            name: definition.name.clone(),
            collection: physical(&definition.collection),
            id_field: definition.id_field.clone(),
            end_period_field: definition.end_period_field.clone(),
            steps,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical name of the entity collection.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Extract an entity from a document of the entity collection.
    pub fn entity_from(&self, doc: Document) -> Result<Entity, EntityError> {
        Entity::from_document(doc, &self.id_field, &self.end_period_field)
    }

    /// Whether the entity already carries the marker of a soft-delete step
    /// that targets its own collection.
    ///
    /// Only literal marker values count; `{{now}}` and other placeholders
    /// differ between runs.
    pub fn already_retired(&self, entity: &Entity) -> bool {
        self.steps
            .iter()
            .filter(|step| step.collection == self.collection)
            .filter_map(|step| match &step.action {
                CompiledAction::SoftDelete(set) => Some(set),
                _ => None,
            })
            .any(|set| {
                let mut literals = set
                    .iter()
                    .filter_map(|(path, t)| t.as_literal().map(|v| (path, v)))
                    .peekable();
                literals.peek().is_some()
                    && literals.all(|(path, expected)| {
                        document::get_path(&entity.document, path) == Some(expected)
                    })
            })
    }

    /// Render the cascade plan for one entity.
    ///
    /// Guard lookups run here, before any transaction is opened. A guard
    /// whose related record is missing, or whose value does not match,
    /// omits its step.
    pub async fn build_plan(
        &self,
        entity: &Entity,
        now: DateTime<Utc>,
    ) -> Result<CascadePlan, PlanError> {
        let retirement_id = format!("{}_{}", now.timestamp_millis(), entity.id);
        let ctx = RenderContext {
            entity,
            now,
            retirement_id: &retirement_id,
        };

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut omitted = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(guard) = &step.guard {
                if !self.guard_holds(guard, &ctx).await? {
                    tracing::debug!(
                        entity_id = %entity.id,
                        step = index + 1,
                        collection = %step.collection,
                        "Guard not satisfied, omitting step"
                    );
                    omitted.push(index + 1);
                    continue;
                }
            }

            let action = match &step.action {
                CompiledAction::HardDelete => StepAction::HardDelete,
                CompiledAction::SoftDelete(set) => StepAction::SoftDelete {
                    set: render_fields(set, &ctx)?,
                },
                CompiledAction::ArchiveCopy {
                    target,
                    wrap_field,
                    extra,
                } => StepAction::ArchiveCopy {
                    target: target.clone(),
                    wrap_field: wrap_field.clone(),
                    extra: render_fields(extra, &ctx)?,
                },
                CompiledAction::PullReference { field, value } => StepAction::PullReference {
                    field: field.clone(),
                    value: value.render(&ctx)?,
                },
            };

            steps.push(CascadeStep {
                collection: step.collection.clone(),
                filter: render_filter(&step.filter, &ctx)?,
                action,
            });
        }

        Ok(CascadePlan {
            entity_id: entity.id.clone(),
            retirement_id,
            steps,
            omitted,
        })
    }

    async fn guard_holds(
        &self,
        guard: &CompiledGuard,
        ctx: &RenderContext<'_>,
    ) -> Result<bool, PlanError> {
        let expected = guard.equals.render(ctx)?;

        let actual = match &guard.lookup {
            None => document::get_path(&ctx.entity.document, &guard.field).cloned(),
            Some((collection, filter)) => {
                let filter = render_filter(filter, ctx)?;
                let related = self
                    .store
                    .find_one(collection, &filter)
                    .await
                    .map_err(|e| PlanError::Lookup {
                        collection: collection.clone(),
                        message: e.to_string(),
                    })?;
                related.and_then(|doc| document::get_path(&doc, &guard.field).cloned())
            }
        };

        Ok(actual.as_ref() == Some(&expected))
    }
}

fn render_fields(fields: &FieldTemplates, ctx: &RenderContext<'_>) -> Result<Document, PlanError> {
    let mut doc = Document::new();
    for (path, t) in fields {
        doc.insert(path.clone(), t.render(ctx)?);
    }
    Ok(doc)
}

fn render_filter(fields: &FieldTemplates, ctx: &RenderContext<'_>) -> Result<Filter, PlanError> {
    fields
        .iter()
        .map(|(path, t)| Ok((path.clone(), t.render(ctx)?)))
        .collect()
}
