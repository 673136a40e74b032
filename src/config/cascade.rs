//! Cascade plan configuration.
//!
//! A plan names the entity collection, how to read an entity's identity and
//! end period, and the ordered steps that retire it across related
//! collections. Two presets reproduce the deployments this job was built
//! for; anything else is spelled out step by step.
//!
//! # Example
//!
//! ```toml
//! [plan]
//! name = "connections"
//! collection = "connections"
//! id_field = "_id"
//! end_period_field = "endyear"
//!
//! [plan.collections]
//! connections = ["Organization.Connections", "connections"]
//!
//! [[plan.steps]]
//! collection = "connections"
//! match = { "_id" = "{{id}}" }
//! action = { type = "hard_delete" }
//!
//! [[plan.steps]]
//! collection = "users"
//! match = { "id" = "{{entity.characterid}}" }
//! action = { type = "pull_reference", field = "institutionconnections", value = "{{entity.organization.id}}" }
//!
//! [[plan.steps]]
//! collection = "unilogins"
//! match = { "userid" = "{{entity.characterid}}" }
//! action = { type = "hard_delete" }
//! when = { field = "method", equals = 1 }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::ConfigError;
use crate::retention::Template;

/// Built-in plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlanPreset {
    /// Retire user–organization connections and every denormalized copy of
    /// the membership (user, organization, auth tokens, pages, access).
    ConnectionCleanup,
    /// Retire whole users, leaving a delete request and an archived copy.
    UserCleanup,
}

/// Plan configuration as written in the config file.
///
/// Every field is optional when `preset` is set; explicit fields override
/// the preset, and a non-empty `steps` list replaces the preset's steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    #[serde(default)]
    pub preset: Option<PlanPreset>,

    /// Name used in logs, metrics and the report header.
    #[serde(default)]
    pub name: Option<String>,

    /// Collection holding the entities to sweep (alias or physical name).
    #[serde(default)]
    pub collection: Option<String>,

    /// Field holding the entity's stable identifier.
    #[serde(default)]
    pub id_field: Option<String>,

    /// Field holding the entity's end period (year or date).
    #[serde(default)]
    pub end_period_field: Option<String>,

    /// Collection aliases. Each alias maps to physical names tried in order;
    /// the first one present in the datastore is used.
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<String>>,

    /// Ordered cascade steps.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One cascade step: which collection, which records, what to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Collection (alias or physical name) the step operates on.
    pub collection: String,

    /// Equality predicate, dotted field path → template value.
    #[serde(rename = "match")]
    pub filter: BTreeMap<String, Value>,

    pub action: ActionConfig,

    /// Optional guard; the step is omitted when it does not hold.
    #[serde(default)]
    pub when: Option<GuardConfig>,
}

/// What a step does to the records its predicate matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionConfig {
    /// Remove the matched records.
    HardDelete,
    /// Set marker fields on the matched records.
    SoftDelete { set: BTreeMap<String, Value> },
    /// Insert a copy of each matched record into `target`.
    ArchiveCopy {
        target: String,
        /// Nest the original under this dotted path instead of copying it
        /// at the top level.
        #[serde(default)]
        wrap_field: Option<String>,
        /// Extra fields written into each copy.
        #[serde(default)]
        extra: BTreeMap<String, Value>,
    },
    /// Remove `value` from the array at `field` in the matched records.
    PullReference { field: String, value: Value },
}

/// Step guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct GuardConfig {
    /// Dotted path read from the entity, or from the looked-up record.
    pub field: String,
    pub equals: Value,
    /// Related record to read before the transaction starts.
    #[serde(default)]
    pub lookup: Option<LookupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct LookupConfig {
    pub collection: String,
    #[serde(rename = "match")]
    pub filter: BTreeMap<String, Value>,
}

/// A fully resolved plan definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDefinition {
    pub name: String,
    pub collection: String,
    pub id_field: String,
    pub end_period_field: String,
    pub collections: BTreeMap<String, Vec<String>>,
    pub steps: Vec<StepConfig>,
}

impl PlanConfig {
    /// Merge the preset (if any) with explicit fields and validate the result.
    pub fn resolve(&self) -> Result<PlanDefinition, ConfigError> {
        let base = self.preset.map(PlanPreset::definition);

        let pick = |explicit: &Option<String>,
                    from_base: Option<&String>,
                    field: &str|
         -> Result<String, ConfigError> {
            explicit
                .clone()
                .or_else(|| from_base.cloned())
                .ok_or_else(|| ConfigError::Validation(format!("plan.{field} is required")))
        };

        let name = pick(&self.name, base.as_ref().map(|b| &b.name), "name")?;
        let collection = pick(
            &self.collection,
            base.as_ref().map(|b| &b.collection),
            "collection",
        )?;
        let id_field = self
            .id_field
            .clone()
            .or_else(|| base.as_ref().map(|b| b.id_field.clone()))
            .unwrap_or_else(|| "id".to_string());
        let end_period_field = self
            .end_period_field
            .clone()
            .or_else(|| base.as_ref().map(|b| b.end_period_field.clone()))
            .unwrap_or_else(|| "endyear".to_string());

        let mut collections = base
            .as_ref()
            .map(|b| b.collections.clone())
            .unwrap_or_default();
        collections.extend(self.collections.clone());

        let steps = if self.steps.is_empty() {
            base.map(|b| b.steps).unwrap_or_default()
        } else {
            self.steps.clone()
        };

        let definition = PlanDefinition {
            name,
            collection,
            id_field,
            end_period_field,
            collections,
            steps,
        };
        definition.validate()?;
        Ok(definition)
    }
}

impl PlanDefinition {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::Validation(format!(
                "plan '{}' has no steps",
                self.name
            )));
        }
        if self.id_field.is_empty() || self.end_period_field.is_empty() {
            return Err(ConfigError::Validation(format!(
                "plan '{}' needs non-empty id_field and end_period_field",
                self.name
            )));
        }
        for (alias, alternatives) in &self.collections {
            if alternatives.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "collection alias '{alias}' lists no physical names"
                )));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            let context = |msg: String| {
                ConfigError::Validation(format!("plan '{}' step {}: {}", self.name, index + 1, msg))
            };

            if step.filter.is_empty() {
                return Err(context(
                    "match must name at least one field; refusing to touch a whole collection"
                        .into(),
                ));
            }
            check_templates(step.filter.values()).map_err(context)?;

            match &step.action {
                ActionConfig::HardDelete => {}
                ActionConfig::SoftDelete { set } => {
                    if set.is_empty() {
                        return Err(context("soft_delete needs at least one field in `set`".into()));
                    }
                    check_templates(set.values()).map_err(context)?;
                    if self.targets_entity_collection(&step.collection)
                        && !set.values().any(is_literal_marker)
                    {
                        return Err(context(
                            "soft_delete on the entity collection needs at least one literal \
                             value in `set` to mark retired entities"
                                .into(),
                        ));
                    }
                }
                ActionConfig::ArchiveCopy { target, extra, .. } => {
                    if target.is_empty() {
                        return Err(context("archive_copy target cannot be empty".into()));
                    }
                    check_templates(extra.values()).map_err(context)?;
                }
                ActionConfig::PullReference { field, value } => {
                    if field.is_empty() {
                        return Err(context("pull_reference field cannot be empty".into()));
                    }
                    check_templates(std::iter::once(value)).map_err(context)?;
                }
            }

            if let Some(guard) = &step.when {
                check_templates(std::iter::once(&guard.equals)).map_err(context)?;
                if let Some(lookup) = &guard.lookup {
                    if lookup.filter.is_empty() {
                        return Err(context("lookup match cannot be empty".into()));
                    }
                    check_templates(lookup.filter.values()).map_err(context)?;
                }
            }
        }
        Ok(())
    }

    /// Whether `collection` can resolve to the same physical collection as
    /// the entity collection.
    fn targets_entity_collection(&self, collection: &str) -> bool {
        if collection == self.collection {
            return true;
        }
        let entity_names = self.alternatives(&self.collection);
        self.alternatives(collection)
            .iter()
            .any(|name| entity_names.contains(name))
    }

    /// Physical-name candidates for a collection reference.
    pub fn alternatives(&self, collection: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .cloned()
            .unwrap_or_else(|| vec![collection.to_string()])
    }

    /// Every collection reference the plan touches, entity collection first,
    /// without duplicates.
    pub fn referenced_collections(&self) -> Vec<String> {
        let mut names = vec![self.collection.clone()];
        let mut push = |name: &String| {
            if !names.contains(name) {
                names.push(name.clone());
            }
        };
        for step in &self.steps {
            push(&step.collection);
            if let ActionConfig::ArchiveCopy { target, .. } = &step.action {
                push(target);
            }
            if let Some(lookup) = step.when.as_ref().and_then(|g| g.lookup.as_ref()) {
                push(&lookup.collection);
            }
        }
        names
    }
}

fn is_literal_marker(value: &Value) -> bool {
    matches!(Template::parse(value), Ok(Template::Literal(_)))
}

fn check_templates<'a>(values: impl Iterator<Item = &'a Value>) -> Result<(), String> {
    for value in values {
        Template::parse(value).map_err(|e| e.to_string())?;
    }
    Ok(())
}

impl PlanPreset {
    /// The built-in definition for this preset.
    pub fn definition(self) -> PlanDefinition {
        match self {
            PlanPreset::ConnectionCleanup => connection_cleanup(),
            PlanPreset::UserCleanup => user_cleanup(),
        }
    }
}

fn step(
    collection: &str,
    filter: Value,
    action: ActionConfig,
    when: Option<GuardConfig>,
) -> StepConfig {
    let filter = match filter {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    StepConfig {
        collection: collection.to_string(),
        filter,
        action,
        when,
    }
}

fn connection_cleanup() -> PlanDefinition {
    let steps = vec![
        step(
            "Organization.Connections",
            json!({ "_id": "{{id}}" }),
            ActionConfig::HardDelete,
            None,
        ),
        step(
            "users",
            json!({ "id": "{{entity.characterid}}" }),
            ActionConfig::PullReference {
                field: "institutionconnections".into(),
                value: json!("{{entity.organization.id}}"),
            },
            None,
        ),
        step(
            "Organization.Organizations",
            json!({ "id": "{{entity.organization.id}}" }),
            ActionConfig::PullReference {
                field: "connections".into(),
                value: json!("{{id}}"),
            },
            None,
        ),
        step(
            "Unilogin.Auth",
            json!({ "userid": "{{entity.characterid}}" }),
            ActionConfig::HardDelete,
            None,
        ),
        step(
            "Page.Pages",
            json!({ "organization.id": "{{entity.organization.id}}" }),
            ActionConfig::PullReference {
                field: "allowedUsers".into(),
                value: json!("{{entity.characterid}}"),
            },
            None,
        ),
        step(
            "Access.Access",
            json!({
                "characterid": "{{entity.characterid}}",
                "organization.id": "{{entity.organization.id}}",
            }),
            ActionConfig::HardDelete,
            None,
        ),
        step(
            "unilogins",
            json!({ "userid": "{{entity.characterid}}" }),
            ActionConfig::HardDelete,
            Some(GuardConfig {
                field: "method".into(),
                equals: json!(1),
                lookup: None,
            }),
        ),
    ];

    PlanDefinition {
        name: "connection_cleanup".into(),
        collection: "Organization.Connections".into(),
        id_field: "_id".into(),
        end_period_field: "endyear".into(),
        collections: BTreeMap::from([
            (
                "Organization.Connections".to_string(),
                vec!["Organization.Connections".to_string(), "connections".to_string()],
            ),
            (
                "Access.Access".to_string(),
                vec!["Access.Access".to_string(), "accesses".to_string()],
            ),
        ]),
        steps,
    }
}

fn user_cleanup() -> PlanDefinition {
    let steps = vec![
        step(
            "users",
            json!({ "id": "{{id}}" }),
            ActionConfig::ArchiveCopy {
                target: "deleteRequests".into(),
                wrap_field: Some("metadata.originalUser".into()),
                extra: BTreeMap::from([
                    ("_id".to_string(), json!("{{retirement_id}}")),
                    ("userId".to_string(), json!("{{id}}")),
                    (
                        "accessid".to_string(),
                        json!("{{entity.accessid | retirement_id}}"),
                    ),
                    ("requestDate".to_string(), json!("{{now}}")),
                    ("status".to_string(), json!("COMPLETED")),
                    ("reason".to_string(), json!("AUTOMATIC_CLEANUP")),
                    ("metadata.deletionDate".to_string(), json!("{{now}}")),
                    ("metadata.deletionType".to_string(), json!("BATCH_CLEANUP")),
                ]),
            },
            None,
        ),
        step(
            "users",
            json!({ "id": "{{id}}" }),
            ActionConfig::ArchiveCopy {
                target: "deleted".into(),
                wrap_field: None,
                extra: BTreeMap::from([
                    ("deletedAt".to_string(), json!("{{now}}")),
                    ("deleteRequestId".to_string(), json!("{{retirement_id}}")),
                ]),
            },
            None,
        ),
        step(
            "users",
            json!({ "id": "{{id}}" }),
            ActionConfig::HardDelete,
            None,
        ),
        step(
            "identifications",
            json!({ "userId": "{{id}}" }),
            ActionConfig::HardDelete,
            None,
        ),
    ];

    PlanDefinition {
        name: "user_cleanup".into(),
        collection: "users".into(),
        id_field: "id".into(),
        end_period_field: "endyear".into(),
        collections: BTreeMap::from([
            (
                "users".to_string(),
                vec!["Users".to_string(), "User.Users".to_string(), "users".to_string()],
            ),
            ("identifications".to_string(), vec!["Identifications".to_string()]),
            ("deleteRequests".to_string(), vec!["DeleteRequests".to_string()]),
            ("deleted".to_string(), vec!["Deleted".to_string()]),
        ]),
        steps,
    }
}
