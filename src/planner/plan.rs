//! Plan construction.
//!
//! A [`Plan`] is the immutable, validated form of a plan file: counted
//! resources are expanded into instances, attribute trees are typed, every
//! reference is checked against its target's kind, and each declaration
//! carries its full dependency list and content hash.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::{
    AttributeValue, ConfigHasher, PlanConfig, Reference, ResourceKind, Selector, instance_id, mentions_count_index,
    substitute_count_index,
};
use crate::error::{ConfigError, Result};

/// A typed resource declaration after count expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    /// Unique identifier (`web` or `web[0]` for counted resources).
    pub id: String,
    /// Identifier as written in the plan file.
    pub base: String,
    /// Instance index for counted resources.
    pub count_index: Option<usize>,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Typed attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Declarations this one depends on, explicit entries first.
    pub dependencies: Vec<String>,
    /// Position in declaration order.
    pub index: usize,
    /// Content hash of the declaration.
    pub hash: String,
}

/// A declared output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDeclaration {
    /// Output name.
    pub name: String,
    /// Value tree, usually containing references.
    pub value: AttributeValue,
}

/// How a declared identifier expands.
#[derive(Debug, Clone, Copy)]
struct BaseInfo {
    kind: ResourceKind,
    count: Option<usize>,
}

/// A validated, expanded plan.
#[derive(Debug, Clone)]
pub struct Plan {
    project: String,
    environment: String,
    region: Option<String>,
    declarations: Vec<ResourceDeclaration>,
    outputs: Vec<OutputDeclaration>,
    bases: BTreeMap<String, BaseInfo>,
    positions: HashMap<String, usize>,
    hash: String,
}

impl Plan {
    /// Builds a plan from a parsed plan file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for duplicate identifiers, unknown resource
    /// types, malformed attributes, and references to undeclared resources or
    /// to attributes the target kind does not export.
    pub fn from_config(config: &PlanConfig) -> Result<Self> {
        let hasher = ConfigHasher::new();
        let mut bases = BTreeMap::new();

        for resource in &config.resources {
            let kind = resource
                .type_name
                .parse::<ResourceKind>()
                .map_err(|_| ConfigError::UnknownResourceType {
                    id: resource.id.clone(),
                    type_name: resource.type_name.clone(),
                })?;

            let info = BaseInfo {
                kind,
                count: resource.count,
            };
            if bases.insert(resource.id.clone(), info).is_some() {
                return Err(ConfigError::DuplicateId {
                    id: resource.id.clone(),
                }
                .into());
            }
        }

        let mut plan = Self {
            project: config.project.name.clone(),
            environment: config.project.environment.clone(),
            region: config.project.region.clone(),
            declarations: Vec::new(),
            outputs: Vec::new(),
            bases,
            positions: HashMap::new(),
            hash: String::new(),
        };

        for resource in &config.resources {
            let info = plan.bases[&resource.id];
            let instances: Vec<Option<usize>> = match info.count {
                Some(n) => (0..n).map(Some).collect(),
                None => vec![None],
            };

            for count_index in instances {
                let id = count_index.map_or_else(|| resource.id.clone(), |i| instance_id(&resource.id, i));

                let mut attributes = BTreeMap::new();
                for (name, raw) in &resource.attributes {
                    if count_index.is_none() && mentions_count_index(raw) {
                        return Err(ConfigError::validation(
                            "${count.index} is only valid inside a resource with count",
                            format!("{id}.{name}"),
                        )
                        .into());
                    }
                    let raw = count_index.map_or_else(|| raw.clone(), |i| substitute_count_index(raw, i));
                    let value = AttributeValue::from_yaml(&raw)
                        .map_err(|message| ConfigError::validation(message, format!("{id}.{name}")))?;
                    attributes.insert(name.clone(), value);
                }

                let mut dependencies = Vec::new();
                for dep in &resource.depends_on {
                    let targets = plan.expand_base(&id, dep)?;
                    push_unique(&mut dependencies, targets);
                }
                for value in attributes.values() {
                    for reference in value.references() {
                        let targets = plan.reference_targets(&id, reference)?;
                        push_unique(&mut dependencies, targets);
                    }
                }

                if dependencies.contains(&id) {
                    return Err(ConfigError::CircularDependency { members: vec![id] }.into());
                }

                let hash = hasher.hash_declaration(&id, info.kind, &attributes, &dependencies);
                let index = plan.declarations.len();
                plan.positions.insert(id.clone(), index);
                plan.declarations.push(ResourceDeclaration {
                    id,
                    base: resource.id.clone(),
                    count_index,
                    kind: info.kind,
                    attributes,
                    dependencies,
                    index,
                    hash,
                });
            }
        }

        for (name, raw) in &config.outputs {
            let from = format!("output.{name}");
            let value = AttributeValue::from_yaml(raw).map_err(|message| ConfigError::invalid_reference(&from, message))?;
            for reference in value.references() {
                plan.reference_targets(&from, reference)?;
            }
            plan.outputs.push(OutputDeclaration {
                name: name.clone(),
                value,
            });
        }

        plan.hash = hasher.hash_plan(
            &plan.project,
            &plan.environment,
            plan.declarations.iter().map(|d| d.hash.as_str()),
            plan.outputs.iter().map(|o| (o.name.as_str(), &o.value)),
        );

        debug!(
            declarations = plan.declarations.len(),
            outputs = plan.outputs.len(),
            hash = %plan.hash,
            "Built plan"
        );

        Ok(plan)
    }

    /// Resolves the declarations a reference points at.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownReference`] for undeclared targets and
    /// [`ConfigError::InvalidReference`] when the attribute is not exported
    /// or the selector does not match the target's count.
    pub fn reference_targets(&self, from: &str, reference: &Reference) -> Result<Vec<String>> {
        let info = self
            .bases
            .get(&reference.resource)
            .ok_or_else(|| ConfigError::UnknownReference {
                from: from.to_string(),
                target: reference.resource.clone(),
            })?;

        if !info.kind.exports(&reference.attribute) {
            return Err(ConfigError::invalid_reference(
                from,
                format!(
                    "{} '{}' does not export '{}' (available: {})",
                    info.kind,
                    reference.resource,
                    reference.attribute,
                    info.kind.exported_attributes().join(", ")
                ),
            )
            .into());
        }

        let targets = match (reference.selector, info.count) {
            (Selector::Whole, None) => vec![reference.resource.clone()],
            (Selector::Whole, Some(_)) => {
                return Err(ConfigError::invalid_reference(
                    from,
                    format!(
                        "'{0}' has count; use {0}[i] or {0}[*] in {reference}",
                        reference.resource
                    ),
                )
                .into());
            }
            (Selector::Index(i), Some(n)) if i < n => vec![instance_id(&reference.resource, i)],
            (Selector::Index(i), Some(n)) => {
                return Err(ConfigError::invalid_reference(
                    from,
                    format!("index {i} is out of range for '{}' with count {n}", reference.resource),
                )
                .into());
            }
            (Selector::Splat, Some(n)) => (0..n).map(|i| instance_id(&reference.resource, i)).collect(),
            (Selector::Index(_) | Selector::Splat, None) => {
                return Err(ConfigError::invalid_reference(
                    from,
                    format!("'{}' has no count and cannot be indexed in {reference}", reference.resource),
                )
                .into());
            }
        };

        Ok(targets)
    }

    /// Expands a `depends_on` entry into declaration identifiers.
    fn expand_base(&self, from: &str, base: &str) -> Result<Vec<String>> {
        let info = self.bases.get(base).ok_or_else(|| ConfigError::UnknownReference {
            from: from.to_string(),
            target: base.to_string(),
        })?;

        Ok(match info.count {
            Some(n) => (0..n).map(|i| instance_id(base, i)).collect(),
            None => vec![base.to_string()],
        })
    }

    /// Returns the project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Returns the environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the target region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Returns the declarations in declaration order.
    #[must_use]
    pub fn declarations(&self) -> &[ResourceDeclaration] {
        &self.declarations
    }

    /// Returns the declared outputs, sorted by name.
    #[must_use]
    pub fn outputs(&self) -> &[OutputDeclaration] {
        &self.outputs
    }

    /// Looks up a declaration by identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.positions.get(id).map(|&i| &self.declarations[i])
    }

    /// Returns true if `id` is declared.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Looks up an output by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputDeclaration> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Returns the number of declarations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns true if the plan declares nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Returns the plan hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the instance identifiers declared under `base`.
    ///
    /// Accepts either a base name (expanding counted resources) or an exact
    /// instance identifier.
    #[must_use]
    pub fn resolve_target(&self, target: &str) -> Vec<String> {
        if self.contains(target) {
            return vec![target.to_string()];
        }
        self.declarations
            .iter()
            .filter(|d| d.base == target)
            .map(|d| d.id.clone())
            .collect()
    }
}

fn push_unique(out: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
}
