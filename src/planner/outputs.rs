//! Output resolution.
//!
//! References are read from the realized attributes recorded in state. The
//! same lookup feeds attribute resolution in the apply engine.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::{Reference, Selector};
use crate::error::{ApplyError, OutputError, Result, TierformError};
use crate::state::StateSnapshot;

use super::plan::{OutputDeclaration, Plan};

/// Why a reference could not be read from state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    /// The referenced resource is not `Ready`.
    NotReady {
        /// Identifier of the resource.
        resource: String,
    },
    /// The resource is ready but did not report the attribute.
    MissingAttribute {
        /// Identifier of the resource.
        resource: String,
        /// Attribute name.
        attribute: String,
    },
    /// The reference does not match the plan.
    Invalid(String),
}

impl LookupFailure {
    /// Converts into the error reported for an output.
    #[must_use]
    pub fn into_output_error(self, output: &str) -> TierformError {
        match self {
            Self::NotReady { resource } => OutputError::UnresolvedReference {
                output: output.to_string(),
                resource,
            }
            .into(),
            Self::MissingAttribute { resource, attribute } => OutputError::MissingAttribute {
                output: output.to_string(),
                resource,
                attribute,
            }
            .into(),
            Self::Invalid(message) => TierformError::internal(format!("Output '{output}': {message}")),
        }
    }

    /// Converts into the error reported for a resource being applied.
    #[must_use]
    pub fn into_apply_error(self, resource: &str, reference: &Reference) -> TierformError {
        let reason = match self {
            Self::NotReady { resource } => format!("{resource} is not ready"),
            Self::MissingAttribute { resource, attribute } => {
                format!("{resource} did not report attribute '{attribute}'")
            }
            Self::Invalid(message) => message,
        };
        ApplyError::ReferenceResolution {
            resource: resource.to_string(),
            reference: reference.to_string(),
            reason,
        }
        .into()
    }
}

/// Reads the realized value of `reference`.
///
/// A splat reference yields a list in instance order.
///
/// # Errors
///
/// Returns a [`LookupFailure`] naming the first instance that is not ready or
/// lacks the attribute.
pub fn lookup_reference(
    plan: &Plan,
    state: &StateSnapshot,
    reference: &Reference,
) -> std::result::Result<JsonValue, LookupFailure> {
    let targets = plan
        .reference_targets(&reference.resource, reference)
        .map_err(|e| LookupFailure::Invalid(e.to_string()))?;

    let mut values = Vec::with_capacity(targets.len());
    for target in targets {
        let record = state
            .get(&target)
            .filter(|r| r.is_ready())
            .ok_or_else(|| LookupFailure::NotReady {
                resource: target.clone(),
            })?;
        let value = record
            .attribute(&reference.attribute)
            .ok_or_else(|| LookupFailure::MissingAttribute {
                resource: target.clone(),
                attribute: reference.attribute.clone(),
            })?;
        values.push(value.clone());
    }

    match reference.selector {
        Selector::Splat => Ok(JsonValue::Array(values)),
        Selector::Whole | Selector::Index(_) => values
            .pop()
            .ok_or_else(|| LookupFailure::Invalid(format!("{reference} matches no resource"))),
    }
}

/// Outputs resolved as far as possible.
#[derive(Debug, Default)]
pub struct ResolvedOutputs {
    /// Outputs whose references all resolved.
    pub values: BTreeMap<String, JsonValue>,
    /// One error per output that could not be resolved.
    pub errors: Vec<TierformError>,
}

impl ResolvedOutputs {
    /// Returns true if every output resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Resolves declared outputs against recorded state.
#[derive(Debug, Clone, Copy)]
pub struct OutputResolver<'a> {
    plan: &'a Plan,
}

impl<'a> OutputResolver<'a> {
    /// Creates a resolver for `plan`.
    #[must_use]
    pub const fn new(plan: &'a Plan) -> Self {
        Self { plan }
    }

    /// Resolves one output declaration.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::UnresolvedReference`] if a referenced resource
    /// is not `Ready`, or [`OutputError::MissingAttribute`] if it did not
    /// report the attribute.
    pub fn resolve(&self, output: &OutputDeclaration, state: &StateSnapshot) -> Result<JsonValue> {
        output.value.resolve(&|reference: &Reference| {
            lookup_reference(self.plan, state, reference).map_err(|f| f.into_output_error(&output.name))
        })
    }

    /// Resolves the output called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::UnknownOutput`] if no such output is declared,
    /// or the error of [`resolve`](Self::resolve).
    pub fn resolve_named(&self, name: &str, state: &StateSnapshot) -> Result<JsonValue> {
        let output = self.plan.output(name).ok_or_else(|| OutputError::UnknownOutput {
            name: name.to_string(),
        })?;
        self.resolve(output, state)
    }

    /// Resolves every output it can, collecting errors for the rest.
    #[must_use]
    pub fn resolve_available(&self, state: &StateSnapshot) -> ResolvedOutputs {
        let mut resolved = ResolvedOutputs::default();
        for output in self.plan.outputs() {
            match self.resolve(output, state) {
                Ok(value) => {
                    resolved.values.insert(output.name.clone(), value);
                }
                Err(e) => {
                    warn!(output = %output.name, error = %e, "Output unresolved");
                    resolved.errors.push(e);
                }
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, ResourceKind};
    use crate::state::{ResourceState, ResourceStatus};
    use serde_json::json;

    const PLAN: &str = r"
project:
  name: web-stack
resources:
  - id: vpc
    type: vpc
    attributes:
      cidr_block: 10.0.0.0/16
  - id: subnet
    type: subnet
    count: 2
    attributes:
      vpc_id: ${vpc.id}
      cidr_block: 10.0.${count.index}.0/24
  - id: lb
    type: load_balancer
    attributes:
      subnets: ${subnet[*].id}
outputs:
  url: http://${lb.dns_name}/
  subnet_ids: ${subnet[*].id}
  first_subnet: ${subnet[0].id}
";

    fn plan() -> Plan {
        Plan::from_config(&ConfigParser::new().parse_yaml(PLAN, None).unwrap()).unwrap()
    }

    fn ready(state: &mut StateSnapshot, id: &str, kind: ResourceKind, attrs: &[(&str, JsonValue)]) {
        let mut record = ResourceState::new(id, kind, "h", Vec::new());
        record.status = ResourceStatus::Ready;
        record.handle = Some(format!("arn:{id}"));
        for (name, value) in attrs {
            record.attributes.insert((*name).to_string(), value.clone());
        }
        state.upsert(record);
    }

    fn realized() -> StateSnapshot {
        let mut state = StateSnapshot::new("web-stack", "dev");
        ready(&mut state, "vpc", ResourceKind::Vpc, &[("id", json!("vpc-1"))]);
        ready(&mut state, "subnet[0]", ResourceKind::Subnet, &[("id", json!("subnet-a"))]);
        ready(&mut state, "subnet[1]", ResourceKind::Subnet, &[("id", json!("subnet-b"))]);
        ready(&mut state, "lb", ResourceKind::LoadBalancer, &[("dns_name", json!("lb-1.elb.amazonaws.com"))]);
        state
    }

    #[test]
    fn test_resolve_every_output() {
        let plan = plan();
        let resolved = OutputResolver::new(&plan).resolve_available(&realized());
        assert!(resolved.errors.is_empty());
        let outputs = resolved.values;

        assert_eq!(outputs["url"], json!("http://lb-1.elb.amazonaws.com/"));
        assert_eq!(outputs["subnet_ids"], json!(["subnet-a", "subnet-b"]));
        assert_eq!(outputs["first_subnet"], json!("subnet-a"));
    }

    #[test]
    fn test_unready_reference_names_output_and_resource() {
        let plan = plan();
        let mut state = realized();
        state.get_mut("lb").unwrap().status = ResourceStatus::Failed;

        let err = OutputResolver::new(&plan).resolve_named("url", &state).unwrap_err();
        match err {
            TierformError::Output(OutputError::UnresolvedReference { output, resource }) => {
                assert_eq!(output, "url");
                assert_eq!(resource, "lb");
            }
            other => panic!("expected unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_attribute() {
        let plan = plan();
        let mut state = realized();
        state.get_mut("subnet[1]").unwrap().attributes.clear();

        let err = OutputResolver::new(&plan).resolve_named("subnet_ids", &state).unwrap_err();
        assert!(matches!(
            err,
            TierformError::Output(OutputError::MissingAttribute { ref resource, .. }) if resource == "subnet[1]"
        ));
    }

    #[test]
    fn test_resolve_available_collects_errors() {
        let plan = plan();
        let mut state = realized();
        state.remove("lb");

        let resolved = OutputResolver::new(&plan).resolve_available(&state);
        assert!(!resolved.is_complete());
        assert_eq!(resolved.errors.len(), 1);
        assert!(resolved.values.contains_key("subnet_ids"));
        assert!(!resolved.values.contains_key("url"));
    }

    #[test]
    fn test_unknown_output() {
        let plan = plan();
        let err = OutputResolver::new(&plan).resolve_named("nope", &realized()).unwrap_err();
        assert!(matches!(err, TierformError::Output(OutputError::UnknownOutput { .. })));
    }

    #[test]
    fn test_apply_error_conversion() {
        let reference = Reference::parse("vpc.id").unwrap();
        let err = LookupFailure::NotReady {
            resource: String::from("vpc"),
        }
        .into_apply_error("subnet[0]", &reference);
        assert_eq!(err.to_string(), "Apply error: Cannot resolve ${vpc.id} for subnet[0]: vpc is not ready");
    }
}
