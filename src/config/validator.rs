//! Plan validation.
//!
//! Checks project settings, engine tuning and every resource declaration
//! against the schema of its kind before a plan is built. Reference targets,
//! duplicate identifiers and cycles are checked when the plan and its graph
//! are built, where they surface as typed [`ConfigError`]s.

use crate::error::{ConfigError, Result, TierformError};
use tracing::debug;

use super::schema::ResourceKind;
use super::spec::{
    EngineConfig, PlanConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig, StateBackend,
    StateConfig,
};
use super::value::{AttributeValue, is_identifier, mentions_count_index, substitute_count_index};

/// Highest `count` accepted on a single resource.
const MAX_COUNT: usize = 100;

/// Attributes that should come from the environment rather than the plan file.
const SECRET_ATTRIBUTES: &[&str] = &["master_password", "auth_token"];

/// Validator for plan files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a plan.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &PlanConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Plan validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(TierformError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &PlanConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {}
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.kind == ProviderKind::Http {
            match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "An endpoint is required for the http provider");
                }
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(endpoint) if endpoint.starts_with("http://") => {
                    result.warn(format!("provider.endpoint: '{endpoint}' is not using TLS"));
                }
                Some(_) => {}
            }
        }

        if provider.request_timeout_secs == 0 {
            result.error("provider.request_timeout_secs", "Request timeout must be at least 1 second");
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.error("engine.parallelism", "Parallelism must be at least 1");
        } else if engine.parallelism > 64 {
            result.warn(format!(
                "engine.parallelism: {} concurrent operations may trigger provider throttling",
                engine.parallelism
            ));
        }

        let poll = &engine.poll;
        if poll.initial_delay_ms == 0 {
            result.error("engine.poll.initial_delay_ms", "Initial poll delay must be positive");
        }
        if poll.max_delay_ms < poll.initial_delay_ms {
            result.error(
                "engine.poll.max_delay_ms",
                "Maximum poll delay cannot be smaller than the initial delay",
            );
        }
        if !(0.0..=1.0).contains(&poll.jitter) {
            result.error("engine.poll.jitter", "Jitter must be between 0.0 and 1.0");
        }
        if poll.timeout_secs == Some(0) {
            result.error("engine.poll.timeout_secs", "Readiness timeout must be at least 1 second");
        }
    }

    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warn("No resources defined in plan");
            return;
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_identifier(&resource.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, digits, '-' or '_'.",
                        resource.id
                    ),
                );
            }

            match resource.count {
                Some(0) => result.warn(format!("{prefix}.count: '{}' declares no instances", resource.id)),
                Some(n) if n > MAX_COUNT => result.error(
                    format!("{prefix}.count"),
                    format!("Count {n} exceeds the maximum of {MAX_COUNT}"),
                ),
                _ => {}
            }

            if resource.depends_on.iter().any(|dep| dep == &resource.id) {
                result.error(
                    format!("{prefix}.depends_on"),
                    format!("Resource '{}' cannot depend on itself", resource.id),
                );
            }

            let kind = match resource.type_name.parse::<ResourceKind>() {
                Ok(kind) => kind,
                Err(message) => {
                    result.error(format!("{prefix}.type"), message);
                    continue;
                }
            };

            Self::validate_attributes(resource, kind, &prefix, result);
        }
    }

    fn validate_attributes(
        resource: &ResourceConfig,
        kind: ResourceKind,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        let schema = kind.schema();

        for (name, _) in schema.required {
            if !resource.attributes.contains_key(*name) {
                result.error(
                    format!("{prefix}.attributes.{name}"),
                    format!("Missing required attribute '{name}' for {kind} '{}'", resource.id),
                );
            }
        }

        for (name, raw) in &resource.attributes {
            let field = format!("{prefix}.attributes.{name}");

            let Some(expected) = kind.attribute_type(name) else {
                result.error(field, format!("Unknown attribute '{name}' for {kind}"));
                continue;
            };

            if resource.count.is_none() && mentions_count_index(raw) {
                result.error(field, "${count.index} is only valid inside a resource with count");
                continue;
            }

            let value = match AttributeValue::from_yaml(&substitute_count_index(raw, 0)) {
                Ok(value) => value,
                Err(message) => {
                    result.error(field, message);
                    continue;
                }
            };

            if !expected.accepts(&value) {
                result.error(
                    field,
                    format!("Expected {expected} for '{name}', found {}", value.type_name()),
                );
                continue;
            }

            if SECRET_ATTRIBUTES.contains(&name.as_str()) && matches!(value, AttributeValue::String(_)) {
                result.warn(format!(
                    "{field}: literal secret in plan file; prefer injecting it from the environment"
                ));
            }
        }
    }

    fn validate_outputs(config: &PlanConfig, result: &mut ValidationResult) {
        for (name, raw) in &config.outputs {
            let field = format!("outputs.{name}");

            if !is_identifier(name) {
                result.error(field.clone(), format!("Output name '{name}' is invalid"));
            }

            match AttributeValue::from_yaml(raw) {
                Ok(value) if value.references().is_empty() => {
                    result.warn(format!("{field}: output does not reference any resource"));
                }
                Ok(_) => {}
                Err(message) => result.error(field, message),
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> PlanConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    fn fields(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("shop-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web"));
        assert!(!is_valid_name("web-"));
        assert!(!is_valid_name("web--stack"));
        assert!(!is_valid_name("web_stack"));
    }

    #[test]
    fn test_valid_plan_passes() {
        let config = parse(
            r"
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
outputs:
  vpc_id: ${vpc.id}
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_schema_violations_reported() {
        let config = parse(
            r"
project:
  name: web-stack
resources:
  - id: vpc
    type: vpc
    attributes:
      cidr: 10.0.0.0/16
  - id: tg
    type: target_group
    attributes:
      vpc_id: ${vpc.id}
      port: eighty
      protocol: HTTP
  - id: nat
    type: nat_gateway
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields = fields(&result);
        assert!(fields.contains(&"resources[0].attributes.cidr_block"));
        assert!(fields.contains(&"resources[0].attributes.cidr"));
        assert!(fields.contains(&"resources[1].attributes.port"));
        assert!(fields.contains(&"resources[2].type"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_count_index_requires_count() {
        let config = parse(
            r"
project:
  name: web-stack
resources:
  - id: vpc
    type: vpc
    attributes:
      cidr_block: 10.${count.index}.0.0/16
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(fields(&result), vec!["resources[0].attributes.cidr_block"]);
    }

    #[test]
    fn test_engine_and_provider_settings() {
        let config = parse(
            r"
project:
  name: web-stack
provider:
  kind: http
engine:
  parallelism: 0
  poll:
    initial_delay_ms: 1000
    max_delay_ms: 10
    jitter: 1.5
resources: []
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields = fields(&result);
        assert!(fields.contains(&"provider.endpoint"));
        assert!(fields.contains(&"engine.parallelism"));
        assert!(fields.contains(&"engine.poll.max_delay_ms"));
        assert!(fields.contains(&"engine.poll.jitter"));
    }

    #[test]
    fn test_literal_secret_warns() {
        let config = parse(
            r"
project:
  name: web-stack
resources:
  - id: db
    type: db_cluster
    attributes:
      engine: aurora-mysql
      master_username: admin
      master_password: hunter2
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 1);
    }
}
