//! Configuration module for the Tierform engine.
//!
//! This module handles all plan-file functionality:
//! - Parsing and deserializing `tierform.yaml`
//! - Typed attribute values and `${...}` references
//! - Per-kind attribute schemas
//! - Validation of configuration values
//! - Computing declaration hashes for change detection

mod hash;
mod parser;
mod schema;
mod spec;
mod validator;
mod value;

pub use hash::ConfigHasher;
pub use parser::{API_TOKEN_VAR, ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use schema::{ALL_KINDS, AttrType, KindSchema, Readiness, ResourceKind};
pub use spec::{
    EngineConfig, PlanConfig, PollConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use value::{
    AttributeValue, COUNT_INDEX, Reference, Selector, TemplatePart, instance_id, is_identifier,
    json_to_text, mentions_count_index, substitute_count_index,
};
