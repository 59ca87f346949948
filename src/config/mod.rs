//! Configuration module for the converge engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of configuration values
//! - Expanding `count`, `for_each` and modules into instances
//! - Computing configuration hashes for change detection

mod expr;
mod hash;
mod parser;
mod resolve;
mod spec;
mod validator;

pub use expr::{ConfigExpr, Expr, KeyExpr, Reference, TemplatePart, parse_template};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use resolve::{
    BoundPart, BoundRef, RefTarget, ReferenceLookup, ResolvedConfig, ResolvedResource,
    UnknownLookup, ValueExpr, resolve,
};
pub use spec::{
    DeployConfig, ForEach, GuardrailsConfig, LifecycleConfig, ModuleConfig, ProjectConfig,
    ProviderConfig, ResourceConfig, RetryConfig, SettingsConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
