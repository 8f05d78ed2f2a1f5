//! Tool contracts and the contract registry.
//!
//! A [`ToolContract`] is the typed description of everything the kernel
//! needs to govern a tool: parameter schema, risk class, permissions,
//! side effects, approval flag, timeout, and tags. Contracts are
//! immutable after registration; re-registering the same `(name, version)`
//! pair is rejected.
//!
//! User-defined tools arrive as a [`CustomToolSpec`] descriptor and are
//! synthesized into full contracts, with permissions and risk class
//! derived from the handler type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::kernel::schema::{FieldKind, FieldSpec, ParamSchema};
use crate::types::{ComponentHealth, RiskClass};

// ── Contract model ──────────────────────────────────────────────

/// A declared side effect of running a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideEffect {
    /// What happens.
    pub description: String,
    /// The resource affected (e.g. `fs:workspace`, `net:example.com`).
    pub resource: String,
    /// Whether a compensation function can undo it.
    pub reversible: bool,
}

/// Immutable contract describing one governed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContract {
    /// Tool name, unique together with `version`.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Human description.
    pub description: String,
    /// Risk classification.
    pub risk_class: RiskClass,
    /// Strict parameter schema.
    pub params: ParamSchema,
    /// Required permissions (e.g. `fs:read:workspace`, `process:shell`).
    pub permissions: Vec<String>,
    /// Declared side effects.
    pub side_effects: Vec<SideEffect>,
    /// Whether execution always requires approval, regardless of policy.
    pub approval_required: bool,
    /// Handler timeout.
    pub timeout: Duration,
    /// Free-form tags for lookup.
    pub tags: Vec<String>,
}

impl ToolContract {
    /// Whether any declared side effect exists (drives compensation on cancel).
    pub fn has_side_effects(&self) -> bool {
        !self.side_effects.is_empty()
    }
}

/// Builder-style constructor for contracts.
#[derive(Debug, Clone)]
pub struct ToolContractBuilder {
    contract: ToolContract,
}

impl ToolContractBuilder {
    /// Start a contract with the mandatory fields.
    pub fn new(name: impl Into<String>, risk_class: RiskClass) -> Self {
        Self {
            contract: ToolContract {
                name: name.into(),
                version: "1.0.0".to_owned(),
                description: String::new(),
                risk_class,
                params: ParamSchema::new(),
                permissions: Vec::new(),
                side_effects: Vec::new(),
                approval_required: false,
                timeout: Duration::from_secs(30),
                tags: Vec::new(),
            },
        }
    }

    /// Set the semver version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.contract.version = version.into();
        self
    }

    /// Set the human description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.contract.description = description.into();
        self
    }

    /// Set the parameter schema.
    #[must_use]
    pub fn params(mut self, params: ParamSchema) -> Self {
        self.contract.params = params;
        self
    }

    /// Add a required permission.
    #[must_use]
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.contract.permissions.push(permission.into());
        self
    }

    /// Declare a side effect.
    #[must_use]
    pub fn side_effect(
        mut self,
        description: impl Into<String>,
        resource: impl Into<String>,
        reversible: bool,
    ) -> Self {
        self.contract.side_effects.push(SideEffect {
            description: description.into(),
            resource: resource.into(),
            reversible,
        });
        self
    }

    /// Force approval regardless of governance policy.
    #[must_use]
    pub fn requires_approval(mut self) -> Self {
        self.contract.approval_required = true;
        self
    }

    /// Set the handler timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.contract.timeout = timeout;
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.contract.tags.push(tag.into());
        self
    }

    /// Finish the builder.
    pub fn build(self) -> ToolContract {
        self.contract
    }
}

// ── Custom tool synthesis ───────────────────────────────────────

/// Handler type of a user-defined tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    /// Outbound HTTP call.
    Http,
    /// Shell command on the host.
    Shell,
    /// Sandboxed code execution.
    Code,
}

/// A parameter declaration inside a [`CustomToolSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomParam {
    /// Parameter name.
    pub name: String,
    /// JSON type.
    pub kind: FieldKind,
    /// Whether the parameter is required.
    pub required: bool,
    /// Human description.
    pub description: String,
}

/// Descriptor from which a user-defined contract is synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomToolSpec {
    /// Tool name.
    pub name: String,
    /// Handler type; induces permissions and risk class.
    pub handler_type: HandlerType,
    /// Declared parameters.
    pub parameters: Vec<CustomParam>,
}

impl CustomToolSpec {
    /// Synthesize a full contract from this descriptor.
    ///
    /// Risk class derives from the handler type: `shell` is irreversible
    /// and always requires approval; `http` and `code` are reversible.
    pub fn synthesize(&self) -> ToolContract {
        let mut params = ParamSchema::new();
        for p in &self.parameters {
            let spec = if p.required {
                FieldSpec::required(p.kind)
            } else {
                FieldSpec::optional(p.kind)
            };
            params = params.field(p.name.clone(), spec);
        }

        let (risk_class, permissions, approval_required) = match self.handler_type {
            HandlerType::Shell => (
                RiskClass::Irreversible,
                vec!["process:shell".to_owned()],
                true,
            ),
            HandlerType::Http => (
                RiskClass::Reversible,
                vec!["net:outbound:https".to_owned()],
                false,
            ),
            HandlerType::Code => (
                RiskClass::Reversible,
                vec!["process:sandbox".to_owned()],
                false,
            ),
        };

        ToolContract {
            name: self.name.clone(),
            version: "1.0.0".to_owned(),
            description: format!("user-defined {:?} tool", self.handler_type).to_lowercase(),
            risk_class,
            params,
            permissions,
            side_effects: match self.handler_type {
                HandlerType::Shell => vec![SideEffect {
                    description: "arbitrary host mutation".to_owned(),
                    resource: "process:shell".to_owned(),
                    reversible: false,
                }],
                HandlerType::Http => vec![SideEffect {
                    description: "outbound request".to_owned(),
                    resource: "net:outbound".to_owned(),
                    reversible: true,
                }],
                HandlerType::Code => Vec::new(),
            },
            approval_required,
            timeout: Duration::from_secs(30),
            tags: vec!["custom".to_owned()],
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A contract with this name and version already exists.
    #[error("contract already registered: {name}@{version}")]
    Duplicate {
        /// Tool name.
        name: String,
        /// Version string.
        version: String,
    },
    /// The version string is not a valid semver triple.
    #[error("invalid semver version `{0}`")]
    InvalidVersion(String),
    /// The schema has unusable rules.
    #[error("invalid schema for {name}: {issues:?}")]
    InvalidSchema {
        /// Tool name.
        name: String,
        /// Compile problems found in the schema.
        issues: Vec<String>,
    },
    /// Internal lock was poisoned.
    #[error("registry lock poisoned: {0}")]
    Lock(String),
}

/// Typed catalog of every registered tool contract.
///
/// Read-mostly: registration happens at startup, lookups at request time.
#[derive(Default)]
pub struct ToolRegistry {
    // name → version → contract, versions sorted at lookup time.
    contracts: RwLock<HashMap<String, HashMap<String, Arc<ToolContract>>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .contracts
            .read()
            .map(|c| c.values().map(|v| v.len()).sum::<usize>())
            .unwrap_or(0);
        f.debug_struct("ToolRegistry")
            .field("contract_count", &count)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract. Rejects duplicates and unusable schemas.
    pub fn register(&self, contract: ToolContract) -> Result<(), RegistryError> {
        if parse_semver(&contract.version).is_none() {
            return Err(RegistryError::InvalidVersion(contract.version));
        }
        let issues = contract.params.compile_issues();
        if !issues.is_empty() {
            return Err(RegistryError::InvalidSchema {
                name: contract.name,
                issues,
            });
        }

        let mut contracts = self
            .contracts
            .write()
            .map_err(|e| RegistryError::Lock(e.to_string()))?;
        let versions = contracts.entry(contract.name.clone()).or_default();
        if versions.contains_key(&contract.version) {
            return Err(RegistryError::Duplicate {
                name: contract.name,
                version: contract.version,
            });
        }

        info!(
            tool = %contract.name,
            version = %contract.version,
            risk = %contract.risk_class,
            "tool contract registered"
        );
        versions.insert(contract.version.clone(), Arc::new(contract));
        Ok(())
    }

    /// Synthesize and register a user-defined tool.
    pub fn register_custom(&self, spec: &CustomToolSpec) -> Result<Arc<ToolContract>, RegistryError> {
        let contract = spec.synthesize();
        self.register(contract)?;
        self.get(&spec.name, None)
            .ok_or_else(|| RegistryError::Lock("contract vanished after registration".to_owned()))
    }

    /// Look up a contract. `version = None` returns the highest semver.
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<Arc<ToolContract>> {
        let contracts = self.contracts.read().ok()?;
        let versions = contracts.get(name)?;
        match version {
            Some(v) => versions.get(v).cloned(),
            None => versions
                .iter()
                .max_by_key(|(v, _)| parse_semver(v).unwrap_or((0, 0, 0)))
                .map(|(_, c)| Arc::clone(c)),
        }
    }

    /// Whether any version of the tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.contracts
            .read()
            .map(|c| c.contains_key(name))
            .unwrap_or(false)
    }

    /// All contracts carrying the given tag.
    pub fn get_by_tag(&self, tag: &str) -> Vec<Arc<ToolContract>> {
        self.contracts
            .read()
            .map(|contracts| {
                contracts
                    .values()
                    .flat_map(|versions| versions.values())
                    .filter(|c| c.tags.iter().any(|t| t == tag))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All registered contracts.
    pub fn list(&self) -> Vec<Arc<ToolContract>> {
        self.contracts
            .read()
            .map(|contracts| {
                let mut all: Vec<Arc<ToolContract>> = contracts
                    .values()
                    .flat_map(|versions| versions.values())
                    .cloned()
                    .collect();
                all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
                all
            })
            .unwrap_or_default()
    }

    /// Health probe.
    pub fn health(&self) -> ComponentHealth {
        match self.contracts.read() {
            Ok(contracts) => ComponentHealth {
                component: "tool_registry".to_owned(),
                healthy: true,
                detail: format!("{} tools", contracts.len()),
            },
            Err(e) => ComponentHealth {
                component: "tool_registry".to_owned(),
                healthy: false,
                detail: e.to_string(),
            },
        }
    }
}

/// Parse a `major.minor.patch` version triple.
fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}
