//! Stack-file parsing and validation.
//!
//! Parses `stack.yaml` and validates structural constraints:
//! - project and stack names must be non-empty identifiers
//! - `network:name` and `network:vpcRange` must be present
//! - `network:vpcRange` must be an IPv4 CIDR wide enough for the subnet layout

use super::error::{InfraError, Result};
use super::types::StackConfig;
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;

/// Widest prefix that still leaves room for the /24 subnet blocks.
pub const MAX_VPC_PREFIX: u8 = 20;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a stack file from disk.
pub fn parse_config_file(path: &Path) -> Result<StackConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        InfraError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_config(&content)
}

/// Parse a stack file from a string.
pub fn parse_config(yaml: &str) -> Result<StackConfig> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let ident = name_pattern();

    for (field, value) in [("project", &config.project), ("stack", &config.stack)] {
        if value.is_empty() {
            errors.push(ValidationError {
                message: format!("{} must not be empty", field),
            });
        } else if !ident.is_match(value) {
            errors.push(ValidationError {
                message: format!(
                    "{} '{}' must be lowercase letters, digits and dashes",
                    field, value
                ),
            });
        }
    }

    for key in config.config.keys() {
        if key.split_once(':').is_none_or(|(ns, k)| ns.is_empty() || k.is_empty()) {
            errors.push(ValidationError {
                message: format!("config key '{}' must have the form namespace:key", key),
            });
        }
    }

    let network = ConfigSet::new(config, "network");
    match network.require("name") {
        Ok(name) if !ident.is_match(&name) => errors.push(ValidationError {
            message: format!(
                "network:name '{}' must be lowercase letters, digits and dashes",
                name
            ),
        }),
        Ok(_) => {}
        Err(e) => errors.push(ValidationError {
            message: e.to_string(),
        }),
    }
    match network.require("vpcRange") {
        Ok(range) => {
            if let Err(e) = parse_cidr(&range) {
                errors.push(ValidationError {
                    message: e.to_string(),
                });
            }
        }
        Err(e) => errors.push(ValidationError {
            message: e.to_string(),
        }),
    }

    if config.tagging.standard_tags && config.tagging.prefix.is_empty() {
        errors.push(ValidationError {
            message: "tagging.prefix must not be empty when standard_tags is on".to_string(),
        });
    }

    errors
}

const NAME_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$";

static NAME_REGEX: OnceLock<Regex> = OnceLock::new();

fn name_pattern() -> &'static Regex {
    NAME_REGEX.get_or_init(|| Regex::new(NAME_PATTERN).unwrap())
}

/// An IPv4 network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub base: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    /// The `index`-th /24 block inside this range.
    pub fn block24(&self, index: u8) -> Result<Cidr> {
        if self.prefix > MAX_VPC_PREFIX {
            return Err(InfraError::InvalidConfig(format!(
                "range {} is too narrow for /24 subnets",
                self
            )));
        }
        let capacity = 1u32 << (24 - u32::from(self.prefix));
        if u32::from(index) >= capacity {
            return Err(InfraError::InvalidConfig(format!(
                "block {} is outside range {}",
                index, self
            )));
        }
        let base = u32::from(self.base) | (u32::from(index) << 8);
        Ok(Cidr {
            base: Ipv4Addr::from(base),
            prefix: 24,
        })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// Parse `a.b.c.d/n` and require the host bits to be zero.
pub fn parse_cidr(s: &str) -> Result<Cidr> {
    let invalid = |why: &str| InfraError::InvalidConfig(format!("vpcRange '{}' {}", s, why));
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| invalid("is not in CIDR notation"))?;
    let base: Ipv4Addr = addr.parse().map_err(|_| invalid("has an invalid address"))?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid("has an invalid prefix"))?;
    if prefix > 32 {
        return Err(invalid("has an invalid prefix"));
    }
    if prefix > MAX_VPC_PREFIX {
        return Err(invalid("must be /20 or wider"));
    }
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    if u32::from(base) & !mask != 0 {
        return Err(invalid("has host bits set"));
    }
    Ok(Cidr { base, prefix })
}

/// Namespaced view over the `config` map (`namespace:key`).
#[derive(Debug, Clone, Copy)]
pub struct ConfigSet<'a> {
    config: &'a StackConfig,
    namespace: &'a str,
}

impl<'a> ConfigSet<'a> {
    pub fn new(config: &'a StackConfig, namespace: &'a str) -> Self {
        Self { config, namespace }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.config.config.get(&self.full_key(key)).cloned()
    }

    /// A required value; absence is a fatal configuration error.
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| InfraError::MissingConfig(self.full_key(key)))
    }
}
