//! In-process control plane for every resource kind of the stack.
//!
//! Identifiers are derived from region, kind and name, so two runs against
//! the same declarations produce the same ids, ARNs and DNS names. Requests
//! are validated the way the real control plane would reject them: unknown
//! references, unauthenticated image pushes, services whose load balancer
//! binding does not match a container port or whose target group has no
//! listener, and deletes of resources that are still referenced.

mod control_plane;
mod validate;

use super::Provider;
use crate::core::error::{InfraError, Result};
use crate::core::types::{Properties, ResourceKind, ResourceStatus, StateLock};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use validate::str_field;

/// Account every in-memory resource belongs to.
pub const ACCOUNT_ID: &str = "123456789012";

const DEFAULT_ZONE_SUFFIXES: [&str; 3] = ["a", "b", "c"];

type Key = (ResourceKind, String);

#[derive(Debug, Clone)]
struct Stored {
    kind: ResourceKind,
    attributes: Properties,
    /// Identifiers of other resources this one points at
    refs: BTreeSet<String>,
}

impl Stored {
    fn identifiers(&self) -> Vec<String> {
        identifiers_of(&self.attributes)
    }
}

fn identifiers_of(attributes: &Properties) -> Vec<String> {
    ["id", "arn", "repositoryUrl"]
        .iter()
        .filter_map(|k| attributes.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
struct Inner {
    region: String,
    zones: Vec<String>,
    resources: IndexMap<Key, Stored>,
    by_id: FxHashMap<String, Key>,
    /// Pushed image digests per repository URL
    images: FxHashMap<String, Vec<String>>,
    fail_on: BTreeSet<ResourceKind>,
    token_override: Option<String>,
    calls: Vec<String>,
}

/// Deterministic, validating stand-in for the cloud control plane.
#[derive(Debug)]
pub struct MemoryProvider {
    state: Mutex<Inner>,
}

impl MemoryProvider {
    pub fn new(region: &str) -> Self {
        let zones = DEFAULT_ZONE_SUFFIXES
            .iter()
            .map(|s| format!("{}{}", region, s))
            .collect();
        Self {
            state: Mutex::new(Inner {
                region: region.to_string(),
                zones,
                ..Inner::default()
            }),
        }
    }

    /// Replace the zone list reported by the region.
    pub fn with_zones(self, zones: &[&str]) -> Self {
        if let Ok(mut inner) = self.state.lock() {
            inner.zones = zones.iter().map(|z| z.to_string()).collect();
        }
        self
    }

    /// Rebuild provider state from a recorded lock.
    pub fn from_lock(region: &str, lock: &StateLock) -> Self {
        let provider = Self::new(region);
        if let Ok(mut inner) = provider.state.lock() {
            for entry in lock.resources.values() {
                if entry.kind.is_component()
                    || entry.kind.is_data_source()
                    || entry.status != ResourceStatus::Converged
                {
                    continue;
                }
                let attributes = entry.attributes.clone();
                let refs = inner.references_in(attributes.values());
                if entry.kind == ResourceKind::Image {
                    if let (Some(repo), Some(digest)) = (
                        attributes.get("baseImageName").and_then(Value::as_str),
                        attributes.get("repoDigest").and_then(Value::as_str),
                    ) {
                        inner
                            .images
                            .entry(repo.to_string())
                            .or_default()
                            .push(digest.to_string());
                    }
                }
                inner.store(entry.kind, &entry.name, attributes, refs);
            }
        }
        provider
    }

    /// Make every create or update of `kind` fail.
    pub fn fail_on(&self, kind: ResourceKind) {
        if let Ok(mut inner) = self.state.lock() {
            inner.fail_on.insert(kind);
        }
    }

    /// Issue `token` instead of a valid registry authorization token.
    pub fn issue_token(&self, token: &str) {
        if let Ok(mut inner) = self.state.lock() {
            inner.token_override = Some(token.to_string());
        }
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.state.lock().map(|i| i.resources.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded attributes of a live resource.
    pub fn attributes(&self, kind: ResourceKind, name: &str) -> Option<Properties> {
        let inner = self.state.lock().ok()?;
        inner
            .resources
            .get(&(kind, name.to_string()))
            .map(|s| s.attributes.clone())
    }

    /// Digests pushed to a repository.
    pub fn images(&self, repository_url: &str) -> Vec<String> {
        self.state
            .lock()
            .ok()
            .and_then(|i| i.images.get(repository_url).cloned())
            .unwrap_or_default()
    }

    /// Every call received, as `"<verb> <kind>::<name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.state
            .lock()
            .map_err(|_| InfraError::provider("memory", "provider state poisoned"))
    }
}

/// Password the registry accepts for pushes, derived from its id.
pub fn registry_password(registry_id: &str) -> String {
    let hash = blake3::hash(format!("ecr-password:{}", registry_id).as_bytes());
    hash.to_hex().as_str()[..32].to_string()
}

fn short_hash(parts: &[&str], len: usize) -> String {
    let hash = blake3::hash(parts.join("\0").as_bytes());
    hash.to_hex().as_str()[..len].to_string()
}

fn label(kind: ResourceKind, name: &str) -> String {
    format!("{}::{}", kind, name)
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn availability_zones(&self) -> Result<Vec<String>> {
        Ok(self.inner()?.zones.clone())
    }

    fn create(&self, kind: ResourceKind, name: &str, inputs: &Properties) -> Result<Properties> {
        let mut inner = self.inner()?;
        let label = label(kind, name);
        inner.calls.push(format!("create {}", label));
        inner.check_injected(kind, &label)?;
        if inner.resources.contains_key(&(kind, name.to_string())) {
            return Err(InfraError::provider(label, "resource already exists"));
        }
        let attributes = inner.materialize(kind, name, inputs, None)?;
        let refs = inner.references_in(inputs.values());
        if kind == ResourceKind::Image {
            if let (Some(repo), Some(digest)) = (
                attributes.get("baseImageName").and_then(Value::as_str),
                attributes.get("repoDigest").and_then(Value::as_str),
            ) {
                inner
                    .images
                    .entry(repo.to_string())
                    .or_default()
                    .push(digest.to_string());
            }
        }
        inner.store(kind, name, attributes.clone(), refs);
        tracing::debug!(resource = %label, "created");
        Ok(attributes)
    }

    fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        _current: &Properties,
        inputs: &Properties,
    ) -> Result<Properties> {
        let mut inner = self.inner()?;
        let label = label(kind, name);
        inner.calls.push(format!("update {}", label));
        inner.check_injected(kind, &label)?;
        let previous = inner
            .resources
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| InfraError::provider(&label, "resource does not exist"))?;
        let attributes = inner.materialize(kind, name, inputs, Some(&previous))?;
        let refs = inner.references_in(inputs.values());
        inner.store(kind, name, attributes.clone(), refs);
        tracing::debug!(resource = %label, "updated");
        Ok(attributes)
    }

    fn delete(&self, kind: ResourceKind, name: &str, _current: &Properties) -> Result<()> {
        let mut inner = self.inner()?;
        let label = label(kind, name);
        inner.calls.push(format!("delete {}", label));
        let key = (kind, name.to_string());
        let Some(stored) = inner.resources.get(&key) else {
            tracing::debug!(resource = %label, "already gone");
            return Ok(());
        };

        let own = stored.identifiers();
        if let Some(((dep_kind, dep_name), _)) = inner
            .resources
            .iter()
            .find(|(k, s)| **k != key && s.refs.iter().any(|r| own.contains(r)))
        {
            return Err(InfraError::provider(
                label,
                format!("still referenced by {}", self::label(*dep_kind, dep_name)),
            ));
        }

        if kind == ResourceKind::Repository {
            let force = stored
                .attributes
                .get("forceDelete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let url = stored
                .attributes
                .get("repositoryUrl")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let pushed = inner.images.get(&url).is_some_and(|i| !i.is_empty());
            if pushed && !force {
                return Err(InfraError::provider(
                    label,
                    "repository contains images and forceDelete is not set",
                ));
            }
            inner.images.remove(&url);
        }

        for id in own {
            inner.by_id.remove(&id);
        }
        inner.resources.shift_remove(&key);
        tracing::debug!(resource = %label, "deleted");
        Ok(())
    }

    fn invoke(&self, kind: ResourceKind, inputs: &Properties) -> Result<Properties> {
        let mut inner = self.inner()?;
        inner.calls.push(format!("invoke {}", kind));
        if kind != ResourceKind::RegistryCredentials {
            return Err(InfraError::provider(kind.token(), "not a data source"));
        }
        let registry_id = str_field(inputs, "registryId", kind.token())?;
        let known = inner.resources.values().any(|s| {
            s.kind == ResourceKind::Repository
                && s.attributes.get("registryId").and_then(Value::as_str) == Some(registry_id)
        });
        if !known {
            return Err(InfraError::provider(
                kind.token(),
                format!("registry '{}' does not exist", registry_id),
            ));
        }
        let token = inner.token_override.clone().unwrap_or_else(|| {
            BASE64.encode(format!("AWS:{}", registry_password(registry_id)))
        });
        let mut out = Properties::new();
        out.insert("registryId".into(), registry_id.into());
        out.insert("authorizationToken".into(), token.into());
        out.insert(
            "proxyEndpoint".into(),
            format!("https://{}.dkr.ecr.{}.amazonaws.com", registry_id, inner.region).into(),
        );
        Ok(out)
    }
}
