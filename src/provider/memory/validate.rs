//! Request validation shared by every resource kind: typed input access,
//! IPv4 range arithmetic, references to other resources and placement checks.

use super::{Inner, Stored};
use crate::core::error::{InfraError, Result};
use crate::core::types::{Properties, ResourceKind};
use serde_json::Value;
use std::collections::BTreeSet;

pub(super) fn field<'a>(inputs: &'a Properties, key: &str, label: &str) -> Result<&'a Value> {
    inputs
        .get(key)
        .ok_or_else(|| InfraError::provider(label, format!("missing required input '{}'", key)))
}

pub(super) fn str_field<'a>(inputs: &'a Properties, key: &str, label: &str) -> Result<&'a str> {
    field(inputs, key, label)?
        .as_str()
        .ok_or_else(|| InfraError::provider(label, format!("input '{}' must be a string", key)))
}

pub(super) fn array_field<'a>(inputs: &'a Properties, key: &str, label: &str) -> Result<&'a Vec<Value>> {
    field(inputs, key, label)?
        .as_array()
        .ok_or_else(|| InfraError::provider(label, format!("input '{}' must be a list", key)))
}

pub(super) fn port_of(value: &Value, what: &str, label: &str) -> Result<u16> {
    value
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0)
        .ok_or_else(|| InfraError::provider(label, format!("{} must be a port number", what)))
}

pub(super) fn str_of<'a>(value: &'a Value, what: &str, label: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| InfraError::provider(label, format!("{} must be a string", what)))
}

/// Parse `a.b.c.d/n` into (network, prefix).
pub(super) fn parse_range(s: &str) -> Option<(u32, u8)> {
    let (addr, prefix) = s.split_once('/')?;
    let addr: std::net::Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    let base = u32::from(addr);
    (base & !mask == 0).then_some((base, prefix))
}

pub(super) fn range_contains(outer: (u32, u8), inner: (u32, u8)) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(outer.1)).unwrap_or(0);
    inner.1 >= outer.1 && inner.0 & mask == outer.0
}

pub(super) fn ranges_overlap(a: (u32, u8), b: (u32, u8)) -> bool {
    range_contains(a, b) || range_contains(b, a)
}

/// Container definitions arrive either as a JSON document or as a list.
pub(super) fn container_definitions(value: &Value, label: &str) -> Result<Vec<Value>> {
    let parsed = match value {
        Value::String(doc) => serde_json::from_str::<Value>(doc).map_err(|e| {
            InfraError::provider(label, format!("containerDefinitions is not valid JSON: {}", e))
        })?,
        other => other.clone(),
    };
    let containers = parsed
        .as_array()
        .cloned()
        .ok_or_else(|| InfraError::provider(label, "containerDefinitions must be a list"))?;
    if containers.is_empty() {
        return Err(InfraError::provider(label, "task definition has no containers"));
    }
    let mut names = BTreeSet::new();
    for c in &containers {
        let name = c
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| InfraError::provider(label, "container without a name"))?;
        if c.get("image").and_then(Value::as_str).is_none() {
            return Err(InfraError::provider(
                label,
                format!("container '{}' has no image", name),
            ));
        }
        if !names.insert(name.to_string()) {
            return Err(InfraError::provider(
                label,
                format!("duplicate container name '{}'", name),
            ));
        }
    }
    Ok(containers)
}

pub(super) fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl Inner {
    /// Look up a referenced resource and check its kind.
    pub(super) fn require(&self, id: &str, kind: ResourceKind, label: &str, field: &str) -> Result<&Stored> {
        let stored = self
            .by_id
            .get(id)
            .and_then(|key| self.resources.get(key))
            .ok_or_else(|| {
                InfraError::provider(
                    label,
                    format!("{} references unknown {} '{}'", field, kind, id),
                )
            })?;
        if stored.kind != kind {
            return Err(InfraError::provider(
                label,
                format!("{} '{}' is a {}, expected {}", field, id, stored.kind, kind),
            ));
        }
        Ok(stored)
    }

    pub(super) fn check_zone(&self, zone: &str, label: &str) -> Result<()> {
        if !self.zones.iter().any(|z| z == zone) {
            return Err(InfraError::provider(
                label,
                format!("availability zone '{}' is not in {}", zone, self.region),
            ));
        }
        Ok(())
    }

    /// A subnet lies inside its VPC and overlaps no other subnet of that VPC.
    /// `own_id` is skipped so an update may keep its range.
    pub(super) fn check_subnet_range(
        &self,
        vpc: &Stored,
        vpc_id: &str,
        cidr: &str,
        own_id: Option<&str>,
        label: &str,
    ) -> Result<()> {
        let range = parse_range(cidr)
            .ok_or_else(|| InfraError::provider(label, format!("invalid cidrBlock '{}'", cidr)))?;
        let vpc_range = vpc
            .attributes
            .get("cidrBlock")
            .and_then(Value::as_str)
            .and_then(parse_range);
        if vpc_range.is_some_and(|v| !range_contains(v, range)) {
            return Err(InfraError::provider(
                label,
                format!("cidrBlock {} is outside the VPC range", cidr),
            ));
        }
        for sibling in self.resources.values().filter(|s| {
            s.kind == ResourceKind::Subnet
                && s.attributes.get("vpcId").and_then(Value::as_str) == Some(vpc_id)
                && s.attributes.get("id").and_then(Value::as_str) != own_id
        }) {
            let other = sibling.attributes.get("cidrBlock").and_then(Value::as_str);
            if other.and_then(parse_range).is_some_and(|o| ranges_overlap(o, range)) {
                return Err(InfraError::provider(
                    label,
                    format!("cidrBlock {} conflicts with an existing subnet", cidr),
                ));
            }
        }
        Ok(())
    }

    /// Targets can only be registered once a listener forwards to the group.
    pub(super) fn check_target_group_attached(&self, tg_arn: &str, label: &str) -> Result<()> {
        let attached = self.resources.values().any(|s| {
            s.kind == ResourceKind::Listener
                && s.attributes
                    .get("defaultActions")
                    .and_then(Value::as_array)
                    .is_some_and(|actions| actions.iter().any(|a| a["targetGroupArn"] == tg_arn))
        });
        if !attached {
            return Err(InfraError::provider(
                label,
                format!("target group '{}' is not attached to a load balancer", tg_arn),
            ));
        }
        Ok(())
    }
}
