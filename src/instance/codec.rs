//! Instance ⇄ store node encoding
//!
//! Keys encode identity positionally: `<prefix>/<group>/<service>/<n>`. The
//! value holds everything else as JSON. An empty value marks a slot lock
//! placeholder rather than a live instance.

use super::{Instance, InstanceId, Operation};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Value payload. Field names match the historical wire format.
#[derive(Serialize)]
struct PayloadRef<'a> {
    #[serde(rename = "Addrs")]
    addrs: &'a [IpAddr],
    #[serde(rename = "PortMappings")]
    port_mappings: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct Payload {
    #[serde(rename = "Addrs", default)]
    addrs: Option<Vec<IpAddr>>,
    #[serde(rename = "PortMappings", default)]
    port_mappings: Option<BTreeMap<String, String>>,
}

/// Store key of a slot, without a leading slash
pub fn instance_key(prefix: &str, id: &InstanceId) -> String {
    format!(
        "{}/{}/{}/{}",
        prefix.trim_matches('/'),
        id.group,
        id.service,
        id.instance_number
    )
}

/// Encode an instance as `(key, value)`
pub fn encode_instance(prefix: &str, instance: &Instance) -> Result<(String, String)> {
    let payload = PayloadRef {
        addrs: &instance.addrs,
        port_mappings: &instance.port_mappings,
    };
    let value = serde_json::to_string(&payload)
        .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
    Ok((instance_key(prefix, &instance.id()), value))
}

/// Split a key into its three identity segments. Extra trailing segments are
/// ignored.
fn identity_segments<'a>(prefix: &str, key: &'a str) -> Result<[&'a str; 3]> {
    let prefix = prefix.trim_matches('/');
    let rest = key
        .trim_start_matches('/')
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| Error::MalformedKey(key.to_string()))?;

    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(group), Some(service), Some(number)) => Ok([group, service, number]),
        _ => Err(Error::MalformedKey(key.to_string())),
    }
}

fn parse_identity(key: &str, [group, service, number]: [&str; 3]) -> Result<InstanceId> {
    if group.is_empty() || service.is_empty() {
        return Err(Error::MalformedKey(key.to_string()));
    }
    let instance_number = number
        .parse::<u32>()
        .map_err(|_| Error::MalformedKey(key.to_string()))?;
    Ok(InstanceId::new(group, service, instance_number))
}

/// Decode only the identity encoded in a key
pub fn decode_identity(prefix: &str, key: &str) -> Result<InstanceId> {
    let segments = identity_segments(prefix, key)?;
    parse_identity(key, segments)
}

/// Whether `key` is the prefix itself or a group/service directory under
/// it, i.e. something whose removal takes instances with it
pub fn is_directory_key(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_matches('/');
    if key == prefix {
        return true;
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| rest.split('/').count() < 3)
}

/// Decode a store node. `Ok(None)` means the node is a lock placeholder.
pub fn decode_instance(prefix: &str, key: &str, value: &str) -> Result<Option<Instance>> {
    let segments = identity_segments(prefix, key)?;
    if value.is_empty() {
        return Ok(None);
    }
    let id = parse_identity(key, segments)?;

    let payload: Payload = serde_json::from_str(value).map_err(|e| Error::MalformedPayload {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    let mut instance = Instance::new(id);
    instance.addrs = payload.addrs.unwrap_or_default();
    instance.port_mappings = payload.port_mappings.unwrap_or_default();
    Ok(Some(instance))
}

/// Map a store action onto a registry operation
pub fn classify_action(action: &str) -> Result<Operation> {
    match action {
        "set" | "update" | "create" | "compareAndSwap" => Ok(Operation::Add),
        "delete" | "expire" | "compareAndDelete" => Ok(Operation::Remove),
        other => Err(Error::UnknownAction(other.to_string())),
    }
}
