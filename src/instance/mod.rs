//! Instance model
//!
//! An [`Instance`] is the observed state of one running replica. Its identity
//! is the `(group, service, instance_number)` triple, which also names the
//! slot a scheduler claims before the instance goes live.

pub mod codec;

pub use codec::{
    classify_action, decode_identity, decode_instance, encode_instance, instance_key,
    is_directory_key,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Identity of an instance, and of the slot it occupies
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub group: String,
    pub service: String,
    pub instance_number: u32,
}

impl InstanceId {
    pub fn new(group: impl Into<String>, service: impl Into<String>, instance_number: u32) -> Self {
        Self {
            group: group.into(),
            service: service.into(),
            instance_number,
        }
    }

    /// `instanceNumber.service.group`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.instance_number, self.service, self.group)
    }

    /// Qualified name plus the domain suffix
    pub fn fully_qualified_domain_name(&self, suffix: &str) -> String {
        let suffix = suffix.trim_matches('.');
        if suffix.is_empty() {
            self.qualified_name()
        } else {
            format!("{}.{}", self.qualified_name(), suffix)
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Observed state of one running replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub group: String,
    pub service: String,
    pub instance_number: u32,
    /// Addresses in discovery order
    pub addrs: Vec<IpAddr>,
    /// Host port → container port
    pub port_mappings: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(id: InstanceId) -> Self {
        Self {
            group: id.group,
            service: id.service,
            instance_number: id.instance_number,
            addrs: Vec::new(),
            port_mappings: BTreeMap::new(),
        }
    }

    pub fn with_addrs(mut self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addrs = addrs.into_iter().collect();
        self
    }

    pub fn with_port(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.port_mappings.insert(host.into(), container.into());
        self
    }

    pub fn id(&self) -> InstanceId {
        InstanceId::new(self.group.clone(), self.service.clone(), self.instance_number)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.instance_number, self.service, self.group)
    }

    pub fn fully_qualified_domain_name(&self, suffix: &str) -> String {
        self.id().fully_qualified_domain_name(suffix)
    }

    /// Whether `other` carries exactly the same observable state.
    ///
    /// Gates snapshot emission in the registry: an Add that is `same_state`
    /// as the registered instance is a keep-alive refresh, not a change.
    pub fn same_state(&self, other: &Instance) -> bool {
        self.group == other.group
            && self.service == other.service
            && self.instance_number == other.instance_number
            && self.addrs == other.addrs
            && self.port_mappings == other.port_mappings
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addrs: Vec<String> = self.addrs.iter().map(|a| a.to_string()).collect();
        let ports: Vec<String> = self
            .port_mappings
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect();
        write!(
            f,
            "{}@{}{{{}}}",
            self.qualified_name(),
            addrs.join(","),
            ports.join(",")
        )
    }
}

/// Registry operation derived from a store action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Add => write!(f, "add"),
            Operation::Remove => write!(f, "remove"),
        }
    }
}

/// A single change to fold into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub operation: Operation,
    pub instance: Instance,
}

impl InstanceUpdate {
    pub fn add(instance: Instance) -> Self {
        Self {
            operation: Operation::Add,
            instance,
        }
    }

    /// Removal only needs the identity
    pub fn remove(id: InstanceId) -> Self {
        Self {
            operation: Operation::Remove,
            instance: Instance::new(id),
        }
    }
}

/// Container to run for a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Command", default)]
    pub command: Vec<String>,
}

/// Desired state of a service. Stored for the reconciler; the registry never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Group")]
    pub group: String,
    /// Replica count
    #[serde(rename = "Instances")]
    pub instances: u32,
    #[serde(rename = "Container", default)]
    pub container: ContainerSpec,
}

impl ServiceConfig {
    pub fn slot(&self, instance_number: u32) -> InstanceId {
        InstanceId::new(self.group.clone(), self.name.clone(), instance_number)
    }
}

/// Parse a `host:container` port mapping
pub fn parse_port_mapping(s: &str) -> crate::Result<(String, String)> {
    let (host, container) = s
        .split_once(':')
        .ok_or_else(|| crate::Error::Other(format!("expected host:container, got {}", s)))?;
    for port in [host, container] {
        port.parse::<u16>()
            .map_err(|_| crate::Error::Other(format!("invalid port in mapping {}", s)))?;
    }
    Ok((host.to_string(), container.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web(n: u32, addr: &str) -> Instance {
        Instance::new(InstanceId::new("prod", "web", n)).with_addrs([addr.parse().unwrap()])
    }

    #[test]
    fn test_names() {
        let instance = web(3, "10.0.0.1");
        assert_eq!(instance.qualified_name(), "3.web.prod");
        assert_eq!(
            instance.fully_qualified_domain_name("container"),
            "3.web.prod.container"
        );
        assert_eq!(instance.fully_qualified_domain_name(""), "3.web.prod");
        assert_eq!(instance.id().to_string(), "3.web.prod");
    }

    #[test]
    fn test_display() {
        let instance = web(0, "10.0.0.1").with_port("8080", "80");
        assert_eq!(instance.to_string(), "0.web.prod@10.0.0.1{8080:80}");
    }

    #[test]
    fn test_same_state() {
        let a = web(0, "10.0.0.1").with_port("8080", "80");
        let b = web(0, "10.0.0.1").with_port("8080", "80");
        assert!(a.same_state(&b));

        assert!(!a.same_state(&web(0, "10.0.0.2").with_port("8080", "80")));
        assert!(!a.same_state(&web(0, "10.0.0.1")));
        assert!(!a.same_state(&web(1, "10.0.0.1").with_port("8080", "80")));
    }

    #[test]
    fn test_remove_update_carries_identity() {
        let update = InstanceUpdate::remove(InstanceId::new("prod", "web", 1));
        assert_eq!(update.operation, Operation::Remove);
        assert_eq!(update.instance.qualified_name(), "1.web.prod");
        assert!(update.instance.addrs.is_empty());
    }

    #[test]
    fn test_service_config_slot() {
        let config = ServiceConfig {
            name: "web".into(),
            group: "service-prod".into(),
            instances: 5,
            container: ContainerSpec {
                image: "base/devel".into(),
                command: vec!["/bin/sh".into(), "-c".into(), "sleep 100".into()],
            },
        };
        assert_eq!(config.slot(2).qualified_name(), "2.web.service-prod");

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"Instances\":5"));
        let back: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!(
            parse_port_mapping("8080:80").unwrap(),
            ("8080".to_string(), "80".to_string())
        );
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("http:80").is_err());
    }
}
