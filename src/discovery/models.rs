//! Data model for discovered cloud instances and service groupings.
//!
//! Instances are immutable within a cycle; they are rebuilt from scratch by
//! the next discovery pass, never mutated. A [`Service`] has no identity
//! across cycles beyond its `(name, port, region)` key.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::config::{BackendConfig, TagsConfig};

/// Where an instance was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceSource {
    Vm,
    Vmss,
    Ec2,
    Asg,
}

impl fmt::Display for InstanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceSource::Vm => f.write_str("vm"),
            InstanceSource::Vmss => f.write_str("vmss"),
            InstanceSource::Ec2 => f.write_str("ec2"),
            InstanceSource::Asg => f.write_str("asg"),
        }
    }
}

/// A single running compute unit discovered from a cloud provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Provider-unique identifier.
    pub id: String,
    /// Display name, for logs only.
    pub name: String,
    /// The address HAProxy will dial.
    pub ip: String,
    pub region: String,
    /// Availability zone, when the provider reports one.
    pub zone: Option<String>,
    pub source: InstanceSource,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Service name and port from the required tags, or `None` if either tag
    /// is missing or the port does not parse to 1..=65535.
    pub fn service_tags<'a>(&'a self, tags: &TagsConfig) -> Option<(&'a str, u16)> {
        let name = self.tags.get(&tags.service_name_tag)?;
        if name.is_empty() {
            return None;
        }
        let port = parse_port(self.tags.get(&tags.service_port_tag)?)?;
        Some((name, port))
    }

    /// The optional per-instance port override tag.
    pub fn port_override(&self, tags: &TagsConfig) -> Option<u16> {
        parse_port(self.tags.get(&tags.instance_port_tag)?)
    }

    /// The cross-zone weight percentage tag, accepted only in 1..=99.
    pub fn az_weight(&self, tags: &TagsConfig) -> Option<u8> {
        let raw = self.tags.get(&tags.az_weight_tag)?;
        let value = raw.trim().parse::<i64>().ok()?;
        if (1..=99).contains(&value) {
            Some(value as u8)
        } else {
            None
        }
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|p| *p > 0)
}

/// Identity of a service across cycles: `(name, port, region)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub port: u16,
    pub region: String,
}

impl ServiceKey {
    /// The stable backend name in HAProxy, e.g. `azure-web-8080-eastus`.
    pub fn backend_name(&self, backend: &BackendConfig) -> String {
        let sep = &backend.name_separator;
        format!(
            "{prefix}{sep}{name}{sep}{port}{sep}{region}",
            prefix = backend.name_prefix,
            name = self.name,
            port = self.port,
            region = self.region,
        )
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.name, self.port, self.region)
    }
}

/// A group of instances that form one HAProxy backend.
///
/// Instance order is discovery order; it determines slot indices.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub port: u16,
    pub region: String,
    pub instances: Vec<Instance>,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            port: self.port,
            region: self.region.clone(),
        }
    }

    /// The port HAProxy dials for this instance: the per-instance override
    /// tag when present, otherwise the service port.
    pub fn effective_port(&self, instance: &Instance, tags: &TagsConfig) -> u16 {
        instance.port_override(tags).unwrap_or(self.port)
    }
}

/// Fold filtered instances into services keyed by `(name, port, region)`,
/// de-duplicated by instance id (first occurrence wins).
pub fn group_instances(
    instances: Vec<Instance>,
    tags: &TagsConfig,
) -> BTreeMap<ServiceKey, Service> {
    let mut services: BTreeMap<ServiceKey, Service> = BTreeMap::new();
    let mut seen: HashSet<String> = HashSet::new();

    for instance in instances {
        let (name, port) = match instance.service_tags(tags) {
            Some((name, port)) => (name.to_string(), port),
            None => continue,
        };
        if !seen.insert(instance.id.clone()) {
            continue;
        }

        let key = ServiceKey {
            name: name.clone(),
            port,
            region: instance.region.clone(),
        };
        services
            .entry(key)
            .or_insert_with(|| Service {
                name,
                port,
                region: instance.region.clone(),
                instances: Vec::new(),
            })
            .instances
            .push(instance);
    }

    services
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags_config() -> TagsConfig {
        TagsConfig::default()
    }

    fn instance(id: &str, ip: &str, tags: &[(&str, &str)]) -> Instance {
        Instance {
            id: id.to_string(),
            name: format!("vm-{id}"),
            ip: ip.to_string(),
            region: "eastus".to_string(),
            zone: None,
            source: InstanceSource::Vm,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_service_tags_parse() {
        let inst = instance(
            "a",
            "10.0.0.1",
            &[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", "8080")],
        );
        assert_eq!(inst.service_tags(&tags_config()), Some(("web", 8080)));
    }

    #[test]
    fn test_service_tags_reject_bad_ports() {
        for bad in ["0", "65536", "http", "", "-1"] {
            let inst = instance(
                "a",
                "10.0.0.1",
                &[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", bad)],
            );
            assert_eq!(inst.service_tags(&tags_config()), None, "port {bad:?}");
        }
    }

    #[test]
    fn test_az_weight_range() {
        let cases = [
            ("1", Some(1)),
            ("50", Some(50)),
            ("99", Some(99)),
            ("0", None),
            ("100", None),
            ("-20", None),
            ("abc", None),
        ];
        for (raw, expected) in cases {
            let inst = instance("a", "10.0.0.1", &[("HAProxy:Instance:AZperc", raw)]);
            assert_eq!(inst.az_weight(&tags_config()), expected, "value {raw:?}");
        }
    }

    #[test]
    fn test_backend_name() {
        let key = ServiceKey {
            name: "myapp".to_string(),
            port: 8080,
            region: "eastus".to_string(),
        };
        let mut backend = BackendConfig::default();
        backend.name_prefix = "azure".to_string();
        assert_eq!(key.backend_name(&backend), "azure-myapp-8080-eastus");

        backend.name_prefix = "aws".to_string();
        backend.name_separator = "_".to_string();
        assert_eq!(key.backend_name(&backend), "aws_myapp_8080_eastus");
    }

    #[test]
    fn test_group_instances_by_key() {
        let tags = tags_config();
        let svc_tags: &[(&str, &str)] =
            &[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", "80")];
        let mut other = instance("c", "10.0.0.3", svc_tags);
        other.region = "westus".to_string();

        let grouped = group_instances(
            vec![
                instance("a", "10.0.0.1", svc_tags),
                instance("b", "10.0.0.2", svc_tags),
                other,
            ],
            &tags,
        );

        assert_eq!(grouped.len(), 2);
        let east = grouped
            .get(&ServiceKey {
                name: "web".to_string(),
                port: 80,
                region: "eastus".to_string(),
            })
            .unwrap();
        assert_eq!(east.instances.len(), 2);
        assert_eq!(east.instances[0].id, "a");
        assert_eq!(east.instances[1].id, "b");
    }

    #[test]
    fn test_group_instances_dedupes_by_id() {
        let tags = tags_config();
        let svc_tags: &[(&str, &str)] =
            &[("HAProxy:Service:Name", "web"), ("HAProxy:Service:Port", "80")];
        let grouped = group_instances(
            vec![
                instance("a", "10.0.0.1", svc_tags),
                instance("a", "10.0.0.9", svc_tags),
            ],
            &tags,
        );

        let service = grouped.values().next().unwrap();
        assert_eq!(service.instances.len(), 1);
        assert_eq!(service.instances[0].ip, "10.0.0.1");
    }

    #[test]
    fn test_effective_port_override() {
        let tags = tags_config();
        let service = Service {
            name: "web".to_string(),
            port: 80,
            region: "eastus".to_string(),
            instances: Vec::new(),
        };

        let plain = instance("a", "10.0.0.1", &[]);
        assert_eq!(service.effective_port(&plain, &tags), 80);

        let overridden = instance("b", "10.0.0.2", &[("HAProxy:Instance:Port", "9090")]);
        assert_eq!(service.effective_port(&overridden, &tags), 9090);

        let garbage = instance("c", "10.0.0.3", &[("HAProxy:Instance:Port", "nope")]);
        assert_eq!(service.effective_port(&garbage, &tags), 80);
    }
}
