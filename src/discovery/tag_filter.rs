//! Tag-based filtering of discovered instances.
//!
//! An instance survives the filter when it carries the service name and a
//! parseable service port tag, matches every allowlist entry, and matches no
//! denylist entry. Comparisons are case-sensitive string equality.

use tracing::{debug, info};

use crate::config::TagsConfig;
use crate::discovery::models::Instance;

pub struct TagFilter {
    tags: TagsConfig,
}

impl TagFilter {
    pub fn new(tags: TagsConfig) -> Self {
        Self { tags }
    }

    pub fn apply(&self, instances: Vec<Instance>) -> Vec<Instance> {
        let before = instances.len();
        let kept: Vec<Instance> = instances
            .into_iter()
            .filter(|instance| self.matches(instance))
            .collect();

        let dropped = before - kept.len();
        if dropped > 0 {
            info!(dropped, total = before, "Tag filter removed instances");
        }
        kept
    }

    fn matches(&self, instance: &Instance) -> bool {
        if instance.service_tags(&self.tags).is_none() {
            debug!(
                instance = %instance.name,
                "Instance missing service tags or port does not parse, dropping"
            );
            return false;
        }

        // Denylist: excluded if any entry matches.
        for (key, value) in &self.tags.denylist {
            if instance.tags.get(key) == Some(value) {
                debug!(instance = %instance.name, tag = %key, "Instance denied by tag");
                return false;
            }
        }

        // Allowlist: must match every entry.
        for (key, value) in &self.tags.allowlist {
            if instance.tags.get(key) != Some(value) {
                debug!(
                    instance = %instance.name,
                    tag = %key,
                    "Instance does not match allowlist tag"
                );
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::discovery::models::InstanceSource;

    fn instance(tags: &[(&str, &str)]) -> Instance {
        Instance {
            id: "i-1".to_string(),
            name: "vm-1".to_string(),
            ip: "10.0.0.1".to_string(),
            region: "eastus".to_string(),
            zone: None,
            source: InstanceSource::Ec2,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn service_tagged(extra: &[(&str, &str)]) -> Instance {
        let mut tags = vec![
            ("HAProxy:Service:Name", "web"),
            ("HAProxy:Service:Port", "80"),
        ];
        tags.extend_from_slice(extra);
        instance(&tags)
    }

    fn filter(allow: &[(&str, &str)], deny: &[(&str, &str)]) -> TagFilter {
        let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        TagFilter::new(TagsConfig {
            allowlist: to_map(allow),
            denylist: to_map(deny),
            ..TagsConfig::default()
        })
    }

    #[test]
    fn test_keeps_instances_with_service_tags() {
        let kept = filter(&[], &[]).apply(vec![service_tagged(&[])]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_drops_instances_missing_service_tags() {
        let kept = filter(&[], &[]).apply(vec![
            instance(&[("HAProxy:Service:Name", "web")]),
            instance(&[("HAProxy:Service:Port", "80")]),
            instance(&[]),
        ]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_drops_unparseable_port() {
        let kept = filter(&[], &[]).apply(vec![instance(&[
            ("HAProxy:Service:Name", "web"),
            ("HAProxy:Service:Port", "eighty"),
        ])]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_allowlist_requires_all_entries() {
        let filter = filter(&[("env", "prod"), ("team", "core")], &[]);

        let full = service_tagged(&[("env", "prod"), ("team", "core")]);
        let partial = service_tagged(&[("env", "prod")]);
        let kept = filter.apply(vec![full, partial]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_denylist_excludes_on_any_match() {
        let filter = filter(&[], &[("env", "dev"), ("drain", "true")]);

        let kept = filter.apply(vec![
            service_tagged(&[("env", "prod")]),
            service_tagged(&[("env", "dev")]),
            service_tagged(&[("drain", "true")]),
        ]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_denylist_wins_over_allowlist() {
        let filter = filter(&[("env", "prod")], &[("drain", "true")]);
        let kept = filter.apply(vec![service_tagged(&[("env", "prod"), ("drain", "true")])]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let filter = filter(&[("env", "prod")], &[]);
        let kept = filter.apply(vec![service_tagged(&[("env", "Prod")])]);
        assert!(kept.is_empty());
    }
}
