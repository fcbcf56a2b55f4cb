//! EC2 and Auto Scaling Group discovery through the AWS SDK.
//!
//! Plain EC2 instances are found by tag filter server-side. ASG members are
//! enumerated separately because their service tags may live on the group
//! rather than the instance; members already seen via EC2 are skipped.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::Filter;
use tracing::{info, warn};

use crate::config::{AwsConfig, TagsConfig};
use crate::discovery::models::{Instance, InstanceSource};
use crate::discovery::DiscoveryClient;
use crate::error::DiscoveryError;

/// DescribeInstances accepts at most this many instance ids per call.
const DESCRIBE_CHUNK: usize = 100;

pub struct AwsDiscovery {
    ec2: aws_sdk_ec2::Client,
    autoscaling: aws_sdk_autoscaling::Client,
    config: AwsConfig,
    tags: TagsConfig,
}

impl AwsDiscovery {
    pub async fn new(config: AwsConfig, tags: TagsConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if !config.credential_profile.is_empty() {
            loader = loader.profile_name(&config.credential_profile);
        }
        let shared = loader.load().await;

        Self {
            ec2: aws_sdk_ec2::Client::new(&shared),
            autoscaling: aws_sdk_autoscaling::Client::new(&shared),
            config,
            tags,
        }
    }

    async fn discover_ec2(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut instances = Vec::new();

        let mut pages = self
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("tag-key")
                    .values(self.tags.service_name_tag.as_str())
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| DiscoveryError::Aws(DisplayErrorContext(&e).to_string()))?;
            for reservation in page.reservations() {
                for raw in reservation.instances() {
                    if let Some(instance) = self.parse_instance(raw, InstanceSource::Ec2) {
                        instances.push(instance);
                    }
                }
            }
        }

        info!(count = instances.len(), "EC2 discovery complete");
        Ok(instances)
    }

    /// Enumerate instances in tagged Auto Scaling Groups, resolving IPs and
    /// tags through DescribeInstances. Ids in `known` were already surfaced
    /// via plain EC2 and are skipped.
    async fn discover_asg(&self, known: &HashSet<String>) -> Result<Vec<Instance>, DiscoveryError> {
        let mut member_ids: Vec<String> = Vec::new();

        let mut pages = self
            .autoscaling
            .describe_auto_scaling_groups()
            .filters(
                aws_sdk_autoscaling::types::Filter::builder()
                    .name("tag-key")
                    .values(self.tags.service_name_tag.as_str())
                    .build(),
            )
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| DiscoveryError::Aws(DisplayErrorContext(&e).to_string()))?;
            for group in page.auto_scaling_groups() {
                for member in group.instances() {
                    if let Some(id) = member.instance_id() {
                        if !id.is_empty() && !known.contains(id) {
                            member_ids.push(id.to_string());
                        }
                    }
                }
            }
        }

        if member_ids.is_empty() {
            info!(count = 0usize, "ASG discovery complete");
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();
        for chunk in member_ids.chunks(DESCRIBE_CHUNK) {
            let response = self
                .ec2
                .describe_instances()
                .set_instance_ids(Some(chunk.to_vec()))
                .filters(
                    Filter::builder()
                        .name("instance-state-name")
                        .values("running")
                        .build(),
                )
                .send()
                .await
                .map_err(|e| DiscoveryError::Aws(DisplayErrorContext(&e).to_string()))?;

            for reservation in response.reservations() {
                for raw in reservation.instances() {
                    if let Some(instance) = self.parse_instance(raw, InstanceSource::Asg) {
                        instances.push(instance);
                    }
                }
            }
        }

        info!(count = instances.len(), "ASG discovery complete");
        Ok(instances)
    }

    fn parse_instance(
        &self,
        raw: &aws_sdk_ec2::types::Instance,
        source: InstanceSource,
    ) -> Option<Instance> {
        let id = raw.instance_id()?.to_string();

        let tags: BTreeMap<String, String> = raw
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect();

        let Some(ip) = raw.private_ip_address() else {
            warn!(instance = %id, "EC2 instance has no private IP, skipping");
            return None;
        };

        let zone = raw
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string);

        // Region is the AZ name minus its trailing letter.
        let region = zone
            .as_deref()
            .map(|az| az[..az.len().saturating_sub(1)].to_string())
            .unwrap_or_else(|| self.config.region.clone());

        let name = tags.get("Name").cloned().unwrap_or_else(|| id.clone());

        Some(Instance {
            id,
            name,
            ip: ip.to_string(),
            region,
            zone,
            source,
            tags,
        })
    }
}

#[async_trait]
impl DiscoveryClient for AwsDiscovery {
    async fn discover_all(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut instances = self.discover_ec2().await?;

        let known: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();
        instances.extend(self.discover_asg(&known).await?);

        info!(
            total = instances.len(),
            account = %self.config.account_id,
            "Discovery complete"
        );
        Ok(instances)
    }
}
