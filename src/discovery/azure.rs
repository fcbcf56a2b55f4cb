//! Azure VM and VM Scale Set discovery over the Resource Manager REST API.
//!
//! Credentials follow the environment-first chain: a service principal from
//! `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET`, falling
//! back to the IMDS managed-identity endpoint. Tokens are cached until close
//! to expiry.
//!
//! VMSS instances get a synthetic id of `{vmss_id}/virtualMachines/{n}` and
//! their tags overlay the scale set's tags.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AzureConfig, TagsConfig};
use crate::discovery::models::{Instance, InstanceSource};
use crate::discovery::DiscoveryClient;
use crate::error::DiscoveryError;

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const COMPUTE_API_VERSION: &str = "2024-03-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Refresh the cached token this long before it actually expires.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

pub struct AzureDiscovery {
    http: reqwest::Client,
    config: AzureConfig,
    tags: TagsConfig,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<ExpiresIn>,
}

/// AAD returns `expires_in` as a number, IMDS as a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Number(u64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> u64 {
        match self {
            ExpiresIn::Number(n) => *n,
            ExpiresIn::Text(s) => s.parse().unwrap_or(300),
        }
    }
}

#[derive(Deserialize)]
struct ArmPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

impl AzureDiscovery {
    pub fn new(config: AzureConfig, tags: TagsConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport)?;

        Ok(Self {
            http,
            config,
            tags,
            token: Mutex::new(None),
        })
    }

    // ── Authentication ──────────────────────────────────────────────

    async fn bearer_token(&self) -> Result<String, DiscoveryError> {
        let mut cache = self.token.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_SLACK {
                return Ok(token.value.clone());
            }
        }

        let fetched = self.fetch_token().await?;
        let value = fetched.value.clone();
        *cache = Some(fetched);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<CachedToken, DiscoveryError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        if let (Some(tenant), Some(client_id), Some(secret)) = (
            env("AZURE_TENANT_ID"),
            env("AZURE_CLIENT_ID"),
            env("AZURE_CLIENT_SECRET"),
        ) {
            debug!("Requesting management token via service principal");
            let url = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token");
            let params = [
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", secret.as_str()),
                ("scope", MANAGEMENT_SCOPE),
            ];
            let response = self
                .http
                .post(&url)
                .form(&params)
                .send()
                .await
                .map_err(transport)?;
            return parse_token(response, "service principal").await;
        }

        debug!("Requesting management token via IMDS managed identity");
        let response = self
            .http
            .get(IMDS_TOKEN_URL)
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", "https://management.azure.com/"),
            ])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| {
                DiscoveryError::Credentials(format!(
                    "no AZURE_* service principal in the environment and the IMDS \
                     endpoint is unreachable: {e}"
                ))
            })?;
        parse_token(response, "managed identity").await
    }

    // ── ARM plumbing ────────────────────────────────────────────────

    /// GET a paginated ARM collection, following `nextLink` to the end.
    async fn get_all(&self, first_url: String) -> Result<Vec<Value>, DiscoveryError> {
        let mut items = Vec::new();
        let mut next = Some(first_url);

        while let Some(url) = next {
            let token = self.bearer_token().await?;
            let response = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(transport)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DiscoveryError::Azure(format!(
                    "HTTP {status} on {url}: {body}"
                )));
            }

            let page: ArmPage = response.json().await.map_err(transport)?;
            items.extend(page.value);
            next = page.next_link;
        }

        Ok(items)
    }

    /// GET a single ARM resource; `None` on any failure (logged at DEBUG).
    async fn get_resource(&self, url: &str) -> Option<Value> {
        let token = match self.bearer_token().await {
            Ok(token) => token,
            Err(err) => {
                debug!(url = %url, error = %err, "Could not acquire token for resource fetch");
                return None;
            }
        };

        let response = match self.http.get(url).bearer_auth(&token).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url = %url, error = %err, "Resource fetch failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Resource fetch rejected");
            return None;
        }

        response.json().await.ok()
    }

    // ── VM discovery ────────────────────────────────────────────────

    async fn discover_vms(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let sub = &self.config.subscription_id;
        let urls: Vec<String> = if self.config.resource_groups.is_empty() {
            vec![format!(
                "{MANAGEMENT_BASE}/subscriptions/{sub}/providers/Microsoft.Compute/virtualMachines?api-version={COMPUTE_API_VERSION}"
            )]
        } else {
            self.config
                .resource_groups
                .iter()
                .map(|rg| {
                    format!(
                        "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachines?api-version={COMPUTE_API_VERSION}"
                    )
                })
                .collect()
        };

        let mut instances = Vec::new();
        for url in urls {
            for vm in self.get_all(url).await? {
                if let Some(instance) = self.parse_vm(&vm).await {
                    instances.push(instance);
                }
            }
        }

        info!(count = instances.len(), "VM discovery complete");
        Ok(instances)
    }

    async fn parse_vm(&self, vm: &Value) -> Option<Instance> {
        let tags = tag_map(vm);
        if !self.has_service_tags(&tags) {
            return None;
        }

        let resource_id = vm.get("id").and_then(Value::as_str)?;
        let name = vm.get("name").and_then(Value::as_str)?.to_string();
        let region = vm.get("location").and_then(Value::as_str)?.to_string();

        if !self.is_running(resource_id).await {
            debug!(vm = %name, "Skipping VM that is not running");
            return None;
        }

        let Some(ip) = self.resolve_vm_ip(vm).await else {
            warn!(vm = %name, "VM has no private IP, skipping");
            return None;
        };

        let id = vm
            .pointer("/properties/vmId")
            .and_then(Value::as_str)
            .unwrap_or(resource_id)
            .to_string();

        Some(Instance {
            id,
            name,
            ip,
            region,
            zone: first_zone(vm),
            source: InstanceSource::Vm,
            tags,
        })
    }

    async fn is_running(&self, resource_id: &str) -> bool {
        let url = format!(
            "{MANAGEMENT_BASE}{resource_id}/instanceView?api-version={COMPUTE_API_VERSION}"
        );
        let Some(view) = self.get_resource(&url).await else {
            return false;
        };

        view.get("statuses")
            .and_then(Value::as_array)
            .is_some_and(|statuses| {
                statuses.iter().any(|status| {
                    status
                        .get("code")
                        .and_then(Value::as_str)
                        .is_some_and(|code| code.eq_ignore_ascii_case("PowerState/running"))
                })
            })
    }

    /// First private IP across the VM's network interfaces.
    async fn resolve_vm_ip(&self, vm: &Value) -> Option<String> {
        let nics = vm
            .pointer("/properties/networkProfile/networkInterfaces")?
            .as_array()?;

        for nic_ref in nics {
            let Some(nic_id) = nic_ref.get("id").and_then(Value::as_str) else {
                continue;
            };
            let url = format!("{MANAGEMENT_BASE}{nic_id}?api-version={NETWORK_API_VERSION}");
            let Some(nic) = self.get_resource(&url).await else {
                continue;
            };
            if let Some(ip) = private_ip_of(&nic) {
                return Some(ip);
            }
        }
        None
    }

    // ── VMSS discovery ──────────────────────────────────────────────

    async fn discover_vmss(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let sub = &self.config.subscription_id;
        let urls: Vec<String> = if self.config.resource_groups.is_empty() {
            vec![format!(
                "{MANAGEMENT_BASE}/subscriptions/{sub}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version={COMPUTE_API_VERSION}"
            )]
        } else {
            self.config
                .resource_groups
                .iter()
                .map(|rg| {
                    format!(
                        "{MANAGEMENT_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version={COMPUTE_API_VERSION}"
                    )
                })
                .collect()
        };

        let mut instances = Vec::new();
        for url in urls {
            for vmss in self.get_all(url).await? {
                instances.extend(self.discover_vmss_members(&vmss).await?);
            }
        }

        info!(count = instances.len(), "VMSS discovery complete");
        Ok(instances)
    }

    async fn discover_vmss_members(&self, vmss: &Value) -> Result<Vec<Instance>, DiscoveryError> {
        let set_tags = tag_map(vmss);
        if !self.has_service_tags(&set_tags) {
            return Ok(Vec::new());
        }

        let Some(vmss_id) = vmss.get("id").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        let vmss_name = vmss.get("name").and_then(Value::as_str).unwrap_or(vmss_id);
        let region = vmss
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let members = self
            .get_all(format!(
                "{MANAGEMENT_BASE}{vmss_id}/virtualMachines?api-version={COMPUTE_API_VERSION}"
            ))
            .await?;
        debug!(vmss = %vmss_name, members = members.len(), "Listing scale set members");

        let mut instances = Vec::new();
        for member in &members {
            let Some(member_id) = member.get("instanceId").and_then(Value::as_str) else {
                continue;
            };
            let member_path = format!("{vmss_id}/virtualMachines/{member_id}");

            if !self.is_running(&member_path).await {
                debug!(vmss = %vmss_name, member = %member_id, "Skipping member that is not running");
                continue;
            }

            let Some(ip) = self.resolve_vmss_member_ip(&member_path).await else {
                warn!(vmss = %vmss_name, member = %member_id, "Member has no private IP, skipping");
                continue;
            };

            // Instance-level tags overlay scale-set tags.
            let mut tags = set_tags.clone();
            tags.extend(tag_map(member));

            let name = member
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{vmss_name}_{member_id}"));
            let zone = first_zone(member).or_else(|| first_zone(vmss));

            instances.push(Instance {
                id: member_path,
                name,
                ip,
                region: region.clone(),
                zone,
                source: InstanceSource::Vmss,
                tags,
            });
        }

        Ok(instances)
    }

    /// VMSS NICs are only reachable through the scale-set specific endpoint;
    /// the standalone NIC API does not return them.
    async fn resolve_vmss_member_ip(&self, member_path: &str) -> Option<String> {
        let url = format!(
            "{MANAGEMENT_BASE}{member_path}/networkInterfaces?api-version={NETWORK_API_VERSION}"
        );
        let nics = self.get_resource(&url).await?;
        let nics = nics.get("value").and_then(Value::as_array)?;

        nics.iter().find_map(private_ip_of)
    }

    fn has_service_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        tags.get(&self.tags.service_name_tag)
            .is_some_and(|v| !v.is_empty())
            && tags.contains_key(&self.tags.service_port_tag)
    }
}

#[async_trait]
impl DiscoveryClient for AzureDiscovery {
    async fn discover_all(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let mut instances = self.discover_vms().await?;
        instances.extend(self.discover_vmss().await?);

        info!(
            total = instances.len(),
            subscription = %self.config.subscription_id,
            "Discovery complete"
        );
        Ok(instances)
    }
}

fn transport(err: reqwest::Error) -> DiscoveryError {
    DiscoveryError::Azure(err.to_string())
}

async fn parse_token(
    response: reqwest::Response,
    source: &str,
) -> Result<CachedToken, DiscoveryError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DiscoveryError::Credentials(format!(
            "{source} token request failed with HTTP {status}: {body}"
        )));
    }

    let token: TokenResponse = response.json().await.map_err(|e| {
        DiscoveryError::Credentials(format!("{source} token response did not parse: {e}"))
    })?;

    let ttl = token.expires_in.as_ref().map(ExpiresIn::seconds).unwrap_or(300);
    Ok(CachedToken {
        value: token.access_token,
        expires_at: Instant::now() + Duration::from_secs(ttl),
    })
}

fn tag_map(resource: &Value) -> BTreeMap<String, String> {
    resource
        .get("tags")
        .and_then(Value::as_object)
        .map(|tags| {
            tags.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn first_zone(resource: &Value) -> Option<String> {
    resource
        .get("zones")
        .and_then(Value::as_array)?
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn private_ip_of(nic: &Value) -> Option<String> {
    let ip_configs = nic
        .pointer("/properties/ipConfigurations")
        .and_then(Value::as_array)?;

    ip_configs.iter().find_map(|config| {
        config
            .pointer("/properties/privateIPAddress")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}
