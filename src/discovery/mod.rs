//! Cloud instance discovery.
//!
//! One provider is active per process. Both providers return the same flat
//! [`Instance`](models::Instance) shape; everything downstream of the trait
//! is provider-agnostic.

pub mod aws;
pub mod azure;
pub mod change_detector;
pub mod models;
pub mod tag_filter;

use async_trait::async_trait;

use crate::config::{AppConfig, Provider};
use crate::error::{DiscoveryError, Error};

/// Capability contract every cloud discovery client satisfies.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Return every running instance the credentials can see, de-duplicated.
    async fn discover_all(&self) -> Result<Vec<models::Instance>, DiscoveryError>;
}

/// Instantiate the discovery client for the configured provider.
pub async fn build_client(config: &AppConfig) -> Result<Box<dyn DiscoveryClient>, Error> {
    match config.provider()? {
        Provider::Azure => {
            let azure = config.azure.clone().unwrap_or_default();
            Ok(Box::new(azure::AzureDiscovery::new(
                azure,
                config.tags.clone(),
            )?))
        }
        Provider::Aws => {
            let aws = config.aws.clone().unwrap_or_default();
            Ok(Box::new(
                aws::AwsDiscovery::new(aws, config.tags.clone()).await,
            ))
        }
    }
}
