//! Update checker.
//!
//! Polls the configured registry's tags list and compares the preferred
//! release tag against the tag the named Swarm service is running. Purely
//! informational: nothing here triggers a deployment.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::exec::docker::DockerExecutor;
use crate::storage::settings::RegistrySettings;

/// Result of one update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateData {
    pub latest_version: String,
    pub update_available: bool,
}

/// Registry tags-list response (`GET /v2/<repo>/tags/list`)
#[derive(Debug, Deserialize)]
struct TagsList {
    tags: Vec<String>,
}

/// Polls a registry for newer release tags
pub struct UpdateChecker {
    client: Client,
    registry: RegistrySettings,
}

impl UpdateChecker {
    pub fn new(registry: RegistrySettings) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, registry })
    }

    /// Latest release tag published in the registry
    pub async fn latest_tag(&self) -> Result<String, EngineError> {
        let url = format!(
            "{}/v2/{}/tags/list",
            self.registry.base_url.trim_end_matches('/'),
            self.registry.repository
        );
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let list: TagsList = response.json().await?;

        preferred_tag(&list.tags).ok_or_else(|| {
            EngineError::NotFound(format!(
                "no release tags published for {}",
                self.registry.repository
            ))
        })
    }

    /// Compare the registry's latest tag against what the named Swarm
    /// service is currently running
    pub async fn check(
        &self,
        docker: &DockerExecutor,
        service: &str,
    ) -> Result<UpdateData, EngineError> {
        let latest = self.latest_tag().await?;
        let running = docker.service_image_tag(service).await?;

        // A floating "latest" tag carries no version to compare against
        let update_available = running != "latest" && running != latest;
        Ok(UpdateData {
            latest_version: latest,
            update_available,
        })
    }
}

/// Pick the highest `vX.Y.Z` release tag, ignoring floating tags
fn preferred_tag(tags: &[String]) -> Option<String> {
    tags.iter()
        .filter_map(|tag| parse_release(tag).map(|version| (version, tag)))
        .max_by_key(|(version, _)| *version)
        .map(|(_, tag)| tag.clone())
}

fn parse_release(tag: &str) -> Option<(u64, u64, u64)> {
    let rest = tag.strip_prefix('v')?;
    let mut parts = rest.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_preferred_tag_picks_highest_release() {
        let tags = tags(&["latest", "v0.9.3", "v0.10.0", "v0.2.11", "canary"]);
        assert_eq!(preferred_tag(&tags).unwrap(), "v0.10.0");
    }

    #[test]
    fn test_preferred_tag_ignores_non_release_tags() {
        assert_eq!(preferred_tag(&tags(&["latest", "canary", "pr-123"])), None);
        assert_eq!(preferred_tag(&[]), None);
    }

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("v1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_release("1.2.3"), None);
        assert_eq!(parse_release("v1.2"), None);
        assert_eq!(parse_release("v1.2.3.4"), None);
    }
}
