//! Gateway configuration.
//!
//! Loaded from a JSON file at startup; the file is watched and changes are
//! pushed to the update supervisor, which re-seeds the service list and
//! forces a schema refresh.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bramble_federation::auth::OperationPermissions;
use notify::Watcher;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Seed list of downstream service URLs.
    pub services: Vec<String>,
    /// Periodicity of the schema refresh.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-query downstream request cap.
    pub max_requests_per_query: usize,
    /// Response-body clamp per downstream call, in bytes.
    pub max_service_response_size: usize,
    /// Inbound request-body limit, in bytes.
    pub max_file_upload_size: usize,
    /// Per-downstream-call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Hide `__schema`/`__type` from clients.
    pub disable_introspection: bool,
    /// Name of the boundary id field.
    pub id_field_name: String,
    pub host: String,
    pub port: u16,
    /// Inbound headers forwarded to downstream services.
    pub forward_headers: Vec<String>,
    /// Static permission tree applied to every request. Absent means
    /// everything is allowed.
    pub permissions: Option<OperationPermissions>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            services: Vec::new(),
            poll_interval: Duration::from_secs(10),
            max_requests_per_query: 50,
            max_service_response_size: 1024 * 1024,
            max_file_upload_size: 16 * 1024 * 1024,
            timeout: Duration::from_secs(10),
            disable_introspection: false,
            id_field_name: "id".to_owned(),
            host: "0.0.0.0".to_owned(),
            port: 8082,
            forward_headers: Vec::new(),
            permissions: None,
        }
    }
}

impl Configuration {
    pub fn load(path: &Path) -> anyhow::Result<Configuration> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        let config: Configuration = serde_json::from_str(&raw)
            .with_context(|| format!("parsing configuration from {}", path.display()))?;
        Ok(config)
    }
}

/// Watches the configuration file and sends each successfully re-parsed
/// version. The watcher lives as long as the returned guard.
pub fn watch(
    path: PathBuf,
    updates: mpsc::Sender<Configuration>,
) -> anyhow::Result<notify::RecommendedWatcher> {
    let watched = path.clone();
    let mut watcher = notify::recommended_watcher(move |event: Result<notify::Event, _>| {
        let Ok(event) = event else { return };
        if !matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        ) {
            return;
        }
        match Configuration::load(&watched) {
            Ok(config) => {
                info!(path = %watched.display(), "configuration reloaded");
                let _ = updates.blocking_send(config);
            }
            Err(err) => error!(
                path = %watched.display(),
                "ignoring configuration change: {err:#}"
            ),
        }
    })?;
    watcher.watch(&path, notify::RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config: Configuration = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.max_requests_per_query, 50);
        assert_eq!(config.id_field_name, "id");
        assert!(!config.disable_introspection);
    }

    #[test]
    fn kebab_case_keys_are_recognised() {
        let config: Configuration = serde_json::from_str(
            r#"{
                "services": ["http://movies/query"],
                "poll-interval": "5s",
                "max-requests-per-query": 10,
                "disable-introspection": true,
                "id-field-name": "uid"
            }"#,
        )
        .unwrap();
        assert_eq!(config.services, vec!["http://movies/query".to_owned()]);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_requests_per_query, 10);
        assert!(config.disable_introspection);
        assert_eq!(config.id_field_name, "uid");
    }
}
