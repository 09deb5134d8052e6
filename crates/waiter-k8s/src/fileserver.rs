//! Instance log directory listing
//!
//! Queries the fileserver sidecar that shares the instance's home
//! volume and annotates each returned entry with either a client-facing
//! download URL (files) or a navigable sub-path (directories).

use serde::Deserialize;
use tracing::warn;
use waiter_core::{DirectoryEntry, FileserverConfig};

/// One raw listing entry as the sidecar reports it
#[derive(Debug, Deserialize)]
struct RawEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: String,
    size: Option<u64>,
}

/// Normalize a browse path to the `/…/` shape the sidecar expects
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// List one directory of an instance's sandbox.
///
/// Returns `None` when the fileserver is unconfigured, unreachable, or
/// answers with anything unparseable; directory browsing is best-effort
/// and never fails a caller.
pub async fn retrieve_directory_content(
    http: &reqwest::Client,
    config: &FileserverConfig,
    host: &str,
    path: &str,
) -> Option<Vec<DirectoryEntry>> {
    let port = config.port?;
    let path = normalize_path(path);
    let base_url = format!("{}://{}:{}{}", config.scheme, host, port, path);

    let response = match http.get(&base_url).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("fileserver request to {} failed: {}", base_url, e);
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(
            "fileserver at {} answered {}",
            base_url,
            response.status()
        );
        return None;
    }

    let entries: Vec<RawEntry> = match response.json().await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("unparseable fileserver listing from {}: {}", base_url, e);
            return None;
        }
    };

    Some(
        entries
            .into_iter()
            .map(|entry| annotate(entry, &base_url, &path))
            .collect(),
    )
}

fn annotate(entry: RawEntry, base_url: &str, path: &str) -> DirectoryEntry {
    if entry.entry_type == "directory" {
        DirectoryEntry::Directory {
            path: format!("{}{}/", path, entry.name),
            name: entry.name,
        }
    } else {
        DirectoryEntry::File {
            url: format!("{}{}", base_url, entry.name),
            size: entry.size,
            name: entry.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("r0"), "/r0/");
        assert_eq!(normalize_path("/r0/logs"), "/r0/logs/");
        assert_eq!(normalize_path("r0/logs/"), "/r0/logs/");
    }

    #[test]
    fn test_annotation() {
        let file = annotate(
            RawEntry {
                name: "stdout".to_string(),
                entry_type: "file".to_string(),
                size: Some(128),
            },
            "http://10.0.0.5:591/r0/",
            "/r0/",
        );
        assert_eq!(
            file,
            DirectoryEntry::File {
                name: "stdout".to_string(),
                size: Some(128),
                url: "http://10.0.0.5:591/r0/stdout".to_string(),
            }
        );

        let dir = annotate(
            RawEntry {
                name: "logs".to_string(),
                entry_type: "directory".to_string(),
                size: None,
            },
            "http://10.0.0.5:591/r0/",
            "/r0/",
        );
        assert_eq!(
            dir,
            DirectoryEntry::Directory {
                name: "logs".to_string(),
                path: "/r0/logs/".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_unconfigured_fileserver_yields_none() {
        let config = FileserverConfig::default();
        let http = reqwest::Client::new();
        assert!(
            retrieve_directory_content(&http, &config, "10.0.0.5", "/r0")
                .await
                .is_none()
        );
    }
}
