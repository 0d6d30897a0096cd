use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Application name announced in `getInfo`.
pub const APPLICATION: &str = "Forge";

/// This node's version, announced in `getInfo`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub application: &'static str,
    pub version: &'static str,
    pub min_peer_version: String,
    pub ts: u64,
}

/// Parse "1.2.3" into numeric components.
pub fn parse_version(s: &str) -> Option<Vec<u32>> {
    let parts: Option<Vec<u32>> = s.trim().split('.').map(|p| p.parse().ok()).collect();
    parts.filter(|p| !p.is_empty())
}

/// True when `version` is below `min`.
///
/// A missing version is old, a trailing `e` (experimental build marker) is
/// ignored, a non-numeric component is old, and a version with fewer
/// components than `min` that matches on the shared prefix is old.
pub fn is_old_version(version: Option<&str>, min: &[u32]) -> bool {
    let Some(version) = version else {
        return true;
    };
    let version = version.strip_suffix('e').unwrap_or(version);
    let parts: Vec<&str> = version.split('.').collect();
    for (part, wanted) in parts.iter().zip(min.iter()) {
        match part.parse::<u32>() {
            Ok(v) if v > *wanted => return false,
            Ok(v) if v < *wanted => return true,
            Ok(_) => {}
            Err(_) => return true,
        }
    }
    parts.len() < min.len()
}

pub fn format_version(v: &[u32]) -> String {
    v.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn router(min_peer_version: Vec<u32>) -> Router {
    Router::new().route(
        "/version",
        get(move || {
            let min = format_version(&min_peer_version);
            async move {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Json(VersionInfo {
                    name: env!("CARGO_PKG_NAME"),
                    application: APPLICATION,
                    version: VERSION,
                    min_peer_version: min,
                    ts: now,
                })
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_version_gate() {
        let min = [1, 0, 0];
        assert!(is_old_version(Some("0.9.0"), &min));
        assert!(!is_old_version(Some("1.0.0"), &min));
        assert!(!is_old_version(Some("1.0.1"), &min));
        assert!(is_old_version(None, &min));
    }

    #[test]
    fn old_version_edge_cases() {
        let min = [1, 11, 0];
        assert!(!is_old_version(Some("1.11.0e"), &min));
        assert!(!is_old_version(Some("2.0"), &min));
        assert!(is_old_version(Some("1.11"), &min));
        assert!(is_old_version(Some("1.x.0"), &min));
        assert!(is_old_version(Some("1.10.9"), &min));
    }

    #[test]
    fn parse_and_format() {
        assert_eq!(parse_version("1.2.3"), Some(vec![1, 2, 3]));
        assert_eq!(parse_version("1.a"), None);
        assert_eq!(format_version(&[1, 0, 0]), "1.0.0");
    }

    #[test]
    fn own_version_is_not_old() {
        let min = parse_version(VERSION).unwrap();
        assert!(!is_old_version(Some(VERSION), &min));
    }
}
