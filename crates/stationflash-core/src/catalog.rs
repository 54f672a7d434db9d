//! Firmware catalog: the version manifest and version selection.
//!
//! Manifest layout (JSON, latest first):
//!
//! ```json
//! { "versions": [ { "version": "1.2.0", "date": "2025-01-15",
//!                   "changes": ["..."],
//!                   "files": { "bootloader": "bootloader.bin",
//!                              "partitions": "partitions.bin",
//!                              "firmware": "firmware.bin" } } ] }
//! ```
//!
//! File paths are resolved relative to the manifest URL.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

use crate::assets::AssetKind;
use crate::http::{HttpError, HttpFetch};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Failed to fetch versions: {0}")]
    Unreachable(String),

    #[error("Version manifest is malformed: {0}")]
    Malformed(String),

    #[error("Version manifest lists no versions")]
    EmptyCatalog,
}

impl From<HttpError> for FetchError {
    fn from(e: HttpError) -> Self {
        FetchError::Unreachable(e.to_string())
    }
}

/// Raw manifest as served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub versions: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub version: String,
    pub date: NaiveDate,
    pub changes: Vec<String>,
    pub files: ManifestFiles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFiles {
    pub bootloader: String,
    pub partitions: String,
    pub firmware: String,
}

/// Absolute locations of the three images of one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUrls {
    pub bootloader: Url,
    pub partitions: Url,
    pub firmware: Url,
}

impl AssetUrls {
    pub fn url(&self, kind: AssetKind) -> &Url {
        match kind {
            AssetKind::Bootloader => &self.bootloader,
            AssetKind::PartitionTable => &self.partitions,
            AssetKind::Application => &self.firmware,
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub version_id: String,
    pub release_date: NaiveDate,
    pub change_notes: Vec<String>,
    pub assets: AssetUrls,
}

impl FirmwareVersion {
    fn resolve(entry: ManifestEntry, base: &Url) -> Result<Self, FetchError> {
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| FetchError::Malformed(format!("bad file path {path:?}: {e}")))
        };
        let assets = AssetUrls {
            bootloader: join(&entry.files.bootloader)?,
            partitions: join(&entry.files.partitions)?,
            firmware: join(&entry.files.firmware)?,
        };
        Ok(Self {
            version_id: entry.version,
            release_date: entry.date,
            change_notes: entry.changes,
            assets,
        })
    }

    /// Check whether `id` names this version ("1.2.0" or "v1.2.0").
    pub fn matches(&self, id: &str) -> bool {
        let id = id.trim();
        self.version_id == id || id.strip_prefix('v') == Some(self.version_id.as_str())
    }
}

/// Non-empty, manifest-ordered list of versions. The first entry is the latest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    versions: Vec<FirmwareVersion>,
}

impl Catalog {
    pub fn new(versions: Vec<FirmwareVersion>) -> Result<Self, FetchError> {
        if versions.is_empty() {
            return Err(FetchError::EmptyCatalog);
        }
        Ok(Self { versions })
    }

    /// Parse a manifest body, resolving file paths against `base`.
    pub fn from_manifest(body: &[u8], base: &Url) -> Result<Self, FetchError> {
        let manifest: VersionManifest =
            serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        let versions = manifest
            .versions
            .into_iter()
            .map(|entry| FirmwareVersion::resolve(entry, base))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(versions)
    }

    pub fn latest(&self) -> &FirmwareVersion {
        &self.versions[0]
    }

    pub fn versions(&self) -> &[FirmwareVersion] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Always false: a catalog holds at least one version.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Look up an exact version.
    pub fn find(&self, version_id: &str) -> Option<&FirmwareVersion> {
        self.versions.iter().find(|v| v.matches(version_id))
    }

    /// Pick the requested version, falling back to the latest when the id is
    /// omitted or unknown.
    pub fn select_version(&self, version_id: Option<&str>) -> &FirmwareVersion {
        version_id
            .and_then(|id| self.find(id))
            .unwrap_or_else(|| self.latest())
    }
}

/// Fetch and parse the version manifest.
#[instrument(skip(fetcher), fields(url = %manifest_url))]
pub async fn fetch_catalog<F: HttpFetch + ?Sized>(
    fetcher: &F,
    manifest_url: &Url,
) -> Result<Catalog, FetchError> {
    let body = fetcher.get(manifest_url).await?;
    let catalog = Catalog::from_manifest(&body, manifest_url)?;
    info!(
        versions = catalog.len(),
        latest = %catalog.latest().version_id,
        "Catalog loaded"
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::mock::MockFetcher;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "versions": [
            {
                "version": "1.2.0",
                "date": "2025-03-01",
                "changes": ["Faster departures refresh", "German umlauts fixed"],
                "files": {
                    "bootloader": "v1.2.0/bootloader.bin",
                    "partitions": "v1.2.0/partitions.bin",
                    "firmware": "v1.2.0/firmware.bin"
                }
            },
            {
                "version": "1.1.0",
                "date": "2025-01-20",
                "changes": ["Initial release"],
                "files": {
                    "bootloader": "v1.1.0/bootloader.bin",
                    "partitions": "v1.1.0/partitions.bin",
                    "firmware": "v1.1.0/firmware.bin"
                }
            }
        ]
    }"#;

    fn base() -> Url {
        Url::parse("https://boards.example/firmware/versions.json").unwrap()
    }

    fn catalog() -> Catalog {
        Catalog::from_manifest(MANIFEST.as_bytes(), &base()).unwrap()
    }

    #[test]
    fn test_parse_keeps_manifest_order() {
        let catalog = catalog();
        let ids: Vec<_> = catalog.versions().iter().map(|v| v.version_id.as_str()).collect();
        assert_eq!(ids, vec!["1.2.0", "1.1.0"]);
        assert_eq!(
            catalog.latest().release_date,
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
        assert_eq!(catalog.latest().change_notes.len(), 2);
    }

    #[test]
    fn test_file_paths_resolve_against_manifest() {
        let catalog = catalog();
        assert_eq!(
            catalog.latest().assets.url(AssetKind::PartitionTable).as_str(),
            "https://boards.example/firmware/v1.2.0/partitions.bin"
        );
    }

    #[test]
    fn test_select_version() {
        let catalog = catalog();
        assert_eq!(catalog.select_version(None).version_id, "1.2.0");
        assert_eq!(catalog.select_version(Some("1.1.0")).version_id, "1.1.0");
        assert_eq!(catalog.select_version(Some("v1.1.0")).version_id, "1.1.0");
        assert_eq!(catalog.select_version(Some("9.9.9")).version_id, "1.2.0");
    }

    #[test]
    fn test_empty_manifest_is_reported() {
        let err = Catalog::from_manifest(br#"{"versions": []}"#, &base()).unwrap_err();
        assert_eq!(err, FetchError::EmptyCatalog);
    }

    #[test]
    fn test_schema_mismatch_is_malformed() {
        let err = Catalog::from_manifest(br#"{"releases": []}"#, &base()).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));

        let bad_date = MANIFEST.replace("2025-03-01", "first of march");
        let err = Catalog::from_manifest(bad_date.as_bytes(), &base()).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_fetch_catalog() {
        let fetcher = MockFetcher::new();
        fetcher.respond(base().as_str(), MANIFEST.as_bytes());

        let catalog = fetch_catalog(&fetcher, &base()).await.unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_catalog_unreachable() {
        let fetcher = MockFetcher::new();
        fetcher.fail_with_status(base().as_str(), 503);

        let err = fetch_catalog(&fetcher, &base()).await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }
}
