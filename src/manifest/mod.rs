//! Reference measurements the client is willing to trust.

pub mod remote;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub use remote::{HttpManifestFetcher, ManifestFetcher, RemoteManifest};

/// Manifest format understood by this client.
pub const MANIFEST_VERSION: u32 = 1;

const DEFAULT_MANIFEST: &str = include_str!("default_manifest.toml");

/// One application's accepted enclave identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationEntry {
    pub id: String,
    /// Accepted MRENCLAVE values. Any exact match is enough.
    pub mr_enclave: Vec<Vec<u8>>,
    pub mr_signer: Option<[u8; 32]>,
    pub isv_prod_id: Option<u16>,
    pub min_isv_svn: Option<u16>,
    pub allow_debug: bool,
}

impl ApplicationEntry {
    /// An entry constrained only by its accepted measurements.
    pub fn new(id: impl Into<String>, mr_enclave: Vec<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            mr_enclave,
            mr_signer: None,
            isv_prod_id: None,
            min_isv_svn: None,
            allow_debug: false,
        }
    }
}

/// A parsed, read-only manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    expected_application: String,
    applications: Vec<ApplicationEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    version: u32,
    expected_application: String,
    #[serde(default)]
    applications: Vec<RawEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    id: String,
    #[serde(default)]
    mr_enclave: Vec<String>,
    mr_signer: Option<String>,
    isv_prod_id: Option<u16>,
    min_isv_svn: Option<u16>,
    #[serde(default)]
    allow_debug: bool,
}

fn decode_measurement(entry: &str, value: &str) -> std::result::Result<Vec<u8>, String> {
    let bytes = hex::decode(value)
        .map_err(|e| format!("application {entry:?}: invalid measurement {value:?}: {e}"))?;
    if bytes.is_empty() {
        return Err(format!("application {entry:?}: empty measurement"));
    }
    Ok(bytes)
}

impl TryFrom<RawEntry> for ApplicationEntry {
    type Error = String;

    fn try_from(raw: RawEntry) -> std::result::Result<Self, String> {
        let mr_enclave = raw
            .mr_enclave
            .iter()
            .map(|value| decode_measurement(&raw.id, value))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mr_signer = raw
            .mr_signer
            .as_deref()
            .map(|value| {
                let mut signer = [0u8; 32];
                hex::decode_to_slice(value, &mut signer).map_err(|e| {
                    format!("application {:?}: invalid mr_signer {value:?}: {e}", raw.id)
                })?;
                Ok::<_, String>(signer)
            })
            .transpose()?;

        Ok(Self {
            id: raw.id,
            mr_enclave,
            mr_signer,
            isv_prod_id: raw.isv_prod_id,
            min_isv_svn: raw.min_isv_svn,
            allow_debug: raw.allow_debug,
        })
    }
}

impl Manifest {
    pub fn new(expected_application: impl Into<String>, applications: Vec<ApplicationEntry>) -> Self {
        Self {
            expected_application: expected_application.into(),
            applications,
        }
    }

    /// Parse manifest TOML. Every failure is [`Error::ManifestParse`].
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawManifest =
            toml::from_str(text).map_err(|e| Error::ManifestParse(e.to_string()))?;
        if raw.version != MANIFEST_VERSION {
            return Err(Error::ManifestParse(format!(
                "unsupported manifest version {} (expected {MANIFEST_VERSION})",
                raw.version
            )));
        }
        if raw.expected_application.is_empty() {
            return Err(Error::ManifestParse("expected_application is empty".into()));
        }
        let applications = raw
            .applications
            .into_iter()
            .map(ApplicationEntry::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::ManifestParse)?;

        Ok(Self {
            expected_application: raw.expected_application,
            applications,
        })
    }

    /// The manifest compiled into the crate. Its accepted set is empty.
    pub fn bundled() -> Result<Self> {
        Self::parse(DEFAULT_MANIFEST)
    }

    /// Read and parse a manifest file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ManifestNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(Error::ManifestParse(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Self::parse(&text)
    }

    pub fn expected_application(&self) -> &str {
        &self.expected_application
    }

    pub fn applications(&self) -> &[ApplicationEntry] {
        &self.applications
    }
}

/// Where the manifest for one connection attempt comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ManifestSource {
    #[default]
    Default,
    Local(PathBuf),
    Remote(RemoteManifest),
}

impl ManifestSource {
    /// Build a source from raw connect options, rejecting conflicts before
    /// any I/O.
    pub fn from_options(
        local_path: Option<PathBuf>,
        use_remote: bool,
        remote: Option<RemoteManifest>,
    ) -> Result<Self> {
        match (local_path, use_remote) {
            (Some(_), true) => Err(Error::Configuration(
                "local_manifest_path and use_remote_manifest are mutually exclusive".into(),
            )),
            (Some(path), false) => Ok(Self::Local(path)),
            (None, true) => remote.map(Self::Remote).ok_or_else(|| {
                Error::Configuration(
                    "use_remote_manifest requires a manifest URL and publisher key".into(),
                )
            }),
            (None, false) => Ok(Self::Default),
        }
    }
}

/// Produce the manifest for a connection attempt.
pub async fn resolve(source: &ManifestSource, fetcher: &dyn ManifestFetcher) -> Result<Manifest> {
    let manifest = match source {
        ManifestSource::Default => {
            tracing::warn!("no manifest configured, using the bundled manifest");
            Manifest::bundled()?
        }
        ManifestSource::Local(path) => Manifest::load(path).await?,
        ManifestSource::Remote(remote) => {
            let text = remote::fetch_verified(remote, fetcher).await?;
            Manifest::parse(&text).map_err(|e| Error::ManifestFetch(e.to_string()))?
        }
    };
    tracing::debug!(
        expected_application = manifest.expected_application(),
        entries = manifest.applications().len(),
        "manifest resolved"
    );
    Ok(manifest)
}
