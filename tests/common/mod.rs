#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use attested_inference::inference::ModelRuntime;
use attested_inference::mock::{DuplexConnector, EchoRuntime, MockEnclave, PlatformConfig, SyntheticPlatform};
use attested_inference::transport::BoxedStream;
use attested_inference::{
    AttestationProvider, ClientConfig, ClientConfigBuilder, Connector, Error, ManifestFetcher,
    ManifestSource, ModelId,
};

pub const ENDPOINT: &str = "enclave.test:50051";

pub fn echo_model() -> ModelId {
    ModelId::from_model_bytes(b"echo-model-v1")
}

/// Manifest accepting exactly `mr_enclave` for the expected application.
pub fn manifest_toml(mr_enclave: &[u8]) -> String {
    format!(
        r#"version = 1
expected_application = "inference-server"

[[applications]]
id = "inference-server"
mr_enclave = ["{}"]
"#,
        hex::encode(mr_enclave)
    )
}

pub fn write_manifest(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

/// A synthetic platform, a mock enclave on top of it and a manifest that
/// accepts the platform's measurement.
pub struct Harness {
    pub platform: Arc<SyntheticPlatform>,
    pub enclave: Arc<MockEnclave>,
    pub connector: DuplexConnector,
    pub manifest: NamedTempFile,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(PlatformConfig::default(), EchoRuntime::new().with_model(echo_model()))
    }

    pub fn with(config: PlatformConfig, runtime: EchoRuntime) -> Self {
        let platform = Arc::new(SyntheticPlatform::new(config).unwrap());
        let manifest = write_manifest(&manifest_toml(&platform.config().mr_enclave));
        Self::with_provider(platform.clone(), platform, Arc::new(runtime), manifest)
    }

    pub fn with_provider(
        platform: Arc<SyntheticPlatform>,
        provider: Arc<dyn AttestationProvider>,
        runtime: Arc<dyn ModelRuntime>,
        manifest: NamedTempFile,
    ) -> Self {
        let enclave = Arc::new(MockEnclave::new(provider, runtime));
        Self {
            platform,
            connector: DuplexConnector::new(enclave.clone()),
            enclave,
            manifest,
        }
    }

    /// Config builder pinned to this platform's root and local manifest.
    pub fn config(&self) -> ClientConfigBuilder {
        ClientConfig::builder(ENDPOINT)
            .trust_root_pem(self.platform.root_pem())
            .manifest(ManifestSource::Local(self.manifest.path().to_path_buf()))
    }
}

/// Fetcher for tests that never configure a remote manifest.
pub struct NoFetch;

#[async_trait]
impl ManifestFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> attested_inference::Result<Vec<u8>> {
        Err(Error::ManifestFetch(format!("unexpected fetch of {url}")))
    }
}

/// Refuses the first `failures` connections, then delegates.
pub struct FlakyConnector<C> {
    inner: C,
    failures: u32,
    pub attempts: Arc<AtomicU32>,
}

impl<C> FlakyConnector<C> {
    pub fn new(inner: C, failures: u32) -> Self {
        Self {
            inner,
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl<C: Connector> Connector for FlakyConnector<C> {
    async fn connect(&self, endpoint: &str) -> std::io::Result<BoxedStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        self.inner.connect(endpoint).await
    }
}

/// Captures formatted log output for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || capture.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Counts fetches and serves nothing.
#[derive(Default)]
pub struct CountingFetcher {
    pub calls: AtomicU32,
}

#[async_trait]
impl ManifestFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> attested_inference::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::ManifestFetch(format!("404 {url}")))
    }
}
