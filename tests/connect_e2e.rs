//! End-to-end connection establishment against the mock enclave.

#![cfg(feature = "mock")]

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use attested_inference::attestation::types::{AttestationEvidence, Collateral};
use attested_inference::error::AttestError;
use attested_inference::mock::{EchoRuntime, PlatformConfig, SyntheticPlatform};
use attested_inference::{
    connect_with, AttestationProvider, ChannelState, ClientConfig, ConnectOptions, DType, Error,
    ManifestFetcher, ManifestSource, ModelId, RemoteManifest, RetryPolicy, RunOptions, Tensor,
};

use common::{
    echo_model, manifest_toml, write_manifest, CountingFetcher, FlakyConnector, Harness, LogCapture,
    NoFetch,
};

fn sample_inputs() -> Vec<Tensor> {
    vec![
        Tensor::from_f32("input_ids", vec![1, 4], &[1.0, 2.0, 3.0, 4.0]),
        Tensor::new("mask", DType::U8, vec![4], vec![1u8, 1, 1, 0]),
    ]
}

// ---------------------------------------------------------------------------
// Accept path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_enclave_runs_inference() {
    let harness = Harness::new();
    let config = harness.config().build().unwrap();

    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Attested);
    assert_eq!(channel.endpoint(), common::ENDPOINT);
    assert_eq!(channel.identity().measurement(), &[0x5E; 32]);
    assert!(!channel.identity().simulated());

    let outputs = channel.run(&echo_model(), sample_inputs()).await.unwrap();
    assert_eq!(outputs, sample_inputs());

    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn signed_proof_verifies_against_response_key() {
    let harness = Harness::new();
    let config = harness.config().build().unwrap();
    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();

    let result = channel
        .run_with(&echo_model(), sample_inputs(), RunOptions::signed())
        .await
        .unwrap();
    assert_eq!(result.outputs, sample_inputs());

    let proof = result.proof.expect("signed run returns a proof");
    let key = VerifyingKey::from_bytes(&harness.enclave.response_key()).unwrap();
    let signature = ed25519_dalek::Signature::from_bytes(proof.signature());
    key.verify_strict(proof.payload(), &signature).unwrap();

    let unsigned = channel
        .run_with(&echo_model(), sample_inputs(), RunOptions::default())
        .await
        .unwrap();
    assert!(unsigned.proof.is_none());
}

#[tokio::test]
async fn model_errors_are_distinct() {
    let broken = ModelId::from_model_bytes(b"broken-model");
    let runtime = EchoRuntime::new()
        .with_model(echo_model())
        .with_failing_model(broken, "out of memory");
    let harness = Harness::with(PlatformConfig::default(), runtime);
    let config = harness.config().build().unwrap();
    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();

    let unknown = ModelId::from_model_bytes(b"never-registered");
    let err = channel.run(&unknown, sample_inputs()).await.unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(id) if id == unknown));

    let err = channel.run(&broken, sample_inputs()).await.unwrap_err();
    assert!(matches!(&err, Error::Inference(msg) if msg.contains("out of memory")), "got {err:?}");

    // Model failures leave the channel usable.
    assert_eq!(channel.state(), ChannelState::Attested);
    channel.run(&echo_model(), sample_inputs()).await.unwrap();
}

#[tokio::test]
async fn deleted_model_is_not_found() {
    let harness = Harness::new();
    let config = harness.config().build().unwrap();
    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();

    channel.delete_model(&echo_model()).await.unwrap();
    let err = channel.run(&echo_model(), sample_inputs()).await.unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(_)));

    let err = channel.delete_model(&echo_model()).await.unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(_)));
}

#[tokio::test]
async fn signed_delete_returns_verified_proof() {
    let spare = ModelId::from_model_bytes(b"spare-model");
    let runtime = EchoRuntime::new().with_model(echo_model()).with_model(spare);
    let harness = Harness::with(PlatformConfig::default(), runtime);
    let config = harness.config().build().unwrap();
    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();

    let proof = channel
        .delete_model_with(&echo_model(), RunOptions::signed())
        .await
        .unwrap()
        .expect("signed delete returns a proof");
    let key = VerifyingKey::from_bytes(&harness.enclave.response_key()).unwrap();
    let signature = ed25519_dalek::Signature::from_bytes(proof.signature());
    key.verify_strict(proof.payload(), &signature).unwrap();
    assert_eq!(proof.input_hash(), proof.output_hash());

    let err = channel.run(&echo_model(), sample_inputs()).await.unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(_)));

    let unsigned = channel
        .delete_model_with(&spare, RunOptions::default())
        .await
        .unwrap();
    assert!(unsigned.is_none());
}

// ---------------------------------------------------------------------------
// Reject paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bundled_manifest_rejects_every_enclave() {
    let harness = Harness::new();
    let config = harness.config().manifest(ManifestSource::Default).build().unwrap();

    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation), "got {err:?}");
}

#[tokio::test]
async fn revoked_and_mismatched_fail_identically() {
    let revoked = Harness::with(
        PlatformConfig {
            revoke_pck: true,
            ..Default::default()
        },
        EchoRuntime::new(),
    );
    let revoked_logs = LogCapture::default();
    let revoked_err = {
        let _guard = revoked_logs.install();
        let config = revoked.config().build().unwrap();
        connect_with(&config, &revoked.connector, &NoFetch).await.unwrap_err()
    };

    let mismatched = Harness::new();
    let other_manifest = write_manifest(&manifest_toml(&[0x00; 32]));
    let mismatch_logs = LogCapture::default();
    let mismatch_err = {
        let _guard = mismatch_logs.install();
        let config = mismatched
            .config()
            .manifest(ManifestSource::Local(other_manifest.path().to_path_buf()))
            .build()
            .unwrap();
        connect_with(&config, &mismatched.connector, &NoFetch).await.unwrap_err()
    };

    assert!(matches!(revoked_err, Error::Attestation));
    assert!(matches!(mismatch_err, Error::Attestation));
    assert_eq!(revoked_err.to_string(), mismatch_err.to_string());

    let revoked_logs = revoked_logs.contents();
    let mismatch_logs = mismatch_logs.contents();
    assert!(revoked_logs.contains("is revoked"), "{revoked_logs}");
    assert!(!revoked_logs.contains("measurement not accepted"));
    assert!(mismatch_logs.contains("measurement not accepted"), "{mismatch_logs}");
    assert!(!mismatch_logs.contains("is revoked"));
}

#[tokio::test]
async fn foreign_trust_root_rejected() {
    let harness = Harness::new();
    let stranger = SyntheticPlatform::new(PlatformConfig::default()).unwrap();
    let config = harness.config().trust_root_pem(stranger.root_pem()).build().unwrap();

    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation));
}

#[tokio::test]
async fn expired_collateral_rejected() {
    let harness = Harness::with(
        PlatformConfig {
            collateral_expired: true,
            ..Default::default()
        },
        EchoRuntime::new(),
    );
    let config = harness.config().build().unwrap();
    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation));
}

#[tokio::test]
async fn debug_enclave_needs_explicit_allowance() {
    let harness = Harness::with(
        PlatformConfig {
            debug: true,
            ..Default::default()
        },
        EchoRuntime::new(),
    );
    let config = harness.config().build().unwrap();
    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation));

    let permissive = write_manifest(&format!(
        "{}allow_debug = true\n",
        manifest_toml(&harness.platform.config().mr_enclave)
    ));
    let config = harness
        .config()
        .manifest(ManifestSource::Local(permissive.path().to_path_buf()))
        .build()
        .unwrap();
    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();
    assert!(channel.identity().debug());
}

#[tokio::test]
async fn missing_manifest_file_reported() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let config = harness
        .config()
        .manifest(ManifestSource::Local(path.clone()))
        .build()
        .unwrap();

    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::ManifestNotFound(p) if p == path));
}

#[tokio::test]
async fn conflicting_manifest_sources_rejected_before_any_io() {
    let harness = Harness::new();
    let connector = FlakyConnector::new(harness.connector, 0);
    let attempts = connector.attempts.clone();
    let fetcher = CountingFetcher::default();

    let options = ConnectOptions {
        endpoint: common::ENDPOINT.into(),
        local_manifest_path: Some(harness.manifest.path().to_path_buf()),
        use_remote_manifest: true,
        remote_manifest_url: Some(MANIFEST_URL.into()),
        remote_manifest_publisher_key: Some("11".repeat(32)),
        simulation_mode: true,
        ..Default::default()
    };
    let result = async {
        let config = ClientConfig::from_options(options)?;
        connect_with(&config, &connector, &fetcher).await
    }
    .await;

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Session binding
// ---------------------------------------------------------------------------

/// Answers every session with the evidence produced for the first one.
struct ReplayingProvider {
    platform: Arc<SyntheticPlatform>,
    recorded: Mutex<Option<(AttestationEvidence, Collateral)>>,
}

#[async_trait]
impl AttestationProvider for ReplayingProvider {
    async fn attest(
        &self,
        report_data: &[u8; 64],
    ) -> Result<(AttestationEvidence, Collateral), AttestError> {
        if let Some(recorded) = self.recorded.lock().unwrap().clone() {
            return Ok(recorded);
        }
        let fresh = self.platform.attest(report_data).await?;
        *self.recorded.lock().unwrap() = Some(fresh.clone());
        Ok(fresh)
    }
}

fn replaying_harness() -> Harness {
    let platform = Arc::new(SyntheticPlatform::new(PlatformConfig::default()).unwrap());
    let provider = Arc::new(ReplayingProvider {
        platform: platform.clone(),
        recorded: Mutex::new(None),
    });
    let manifest = write_manifest(&manifest_toml(&platform.config().mr_enclave));
    let runtime = Arc::new(EchoRuntime::new().with_model(echo_model()));
    Harness::with_provider(platform, provider, runtime, manifest)
}

#[tokio::test]
async fn replayed_evidence_rejected() {
    let harness = replaying_harness();
    let config = harness.config().build().unwrap();

    let first = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();
    first.close().await;

    // Same genuine, fully verifiable evidence, but bound to another session.
    let err = connect_with(&config, &harness.connector, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation), "got {err:?}");
}

#[tokio::test]
async fn unattested_transport_switch_accepts_unbound_evidence() {
    let harness = replaying_harness();
    let config = harness.config().build().unwrap();
    connect_with(&config, &harness.connector, &NoFetch).await.unwrap();

    let logs = LogCapture::default();
    let _guard = logs.install();
    let unsafe_config = harness.config().allow_unattested_transport(true).build().unwrap();
    let channel = connect_with(&unsafe_config, &harness.connector, &NoFetch)
        .await
        .unwrap();
    channel.run(&echo_model(), sample_inputs()).await.unwrap();
    assert!(logs.contents().contains("UNSAFE"));
}

#[tokio::test]
async fn simulation_mode_skips_hardware_checks() {
    let harness = Harness::with(
        PlatformConfig {
            revoke_pck: true,
            ..Default::default()
        },
        EchoRuntime::new().with_model(echo_model()),
    );
    let config = ClientConfig::builder(common::ENDPOINT)
        .simulation_mode(true)
        .manifest(ManifestSource::Local(harness.manifest.path().to_path_buf()))
        .build()
        .unwrap();

    let channel = connect_with(&config, &harness.connector, &NoFetch).await.unwrap();
    assert!(channel.identity().simulated());
    assert_eq!(channel.identity().tcb_status(), None);
    channel.run(&echo_model(), sample_inputs()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Retry and remote manifests
// ---------------------------------------------------------------------------

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn unreachable_endpoint_retried() {
    let harness = Harness::new();
    let flaky = FlakyConnector::new(harness.connector, 2);
    let attempts = flaky.attempts.clone();

    let config = ClientConfig::builder(common::ENDPOINT)
        .trust_root_pem(harness.platform.root_pem())
        .manifest(ManifestSource::Local(harness.manifest.path().to_path_buf()))
        .retry_policy(fast_retries(3))
        .build()
        .unwrap();

    let channel = connect_with(&config, &flaky, &NoFetch).await.unwrap();
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert_eq!(channel.state(), ChannelState::Attested);
}

#[tokio::test]
async fn retries_exhausted_reports_unreachable() {
    let harness = Harness::new();
    let config = harness.config().retry_policy(fast_retries(1)).build().unwrap();
    let flaky = FlakyConnector::new(harness.connector, 10);
    let attempts = flaky.attempts.clone();

    let err = connect_with(&config, &flaky, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Unreachable(_)));
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn attestation_failures_never_retried() {
    let harness = Harness::new();
    let stranger = SyntheticPlatform::new(PlatformConfig::default()).unwrap();
    let config = harness
        .config()
        .trust_root_pem(stranger.root_pem())
        .retry_policy(fast_retries(3))
        .build()
        .unwrap();
    let counting = FlakyConnector::new(harness.connector, 0);
    let attempts = counting.attempts.clone();

    let err = connect_with(&config, &counting, &NoFetch).await.unwrap_err();
    assert!(matches!(err, Error::Attestation));
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

struct MapFetcher(HashMap<String, Vec<u8>>);

#[async_trait]
impl ManifestFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> attested_inference::Result<Vec<u8>> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| Error::ManifestFetch(format!("404 {url}")))
    }
}

const MANIFEST_URL: &str = "https://manifests.example/inference.toml";

fn publish(key: &SigningKey, body: &str) -> MapFetcher {
    let signature = hex::encode(key.sign(body.as_bytes()).to_bytes());
    MapFetcher(HashMap::from([
        (MANIFEST_URL.to_string(), body.as_bytes().to_vec()),
        (format!("{MANIFEST_URL}.sig"), signature.into_bytes()),
    ]))
}

#[tokio::test]
async fn signed_remote_manifest_used() {
    let harness = Harness::new();
    let publisher = SigningKey::generate(&mut OsRng);
    let fetcher = publish(&publisher, &manifest_toml(&harness.platform.config().mr_enclave));
    let remote = ManifestSource::Remote(RemoteManifest {
        url: MANIFEST_URL.into(),
        publisher_key: publisher.verifying_key().to_bytes(),
    });

    let config = harness.config().manifest(remote.clone()).build().unwrap();
    connect_with(&config, &harness.connector, &fetcher).await.unwrap();

    let impostor = SigningKey::generate(&mut OsRng);
    let forged = publish(&impostor, &manifest_toml(&harness.platform.config().mr_enclave));
    let err = connect_with(&config, &harness.connector, &forged).await.unwrap_err();
    assert!(matches!(err, Error::ManifestFetch(_)), "got {err:?}");
}

#[tokio::test]
async fn invalid_trust_root_fails_before_any_io() {
    let harness = Harness::new();
    let config = ClientConfig::builder(common::ENDPOINT)
        .trust_root_pem(b"-----BEGIN CERTIFICATE-----\ngarbage".to_vec())
        .manifest(ManifestSource::Remote(RemoteManifest {
            url: MANIFEST_URL.into(),
            publisher_key: [0x11; 32],
        }))
        .build()
        .unwrap();
    let connector = FlakyConnector::new(harness.connector, 0);
    let attempts = connector.attempts.clone();
    let fetcher = CountingFetcher::default();

    let err = connect_with(&config, &connector, &fetcher).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "got {err:?}");
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}
