//! Channel state machine, timeouts and concurrent use.

#![cfg(feature = "mock")]

mod common;

use std::time::Duration;

use attested_inference::mock::{EchoRuntime, PlatformConfig};
use attested_inference::{
    connect_with, ChannelState, ConfidentialChannel, Error, RunOptions, Tensor,
};

use common::{echo_model, Harness, NoFetch};

async fn attested(harness: &Harness) -> ConfidentialChannel {
    let config = harness.config().build().unwrap();
    connect_with(&config, &harness.connector, &NoFetch).await.unwrap()
}

fn tensor(tag: u32) -> Tensor {
    Tensor::from_f32(format!("t{tag}"), vec![2], &[tag as f32, -(tag as f32)])
}

#[tokio::test]
async fn closed_channel_rejects_requests() {
    let harness = Harness::new();
    let channel = attested(&harness).await;

    channel.close().await;
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);

    let err = channel.run(&echo_model(), vec![tensor(1)]).await.unwrap_err();
    assert!(matches!(err, Error::ChannelState(ChannelState::Closed)), "got {err:?}");
    let err = channel.heartbeat().await.unwrap_err();
    assert!(matches!(err, Error::ChannelState(ChannelState::Closed)));
    let err = channel.delete_model(&echo_model()).await.unwrap_err();
    assert!(matches!(err, Error::ChannelState(ChannelState::Closed)));
}

#[tokio::test]
async fn heartbeat_keeps_channel_attested() {
    let harness = Harness::new();
    let channel = attested(&harness).await;
    channel.heartbeat().await.unwrap();
    channel.heartbeat().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Attested);
    channel.run(&echo_model(), vec![tensor(3)]).await.unwrap();
}

#[tokio::test]
async fn slow_model_times_out_without_closing() {
    let runtime = EchoRuntime::new()
        .with_model(echo_model())
        .with_delay(Duration::from_millis(300));
    let harness = Harness::with(PlatformConfig::default(), runtime);
    let channel = attested(&harness).await;

    let options = RunOptions::default().with_timeout(Duration::from_millis(30));
    let err = channel
        .run_with(&echo_model(), vec![tensor(1)], options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(30)), "got {err:?}");
    assert!(!matches!(err, Error::Transport(_)));

    // The late response is dropped; the channel stays usable.
    assert_eq!(channel.state(), ChannelState::Attested);
    let outputs = channel
        .run_with(
            &echo_model(),
            vec![tensor(2)],
            RunOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .outputs;
    assert_eq!(outputs, vec![tensor(2)]);
}

#[tokio::test]
async fn close_fails_in_flight_requests() {
    let runtime = EchoRuntime::new()
        .with_model(echo_model())
        .with_delay(Duration::from_secs(30));
    let harness = Harness::with(PlatformConfig::default(), runtime);
    let channel = attested(&harness).await;

    let in_flight: Vec<_> = (0..4)
        .map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move { channel.run(&echo_model(), vec![tensor(i)]).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.close().await;

    for handle in in_flight {
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("in-flight request must not hang after close")
            .unwrap();
        assert!(matches!(result, Err(Error::Transport(_))), "got {result:?}");
    }
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let harness = Harness::new();
    let channel = attested(&harness).await;

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let channel = channel.clone();
            tokio::spawn(async move {
                let outputs = channel.run(&echo_model(), vec![tensor(i)]).await.unwrap();
                (i, outputs)
            })
        })
        .collect();

    for handle in handles {
        let (i, outputs) = handle.await.unwrap();
        assert_eq!(outputs, vec![tensor(i)]);
    }
}

#[tokio::test]
async fn concurrent_close_is_idempotent() {
    let harness = Harness::new();
    let channel = attested(&harness).await;

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let channel = channel.clone();
            tokio::spawn(async move { channel.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }
    assert_eq!(channel.state(), ChannelState::Closed);
}
