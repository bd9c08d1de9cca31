use fd_device_agent::jobs::{DeviceUpdateJob, GrainbinUpdateJob};
use fd_device_agent::collectors::{DeviceSource, GrainbinSource};
use fd_device_agent::{
    CollectError, DispatchClient, DispatchOutcome, Job, PublishError, Snapshot, DEVICE_UPDATE_TASK,
    GRAINBIN_UPDATE_TASK,
};
use fd_devkit::{init_test_logging, MockPublisher};
use std::sync::Arc;
use std::time::Duration;

fn snapshot() -> Snapshot {
    Snapshot::builder().field("device_id", "fd-0001").field("interior_temp", 21.5).build()
}

#[tokio::test]
async fn test_each_failure_kind_maps_to_its_outcome() {
    init_test_logging();
    let publisher = MockPublisher::new();
    publisher
        .push_result(Err(PublishError::Operational("refused".into())))
        .push_result(Err(PublishError::Timeout))
        .push_result(Err(PublishError::ConnectionClosed("reset".into())))
        .push_result(Err(PublishError::Transport("frame".into())));
    let client = DispatchClient::new(publisher.clone(), Duration::from_secs(1));

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(client.send(DEVICE_UPDATE_TASK, snapshot(), true).await);
    }

    assert_eq!(
        outcomes,
        vec![
            DispatchOutcome::OperationalFailure,
            DispatchOutcome::TimeoutFailure,
            DispatchOutcome::ConnectionFailure,
            DispatchOutcome::TransportFailure,
            DispatchOutcome::Delivered,
        ]
    );
    assert_eq!(publisher.get_published_messages().len(), 5);
}

#[tokio::test]
async fn test_slow_broker_times_out() {
    let publisher = MockPublisher::new();
    publisher.set_delay(Duration::from_secs(5));
    let client = DispatchClient::new(publisher, Duration::from_millis(50));

    let outcome = client.send(DEVICE_UPDATE_TASK, snapshot(), true).await;
    assert_eq!(outcome, DispatchOutcome::TimeoutFailure);
}

#[tokio::test]
async fn test_cleared_publisher_starts_fresh() {
    let publisher = MockPublisher::new();
    let client = DispatchClient::new(publisher.clone(), Duration::from_secs(1));
    client.send(DEVICE_UPDATE_TASK, snapshot(), true).await;
    publisher.push_result(Err(PublishError::Timeout));

    publisher.clear();
    assert!(publisher.get_published_messages().is_empty());

    // the queued failure went with the log
    assert!(client.send(GRAINBIN_UPDATE_TASK, snapshot(), false).await.is_delivered());
    let sent = publisher.get_published_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].task, GRAINBIN_UPDATE_TASK);
}

#[tokio::test]
async fn test_envelope_carries_snapshot() {
    let publisher = MockPublisher::new();
    let client = DispatchClient::new(publisher.clone(), Duration::from_secs(1));
    client.send(DEVICE_UPDATE_TASK, snapshot(), true).await;

    let envelope: serde_json::Value = publisher.get_last_json_message(DEVICE_UPDATE_TASK).unwrap().unwrap();
    assert_eq!(envelope["task"], DEVICE_UPDATE_TASK);
    assert_eq!(envelope["args"][0]["device_id"], "fd-0001");
    assert_eq!(envelope["args"][0]["interior_temp"], 21.5);
    assert!(envelope["args"][0]["created_at"].is_string());
}

struct Device;

#[async_trait::async_trait]
impl DeviceSource for Device {
    async fn device_snapshot(&self) -> Result<Snapshot, CollectError> {
        Ok(snapshot())
    }
}

struct TwoBins;

#[async_trait::async_trait]
impl GrainbinSource for TwoBins {
    async fn grainbin_snapshots(&self) -> Result<Vec<Snapshot>, CollectError> {
        Ok(vec![
            Snapshot::builder().field("bus_number", 1).build(),
            Snapshot::builder().field("bus_number", 2).build(),
        ])
    }
}

#[tokio::test]
async fn test_jobs_dispatch_through_shared_client() {
    let publisher = MockPublisher::new();
    let client = Arc::new(DispatchClient::new(publisher.clone(), Duration::from_secs(1)));

    DeviceUpdateJob::new(Device, client.clone()).run().await;
    GrainbinUpdateJob::new(TwoBins, client).run().await;

    let device = publisher.find_messages_by_task(DEVICE_UPDATE_TASK);
    assert_eq!(device.len(), 1);
    assert!(device[0].wait_for_ack);

    let grainbins = publisher.find_messages_by_task(GRAINBIN_UPDATE_TASK);
    assert_eq!(grainbins.len(), 2);
    assert!(grainbins.iter().all(|m| !m.wait_for_ack));
}
