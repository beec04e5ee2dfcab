use crate::common::create_request;
use crate::common::harness;
use futures::StreamExt;
use podsim_core::ProgressChannel;
use podsim_core::StreamMode;
use podsim_core::StreamerConfig;
use podsim_protocol::JobStatus;
use podsim_protocol::StreamEvent;
use podsim_state::Store;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn fast_poll() -> StreamerConfig {
    StreamerConfig {
        mode: StreamMode::Poll,
        poll_interval: Duration::from_millis(25),
        recovery_interval: Duration::from_secs(30),
        queue_position_ttl: Duration::from_secs(10),
    }
}

fn push() -> StreamerConfig {
    StreamerConfig {
        mode: StreamMode::Push,
        ..fast_poll()
    }
}

#[tokio::test]
async fn stream_opens_with_job_and_simulations_snapshots() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    let streamer = h.streamer(fast_poll());

    let mut stream = Box::pin(streamer.stream(job.id.clone()));
    let first = stream.next().await.expect("job event");
    let StreamEvent::Job(snapshot) = first else {
        panic!("expected job event first");
    };
    assert_eq!(snapshot.id, job.id);
    assert_eq!(snapshot.status, JobStatus::Queued);
    assert_eq!(snapshot.queue_position, Some(0));
    assert_eq!(snapshot.name, "Atraxa vs Krenko vs Meren vs Talrand");

    let second = stream.next().await.expect("simulations event");
    let StreamEvent::Simulations(event) = second else {
        panic!("expected simulations event second");
    };
    assert_eq!(event.simulations.len(), 2);
}

#[tokio::test]
async fn stream_closes_after_terminal_snapshot() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store.cancel_job(&job.id).await.unwrap();

    let streamer = h.streamer(fast_poll());
    let events: Vec<StreamEvent> = streamer.stream(job.id.clone()).collect().await;
    assert_eq!(events.len(), 2);
    let StreamEvent::Job(snapshot) = &events[0] else {
        panic!("expected job event");
    };
    assert_eq!(snapshot.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn poll_mode_emits_only_on_change_and_ends_on_cancel() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    let streamer = h.streamer(fast_poll());
    let mut stream = Box::pin(streamer.stream(job.id.clone()));

    // Initial pair.
    assert!(matches!(stream.next().await, Some(StreamEvent::Job(_))));
    assert!(matches!(
        stream.next().await,
        Some(StreamEvent::Simulations(_))
    ));

    // No change: nothing within a few poll intervals.
    let quiet = tokio::time::timeout(Duration::from_millis(120), stream.next()).await;
    assert!(quiet.is_err(), "unchanged job must not re-emit");

    // Cancel: a terminal job snapshot arrives, then the stream closes.
    h.store.cancel_job(&job.id).await.unwrap();
    let mut saw_terminal = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), stream.next()).await
    {
        if let StreamEvent::Job(snapshot) = &event
            && snapshot.status == JobStatus::Cancelled
        {
            saw_terminal = true;
        }
    }
    assert!(saw_terminal, "terminal snapshot must be emitted before close");
}

#[tokio::test]
async fn push_mode_emits_on_progress_signal() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    let streamer = h.streamer(push());
    let mut stream = Box::pin(streamer.stream(job.id.clone()));

    assert!(matches!(stream.next().await, Some(StreamEvent::Job(_))));
    assert!(matches!(
        stream.next().await,
        Some(StreamEvent::Simulations(_))
    ));

    // A store change alone is invisible to push mode until the progress
    // channel signals the job.
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.progress
        .update_job_progress(&job.id, serde_json::json!({ "status": "RUNNING" }))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("push emission")
        .expect("stream open");
    let StreamEvent::Job(snapshot) = event else {
        panic!("expected job snapshot");
    };
    assert_eq!(snapshot.status, JobStatus::Running);
}
