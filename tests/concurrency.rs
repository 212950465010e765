//! Serialization of driver calls per session.

use std::sync::Arc;
use std::time::Duration;

use async_gpib::{GpibSession, MockDriver, SessionState, Timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_session_never_overlaps_calls() {
    let mock = Arc::new(MockDriver::new().with_latency(Duration::from_millis(5)));
    let session = Arc::new(
        GpibSession::device(0, 22)
            .with_timeout(Timeout::T3s)
            .build(mock.clone())
            .unwrap(),
    );
    session.connect().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session.write(&[i]).await.unwrap();
            session.serial_poll().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(mock.max_concurrency(), 1);
    assert_eq!(mock.active_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_sharing_a_driver_run_in_parallel() {
    let mock = Arc::new(MockDriver::new().with_latency(Duration::from_millis(100)));
    let a = GpibSession::device(0, 1).build(mock.clone()).unwrap();
    let b = GpibSession::device(0, 2).build(mock.clone()).unwrap();
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    let (ra, rb) = tokio::join!(a.clear(), b.clear());
    ra.unwrap();
    rb.unwrap();

    // Separate sessions have separate worker slots
    assert_eq!(mock.max_concurrency(), 2);
}

#[tokio::test]
async fn test_calls_complete_in_issue_order() {
    let mock = Arc::new(MockDriver::new());
    let session = GpibSession::device(0, 22).build(mock.clone()).unwrap();
    session.connect().await.unwrap();

    let (first, second, third) = tokio::join!(
        session.write(b"A"),
        session.write(b"B"),
        session.write(b"C"),
    );
    first.unwrap();
    second.unwrap();
    third.unwrap();

    assert_eq!(session.read(3).await.unwrap(), b"ABC");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_waits_for_abandoned_call() {
    let mock = Arc::new(MockDriver::new().with_latency(Duration::from_millis(200)));
    let session = GpibSession::device(0, 22).build(mock.clone()).unwrap();
    session.connect().await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), session.trigger()).await;
    assert!(abandoned.is_err());
    assert_eq!(mock.active_calls(), 1);

    session.disconnect().await.unwrap();
    assert_eq!(mock.active_calls(), 0);
    assert_eq!(mock.open_handles(), 0);
    assert_eq!(session.state(), SessionState::Disconnected);
}
