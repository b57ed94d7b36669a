//! Durable Queue over beanstalkd
//!
//! DurableQueue + BeanstalkManager against the in-process fake server:
//! publish, reserve, acknowledge, survive dropped sockets, shut down cleanly.

use conveyor_core::application::{
    handler_fn, Acknowledger, DurableQueue, DurableQueueConfig, ReconnectPolicy,
};
use conveyor_core::domain::Job;
use conveyor_core::port::Manager;
use conveyor_infra_beanstalk::mocks::FakeBeanstalkd;
use conveyor_infra_beanstalk::BeanstalkManager;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Email {
    to: String,
    seq: u32,
}

fn config() -> DurableQueueConfig {
    DurableQueueConfig {
        poll_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(10),
        },
        ..DurableQueueConfig::new("emails")
    }
}

async fn connect(server: &FakeBeanstalkd) -> DurableQueue {
    let manager: Arc<dyn Manager> = Arc::new(BeanstalkManager::new(server.addr()));
    DurableQueue::connect(manager, config()).await.unwrap()
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

type Inbox = Arc<Mutex<Vec<Email>>>;

fn spawn_consumer(queue: &DurableQueue, inbox: Inbox) -> tokio::task::JoinHandle<()> {
    let handler = handler_fn(move |job: Job, ack: Acknowledger| {
        let inbox = Arc::clone(&inbox);
        async move {
            let email: Email = job.decode().unwrap();
            ack.finish().await.unwrap();
            inbox.lock().unwrap().push(email);
        }
    });
    let queue = queue.clone();
    tokio::spawn(async move { queue.process(handler).await })
}

/// Test 1: Everything put is delivered once and acknowledged
#[tokio::test]
async fn test_put_process_ack_roundtrip() {
    let server = FakeBeanstalkd::start().await.unwrap();
    let queue = connect(&server).await;

    for seq in 0..20 {
        queue
            .put(&Email {
                to: "ops@example.com".into(),
                seq,
            })
            .await
            .unwrap();
    }

    let inbox: Inbox = Arc::default();
    let consumer = spawn_consumer(&queue, Arc::clone(&inbox));

    let delivered = wait_until(Duration::from_secs(5), || server.deleted().len() == 20).await;
    assert!(delivered, "only {} jobs acknowledged", server.deleted().len());
    assert_eq!(server.ready_len(), 0);

    queue.shutdown().await;
    consumer.await.unwrap();

    let mut seqs: Vec<u32> = inbox.lock().unwrap().iter().map(|email| email.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    println!("✅ Roundtrip: 20 jobs put, reserved and deleted");
}

/// Test 2: Dropped sockets are redialed on both sides
#[tokio::test]
async fn test_recovers_after_server_drops_connections() {
    let server = FakeBeanstalkd::start().await.unwrap();
    let queue = connect(&server).await;

    let inbox: Inbox = Arc::default();
    let consumer = spawn_consumer(&queue, Arc::clone(&inbox));

    queue.put(&Email { to: "a@example.com".into(), seq: 1 }).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || inbox.lock().unwrap().len() == 1).await);

    server.drop_connections();

    // Publish side: first attempt hits the dead socket, the retry redials
    queue.put(&Email { to: "b@example.com".into(), seq: 2 }).await.unwrap();

    // Consume side: the poll fails, the loop redials and picks the job up
    let recovered = wait_until(Duration::from_secs(5), || inbox.lock().unwrap().len() == 2).await;
    assert!(recovered, "consumer did not recover after the drop");
    assert_eq!(server.deleted().len(), 2);
    assert!(server.connections() >= 4, "expected redials, saw {}", server.connections());

    queue.shutdown().await;
    consumer.await.unwrap();
    println!("✅ Reconnect: publish and consume sides redialed after a drop");
}

/// Test 3: After shutdown producers get Stopped and the consumer loop exits
#[tokio::test]
async fn test_shutdown_stops_producers_and_consumer() {
    let server = FakeBeanstalkd::start().await.unwrap();
    let queue = connect(&server).await;

    let consumer = spawn_consumer(&queue, Arc::default());
    tokio::time::sleep(Duration::from_millis(50)).await;

    queue.shutdown().await;
    let finished = tokio::time::timeout(Duration::from_secs(2), consumer).await;
    assert!(finished.is_ok(), "consumer loop did not exit after shutdown");

    let err = queue
        .put(&Email { to: "late@example.com".into(), seq: 0 })
        .await
        .unwrap_err();
    assert!(err.is_stopped(), "expected Stopped, got {err}");
    assert_eq!(server.ready_len(), 0);
    println!("✅ Shutdown: consumer exited, late put reports Stopped");
}

/// Test 4: Jobs from another producer are consumed like our own
#[tokio::test]
async fn test_consumes_jobs_put_by_other_producers() {
    let server = FakeBeanstalkd::start().await.unwrap();
    let queue = connect(&server).await;

    let payload = serde_json::to_vec(&Email { to: "x@example.com".into(), seq: 99 }).unwrap();
    let id = server.push(payload);

    let inbox: Inbox = Arc::default();
    let consumer = spawn_consumer(&queue, Arc::clone(&inbox));
    assert!(wait_until(Duration::from_secs(5), || server.deleted() == vec![id]).await);

    queue.shutdown().await;
    consumer.await.unwrap();
    assert_eq!(inbox.lock().unwrap()[0].seq, 99);
    println!("✅ Foreign producer: job decoded and acknowledged");
}
