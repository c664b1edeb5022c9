use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use durq_core::{
    Clock, JobStatus, ManualClock, NewJob, NewProcess, ProcessKind, QueueConfig, QueueSelector,
};
use durq_dispatcher::{DispatcherConfig, HandlerRegistry, Supervisor, WorkerConfig};
use durq_store::{QueueStore, SqliteQueueStore};
use tokio_util::sync::CancellationToken;

async fn sqlite_store(clock: &ManualClock) -> Arc<dyn QueueStore> {
    let store = SqliteQueueStore::in_memory(QueueConfig::default(), Arc::new(clock.clone()))
        .await
        .unwrap();
    Arc::new(store)
}

async fn wait_until<F>(store: &Arc<dyn QueueStore>, mut done: F)
where
    F: FnMut(durq_core::IndexCounts) -> bool,
{
    for _ in 0..1000 {
        if done(store.counts().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never reached the expected state");
}

fn fast_worker(name: &str) -> WorkerConfig {
    WorkerConfig::default()
        .with_name(name)
        .with_poll_interval(Duration::from_millis(2))
        .with_max_concurrent(4)
        .with_heartbeat_interval(Duration::from_secs(10))
}

fn fast_dispatcher() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_polling_interval(Duration::from_millis(5))
        .with_stale_after(Duration::from_secs(60))
        .with_heartbeat_interval(Duration::from_secs(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keyed_jobs_never_overlap() {
    let clock = ManualClock::new(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
    let store = sqlite_store(&clock).await;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let registry = {
        let in_flight = in_flight.clone();
        let overlaps = overlaps.clone();
        HandlerRegistry::new().with_handler("Sync", move |_| {
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            async move {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    };

    for _ in 0..12 {
        store
            .enqueue(NewJob::new("Sync", "default").with_concurrency_key("account:1"))
            .await
            .unwrap();
    }

    let handle = Supervisor::new(store.clone(), registry)
        .with_clock(Arc::new(clock.clone()))
        .with_dispatcher(fast_dispatcher())
        .with_worker(fast_worker("a"))
        .with_worker(fast_worker("b"))
        .start(CancellationToken::new())
        .await
        .unwrap();

    wait_until(&store, |c| c.finished == 12).await;
    handle.shutdown().await.unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(store.semaphore("account:1").await.unwrap().unwrap().value, 1);
}

#[tokio::test]
async fn dispatcher_promotes_scheduled_work_for_workers() {
    let clock = ManualClock::new(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
    let store = sqlite_store(&clock).await;
    let registry = HandlerRegistry::new().with_handler("Report", |_| async { anyhow::Ok(()) });

    let job = store
        .enqueue(NewJob::new("Report", "default").scheduled_at(clock.now() + chrono::Duration::seconds(30)))
        .await
        .unwrap();

    let handle = Supervisor::new(store.clone(), registry)
        .with_clock(Arc::new(clock.clone()))
        .with_dispatcher(fast_dispatcher())
        .with_worker(fast_worker("reports"))
        .start(CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.job(job.id).await.unwrap().status, JobStatus::Scheduled);

    clock.advance(Duration::from_secs(30));
    wait_until(&store, |c| c.finished == 1).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn crashed_worker_jobs_are_recovered() {
    let clock = ManualClock::new(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
    let store = sqlite_store(&clock).await;

    // A worker that claims and then disappears without deregistering.
    let crashed = store
        .register(NewProcess::new(ProcessKind::Worker, "crashed"))
        .await
        .unwrap();
    let job = store.enqueue(NewJob::new("Report", "default")).await.unwrap();
    store
        .claim(crashed.id, &QueueSelector::all(), 1)
        .await
        .unwrap();

    // The crash is only noticed once the heartbeat is older than the threshold.
    clock.advance(Duration::from_secs(61));

    let registry = HandlerRegistry::new().with_handler("Report", |_| async { anyhow::Ok(()) });
    let handle = Supervisor::new(store.clone(), registry)
        .with_clock(Arc::new(clock.clone()))
        .with_dispatcher(fast_dispatcher())
        .with_worker(fast_worker("survivor"))
        .start(CancellationToken::new())
        .await
        .unwrap();

    wait_until(&store, |c| c.finished == 1).await;
    let recovered = store.job(job.id).await.unwrap();
    assert_eq!(recovered.attempts, 2);
    assert!(
        store
            .processes()
            .await
            .unwrap()
            .iter()
            .all(|p| p.id != crashed.id)
    );
    handle.shutdown().await.unwrap();
}
