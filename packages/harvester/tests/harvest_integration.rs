//! Integration tests for the harvest engine.
//!
//! These exercise the guarantees the engine is built around:
//! 1. Replanning never duplicates work
//! 2. No task is ever leased to two workers
//! 3. Expired leases are recovered
//! 4. Identical payloads are stored once
//! 5. Reconciliation reports exactly the missing pages
//! 6. A crashed or interrupted fetch resumes at page granularity
//! 7. The full cycle against an HTTP upstream

use std::collections::HashSet;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use harvester::{
    content_hash,
    testing::{fixtures, MockPageSource},
    ContentWriter, DateRange, Discovery, Gap, HarvestConfig, HarvestError, Harvester, Holder,
    HttpPageSource, PageRequest, PageResponse, Reconciler, RetryPolicy, RunContext, SqliteStore,
    Task, TaskClaimer, TaskPlanner, TaskStatus,
};
use mockito::Matcher;
use tempfile::TempDir;

/// Helper to open a file-backed store so several pools can share it.
async fn file_store(dir: &TempDir) -> SqliteStore {
    let url = format!("sqlite://{}", dir.path().join("harvest.db").display());
    SqliteStore::connect(&url).await.unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    fixtures::date(y, m, d)
}

fn config() -> HarvestConfig {
    HarvestConfig::default()
        .with_worker_id("w1")
        .with_environment("test")
        .with_retry(RetryPolicy::immediate(2))
}

fn request(task: &Task, page: u32) -> PageRequest {
    PageRequest {
        task_id: task.task_id.clone(),
        endpoint: task.endpoint.clone(),
        path: "/v1/contratos".into(),
        page_number: page,
        data_date: task.data_date,
        query: vec![("pagina".into(), page.to_string())],
    }
}

#[tokio::test]
async fn test_planning_twice_yields_same_tasks() {
    let store = SqliteStore::in_memory().await.unwrap();
    let catalog = fixtures::catalog();
    let planner = TaskPlanner::new(&store, &catalog, "test");
    let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 10)).unwrap();
    let gaps = vec![Gap::new("contratos", range)];

    let first = planner.plan(&gaps, &range).await.unwrap();
    let ids_first: HashSet<_> = store
        .tasks_in_range(None, &range)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();

    let second = planner.plan(&gaps, &range).await.unwrap();
    let tasks = store.tasks_in_range(None, &range).await.unwrap();
    let ids_second: HashSet<_> = tasks.iter().map(|t| t.task_id.clone()).collect();

    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.created, 10);
    assert_eq!(second.created, 0);
    assert_eq!(tasks.len(), 10);
    assert_eq!(ids_first, ids_second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_never_share_a_task() {
    const TASKS: usize = 40;
    const WORKERS: usize = 4;

    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let tasks: Vec<Task> = (0..TASKS as u64)
        .map(|i| fixtures::task("contratos", date(2024, 1, 1) + chrono::Days::new(i)))
        .collect();
    store.insert_tasks(&tasks).await.unwrap();

    // One pool per worker, as separate processes would have.
    let mut handles = Vec::new();
    for w in 0..WORKERS {
        let claimer = TaskClaimer::new(
            file_store(&dir).await,
            format!("worker-{w}"),
            Duration::from_secs(60),
        );
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = claimer.claim_pending(3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|t| t.task_id));
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), TASKS, "a task was claimed twice");
    assert_eq!(unique.len(), TASKS);
    for id in &unique {
        assert!(store.active_claim(id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn test_expired_claim_is_released_and_reclaimable() {
    let store = SqliteStore::in_memory().await.unwrap();
    let task = fixtures::task("contratos", date(2024, 1, 15));
    store.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

    let crashed = TaskClaimer::new(store.clone(), "crashed", Duration::from_secs(1));
    let claimed = crashed.claim_pending(1).await.unwrap();
    crashed.begin_execution(&claimed[0]).await.unwrap();

    let survivor = TaskClaimer::new(store.clone(), "survivor", Duration::from_secs(60));
    assert!(survivor.claim_pending(1).await.unwrap().is_empty());

    let released = survivor
        .release_expired_at(Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(released, vec![task.task_id.clone()]);
    assert_eq!(
        store.require_task(&task.task_id).await.unwrap().status,
        TaskStatus::Pending
    );

    let reclaimed = survivor.claim_pending(1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    let claim = store.active_claim(&task.task_id).await.unwrap().unwrap();
    assert!(claim.is_owned_by("survivor"));
}

#[tokio::test]
async fn test_identical_payloads_are_stored_once() {
    let store = SqliteStore::in_memory().await.unwrap();
    let a = fixtures::task("contratos", date(2024, 1, 15));
    let b = fixtures::task("contratos", date(2024, 1, 16));
    store.insert_tasks(&[a.clone(), b.clone()]).await.unwrap();

    let body = br#"{"data":[],"totalRegistros":0,"totalPaginas":0}"#.to_vec();
    let (writer, join) = ContentWriter::new(store.clone(), 8).spawn(8);
    writer
        .enqueue(PageResponse::success(&request(&a, 1), 200, body.clone(), 0))
        .await
        .unwrap();
    writer
        .enqueue(PageResponse::success(&request(&b, 1), 200, body.clone(), 0))
        .await
        .unwrap();
    drop(writer);
    join.await.unwrap();

    assert_eq!(store.count_blobs().await.unwrap(), 1);
    let blob = store.get_blob(&content_hash(&body)).await.unwrap().unwrap();
    assert_eq!(blob.reference_count, 2);

    let hash_a = store.request_records(&a.task_id).await.unwrap()[0].content_hash.clone();
    let hash_b = store.request_records(&b.task_id).await.unwrap()[0].content_hash.clone();
    assert_eq!(hash_a, hash_b);
}

#[tokio::test]
async fn test_reconciliation_reports_exact_missing_pages() {
    let store = SqliteStore::in_memory().await.unwrap();
    let task = fixtures::task("contratos", date(2024, 1, 15));
    store.insert_tasks(std::slice::from_ref(&task)).await.unwrap();

    let claimer = TaskClaimer::new(store.clone(), "w1", Duration::from_secs(60));
    let claimed = claimer.claim_pending(1).await.unwrap();
    claimer.begin_execution(&claimed[0]).await.unwrap();

    let page = |n: u32| PageResponse::success(&request(&task, n), 200, format!("p{n}").into_bytes(), 1);
    store
        .write_batch(&[
            page(1).with_discovery(Discovery {
                total_pages: 5,
                total_records: 5,
            }),
            page(2),
            page(4),
        ])
        .await
        .unwrap();

    let reconciler = Reconciler::new(store.clone());
    let partial = reconciler
        .reconcile(&task.task_id, Holder::Worker("w1"))
        .await
        .unwrap();
    assert_eq!(partial.status, TaskStatus::Partial);
    assert_eq!(partial.missing_pages, vec![3, 5]);

    store.write_batch(&[page(3), page(5)]).await.unwrap();
    let complete = reconciler
        .reconcile(&task.task_id, Holder::Worker("w1"))
        .await
        .unwrap();
    assert_eq!(complete.status, TaskStatus::Completed);
    assert!(complete.missing_pages.is_empty());
}

#[tokio::test]
async fn test_invalid_transition_raises_and_leaves_task_unchanged() {
    let store = SqliteStore::in_memory().await.unwrap();
    let harvester = Harvester::new(
        store.clone(),
        fixtures::catalog(),
        config(),
        MockPageSource::new().with_listing("/v1/contratos", 1, 1),
    );
    let range = DateRange::day(date(2024, 1, 15));
    harvester.run(range, &RunContext::new("w1")).await.unwrap();

    let task = store.tasks_in_range(None, &range).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Completed);

    let claimer = TaskClaimer::new(store.clone(), "w1", Duration::from_secs(60));
    let err = claimer
        .update_status(&task.task_id, TaskStatus::Executing)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HarvestError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Executing,
            ..
        }
    ));

    let after = store.require_task(&task.task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.updated_at, task.updated_at);
}

#[tokio::test]
async fn test_discovery_404_completes_with_no_data() {
    let store = SqliteStore::in_memory().await.unwrap();
    let source = MockPageSource::new();
    let harvester = Harvester::new(store.clone(), fixtures::catalog(), config(), source.clone());
    let range = DateRange::day(date(2024, 1, 15));

    let summary = harvester.run(range, &RunContext::new("w1")).await.unwrap();

    assert_eq!(summary.count(TaskStatus::Completed), 1);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(source.call_count(), 1);

    let task = store.tasks_in_range(None, &range).await.unwrap().remove(0);
    assert_eq!(task.total_pages, Some(0));
    let records = store.request_records(&task.task_id).await.unwrap();
    assert!(records.iter().all(|r| r.content_hash.is_none()));
    assert_eq!(store.count_blobs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_crashed_fetch_resumes_missing_pages_only() {
    let store = SqliteStore::in_memory().await.unwrap();
    let catalog = fixtures::catalog();
    let range = DateRange::day(date(2024, 1, 15));
    TaskPlanner::new(&store, &catalog, "test")
        .plan(&[Gap::new("contratos", range)], &range)
        .await
        .unwrap();
    let task = store.tasks_in_range(None, &range).await.unwrap().remove(0);

    // A worker fetched pages 1 and 2 of 3, then died holding the lease.
    let now = Utc::now();
    store
        .claim_pending("crashed", 1, Duration::from_secs(1), now)
        .await
        .unwrap();
    let page = |n: u32| PageResponse::success(&request(&task, n), 200, format!("p{n}").into_bytes(), 1);
    store
        .write_batch(&[
            page(1).with_discovery(Discovery {
                total_pages: 3,
                total_records: 3,
            }),
            page(2),
        ])
        .await
        .unwrap();
    store
        .release_expired(now + chrono::Duration::seconds(2))
        .await
        .unwrap();

    let source = MockPageSource::new().with_listing("/v1/contratos", 3, 1);
    let harvester = Harvester::new(store.clone(), catalog, config(), source.clone());
    let summary = harvester.run(range, &RunContext::new("w2")).await.unwrap();

    assert_eq!(summary.count(TaskStatus::Completed), 1);
    assert_eq!(source.requested_pages(), vec![3]);
    assert_eq!(store.persisted_pages(&task.task_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_interrupted_fetch_drains_and_resumes() {
    let store = SqliteStore::in_memory().await.unwrap();
    let source = MockPageSource::new()
        .with_listing("/v1/contratos", 3, 1)
        .with_delay(Duration::from_millis(200));
    let config = config().with_lease_duration(Duration::from_secs(1));
    let harvester = Harvester::new(store.clone(), fixtures::catalog(), config, source.clone());
    let range = DateRange::day(date(2024, 1, 15));

    // Interrupt while pages 2 and 3 are in flight, after discovery returned.
    let ctx = RunContext::new("w1");
    let interrupter = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupter.cancel();
    });
    let first = harvester.run(range, &ctx).await.unwrap();

    assert!(first.cancelled);
    assert_eq!(first.exit_code(), 130);
    let task = store.tasks_in_range(None, &range).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Executing);
    assert_eq!(task.total_pages, Some(3));
    assert_eq!(
        store.persisted_pages(&task.task_id).await.unwrap().into_iter().collect::<Vec<_>>(),
        vec![1]
    );
    let claim = store.active_claim(&task.task_id).await.unwrap().unwrap();
    assert!(claim.is_owned_by("w1"));

    // The lease runs out; the next run reclaims and fetches only what is missing.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let calls_before = source.call_count();
    let second = harvester.run(range, &RunContext::new("w2")).await.unwrap();

    assert_eq!(second.count(TaskStatus::Completed), 1);
    assert_eq!(second.exit_code(), 0);
    let resumed: Vec<u32> = source.calls()[calls_before..]
        .iter()
        .map(|c| c.page_number)
        .collect();
    assert_eq!(resumed.len(), 2);
    assert!(!resumed.contains(&1));
    assert_eq!(store.persisted_pages(&task.task_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_end_to_end_against_http_upstream() {
    let mut server = mockito::Server::new_async().await;
    let mut mocks = Vec::new();
    for page in 1..=3 {
        let body = format!(
            r#"{{"data":[{{"id":{page}}}],"totalRegistros":3,"totalPaginas":3}}"#
        );
        mocks.push(
            server
                .mock("GET", "/v1/contratos")
                .match_query(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("pagina".into(), page.to_string()),
                    Matcher::UrlEncoded("dataInicial".into(), "20240115".into()),
                    Matcher::UrlEncoded("dataFinal".into(), "20240115".into()),
                ]))
                .with_status(200)
                .with_body(body)
                .expect(1)
                .create_async()
                .await,
        );
    }

    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    let config = config().with_base_url(server.url());
    let source = HttpPageSource::from_config(&config).unwrap();
    let harvester = Harvester::new(store.clone(), fixtures::catalog(), config, source);
    let range = DateRange::day(date(2024, 1, 15));

    let summary = harvester.run(range, &RunContext::new("w1")).await.unwrap();

    for mock in &mocks {
        mock.assert_async().await;
    }
    assert_eq!(summary.exit_code(), 0);

    let task = store.tasks_in_range(None, &range).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.total_pages, Some(3));
    assert_eq!(task.total_records, Some(3));

    let records = store.request_records(&task.task_id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.http_status == Some(200)));
    assert!(store.count_blobs().await.unwrap() >= 1);
}
