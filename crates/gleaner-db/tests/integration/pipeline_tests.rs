use std::sync::Arc;
use std::time::Duration;

use gleaner_core::config::RunConfig;
use gleaner_core::consolidate::Consolidator;
use gleaner_core::models::Category;
use gleaner_core::orchestrator::{Orchestrator, OrchestratorConfig};
use gleaner_core::output::OutputManager;
use gleaner_core::task::RetryPolicy;
use gleaner_core::testutil::{MockExtractorFactory, MockReporter, one_task_per_category, record_at};
use gleaner_core::throttle::RateLimitConfig;

use crate::common::setup_test_db;

#[tokio::test]
async fn full_run_loads_every_record_once() {
    let (db, dir) = setup_test_db().await;
    let output_dir = dir.path().join("output");
    let repo = db.record_repo();

    let config = OrchestratorConfig::default()
        .with_workers(2)
        .with_retry(RetryPolicy::default().with_backoff(Duration::from_millis(20)))
        .with_rate_limit(RateLimitConfig::new(0.0))
        .with_poll_interval(Duration::from_millis(20))
        .with_monitor_interval(Duration::from_millis(50));
    let reporter = MockReporter::new();
    let mut orchestrator = Orchestrator::new(
        config,
        MockExtractorFactory::succeeding(),
        repo.clone(),
        OutputManager::new(&output_dir),
    )
    .with_run_reporter(Arc::new(reporter.clone()));

    let report = orchestrator.run(one_task_per_category()).await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| r.succeeded));
    let consolidation = report.consolidation.unwrap();
    assert_eq!(consolidation.load.inserted, 3);
    assert_eq!(repo.count().await.unwrap(), 3);
    assert!(output_dir.join("database_stats.json").exists());

    // The same run again finds nothing new to insert.
    let mut again = Orchestrator::new(
        OrchestratorConfig::default()
            .with_workers(2)
            .with_rate_limit(RateLimitConfig::new(0.0))
            .with_poll_interval(Duration::from_millis(20)),
        MockExtractorFactory::succeeding(),
        repo.clone(),
        OutputManager::new(&output_dir),
    );
    let second = again.run(one_task_per_category()).await.unwrap();
    assert_eq!(second.consolidation.unwrap().load.inserted, 0);
    assert_eq!(repo.count().await.unwrap(), 3);
}

#[tokio::test]
async fn consolidator_loads_partials_into_sqlite() {
    let (db, dir) = setup_test_db().await;
    let output = OutputManager::new(dir.path().join("output"));
    output.ensure_dir().await.unwrap();

    output
        .write_partial(
            "worker-0",
            &[
                record_at("https://news.example.com/a", Some(Category::News), 0),
                record_at("https://example.com/blog/post", None, 1),
            ],
        )
        .await
        .unwrap();
    output
        .write_partial(
            "worker-1",
            &[record_at("https://news.example.com/a", Some(Category::News), 10)],
        )
        .await
        .unwrap();

    let repo = db.record_repo();
    let report = Consolidator::new(output.clone(), repo.clone())
        .consolidate()
        .await
        .unwrap();

    assert_eq!(report.combined_total, 2);
    assert_eq!(report.reclassified, 1);
    assert_eq!(report.load.inserted, 2);
    assert!(output.list_partials().await.unwrap().is_empty());

    let reclassified = repo.get("https://example.com/blog/post").await.unwrap().unwrap();
    assert_eq!(reclassified.category, Some(Category::Blog));
    let latest = repo.get("https://news.example.com/a").await.unwrap().unwrap();
    assert_eq!(latest.scraped_at, gleaner_core::testutil::test_epoch() + chrono::TimeDelta::seconds(10));
}

#[tokio::test]
async fn category_filtered_run_only_collects_that_category() {
    let (db, dir) = setup_test_db().await;
    let repo = db.record_repo();
    let run_config = RunConfig::from_json(
        r#"{"tasks": [
            {"id": 1, "url": "https://blog.example.com", "category": "blog"},
            {"id": 2, "url": "https://news.example.com", "category": "news"},
            {"id": 3, "url": "https://feeds.example.com/rss", "category": "rss", "search_term": "rust"},
            {"id": 4, "url": "https://wire.example.com", "category": "news"}
        ]}"#,
    )
    .unwrap();

    let config = run_config
        .orchestrator_config(Some(2))
        .with_rate_limit(RateLimitConfig::new(0.0))
        .with_poll_interval(Duration::from_millis(20))
        .with_monitor_interval(Duration::from_millis(50));
    let mut orchestrator = Orchestrator::new(
        config,
        MockExtractorFactory::succeeding(),
        repo.clone(),
        OutputManager::new(dir.path().join("output")),
    );

    let report = orchestrator
        .run(run_config.tasks_in(&[Category::News]))
        .await
        .unwrap();

    let mut task_ids: Vec<_> = report.results.iter().map(|r| r.task_id).collect();
    task_ids.sort_unstable();
    assert_eq!(task_ids, vec![2, 4]);

    let stats = repo.stats().await.unwrap();
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.by_category.get("news"), Some(&2));
    assert_eq!(stats.by_category.len(), 1);
}
