use chrono::TimeDelta;
use gleaner_core::models::Category;
use gleaner_core::testutil::{record_at, test_epoch};
use gleaner_core::traits::{LoadReport, RecordStore};

use crate::common::setup_test_db;

#[tokio::test]
async fn insert_then_reload_is_idempotent() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let records = vec![
        record_at("https://news.example.com/a", Some(Category::News), 0),
        record_at("https://blog.example.com/b", Some(Category::Blog), 1),
    ];

    let first = repo.upsert_records(&records).await.unwrap();
    assert_eq!(
        first,
        LoadReport {
            inserted: 2,
            updated: 0,
            unchanged: 0
        }
    );

    let second = repo.upsert_records(&records).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
async fn newer_scrape_overwrites_stored_row() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();
    let url = "https://news.example.com/story";

    repo.upsert_records(&[record_at(url, Some(Category::News), 0)])
        .await
        .unwrap();

    let mut newer = record_at(url, Some(Category::News), 60);
    newer.title = "Updated headline".into();
    let report = repo.upsert_records(&[newer]).await.unwrap();
    assert_eq!(report.updated, 1);

    let stored = repo.get(url).await.unwrap().unwrap();
    assert_eq!(stored.title, "Updated headline");
    assert_eq!(stored.scraped_at, test_epoch() + TimeDelta::seconds(60));
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn older_scrape_leaves_stored_row_alone() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();
    let url = "https://news.example.com/story";

    let mut current = record_at(url, Some(Category::News), 60);
    current.title = "Current headline".into();
    repo.upsert_records(&[current]).await.unwrap();

    let mut stale = record_at(url, Some(Category::News), 0);
    stale.title = "Stale headline".into();
    let report = repo.upsert_records(&[stale]).await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.written(), 0);

    let stored = repo.get(url).await.unwrap().unwrap();
    assert_eq!(stored.title, "Current headline");
}

#[tokio::test]
async fn stored_record_keeps_every_field() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let mut record = record_at("https://feeds.example.com/item", Some(Category::Rss), 5);
    record.author = Some("Ada".into());
    record.summary = Some("Short summary".into());
    record.published_at = Some(test_epoch() - TimeDelta::hours(2));
    record.tags = vec!["rust".into(), "async".into()];
    record.worker_id = Some("worker-1".into());
    record.task_id = Some(42);
    record
        .metadata
        .insert("search_term".into(), serde_json::json!("rust"));

    repo.upsert_records(std::slice::from_ref(&record))
        .await
        .unwrap();

    let stored = repo.get(&record.url).await.unwrap().unwrap();
    assert_eq!(stored, record);
    assert!(repo.get("https://missing.example.com").await.unwrap().is_none());
}

#[tokio::test]
async fn recent_orders_by_scrape_time_and_limits() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let records: Vec<_> = (0..5)
        .map(|i| record_at(&format!("https://news.example.com/{i}"), Some(Category::News), i))
        .collect();
    repo.upsert_records(&records).await.unwrap();

    let recent = RecordStore::recent(&repo, 3).await.unwrap();
    let urls: Vec<_> = recent.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://news.example.com/4",
            "https://news.example.com/3",
            "https://news.example.com/2",
        ]
    );
}

#[tokio::test]
async fn stats_group_by_category_and_source() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let mut records = vec![
        record_at("https://news.example.com/1", Some(Category::News), 0),
        record_at("https://news.example.com/2", Some(Category::News), 1),
        record_at("https://blog.example.com/1", Some(Category::Blog), 2),
        record_at("https://other.example.com/1", None, 3),
    ];
    records[0].source = Some("news.example.com".into());
    records[1].source = Some("news.example.com".into());
    records[2].source = Some("blog.example.com".into());
    records[3].source = None;
    repo.upsert_records(&records).await.unwrap();

    let stats = RecordStore::stats(&repo).await.unwrap();
    assert_eq!(stats.total_records, 4);
    assert_eq!(stats.by_category.get("news"), Some(&2));
    assert_eq!(stats.by_category.get("blog"), Some(&1));
    assert_eq!(stats.by_category.get("unclassified"), Some(&1));
    assert_eq!(
        stats.top_sources,
        vec![
            ("news.example.com".to_string(), 2),
            ("blog.example.com".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn url_is_unique_at_the_schema_level() {
    let (db, _dir) = setup_test_db().await;

    let insert = "INSERT INTO records (url, scraped_at) VALUES ('https://dup.example.com', '2024-05-01T00:00:00+00:00')";
    sqlx::query(insert).execute(db.pool()).await.unwrap();
    assert!(sqlx::query(insert).execute(db.pool()).await.is_err());
}

#[tokio::test]
async fn migrate_twice_and_health_check() {
    let (db, _dir) = setup_test_db().await;
    db.migrate().await.unwrap();
    db.record_repo().health_check().await.unwrap();
    assert_eq!(db.record_repo().count().await.unwrap(), 0);
}

#[tokio::test]
async fn search_matches_title_summary_and_tags() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let mut by_title = record_at("https://news.example.com/1", Some(Category::News), 0);
    by_title.title = "Inflation cools in April".into();
    let mut by_summary = record_at("https://news.example.com/2", Some(Category::News), 1);
    by_summary.summary = Some("Analysts expected INFLATION to rise".into());
    let mut by_tag = record_at("https://feeds.example.com/3", Some(Category::Rss), 2);
    by_tag.tags = vec!["inflation".into()];
    let unrelated = record_at("https://blog.example.com/4", Some(Category::Blog), 3);
    repo.upsert_records(&[by_title, by_summary, by_tag, unrelated])
        .await
        .unwrap();

    let hits = repo.search("Inflation", 10).await.unwrap();
    let urls: Vec<_> = hits.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://feeds.example.com/3",
            "https://news.example.com/2",
            "https://news.example.com/1",
        ]
    );

    assert_eq!(repo.search("inflation", 1).await.unwrap().len(), 1);
    assert!(repo.search("  ", 10).await.unwrap().is_empty());
    assert!(repo.search("deflation", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_treats_wildcards_literally() {
    let (db, _dir) = setup_test_db().await;
    let repo = db.record_repo();

    let mut sale = record_at("https://shop.example.com/1", Some(Category::Blog), 0);
    sale.title = "Everything 50% off".into();
    let mut plain = record_at("https://shop.example.com/2", Some(Category::Blog), 1);
    plain.title = "Everything 500 off".into();
    repo.upsert_records(&[sale, plain]).await.unwrap();

    let hits = repo.search("50%", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].url, "https://shop.example.com/1");
    assert!(repo.search("_", 10).await.unwrap().is_empty());
}
