mod support;

use chrono::{NaiveTime, TimeZone, Utc};
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::*;
use tender_scout::db::{self, NewRunOutcome};
use tender_scout::model::{PageType, RunStatus};
use tender_scout::scheduler::{Scheduler, SchedulerSettings};

fn settings(max_concurrent: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent,
        timezone: chrono_tz::Asia::Kolkata,
        daily_at: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        log_retention_days: 30,
        shutdown_grace: Duration::from_secs(5),
        maintenance_interval: Duration::from_secs(300),
        max_idle: Duration::from_secs(600),
    }
}

fn scheduler(h: &Harness, max_concurrent: usize) -> Scheduler {
    Scheduler::new(h.db.clone(), h.pool.clone(), h.runner.clone(), settings(max_concurrent))
}

fn one_row_table(title: &str) -> String {
    table_page(&[[title, "Chennai", "02-06-2025", "16-06-2025"]])
}

#[tokio::test]
async fn sweep_never_exceeds_the_concurrency_bound() {
    let h = harness_with(vec![], 4, 4).await;
    for i in 0..5 {
        let url = format!("https://site{i}.example/tenders");
        h.site.serve(
            &url,
            Page::ok(one_row_table(&format!("Tender {i}"))).slow(Duration::from_millis(150)),
        );
        add_source(&h.db, &url, PageType::Table, 24).await;
    }

    let report = scheduler(&h, 2).full_sweep().await.unwrap();
    assert_eq!(report.dispatched, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.records_new, 5);
    assert_eq!(h.site.peak(), 2);
}

#[tokio::test]
async fn tick_runs_only_sources_due_this_local_hour() {
    let h = harness(vec![]).await;
    let mut ids = Vec::new();
    for frequency in [1, 6, 24, 5] {
        let url = format!("https://every{frequency}.example/");
        h.site.serve(&url, Page::ok(one_row_table("Bridge repair")));
        ids.push(add_source(&h.db, &url, PageType::Table, frequency).await);
    }

    // 00:30 UTC is 06:00 in Kolkata.
    let at = Utc.with_ymd_and_hms(2025, 6, 2, 0, 30, 0).unwrap();
    let report = scheduler(&h, 3).tick(at).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(h.site.navigations.load(Ordering::SeqCst), 2);

    let ran: Vec<bool> = {
        let mut ran = Vec::new();
        for id in &ids {
            let source = db::get_source(&h.db, *id).await.unwrap().unwrap();
            ran.push(source.last_scraped_at.is_some());
        }
        ran
    };
    assert_eq!(ran, vec![true, true, false, false]);
}

#[tokio::test]
async fn inactive_sources_are_skipped() {
    let h = harness(vec![]).await;
    let url = "https://paused.example/";
    h.site.serve(url, Page::ok(one_row_table("Paused")));
    let id = add_source(&h.db, url, PageType::Table, 1).await;
    assert!(db::deactivate_source(&h.db, id).await.unwrap());
    assert!(!db::deactivate_source(&h.db, 999).await.unwrap());

    let s = scheduler(&h, 2);
    let report = s.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert!(!s.run_source_now(id).await.unwrap());
    assert!(!s.run_source_now(999).await.unwrap());
    assert_eq!(h.site.navigations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn run_source_now_records_an_outcome() {
    let h = harness(vec![]).await;
    let url = "https://now.example/";
    h.site.serve(url, Page::ok(one_row_table("Immediate")));
    let id = add_source(&h.db, url, PageType::Table, 24).await;

    assert!(scheduler(&h, 1).run_source_now(id).await.unwrap());
    let since = Utc::now() - chrono::Duration::minutes(5);
    let outcomes = db::recent_run_outcomes(&h.db, Some(id), since, 5).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, RunStatus::Success);

    let counts = db::run_status_counts(&h.db, since).await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].runs, 1);
    assert_eq!(counts[0].records_new, 1);
}

#[tokio::test]
async fn retention_prune_removes_only_old_rows() {
    let h = harness(vec![]).await;
    let id = add_source(&h.db, "https://old.example/", PageType::Table, 24).await;
    for days_ago in [90, 45, 1] {
        db::record_run_outcome(
            &h.db,
            &NewRunOutcome {
                source_id: id,
                ran_at: Utc::now() - chrono::Duration::days(days_ago),
                status: RunStatus::Error,
                records_found: 0,
                records_new: 0,
                error_detail: Some("navigation failed: HTTP 500".into()),
                duration_ms: 12,
                payload_bytes: 0,
            },
        )
        .await
        .unwrap();
    }

    let removed = scheduler(&h, 1).prune_run_log().await.unwrap();
    assert_eq!(removed, 2);
    let since = Utc::now() - chrono::Duration::days(365);
    assert_eq!(db::recent_run_outcomes(&h.db, None, since, 10).await.unwrap().len(), 1);

    let source = db::get_source(&h.db, id).await.unwrap().unwrap();
    assert_eq!(source.error_count, 3);
}

#[tokio::test]
async fn stop_shuts_the_pool_down() {
    let h = harness(vec![]).await;
    h.pool.warm_up(1).await.unwrap();
    let s = scheduler(&h, 2);
    s.start();
    assert_eq!(s.pool_stats().await.instances, 1);

    s.stop().await;
    assert_eq!(s.pool_stats().await.instances, 0);
    assert!(h.pool.acquire(Duration::from_millis(50)).await.is_err());
}
