mod common;

use coachly_sw_protocol::{
    ClientMessage, Destination, FetchRequest, HttpMethod, QueuedBody, RequestMode, ResponseSource,
    SyncStatus,
};
use common::{activated_worker, url};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use sw_core::{parse_location, www_redirect, PRECACHE_NAME};

#[test]
fn auth_responses_are_never_cached() {
    let harness = activated_worker();
    let me = url("/api/auth/me");

    let response = harness
        .worker
        .handle_fetch(FetchRequest::get(me.clone()))
        .expect("online fetch");
    assert_eq!(response.source, ResponseSource::Network);

    for name in harness.worker.routes().cache_names() {
        assert_eq!(
            harness.worker.storage().entry_count(&name).expect("count"),
            0,
            "cache {} should be empty",
            name
        );
    }

    harness.backend.set_offline(true);
    assert!(harness.worker.handle_fetch(FetchRequest::get(me)).is_err());

    let login = FetchRequest::get(url("/login")).with_mode(RequestMode::Navigate);
    assert!(harness.worker.handle_fetch(login).is_err());
}

#[test]
fn course_content_is_served_stale_then_refreshed() {
    let harness = activated_worker();
    let lesson = url("/api/courses/7/lessons/3");
    harness.backend.respond(&lesson, 200, "lesson-v1");
    harness
        .worker
        .handle_fetch(FetchRequest::get(lesson.clone()))
        .expect("prime cache");

    harness.backend.respond(&lesson, 200, "lesson-v2");
    harness.backend.set_delay(Some(Duration::from_millis(300)));

    let started = Instant::now();
    let handled = harness
        .worker
        .dispatch(FetchRequest::get(lesson.clone()))
        .expect("stale hit");
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(handled.response.body_text(), "lesson-v1");
    assert_eq!(handled.response.source, ResponseSource::Cache);

    handled
        .revalidation
        .expect("background refresh")
        .join()
        .expect("refresh thread");
    harness.backend.set_delay(None);

    let next = harness
        .worker
        .dispatch(FetchRequest::get(lesson))
        .expect("refreshed hit");
    assert_eq!(next.response.body_text(), "lesson-v2");
    if let Some(revalidation) = next.revalidation {
        revalidation.join().expect("refresh thread");
    }
}

#[test]
fn failed_mutations_are_queued_with_unique_tags() {
    let harness = activated_worker();
    harness.backend.set_offline(true);
    let worker = Arc::new(harness.worker);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                let request = FetchRequest::new(HttpMethod::Post, url("/api/promo-codes"))
                    .with_header("content-type", "application/json")
                    .with_body(format!(r#"{{"code":"PROMO{}"}}"#, i));
                worker.handle_fetch(request).expect("queued response")
            })
        })
        .collect();

    let mut tags = Vec::new();
    for handle in handles {
        let response = handle.join().expect("request thread");
        assert_eq!(response.status, 202);
        assert_eq!(response.source, ResponseSource::Queued);
        let body: QueuedBody = serde_json::from_slice(&response.body).expect("queued body");
        assert!(body.queued);
        assert!(!body.tag.is_empty());
        tags.push(body.tag);
    }

    tags.sort();
    tags.dedup();
    assert_eq!(tags.len(), 8);
    assert_eq!(worker.queue_summaries().len(), 8);
}

#[test]
fn concurrent_cacheable_fetches_are_all_stored() {
    let harness = activated_worker();
    let worker = Arc::new(harness.worker);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                for i in 0..10 {
                    let api = FetchRequest::get(url(&format!("/api/plans/{}-{}", t, i)));
                    let response = worker.handle_fetch(api).expect("api fetch");
                    assert_eq!(response.source, ResponseSource::Network);

                    let dashboard = FetchRequest::get(url(&format!("/dashboard/widgets/{}-{}", t, i)));
                    worker.handle_fetch(dashboard).expect("dashboard fetch");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("request thread");
    }

    let storage = worker.storage();
    let api_keys = storage.keys("api-cache").expect("api keys");
    assert_eq!(api_keys.len(), 80);
    for t in 0..8 {
        for i in 0..10 {
            assert!(api_keys.contains(&url(&format!("/api/plans/{}-{}", t, i))));
        }
    }
    // 80 distinct dashboard responses against a 50-entry bound.
    assert_eq!(storage.entry_count("dashboard-cache").expect("dashboard count"), 50);
}

#[test]
fn error_status_is_returned_not_queued() {
    let harness = activated_worker();
    let endpoint = url("/api/students");
    harness.backend.respond(&endpoint, 500, "server error");

    let response = harness
        .worker
        .handle_fetch(FetchRequest::new(HttpMethod::Put, endpoint).with_body("{}"))
        .expect("response");
    assert_eq!(response.status, 500);
    assert!(!harness.worker.has_pending_sync());
}

#[test]
fn successful_replay_notifies_each_client_once() {
    let harness = activated_worker();
    let (_first, first_rx) = harness.worker.subscribe();
    let (_second, second_rx) = harness.worker.subscribe();

    harness.backend.set_offline(true);
    let response = harness
        .worker
        .handle_fetch(FetchRequest::new(HttpMethod::Delete, url("/api/courses/9")))
        .expect("queued");
    let tag = serde_json::from_slice::<QueuedBody>(&response.body)
        .expect("queued body")
        .tag;

    harness.backend.set_offline(false);
    let report = harness.worker.handle_sync(&tag);
    assert_eq!(report.status, SyncStatus::Succeeded);
    assert!(!harness.worker.has_pending_sync());

    let expected = ClientMessage::SyncSuccess { tag: tag.clone() };
    assert_eq!(first_rx.try_recv().expect("first client"), expected);
    assert_eq!(second_rx.try_recv().expect("second client"), expected);
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());

    assert_eq!(harness.worker.handle_sync(&tag).status, SyncStatus::Missing);
    assert!(first_rx.try_recv().is_err());
    assert_eq!(harness.backend.requests_to(&url("/api/courses/9")), 2);
}

#[test]
fn failed_replay_keeps_request_and_reports_error() {
    let harness = activated_worker();
    let (_client, rx) = harness.worker.subscribe();

    harness.backend.set_offline(true);
    harness
        .worker
        .handle_fetch(FetchRequest::new(HttpMethod::Patch, url("/api/profile")).with_body("{}"))
        .expect("queued");

    let reports = harness.worker.sync_all();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, SyncStatus::Failed);
    match rx.try_recv().expect("failure message") {
        ClientMessage::SyncFailed { tag, error } => {
            assert_eq!(tag, reports[0].tag);
            assert!(error.contains("connection refused"));
        }
        other => panic!("unexpected message: {:?}", other),
    }

    let queued = harness.worker.queue_summaries();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 1);

    harness.backend.set_offline(false);
    assert_eq!(harness.worker.sync_all()[0].status, SyncStatus::Succeeded);
    assert!(harness.worker.queue_summaries().is_empty());
}

#[test]
fn www_redirect_preserves_location() {
    let location = parse_location("www.example.com/foo?x=1#y").expect("location");
    let target = www_redirect(&location).expect("redirect");
    assert_eq!(target.as_str(), "https://example.com/foo?x=1#y");
}

#[test]
fn static_cache_evicts_least_recently_used_entry() {
    let harness = activated_worker();
    let script = |i: usize| {
        FetchRequest::get(url(&format!("/assets/chunk-{}.js", i)))
            .with_destination(Destination::Script)
    };

    for i in 0..60 {
        harness.worker.handle_fetch(script(i)).expect("fill");
    }
    // Touch the oldest entry so the second one becomes least recently used.
    let hit = harness.worker.handle_fetch(script(0)).expect("hit");
    assert_eq!(hit.source, ResponseSource::Cache);

    harness.worker.handle_fetch(script(60)).expect("61st entry");

    let keys = harness
        .worker
        .storage()
        .keys("static-resources")
        .expect("keys");
    assert_eq!(keys.len(), 60);
    assert!(keys.contains(&url("/assets/chunk-0.js")));
    assert!(!keys.contains(&url("/assets/chunk-1.js")));
    assert!(keys.contains(&url("/assets/chunk-60.js")));
}

#[test]
fn navigation_is_answered_with_precached_shell_offline() {
    let harness = activated_worker();
    harness.backend.set_offline(true);

    let response = harness
        .worker
        .handle_fetch(FetchRequest::get(url("/students/42")).with_mode(RequestMode::Navigate))
        .expect("shell");
    assert_eq!(response.source, ResponseSource::Precache);
    assert_eq!(response.body_text(), format!("body:{}", url("/index.html")));
    assert_eq!(
        harness.worker.storage().entry_count(PRECACHE_NAME).expect("count"),
        1
    );
}

#[test]
fn dashboard_falls_back_to_cache_when_offline() {
    let harness = activated_worker();
    let dashboard = url("/api/instructor/dashboard");
    harness
        .worker
        .handle_fetch(FetchRequest::get(dashboard.clone()))
        .expect("prime");

    harness.backend.set_offline(true);
    let response = harness
        .worker
        .handle_fetch(FetchRequest::get(dashboard))
        .expect("cached");
    assert_eq!(response.source, ResponseSource::Cache);
}
