//! End-to-end ingestion through a real adapter.
//!
//! A mock Twilio API serves the inbox and accepts replies. Polls run
//! through the supervisor so the full path is exercised: fetch, dedup,
//! sensitivity routing, reply and audit log.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use mockable::{Clock, DefaultClock};
use secrecy::SecretString;
use serde_json::json;

use taskdesk::channels::http::RetryPolicy;
use taskdesk::channels::whatsapp::WhatsAppConfig;
use taskdesk::channels::{ChannelDeps, ChannelKind, Ingestor, PollSupervisor, WhatsAppAdapter};
use taskdesk::config::LifecycleConfig;
use taskdesk::store::{Database, LibSqlBackend};
use taskdesk::tasks::TaskEngine;
use taskdesk::tasks::model::{LogFilter, Page, TaskFilter, TaskStatus};

struct Harness {
    engine: Arc<TaskEngine>,
    supervisor: PollSupervisor,
}

async fn harness(api_base: &str, auto_reply: bool) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let engine = Arc::new(
        TaskEngine::new(Arc::clone(&db), Arc::clone(&clock), LifecycleConfig::default())
            .await
            .unwrap(),
    );
    let deps = ChannelDeps::new(db, clock, reqwest::Client::new()).with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
    });
    let adapter = WhatsAppAdapter::new(
        WhatsAppConfig {
            account_sid: "AC42".into(),
            auth_token: SecretString::from("twilio-token".to_string()),
            from_number: "+15550001".into(),
            api_base: api_base.to_string(),
            page_size: 20,
            poll_interval: Duration::from_secs(3600),
            auto_reply,
            webhook_url: None,
        },
        deps,
    );

    // The hour-long interval keeps the loop's own first cycle the only
    // background poll; every other cycle is driven by `poll_now`.
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&engine)));
    let mut supervisor = PollSupervisor::new(ingestor, Duration::from_secs(2));
    supervisor.spawn_channel(Arc::new(adapter));
    Harness { engine, supervisor }
}

async fn wait_for_tasks(engine: &TaskEngine, n: u64) {
    for _ in 0..200 {
        let (_, total) = engine
            .list_tasks(&TaskFilter::default(), Page::default())
            .await
            .unwrap();
        if total >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} tasks");
}

async fn wait_for_log(engine: &TaskEngine, action: &str, n: usize) {
    let filter = LogFilter {
        action: Some(action.to_string()),
        ..LogFilter::default()
    };
    for _ in 0..200 {
        let logs = engine.list_logs(&filter, Page::default()).await.unwrap();
        if logs.len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} {action} log rows");
}

fn inbox() -> serde_json::Value {
    json!({
        "messages": [
            {"sid": "SM2", "from": "whatsapp:+1999", "direction": "inbound",
             "body": "Please reset the admin password and share the credential",
             "date_created": "Mon, 02 Mar 2026 09:05:00 +0000"},
            {"sid": "SM1", "from": "whatsapp:+1888", "direction": "inbound",
             "body": "Can you send me the meeting notes from Friday?",
             "date_created": "Mon, 02 Mar 2026 09:00:00 +0000"}
        ]
    })
}

#[tokio::test]
async fn polled_messages_become_routed_tasks_once() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Accounts/AC42/Messages.json");
            then.status(200).json_body(inbox());
        })
        .await;
    let replies = server
        .mock_async(|when, then| {
            when.method(POST).path("/Accounts/AC42/Messages.json");
            then.status(201).json_body(json!({"sid": "SMreply"}));
        })
        .await;

    let h = harness(&server.base_url(), true).await;
    // The loop's first cycle replies after each commit: an acknowledgement
    // for the routine message, an approval notice for the held one.
    wait_for_log(&h.engine, "auto_reply_sent", 1).await;
    wait_for_log(&h.engine, "approval_required", 1).await;

    let filter = TaskFilter {
        source: Some("whatsapp".into()),
        ..TaskFilter::default()
    };
    let (tasks, total) = h.engine.list_tasks(&filter, Page::default()).await.unwrap();
    assert_eq!(total, 2);

    let notes = tasks
        .iter()
        .find(|t| t.title == "[WhatsApp] Message from whatsapp:+1888")
        .unwrap();
    assert_eq!(notes.status, TaskStatus::InProgress);
    assert!(notes.sla_deadline.is_some());

    let reset = tasks
        .iter()
        .find(|t| t.title == "[WhatsApp] Message from whatsapp:+1999")
        .unwrap();
    assert_eq!(reset.status, TaskStatus::AwaitingApproval);

    // A second cycle sees the same inbox and creates nothing.
    let summary = h
        .supervisor
        .poll_now(ChannelKind::WhatsApp)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(summary.errors, 0);

    replies.assert_hits_async(2).await;

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn approving_a_held_message_moves_it_on() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Accounts/AC42/Messages.json");
            then.status(200).json_body(inbox());
        })
        .await;

    let h = harness(&server.base_url(), false).await;
    wait_for_tasks(&h.engine, 2).await;

    let held = TaskFilter {
        status: Some(TaskStatus::AwaitingApproval),
        ..TaskFilter::default()
    };
    let (tasks, _) = h.engine.list_tasks(&held, Page::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);

    let approved = h
        .engine
        .approve(tasks[0].id, "caller verified by phone", "supervisor")
        .await
        .unwrap();
    assert_eq!(approved.status, TaskStatus::Approved);

    let approvals = h.engine.list_approvals(Some(tasks[0].id)).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].decided_by, "supervisor");

    let done = h.engine.complete(tasks[0].id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn provider_outage_creates_nothing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Accounts/AC42/Messages.json");
            then.status(503);
        })
        .await;

    let h = harness(&server.base_url(), true).await;
    let result = h
        .supervisor
        .poll_now(ChannelKind::WhatsApp)
        .await
        .unwrap();
    assert!(result.is_err());

    let (_, total) = h
        .engine
        .list_tasks(&TaskFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(total, 0);

    h.supervisor.shutdown().await;
}
