mod helpers;

use docproc_agent::models::job::{JobPayload, JobStatus, SummaryOptions};
use docproc_agent::models::webhook::{DeliveryStatus, WebhookEvent};
use docproc_agent::services::webhooks::{verify_signature, SIGNATURE_HEADER};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use helpers::{spawn_app, wait_for_deliveries};

#[tokio::test]
async fn status_after_enqueue_is_never_unknown() {
    let app = spawn_app("A short summary.").await;
    app.add_processed_document("doc_1", "Mitochondria are the powerhouse of the cell.")
        .await;

    for _ in 0..5 {
        let id = app
            .queue
            .enqueue(JobPayload::GenerateSummary {
                document_id: "doc_1".to_string(),
                options: SummaryOptions::default(),
            })
            .await
            .unwrap();
        let status = app.queue.status(id).await.unwrap();
        assert!(
            matches!(status, JobStatus::Waiting | JobStatus::Active | JobStatus::Completed),
            "unexpected status {}",
            status
        );
        assert_ne!(status, JobStatus::Unknown);
    }
}

#[tokio::test]
async fn concurrent_enqueues_get_distinct_ids() {
    let app = spawn_app("A short summary.").await;
    app.add_processed_document("doc_1", "Ribosomes assemble proteins.")
        .await;

    let submissions = (0..20).map(|_| {
        app.queue.enqueue(JobPayload::GenerateSummary {
            document_id: "doc_1".to_string(),
            options: SummaryOptions::default(),
        })
    });
    let ids: Vec<Uuid> = futures::future::try_join_all(submissions).await.unwrap();
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 20);

    for id in ids {
        let result = app
            .queue
            .wait_for_result(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
    }
    assert_eq!(app.queue.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn never_issued_ids_are_unknown() {
    let app = spawn_app("unused").await;
    for _ in 0..10 {
        let id = Uuid::new_v4();
        assert_eq!(app.queue.status(id).await.unwrap(), JobStatus::Unknown);
        assert!(app.queue.result(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn extracting_missing_document_fails_and_emits_document_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let app = spawn_app("unused").await;
    let hook = app
        .webhooks
        .register(
            format!("{}/hooks", server.uri()),
            vec![WebhookEvent::DocumentFailed, WebhookEvent::JobFailed],
            None,
        )
        .await;

    let id = app
        .queue
        .enqueue(JobPayload::ExtractDocument {
            document_id: "doc_without_text".to_string(),
        })
        .await
        .unwrap();

    let result = app
        .queue
        .wait_for_result(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("not found"), "error was {}", error);
    assert_eq!(app.queue.status(id).await.unwrap(), JobStatus::Failed);

    let deliveries =
        wait_for_deliveries(&app.webhooks, &hook.webhook.id, 2, Duration::from_secs(5)).await;
    let mut events: Vec<WebhookEvent> = deliveries.iter().map(|d| d.event).collect();
    events.sort_by_key(|e| e.to_string());
    assert_eq!(events, vec![WebhookEvent::DocumentFailed, WebhookEvent::JobFailed]);

    let received = server.received_requests().await.unwrap();
    let document_failed = received
        .iter()
        .find(|r| {
            r.headers
                .get("x-webhook-event")
                .is_some_and(|v| v == "document.failed")
        })
        .expect("document.failed delivery");
    let body: Value = serde_json::from_slice(&document_failed.body).unwrap();
    assert_eq!(body["data"]["documentId"], "doc_without_text");
    assert_eq!(body["data"]["status"], "failed");
}

#[tokio::test]
async fn completed_job_delivers_exactly_once_to_subscriber() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("x-webhook-event", "job.completed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let app = spawn_app("unused").await;
    app.add_text_document("doc_lecture", "Enzymes lower activation energy.")
        .await;
    let hook = app
        .webhooks
        .register(
            format!("{}/hooks", server.uri()),
            vec![WebhookEvent::JobCompleted],
            None,
        )
        .await;

    let id = app
        .queue
        .enqueue(JobPayload::ExtractDocument {
            document_id: "doc_lecture".to_string(),
        })
        .await
        .unwrap();
    let result = app
        .queue
        .wait_for_result(id, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.unwrap()["wordCount"], 4);

    let deliveries =
        wait_for_deliveries(&app.webhooks, &hook.webhook.id, 1, Duration::from_secs(5)).await;
    // Give a stray duplicate the chance to show up before asserting on count.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let deliveries_after = app.webhooks.deliveries(Some(&hook.webhook.id), 50).await;
    assert_eq!(deliveries_after.len(), 1);

    let delivery = &deliveries[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.status_code, Some(200));
    assert_eq!(delivery.attempt, 1);
    assert_eq!(delivery.event, WebhookEvent::JobCompleted);

    let webhook = app.webhooks.get(&hook.webhook.id).await.unwrap();
    assert!(webhook.last_triggered.is_some());

    let received = server.received_requests().await.unwrap();
    let request = &received[0];
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(&hook.secret, &request.body, signature));

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "job.completed");
    assert_eq!(body["webhookId"], hook.webhook.id.as_str());
    assert_eq!(body["data"]["jobId"], id.to_string());
    assert_eq!(body["data"]["type"], "extract_document");
}

#[tokio::test]
async fn webhook_failure_does_not_change_job_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let app = spawn_app("A tidy summary.").await;
    app.add_processed_document("doc_1", "Photosynthesis happens in chloroplasts.")
        .await;
    app.webhooks
        .register(server.uri(), vec![WebhookEvent::JobCompleted], None)
        .await;

    let id = app
        .queue
        .enqueue(JobPayload::GenerateSummary {
            document_id: "doc_1".to_string(),
            options: SummaryOptions::default(),
        })
        .await
        .unwrap();
    let result = app
        .queue
        .wait_for_result(id, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(result.success);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(app.queue.status(id).await.unwrap(), JobStatus::Completed);
}

/// Needs a Redis server; reads REDIS_HOST/REDIS_PORT like the service does.
#[tokio::test]
#[ignore] // Run with: cargo test --test queue_test -- --ignored
async fn redis_backend_runs_jobs() {
    use docproc_agent::config::AppConfig;
    use docproc_agent::services::queue::{JobQueue, QueueBackendKind, QueueSettings};
    use std::sync::Arc;

    let config = AppConfig::from_env().expect("Failed to load config");
    let app = spawn_app("Redis summary.").await;
    app.add_processed_document("doc_1", "Redis keeps jobs across restarts.")
        .await;

    let executor = Arc::new(docproc_agent::services::executor::DocumentJobExecutor::new(
        app.documents.clone(),
        Arc::new(docproc_agent::services::documents::PlainTextExtractor),
        app.llm.clone(),
        app.cache.clone(),
        app.webhooks.clone(),
        60,
    ));
    let queue = JobQueue::connect(
        &config.broker(),
        QueueSettings {
            worker_concurrency: 2,
            result_ttl: Duration::from_secs(60),
        },
        executor,
        app.webhooks.clone(),
    )
    .await;
    assert_eq!(queue.backend_kind(), QueueBackendKind::Redis);

    let id = queue
        .enqueue(JobPayload::GenerateSummary {
            document_id: "doc_1".to_string(),
            options: SummaryOptions::default(),
        })
        .await
        .unwrap();
    assert_ne!(queue.status(id).await.unwrap(), JobStatus::Unknown);

    let result = queue.wait_for_result(id, Duration::from_secs(10)).await.unwrap();
    assert!(result.success);
    assert_eq!(queue.status(id).await.unwrap(), JobStatus::Completed);
    queue.close().await;
}

/// A job claimed by a process that stopped before starting it is picked up
/// again when the queue next connects. Needs a Redis server.
#[tokio::test]
#[ignore] // Run with: cargo test --test queue_test -- --ignored
async fn redis_claim_left_by_previous_process_is_requeued() {
    use docproc_agent::config::AppConfig;
    use docproc_agent::models::job::Job;
    use docproc_agent::services::broker;
    use docproc_agent::services::queue::{JobQueue, QueueBackendKind, QueueSettings};
    use redis::AsyncCommands;
    use std::sync::Arc;

    let config = AppConfig::from_env().expect("Failed to load config");
    let app = spawn_app("Recovered summary.").await;
    app.add_processed_document("doc_1", "Claims survive restarts.")
        .await;

    let job = Job::new(JobPayload::GenerateSummary {
        document_id: "doc_1".to_string(),
        options: SummaryOptions::default(),
    });
    let mut conn = broker::connect(&config.broker()).await.unwrap();
    let _: () = conn
        .set(
            format!("docproc:job:{}", job.id),
            serde_json::to_string(&job).unwrap(),
        )
        .await
        .unwrap();
    let _: () = conn
        .lpush("docproc:jobs:processing", job.id.to_string())
        .await
        .unwrap();

    let executor = Arc::new(docproc_agent::services::executor::DocumentJobExecutor::new(
        app.documents.clone(),
        Arc::new(docproc_agent::services::documents::PlainTextExtractor),
        app.llm.clone(),
        app.cache.clone(),
        app.webhooks.clone(),
        60,
    ));
    let queue = JobQueue::connect(
        &config.broker(),
        QueueSettings::default(),
        executor,
        app.webhooks.clone(),
    )
    .await;
    assert_eq!(queue.backend_kind(), QueueBackendKind::Redis);

    let result = queue
        .wait_for_result(job.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(result.success);

    let still_claimed: Vec<String> = conn.lrange("docproc:jobs:processing", 0, -1).await.unwrap();
    assert!(!still_claimed.contains(&job.id.to_string()));
    queue.close().await;
}
