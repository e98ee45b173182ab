//! HTTP control surface tests, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use outreach_dispatch::alerts::AlertBus;
use outreach_dispatch::api::control_routes;
use outreach_dispatch::approval::{Approval, ApprovalStatus, ApprovalStore, InMemoryApprovalStore};
use outreach_dispatch::browser::{
    ArtifactKind, BrowserContext, BrowserDriver, InMemoryJobStore, Orchestrator, TaskStep,
};
use outreach_dispatch::channels::{AdapterRegistry, ChannelAdapter, Cleared, SendOutcome};
use outreach_dispatch::config::{OrchestratorConfig, RetryConfig, RouterConfig};
use outreach_dispatch::error::DriverError;
use outreach_dispatch::ledger::InMemoryLedger;
use outreach_dispatch::policy::{InMemoryRateCounter, PolicyRules, StaticDncSource};
use outreach_dispatch::router::{Router, RouterDeps};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver whose pages load but whose elements never respond, so jobs stay
/// RUNNING until cancelled.
struct StalledDriver;

#[async_trait]
impl BrowserDriver for StalledDriver {
    async fn open_context(&self, _profile: &str) -> Result<Box<dyn BrowserContext>, DriverError> {
        Ok(Box::new(StalledPage))
    }
}

struct StalledPage;

#[async_trait]
impl BrowserContext for StalledPage {
    async fn navigate(&mut self, _url: &str) -> Result<(), DriverError> {
        Ok(())
    }
    async fn perform(&mut self, _step: &TaskStep, _locator: &str) -> Result<Option<String>, DriverError> {
        std::future::pending().await
    }
    fn current_url(&self) -> Option<String> {
        None
    }
    async fn detect_gate(&mut self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }
    async fn dismiss_interstitials(&mut self) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }
    async fn reload(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
    async fn capture(&mut self, kind: ArtifactKind) -> Result<String, DriverError> {
        Ok(kind.to_string())
    }
    async fn close(&mut self) {}
}

struct AlwaysSent;

#[async_trait]
impl ChannelAdapter for AlwaysSent {
    fn name(&self) -> &str {
        "email"
    }
    async fn send(&self, _cleared: &Cleared) -> SendOutcome {
        SendOutcome::Sent
    }
}

struct App {
    routes: axum::Router,
    approvals: Arc<InMemoryApprovalStore>,
}

fn app() -> App {
    let approvals = Arc::new(InMemoryApprovalStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let alerts = AlertBus::new();

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            step_timeout_secs: 60,
            ..OrchestratorConfig::default()
        },
        Arc::new(StalledDriver),
        Arc::new(InMemoryJobStore::new()),
        ledger.clone(),
        alerts.clone(),
    );
    let deps = RouterDeps {
        store: approvals.clone(),
        ledger,
        counters: Arc::new(InMemoryRateCounter::new()),
        dnc: Arc::new(StaticDncSource::default()),
        adapters: AdapterRegistry::new().with(Arc::new(AlwaysSent)),
        alerts,
    };
    let router = Router::new(
        deps,
        PolicyRules::permissive(),
        RetryConfig::default(),
        RouterConfig::default(),
    )
    .with_job_tracker(Arc::new(orchestrator.clone()));

    App {
        routes: control_routes(orchestrator, Arc::new(router)),
        approvals,
    }
}

async fn call(app: &App, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.routes.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn submit(app: &App) -> Uuid {
    let spec = json!({
        "url": "https://example.com/inbox",
        "steps": [{ "action": "click", "locator": { "primary": "#compose" } }]
    });
    let (status, body) = call(app, "POST", "/jobs", Some(spec)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["job_id"].as_str().unwrap().parse().unwrap()
}

async fn wait_for_state(app: &App, id: Uuid, state: &str) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let (_, body) = call(app, "GET", &format!("/jobs/{id}"), None).await;
            if body["state"] == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {state}"));
}

async fn seed(app: &App, status: ApprovalStatus) -> Approval {
    let approval = Approval::new("email", "alice@example.com", json!({ "body": "hi" }))
        .with_status(status);
    app.approvals.insert(&approval).await.unwrap();
    approval
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["live_jobs"], 0);
}

#[tokio::test]
async fn submitted_job_is_visible_and_cancellable() {
    let app = app();
    let id = submit(&app).await;

    let (status, body) = call(&app, "GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.to_string());

    wait_for_state(&app, id, "RUNNING").await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/jobs/{id}/cancel"),
        Some(json!({ "reason": "wrong recipient" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_state(&app, id, "CANCELLED").await;

    // Terminal jobs refuse further control.
    let (status, _) = call(&app, "POST", &format!("/jobs/{id}/cancel"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = call(&app, "POST", &format!("/jobs/{id}/resume"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_job_spec_is_bad_request() {
    let app = app();
    let (status, body) = call(&app, "POST", "/jobs", Some(json!({ "url": "not a url" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid url"));
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let app = app();
    let (status, _) = call(&app, "GET", &format!("/jobs/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "GET", "/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid ID");

    let (status, _) = call(&app, "POST", &format!("/approvals/{}/confirm", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_confirmation_completes_opened_approval() {
    let app = app();
    let opened = seed(&app, ApprovalStatus::ApprovedOpened).await;

    let (status, body) = call(&app, "POST", &format!("/approvals/{}/confirm", opened.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "sent_manual");

    let (status, _) = call(&app, "POST", &format!("/approvals/{}/confirm", opened.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn manual_failure_records_reason() {
    let app = app();
    let opened = seed(&app, ApprovalStatus::ApprovedOpened).await;

    let (status, body) = call(
        &app,
        "POST",
        &format!("/approvals/{}/fail", opened.id),
        Some(json!({ "reason": "form rejected the message" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["last_error"], "form rejected the message");

    // Only opened approvals can be finished manually.
    let approved = seed(&app, ApprovalStatus::Approved).await;
    let (status, _) = call(
        &app,
        "POST",
        &format!("/approvals/{}/fail", approved.id),
        Some(json!({ "reason": "n/a" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn drain_runs_one_batch() {
    let app = app();
    let a = seed(&app, ApprovalStatus::Approved).await;
    seed(&app, ApprovalStatus::Approved).await;

    let (status, body) = call(&app, "POST", "/dispatch/drain?max_batch=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["sent"], 1);
    assert_eq!(body["reconciled"], 0);

    let (_, body) = call(&app, "POST", "/dispatch/drain", None).await;
    assert_eq!(body["report"]["sent"], 1);

    let stored = app.approvals.get(a.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Sent);
}
