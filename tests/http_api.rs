//! HTTP surface tests: the axum router over the in-memory backends,
//! driven through a real listener with reqwest.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use berth::api;
use berth::lock::{LockService, MemoryLockService};
use berth::model::Role;
use berth::queue::{JobQueue, MemoryJobQueue};
use berth::scheduler::{RetryPolicy, SchedulerWorker, SchedulerWorkerConfig};
use berth::state::AppState;
use berth::store::{MemoryStore, Store};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryJobQueue>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());

        let org_id = store.add_org("acme");
        store.add_user("admin@acme.test", org_id, Role::Admin);
        store.add_user("dev@acme.test", org_id, Role::Developer);
        store.add_user("dev2@acme.test", org_id, Role::Developer);

        let other_org = store.add_org("rival");
        store.add_user("admin@rival.test", other_org, Role::Admin);

        let state = AppState::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
        );
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            store,
            queue,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn as_user(&self, builder: reqwest::RequestBuilder, email: &str) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer user:{email}"))
    }

    async fn create_cluster(&self, email: &str, name: &str, cpu: i64, ram: i64, gpu: i64) -> i64 {
        let resp = self
            .as_user(self.client.post(self.url("/clusters")), email)
            .json(&serde_json::json!({ "name": name, "cpu": cpu, "ram": ram, "gpu": gpu }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        resp.json::<serde_json::Value>().await.unwrap()["id"]
            .as_i64()
            .unwrap()
    }

    /// One scheduler worker draining the queue, as the worker process
    /// would.
    async fn run_worker_until_idle(&self) {
        let worker = SchedulerWorker::new(
            Arc::clone(&self.store) as Arc<dyn Store>,
            Arc::clone(&self.queue) as Arc<dyn JobQueue>,
            Arc::new(MemoryLockService::new()) as Arc<dyn LockService>,
            SchedulerWorkerConfig {
                queue_visibility: Duration::from_millis(200),
                lock_ttl: Duration::from_millis(1_000),
                poll_interval: Duration::from_millis(10),
                retry: RetryPolicy {
                    base: Duration::from_millis(20),
                    cap: Duration::from_millis(100),
                    preempt_requeue_delay: Duration::from_millis(20),
                    max_attempts: 20,
                },
            },
        );
        while worker.run_cycle().await.unwrap() {}
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = server.client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["components"]["store"]["status"], "ok");
    assert_eq!(body["components"]["queue"]["status"], "ok");
}

#[tokio::test]
async fn test_requests_carry_request_id_header() {
    let server = TestServer::start().await;
    let resp = server.client.get(server.url("/healthz")).send().await.unwrap();
    let request_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(!request_id.is_empty());
}

#[tokio::test]
async fn test_authentication_is_required() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .get(server.url("/deployments"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Unknown identities are rejected.
    let resp = server
        .as_user(
            server.client.get(server.url("/deployments")),
            "ghost@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // Malformed bearer tokens are rejected outright.
    let resp = server
        .client
        .get(server.url("/deployments"))
        .header("Authorization", "Bearer whatever")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn test_cluster_creation_is_admin_only() {
    let server = TestServer::start().await;

    let resp = server
        .as_user(server.client.post(server.url("/clusters")), "dev@acme.test")
        .json(&serde_json::json!({ "name": "nope", "cpu": 4, "ram": 8, "gpu": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 16, 32, 4)
        .await;
    assert!(cluster_id > 0);

    // Duplicate active name in the same org conflicts.
    let resp = server
        .as_user(server.client.post(server.url("/clusters")), "admin@acme.test")
        .json(&serde_json::json!({ "name": "main", "cpu": 1, "ram": 1, "gpu": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
}

#[tokio::test]
async fn test_deployment_submit_validation_and_lifecycle() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 16, 32, 4)
        .await;

    // Over-capacity request is a 400 with a problem body.
    let resp = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .json(&serde_json::json!({
            "name": "too-big", "cluster_id": cluster_id, "cpu": 32, "ram": 8, "gpu": 0
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap(),
        "application/problem+json"
    );
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "insufficient_cpu");

    // Valid submission: 201 with {id, status}.
    let resp = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .json(&serde_json::json!({
            "name": "web", "cluster_id": cluster_id, "cpu": 4, "ram": 8, "gpu": 1, "priority": 3
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["status"], "pending");

    // After a worker pass it is RUNNING and the free vector reflects it.
    server.run_worker_until_idle().await;

    let resp = server
        .as_user(
            server.client.get(server.url(&format!("/deployments/{id}"))),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let detail: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(detail["status"], "running");
    assert_eq!(detail["attempt_count"], 1);

    let resp = server
        .as_user(
            server
                .client
                .get(server.url(&format!("/clusters/{cluster_id}/resources"))),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let state: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(state["free"]["cpu"], 12);
    assert_eq!(state["free"]["ram"], 24);
    assert_eq!(state["free"]["gpu"], 3);
    assert_eq!(state["running"].as_array().unwrap().len(), 1);

    // Cancel: 204, then the row survives as deleted history.
    let resp = server
        .as_user(
            server
                .client
                .delete(server.url(&format!("/deployments/{id}"))),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    // Cancelling again conflicts (terminal state).
    let resp = server
        .as_user(
            server
                .client
                .delete(server.url(&format!("/deployments/{id}"))),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // Hidden from the default list, visible with include_deleted.
    let resp = server
        .as_user(server.client.get(server.url("/deployments")), "dev@acme.test")
        .send()
        .await
        .unwrap();
    let visible: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert!(visible.iter().all(|d| d["id"].as_i64() != Some(id)));

    let resp = server
        .as_user(
            server
                .client
                .get(server.url("/deployments?include_deleted=true")),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    let all: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert!(all.iter().any(|d| d["id"].as_i64() == Some(id)));
}

#[tokio::test]
async fn test_developer_cannot_cancel_foreign_deployment() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 8, 8, 0)
        .await;

    let resp = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .json(&serde_json::json!({
            "name": "owned", "cluster_id": cluster_id, "cpu": 1, "ram": 1
        }))
        .send()
        .await
        .unwrap();
    let id = resp.json::<serde_json::Value>().await.unwrap()["id"]
        .as_i64()
        .unwrap();

    let resp = server
        .as_user(
            server
                .client
                .delete(server.url(&format!("/deployments/{id}"))),
            "dev2@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // Admins in the same org may cancel it.
    let resp = server
        .as_user(
            server
                .client
                .delete(server.url(&format!("/deployments/{id}"))),
            "admin@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
}

#[tokio::test]
async fn test_cross_org_isolation() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 8, 8, 0)
        .await;

    // Submitting against another org's cluster is denied outright.
    let resp = server
        .as_user(
            server.client.post(server.url("/deployments")),
            "admin@rival.test",
        )
        .json(&serde_json::json!({
            "name": "sneaky", "cluster_id": cluster_id, "cpu": 1, "ram": 1
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // Foreign rows resolve as not-found on reads.
    let resp = server
        .as_user(
            server
                .client
                .get(server.url(&format!("/clusters/{cluster_id}/resources"))),
            "admin@rival.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = server
        .as_user(server.client.get(server.url("/clusters")), "admin@rival.test")
        .send()
        .await
        .unwrap();
    let clusters: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert!(clusters.is_empty());
}

#[tokio::test]
async fn test_cluster_soft_delete() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "ephemeral", 4, 4, 0)
        .await;

    let resp = server
        .as_user(
            server
                .client
                .delete(server.url(&format!("/clusters/{cluster_id}"))),
            "admin@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    // Gone from the default listing, present with include_deleted.
    let resp = server
        .as_user(server.client.get(server.url("/clusters")), "admin@acme.test")
        .send()
        .await
        .unwrap();
    let active: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert!(active
        .iter()
        .all(|c| c["id"].as_i64() != Some(cluster_id)));

    let resp = server
        .as_user(
            server
                .client
                .get(server.url("/clusters?include_deleted=true")),
            "admin@acme.test",
        )
        .send()
        .await
        .unwrap();
    let all: Vec<serde_json::Value> = resp.json().await.unwrap();
    let deleted = all
        .iter()
        .find(|c| c["id"].as_i64() == Some(cluster_id))
        .unwrap();
    assert_eq!(deleted["status"], "deleted");

    // New deployments against it are rejected.
    let resp = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .json(&serde_json::json!({
            "name": "late", "cluster_id": cluster_id, "cpu": 1, "ram": 1
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn test_idempotency_key_replays_first_response() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 8, 8, 0)
        .await;
    let body = serde_json::json!({
        "name": "idem", "cluster_id": cluster_id, "cpu": 1, "ram": 1
    });

    let resp1 = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .header("Idempotency-Key", "itest-idem-key-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp1.status().as_u16(), 201);
    let first: serde_json::Value = resp1.json().await.unwrap();

    let resp2 = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .header("Idempotency-Key", "itest-idem-key-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp2.status().as_u16(), 201);
    let second: serde_json::Value = resp2.json().await.unwrap();
    assert_eq!(first["id"], second["id"]);

    // Same key with a different body is a conflict.
    let resp3 = server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .header("Idempotency-Key", "itest-idem-key-1")
        .json(&serde_json::json!({
            "name": "other", "cluster_id": cluster_id, "cpu": 1, "ram": 1
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp3.status().as_u16(), 409);

    // Only one deployment was created.
    let resp = server
        .as_user(server.client.get(server.url("/deployments")), "dev@acme.test")
        .send()
        .await
        .unwrap();
    let deployments: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(deployments.len(), 1);
}

#[tokio::test]
async fn test_queue_status_endpoint() {
    let server = TestServer::start().await;
    let cluster_id = server
        .create_cluster("admin@acme.test", "main", 8, 8, 0)
        .await;

    server
        .as_user(server.client.post(server.url("/deployments")), "dev@acme.test")
        .json(&serde_json::json!({
            "name": "q1", "cluster_id": cluster_id, "cpu": 1, "ram": 1
        }))
        .send()
        .await
        .unwrap();

    let resp = server
        .as_user(server.client.get(server.url("/queue/status")), "dev@acme.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["queued"], 1);
    assert_eq!(stats["finished"], 0);

    server.run_worker_until_idle().await;

    let resp = server
        .as_user(server.client.get(server.url("/queue/status")), "dev@acme.test")
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["queued"], 0);
    assert_eq!(stats["finished"], 1);
}

#[tokio::test]
async fn test_unknown_deployment_is_404() {
    let server = TestServer::start().await;
    let resp = server
        .as_user(
            server.client.get(server.url("/deployments/999999")),
            "dev@acme.test",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
