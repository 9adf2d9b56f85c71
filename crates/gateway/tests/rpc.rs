//! Wire-level tests against a live RPC listener.

use bytes::BytesMut;
use serde_json::json;
use tokio::net::TcpStream;

use common::api::{RpcRequest, RpcResponse};
use common::params::ErrorCode;

use gateway::persistence::migrations::init_test_db;
use gateway::rpc;

struct TestClient {
    stream: TcpStream,
    buffer: BytesMut,
    next_id: u64,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            buffer: BytesMut::new(),
            next_id: 1,
        }
    }

    async fn call(
        &mut self,
        kind: &str,
        version: u16,
        id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> RpcResponse {
        let request_id = self.next_id;
        self.next_id += 1;
        let request = RpcRequest {
            request_id,
            kind: kind.to_string(),
            version,
            id: id.to_string(),
            request: method.to_string(),
            params,
        };
        let (mut reader, mut writer) = self.stream.split();
        rpc::codec::write_frame(&mut writer, &request)
            .await
            .expect("write frame");
        rpc::codec::read_frame::<_, RpcResponse>(&mut reader, &mut self.buffer)
            .await
            .expect("read frame")
            .expect("response frame")
    }

    async fn login(&mut self, user: &str, token: &str) -> RpcResponse {
        self.call(
            "Admin",
            3,
            "",
            "Login",
            json!({
                "auth-tag": format!("user-{user}@external"),
                "credentials": token,
            }),
        )
        .await
    }
}

async fn start_server() -> std::net::SocketAddr {
    let db = init_test_db().await;
    let state = gateway::testing::state_with_db(db);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(rpc::serve(state, listener));
    addr
}

#[tokio::test]
async fn unauthenticated_connections_expose_only_admin_and_pinger() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let resp = client.call("Pinger", 1, "", "Ping", json!({})).await;
    assert!(resp.error.is_none(), "ping always answers: {resp:?}");

    let resp = client
        .call("ModelManager", 5, "", "ListModels", json!({}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::NotImplemented));
}

#[tokio::test]
async fn old_admin_versions_are_rejected_as_not_supported() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let resp = client
        .call("Admin", 2, "", "Login", json!({"auth-tag": "user-root@external", "credentials": "root-token"}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::NotSupported));
}

#[tokio::test]
async fn login_transitions_to_the_authenticated_table() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let resp = client.login("alice", "alice-token").await;
    assert!(resp.error.is_none(), "login succeeds: {resp:?}");
    let result = resp.response.expect("login result");
    assert_eq!(result["user-info"]["identity"], "user-alice@external");
    let facades = result["facades"].as_array().expect("facades");
    assert!(facades
        .iter()
        .any(|f| f["name"] == "ModelManager" && f["versions"] == json!([2, 3, 4, 5])));

    let resp = client
        .call("ModelManager", 5, "", "ListModels", json!({}))
        .await;
    assert!(resp.error.is_none(), "list models after login: {resp:?}");
}

#[tokio::test]
async fn bad_credentials_are_unauthorized() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let resp = client.login("alice", "wrong").await;
    assert_eq!(resp.code(), Some(ErrorCode::Unauthorized));
}

#[tokio::test]
async fn local_user_tags_are_bad_requests() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    let resp = client
        .call(
            "Admin",
            3,
            "",
            "Login",
            json!({"auth-tag": "user-alice", "credentials": "alice-token"}),
        )
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::BadRequest));
    assert_eq!(resp.error.as_deref(), Some("unsupported local user"));
}

#[tokio::test]
async fn unexpected_object_ids_are_bad_id() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice", "alice-token").await;

    let resp = client
        .call("ModelManager", 5, "7", "ListModels", json!({}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::BadId));
}

#[tokio::test]
async fn model_summary_watchers_answer_through_sub_object_ids() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice", "alice-token").await;

    let resp = client
        .call("Controller", 9, "", "WatchModelSummaries", json!({}))
        .await;
    assert!(resp.error.is_none(), "allocate watcher: {resp:?}");
    let watcher_id = resp.response.expect("result")["watcher-id"]
        .as_str()
        .expect("id")
        .to_string();

    let resp = client
        .call("ModelSummaryWatcher", 1, &watcher_id, "Next", json!({}))
        .await;
    assert!(resp.error.is_none(), "next page: {resp:?}");

    let resp = client
        .call("ModelSummaryWatcher", 1, &watcher_id, "Stop", json!({}))
        .await;
    assert!(resp.error.is_none(), "stop watcher: {resp:?}");

    let resp = client
        .call("ModelSummaryWatcher", 1, &watcher_id, "Next", json!({}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn watching_summaries_requires_version_nine() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice", "alice-token").await;

    let resp = client
        .call("Controller", 8, "", "WatchModelSummaries", json!({}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::NotImplemented));

    // Methods below the override threshold still answer at v9.
    let resp = client.call("Controller", 9, "", "AllModels", json!({})).await;
    assert!(resp.error.is_none(), "v9 answers v3 methods: {resp:?}");
}

#[tokio::test]
async fn unknown_methods_are_not_implemented() {
    let addr = start_server().await;
    let mut client = TestClient::connect(addr).await;
    client.login("alice", "alice-token").await;

    let resp = client
        .call("ModelManager", 5, "", "NoSuchMethod", json!({}))
        .await;
    assert_eq!(resp.code(), Some(ErrorCode::NotImplemented));
    assert!(resp
        .error
        .as_deref()
        .expect("message")
        .contains("no such request"));
}
