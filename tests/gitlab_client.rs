//! GitLab client tests against a local HTTP server with canned responses.

use bluemine_lib::error::AppError;
use bluemine_lib::models::MetricsRecorder;
use bluemine_lib::services::gitlab_client::{GitLabApi, GitLabClient, GitLabClientConfig};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const TOKEN: &str = "glpat-test";

#[derive(Debug, Clone)]
struct RecordedRequest {
    url: Url,
    /// Lowercased header names.
    headers: HashMap<String, String>,
}

impl RecordedRequest {
    fn page(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "page")
            .map(|(_, value)| value.into_owned())
    }
}

struct CannedResponse {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl CannedResponse {
    fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type", "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    fn next_page(mut self, next: &str) -> Self {
        self.headers.push(("X-Next-Page", next.to_string()));
        self
    }

    fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

type Routes = Arc<dyn Fn(&RecordedRequest) -> CannedResponse + Send + Sync>;

/// Serves `routes` on a random local port, one response per connection.
struct CannedServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl CannedServer {
    async fn start(
        routes: impl Fn(&RecordedRequest) -> CannedResponse + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local port");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes: Routes = Arc::new(routes);

        let recorded = requests.clone();
        let origin = base_url.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let recorded = recorded.clone();
                let origin = origin.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut reader = BufReader::new(reader);

                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.is_err() {
                        return;
                    }
                    let target = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let mut headers = HashMap::new();
                    loop {
                        let mut line = String::new();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) if line.trim().is_empty() => break,
                            Ok(_) => {
                                if let Some((name, value)) = line.split_once(':') {
                                    let name = name.trim().to_lowercase();
                                    headers.insert(name, value.trim().to_string());
                                }
                            }
                        }
                    }

                    let request = RecordedRequest {
                        url: Url::parse(&format!("{}{}", origin, target)).expect("request target"),
                        headers,
                    };
                    let response = routes(&request);
                    recorded.lock().unwrap().push(request);

                    let mut head = format!(
                        "HTTP/1.1 {} Canned\r\nContent-Length: {}\r\nConnection: close\r\n",
                        response.status,
                        response.body.len()
                    );
                    for (name, value) in &response.headers {
                        head.push_str(&format!("{}: {}\r\n", name, value));
                    }
                    head.push_str("\r\n");

                    let _ = writer.write_all(head.as_bytes()).await;
                    let _ = writer.write_all(&response.body).await;
                    let _ = writer.shutdown().await;
                });
            }
        });

        Self { base_url, requests }
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn client(&self) -> GitLabClient {
        GitLabClient::new(GitLabClientConfig {
            base_url: self.base_url.clone(),
            token: TOKEN.to_string(),
            ..Default::default()
        })
        .expect("client for local server")
    }
}

fn mr_json(iid: i64) -> serde_json::Value {
    serde_json::json!({
        "iid": iid,
        "title": format!("1234{} - Change {}", iid, iid),
        "state": "opened",
        "web_url": format!("https://git.example.com/group/app/-/merge_requests/{}", iid),
        "updated_at": "2026-03-01T10:00:00Z",
    })
}

/// Test: list endpoints follow `x-next-page` and send the private token.
///
/// Scenario:
/// 1. Page 1 holds MR 1 and points at page 2
/// 2. Page 2 holds MR 2 and has an empty next-page header
/// 3. Both pages are concatenated and each request is authenticated
#[tokio::test]
async fn test_list_merge_requests_concatenates_pages() {
    let server = CannedServer::start(|request| match request.page().as_deref() {
        Some("1") => CannedResponse::json(serde_json::json!([mr_json(1)])).next_page("2"),
        _ => CannedResponse::json(serde_json::json!([mr_json(2)])).next_page(""),
    })
    .await;
    let metrics = MetricsRecorder::new();

    let merge_requests = server.client().list_merge_requests("7", &metrics).await.unwrap();

    let iids: Vec<i64> = merge_requests.iter().map(|mr| mr.iid).collect();
    assert_eq!(iids, vec![1, 2]);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.url.path(), "/api/v4/projects/7/merge_requests");
        assert_eq!(request.headers.get("private-token").map(String::as_str), Some(TOKEN));
        let query: HashMap<_, _> = request.url.query_pairs().into_owned().collect();
        assert_eq!(query.get("order_by").map(String::as_str), Some("updated_at"));
        assert_eq!(query.get("sort").map(String::as_str), Some("desc"));
        assert_eq!(query.get("per_page").map(String::as_str), Some("100"));
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.api_request_count, 2);
    assert_eq!(snapshot.request_count, 2);
}

/// Test: a next-page header that does not move forward ends the loop.
#[tokio::test]
async fn test_pagination_stops_when_next_page_does_not_advance() {
    let server = CannedServer::start(|_| {
        CannedResponse::json(serde_json::json!([{"id": 1, "username": "ann", "name": "Ann Lee"}]))
            .next_page("1")
    })
    .await;

    let members = server
        .client()
        .list_project_members("group/app", &MetricsRecorder::new())
        .await
        .unwrap();

    assert_eq!(members.len(), 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url.path(), "/api/v4/projects/group%2Fapp/members/all");
}

/// Test: a page whose body is an object is a protocol error.
#[tokio::test]
async fn test_object_page_is_a_protocol_error() {
    let server = CannedServer::start(|request| match request.page().as_deref() {
        Some("1") => CannedResponse::json(serde_json::json!([mr_json(1)])).next_page("2"),
        _ => CannedResponse::json(serde_json::json!({"message": "not a list"})),
    })
    .await;

    let err = server
        .client()
        .list_merge_requests("7", &MetricsRecorder::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Protocol { .. }), "unexpected error: {:?}", err);
    assert!(err.to_string().contains("page 2"));
    assert_eq!(err.status_code(), None);
}

#[tokio::test]
async fn test_error_status_is_mapped() {
    let server = CannedServer::start(|_| {
        CannedResponse::json(serde_json::json!({"message": "403 Forbidden"})).status(403)
    })
    .await;

    let err = server
        .client()
        .get_mr_approvals("7", 10, &MetricsRecorder::new())
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(403));
    assert!(err.to_string().contains("Access denied"));
}

/// Test: avatars carry the token only on the GitLab origin.
///
/// Scenario:
/// 1. A relative avatar path resolves against the GitLab server and is
///    fetched with the token
/// 2. An avatar on another origin is fetched without it
#[tokio::test]
async fn test_avatar_token_only_sent_to_gitlab_origin() {
    let image = |_: &RecordedRequest| CannedResponse {
        status: 200,
        headers: vec![("Content-Type", "image/jpeg; charset=binary".to_string())],
        body: vec![0xff, 0xd8, 0xff],
    };
    let gitlab = CannedServer::start(image).await;
    let foreign = CannedServer::start(image).await;
    let client = gitlab.client();
    let metrics = MetricsRecorder::new();

    let own = client
        .download_avatar("/uploads/-/system/user/avatar/1/avatar.png", &metrics)
        .await
        .unwrap();
    assert_eq!(own.content_type, "image/jpeg");
    assert_eq!(own.bytes, vec![0xff, 0xd8, 0xff]);

    let other_url = format!("{}/avatar/abc", foreign.base_url);
    client.download_avatar(&other_url, &metrics).await.unwrap();

    let own_requests = gitlab.requests();
    assert_eq!(own_requests.len(), 1);
    assert_eq!(own_requests[0].url.path(), "/uploads/-/system/user/avatar/1/avatar.png");
    assert_eq!(own_requests[0].headers.get("private-token").map(String::as_str), Some(TOKEN));

    let foreign_requests = foreign.requests();
    assert_eq!(foreign_requests.len(), 1);
    assert!(!foreign_requests[0].headers.contains_key("private-token"));

    assert_eq!(metrics.snapshot().avatar_request_count, 2);
}
