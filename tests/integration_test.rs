//! Integration tests for the NetBackup client, version negotiation and
//! job pagination.
//!
//! These tests use mockito to simulate NetBackup API responses

use chrono::Utc;
use mockito::{Matcher, Server};
use nbu_exporter::{
    client::{media_type, ApiClient, BODY_PREVIEW_LEN},
    config::NbuConfig,
    pagination::{JobAccumulators, JobKey, JobWalker, PageStep},
    retry::RetryPolicy,
    version::{VersionNegotiator, SUPPORTED_API_VERSIONS},
    NbuError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const JOBS_PATH: &str = "/netbackup/admin/jobs";
const STORAGE_PATH: &str = "/netbackup/storage/storage-units";
const VENDOR_JSON: &str = "application/vnd.netbackup+json;version=13.0";

/// Helper to create a test config pointing to mock server
fn create_test_config(server_url: &str) -> NbuConfig {
    let url = url::Url::parse(server_url).unwrap();
    let mut config = NbuConfig::new(url.host_str().unwrap(), "test-api-key");
    config.scheme = url.scheme().to_string();
    config.port = url.port().unwrap();
    config.timeout_seconds = 5;
    config.shutdown_timeout_seconds = 1;
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_factor: 2.0,
    };
    config
}

fn jobs_body(jobs: &[(&str, &str, i64, i64)], offset: u64, last: u64, next: Option<u64>) -> String {
    let data: Vec<_> = jobs
        .iter()
        .enumerate()
        .map(|(i, (action, policy, status, kb))| {
            let id = offset + i as u64;
            json!({
                "type": "job",
                "id": id.to_string(),
                "attributes": {
                    "jobId": id,
                    "jobType": action,
                    "policyType": policy,
                    "status": status,
                    "kilobytesTransferred": kb
                }
            })
        })
        .collect();

    let mut pagination = json!({ "offset": offset, "last": last });
    if let Some(next) = next {
        pagination["next"] = json!(next);
    }
    json!({ "data": data, "meta": { "pagination": pagination } }).to_string()
}

fn empty_jobs_body() -> String {
    jobs_body(&[], 0, 0, None)
}

/// Accept a connection and never answer it.
async fn silent_listener() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

async fn wait_for_in_flight(client: &ApiClient, expected: usize) {
    for _ in 0..200 {
        if client.in_flight() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("in-flight count never reached {}", expected);
}

#[tokio::test]
async fn test_request_carries_version_and_credentials() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .match_header("accept", VENDOR_JSON)
        .match_header("authorization", "test-api-key")
        .with_status(200)
        .with_header("content-type", VENDOR_JSON)
        .with_body(
            r#"{
            "data": [
                {
                    "type": "storageUnit",
                    "id": "stu-disk",
                    "attributes": {
                        "name": "stu-disk",
                        "storageType": "DISK",
                        "storageServerType": "PureDisk",
                        "freeCapacityBytes": 1099511627776,
                        "usedCapacityBytes": 549755813888
                    }
                }
            ]
        }"#,
        )
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let units = client.get_storage_units("13.0").await.unwrap();

    assert_eq!(units.data.len(), 1);
    let unit = &units.data[0].attributes;
    assert_eq!(unit.name, "stu-disk");
    assert_eq!(unit.storage_server_type.as_deref(), Some("PureDisk"));
    assert_eq!(unit.free_capacity_bytes, Some(1099511627776));
    assert_eq!(client.in_flight(), 0);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_406_is_an_unsupported_version() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(406)
        .expect(1)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    match err {
        NbuError::UnsupportedVersion { version, url } => {
            assert_eq!(version, "13.0");
            assert!(url.ends_with(STORAGE_PATH));
        }
        other => panic!("expected UnsupportedVersion, got {other:?}"),
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_status_error_carries_details() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(404)
        .with_header("content-type", "text/plain")
        .with_body("not found")
        .expect(1)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    match err {
        NbuError::HttpStatus {
            status,
            url,
            content_type,
        } => {
            assert_eq!(status, 404);
            assert!(url.ends_with(STORAGE_PATH));
            assert_eq!(content_type, "text/plain");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }

    mock.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_is_reported_as_auth_failure() {
    let mut server = Server::new_async().await;

    let _mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(401)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    assert!(err.is_auth_failure());
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_unexpected_content_type_includes_preview() {
    let mut server = Server::new_async().await;
    let body = format!("<html>{}</html>", "x".repeat(500));

    let _mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(&body)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    match err {
        NbuError::UnexpectedContentType {
            content_type,
            preview,
            ..
        } => {
            assert_eq!(content_type, "text/html");
            assert!(preview.starts_with("<html>"));
            assert_eq!(preview.len(), BODY_PREVIEW_LEN);
        }
        other => panic!("expected UnexpectedContentType, got {other:?}"),
    }
}

#[tokio::test]
async fn test_decode_error_includes_preview() {
    let mut server = Server::new_async().await;

    let _mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": "definitely not a list"}"#)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    match err {
        NbuError::Decode { preview, .. } => {
            assert!(preview.contains("definitely not a list"));
        }
        other => panic!("expected Decode, got {other:?}"),
    }
}

#[tokio::test]
async fn test_plain_json_with_parameters_is_accepted() {
    let mut server = Server::new_async().await;

    let _mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(200)
        .with_header("content-type", "application/json; charset=utf-8")
        .with_body(r#"{"data": []}"#)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let units = client.get_storage_units("13.0").await.unwrap();
    assert!(units.data.is_empty());
}

#[tokio::test]
async fn test_server_errors_are_retried_up_to_budget() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    assert_eq!(err.status(), Some(503));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_is_retried_with_retry_after() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(429)
        .with_header("retry-after", "0")
        .expect(3)
        .create_async()
        .await;

    // Backoff alone would take several seconds
    let mut config = create_test_config(&server.url());
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 3_000,
        max_delay_ms: 3_000,
        backoff_factor: 1.0,
    };
    let client = ApiClient::new(config).unwrap();

    let started = std::time::Instant::now();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(err.status(), Some(429));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_backoff_applies_without_retry_after() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let mut config = create_test_config(&server.url());
    config.retry = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 300,
        max_delay_ms: 300,
        backoff_factor: 1.0,
    };
    let client = ApiClient::new(config).unwrap();

    let started = std::time::Instant::now();
    client.get_storage_units("13.0").await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(300));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", STORAGE_PATH)
        .with_status(400)
        .expect(1)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    assert!(client.get_storage_units("13.0").await.is_err());

    mock.assert_async().await;
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    // Bind and drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = ApiClient::new(create_test_config(&format!("http://127.0.0.1:{}", port))).unwrap();
    let err = client.get_storage_units("13.0").await.unwrap_err();

    match err {
        NbuError::Transport { url, .. } => assert!(url.contains(&port.to_string())),
        other => panic!("expected Transport, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_rejects_new_requests_and_second_close() {
    let server = Server::new_async().await;
    let client = ApiClient::new(create_test_config(&server.url())).unwrap();

    client.close().await.unwrap();
    assert!(client.is_closed());

    let err = client.get_storage_units("13.0").await.unwrap_err();
    assert!(matches!(err, NbuError::Closed));

    let err = client.close().await.unwrap_err();
    assert!(matches!(err, NbuError::AlreadyClosed));
}

#[tokio::test]
async fn test_close_times_out_with_request_in_flight() {
    let url = silent_listener().await;
    let client = Arc::new(ApiClient::new(create_test_config(&url)).unwrap());

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_storage_units("13.0").await })
    };
    wait_for_in_flight(&client, 1).await;

    let err = client.close().await.unwrap_err();
    assert!(matches!(err, NbuError::ShutdownTimeout { in_flight: 1 }));

    pending.abort();
}

#[tokio::test]
async fn test_close_wait_can_be_cancelled() {
    let url = silent_listener().await;
    let client = Arc::new(ApiClient::new(create_test_config(&url)).unwrap());

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_storage_units("13.0").await })
    };
    wait_for_in_flight(&client, 1).await;

    let err = client.close_with(async {}).await.unwrap_err();
    assert!(matches!(err, NbuError::ShutdownCancelled));
    assert!(client.is_closed());

    // Nothing is left to release on a second attempt
    let err = client.close().await.unwrap_err();
    assert!(matches!(err, NbuError::AlreadyClosed));
    let err = client.get_storage_units("13.0").await.unwrap_err();
    assert!(matches!(err, NbuError::Closed));

    pending.abort();
}

#[tokio::test]
async fn test_close_returns_once_in_flight_request_finishes() {
    let url = silent_listener().await;
    let client = Arc::new(ApiClient::new(create_test_config(&url)).unwrap());

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_storage_units("13.0").await })
    };
    wait_for_in_flight(&client, 1).await;

    let closer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Dropping the request future releases its in-flight slot
    pending.abort();
    let _ = pending.await;

    let result = tokio::time::timeout(Duration::from_millis(900), closer)
        .await
        .expect("close did not return")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(client.in_flight(), 0);
}

async fn version_mock(server: &mut mockito::ServerGuard, version: &str, status: usize, hits: usize) -> mockito::Mock {
    server
        .mock("GET", JOBS_PATH)
        .match_query(Matcher::Any)
        .match_header("accept", media_type(version).as_str())
        .with_status(status)
        .with_header("content-type", "application/json")
        .with_body(empty_jobs_body())
        .expect(hits)
        .create_async()
        .await
}

#[tokio::test]
async fn test_negotiation_falls_back_in_order() {
    let mut server = Server::new_async().await;

    let v13 = version_mock(&mut server, "13.0", 406, 1).await;
    let v12 = version_mock(&mut server, "12.0", 200, 1).await;
    let v3 = version_mock(&mut server, "3.0", 200, 0).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let negotiation = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap();

    assert_eq!(negotiation.version, "12.0");
    assert_eq!(negotiation.attempted, vec!["13.0", "12.0"]);
    // Probing never commits anything on the client
    assert_eq!(client.api_version(), None);

    v13.assert_async().await;
    v12.assert_async().await;
    v3.assert_async().await;
}

#[tokio::test]
async fn test_negotiation_selects_nth_preference() {
    for accepted in 0..SUPPORTED_API_VERSIONS.len() {
        let mut server = Server::new_async().await;
        let mut mocks = Vec::new();
        for (i, version) in SUPPORTED_API_VERSIONS.iter().enumerate() {
            let (status, hits) = match i.cmp(&accepted) {
                std::cmp::Ordering::Less => (406, 1),
                std::cmp::Ordering::Equal => (200, 1),
                std::cmp::Ordering::Greater => (200, 0),
            };
            mocks.push(version_mock(&mut server, version, status, hits).await);
        }

        let client = ApiClient::new(create_test_config(&server.url())).unwrap();
        let negotiation = VersionNegotiator::with_defaults(&client)
            .negotiate()
            .await
            .unwrap();

        assert_eq!(negotiation.version, SUPPORTED_API_VERSIONS[accepted]);
        assert_eq!(negotiation.attempted, SUPPORTED_API_VERSIONS[..=accepted].to_vec());
        for mock in &mocks {
            mock.assert_async().await;
        }
    }
}

#[tokio::test]
async fn test_negotiation_aborts_on_401() {
    let mut server = Server::new_async().await;

    let v13 = version_mock(&mut server, "13.0", 401, 1).await;
    let v12 = version_mock(&mut server, "12.0", 200, 0).await;
    let v3 = version_mock(&mut server, "3.0", 200, 0).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap_err();

    assert!(err.is_auth_failure());
    match err {
        NbuError::Authentication { version, .. } => assert_eq!(version, "13.0"),
        other => panic!("expected Authentication, got {other:?}"),
    }

    v13.assert_async().await;
    v12.assert_async().await;
    v3.assert_async().await;
}

#[tokio::test]
async fn test_negotiation_exhausts_all_versions() {
    let mut server = Server::new_async().await;

    let v13 = version_mock(&mut server, "13.0", 406, 1).await;
    let v12 = version_mock(&mut server, "12.0", 406, 1).await;
    let v3 = version_mock(&mut server, "3.0", 406, 1).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let err = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap_err();

    match &err {
        NbuError::NoCompatibleVersion { attempted } => {
            assert_eq!(attempted, &vec!["13.0", "12.0", "3.0"]);
        }
        other => panic!("expected NoCompatibleVersion, got {other:?}"),
    }
    assert!(err.to_string().contains("connectivity"));

    v13.assert_async().await;
    v12.assert_async().await;
    v3.assert_async().await;
}

#[tokio::test]
async fn test_negotiation_retries_server_errors_before_rejecting() {
    let mut server = Server::new_async().await;

    let v13 = version_mock(&mut server, "13.0", 503, 3).await;
    let v12 = version_mock(&mut server, "12.0", 200, 1).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let negotiation = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap();

    assert_eq!(negotiation.version, "12.0");

    v13.assert_async().await;
    v12.assert_async().await;
}

#[tokio::test]
async fn test_negotiation_rejects_unreachable_server_after_retries() {
    // Bind and drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = ApiClient::new(create_test_config(&format!("http://127.0.0.1:{}", port))).unwrap();
    let err = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap_err();

    match err {
        NbuError::NoCompatibleVersion { attempted } => {
            assert_eq!(attempted, SUPPORTED_API_VERSIONS.to_vec());
        }
        other => panic!("expected NoCompatibleVersion, got {other:?}"),
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_negotiation_accepts_success_with_any_content_type() {
    let mut server = Server::new_async().await;

    let v13 = server
        .mock("GET", JOBS_PATH)
        .match_query(Matcher::Any)
        .match_header("accept", media_type("13.0").as_str())
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html>welcome</html>")
        .expect(1)
        .create_async()
        .await;
    let v12 = version_mock(&mut server, "12.0", 200, 0).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let negotiation = VersionNegotiator::with_defaults(&client)
        .negotiate()
        .await
        .unwrap();

    assert_eq!(negotiation.version, "13.0");
    assert_eq!(negotiation.attempted, vec!["13.0"]);

    v13.assert_async().await;
    v12.assert_async().await;
}

#[tokio::test]
async fn test_negotiation_is_repeatable() {
    let mut server = Server::new_async().await;

    let _v13 = version_mock(&mut server, "13.0", 406, 2).await;
    let _v12 = version_mock(&mut server, "12.0", 200, 2).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let negotiator = VersionNegotiator::with_defaults(&client);
    let first = negotiator.negotiate().await.unwrap();
    let second = negotiator.negotiate().await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_ensure_api_version_negotiates_once() {
    let mut server = Server::new_async().await;

    let v13 = version_mock(&mut server, "13.0", 200, 1).await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    assert_eq!(client.ensure_api_version().await.unwrap(), "13.0");
    assert_eq!(client.ensure_api_version().await.unwrap(), "13.0");
    assert_eq!(client.api_version(), Some("13.0"));

    v13.assert_async().await;
}

#[tokio::test]
async fn test_configured_version_bypasses_negotiation() {
    let mut server = Server::new_async().await;

    let probe = server
        .mock("GET", JOBS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut config = create_test_config(&server.url());
    config.api_version = Some("3.0".to_string());
    let client = ApiClient::new(config).unwrap();

    assert_eq!(client.ensure_api_version().await.unwrap(), "3.0");
    probe.assert_async().await;
}

fn page_query(limit: u32, offset: u64) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("page[limit]".into(), limit.to_string()),
        Matcher::UrlEncoded("page[offset]".into(), offset.to_string()),
        Matcher::Regex("filter=endTime".into()),
    ])
}

#[tokio::test]
async fn test_walk_issues_one_request_per_page() {
    let mut server = Server::new_async().await;
    let limit = 2;

    type Job = (&'static str, &'static str, i64, i64);
    let pages: [(u64, Vec<Job>, Option<u64>); 3] = [
        (0, vec![("BACKUP", "VMWARE", 0, 1024), ("BACKUP", "VMWARE", 0, 1024)], Some(2)),
        (2, vec![("BACKUP", "STANDARD", 1, 10), ("RESTORE", "STANDARD", 0, 0)], Some(4)),
        (4, vec![("BACKUP", "VMWARE", 150, 0)], None),
    ];

    let mut mocks = Vec::new();
    for (offset, jobs, next) in &pages {
        mocks.push(
            server
                .mock("GET", JOBS_PATH)
                .match_query(page_query(limit, *offset))
                .with_status(200)
                .with_header("content-type", VENDOR_JSON)
                .with_body(jobs_body(jobs.as_slice(), *offset, 4, *next))
                .expect(1)
                .create_async()
                .await,
        );
    }

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let walker = JobWalker::new(&client, "13.0", limit, Utc::now());
    let mut acc = JobAccumulators::new();
    let summary = walker.walk(&mut acc).await.unwrap();

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.jobs, 5);
    assert_eq!(acc.jobs(), 5);
    assert_eq!(acc.count[&JobKey::new("BACKUP", "VMWARE", "0")], 2);
    assert_eq!(acc.bytes[&JobKey::new("BACKUP", "VMWARE", "0")], 2 * 1024 * 1024);
    assert_eq!(acc.bytes[&JobKey::new("BACKUP", "STANDARD", "1")], 10 * 1024);

    for mock in &mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_walk_of_empty_collection_makes_one_request() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("GET", JOBS_PATH)
        .match_query(page_query(100, 0))
        .with_status(200)
        .with_header("content-type", VENDOR_JSON)
        .with_body(empty_jobs_body())
        .expect(1)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let walker = JobWalker::new(&client, "13.0", 100, Utc::now());
    let mut acc = JobAccumulators::new();
    let summary = walker.walk(&mut acc).await.unwrap();

    assert_eq!(summary.pages, 1);
    assert_eq!(summary.jobs, 0);
    assert!(acc.is_empty());

    mock.assert_async().await;
}

#[tokio::test]
async fn test_single_page_reports_done() {
    let mut server = Server::new_async().await;

    let _mock = server
        .mock("GET", JOBS_PATH)
        .match_query(page_query(10, 0))
        .with_status(200)
        .with_body(jobs_body(&[("BACKUP", "VMWARE", 0, 1)], 0, 0, None))
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let walker = JobWalker::new(&client, "13.0", 10, Utc::now());
    let mut acc = JobAccumulators::new();
    let page = walker.fetch_page(0, &mut acc).await.unwrap();

    assert_eq!(page.step, PageStep::Done);
    assert_eq!(page.items, 1);
}

#[tokio::test]
async fn test_walk_aborts_on_page_failure() {
    let mut server = Server::new_async().await;

    let first = server
        .mock("GET", JOBS_PATH)
        .match_query(page_query(1, 0))
        .with_status(200)
        .with_body(jobs_body(&[("BACKUP", "VMWARE", 0, 1)], 0, 2, Some(1)))
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", JOBS_PATH)
        .match_query(page_query(1, 1))
        .with_status(500)
        .expect(3)
        .create_async()
        .await;
    let third = server
        .mock("GET", JOBS_PATH)
        .match_query(page_query(1, 2))
        .with_status(200)
        .with_body(jobs_body(&[("BACKUP", "VMWARE", 0, 1)], 2, 2, None))
        .expect(0)
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let walker = JobWalker::new(&client, "13.0", 1, Utc::now());
    let mut acc = JobAccumulators::new();
    let err = walker.walk(&mut acc).await.unwrap_err();

    assert_eq!(err.status(), Some(500));

    first.assert_async().await;
    second.assert_async().await;
    third.assert_async().await;
}

#[tokio::test]
async fn test_walk_stops_misbehaving_server() {
    let mut server = Server::new_async().await;

    // Claims one page but keeps handing out more
    let _mock = server
        .mock("GET", JOBS_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(jobs_body(&[("BACKUP", "VMWARE", 0, 1)], 0, 1, Some(1)))
        .create_async()
        .await;

    let client = ApiClient::new(create_test_config(&server.url())).unwrap();
    let walker = JobWalker::new(&client, "13.0", 1, Utc::now());
    let mut acc = JobAccumulators::new();
    let err = walker.walk(&mut acc).await.unwrap_err();

    assert!(matches!(err, NbuError::PaginationOverrun { .. }));
}
