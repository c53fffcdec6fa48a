//! Update checks against a local HTTP responder.

use alistlite_daemon::config::UpdateConfig;
use alistlite_daemon::{UpdateChecker, UpdateError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const MIRROR: &str = "https://mirror.example.com/apk";

/// Serve `status` and `body` to every request; returns the endpoint URL.
async fn serve(status: u16, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    format!("http://{}/repos/LeoHaoVIP/AListLiteAndroid/releases/latest", addr)
}

fn checker(endpoint: String) -> UpdateChecker {
    let config = UpdateConfig {
        endpoint,
        mirror_base: MIRROR.to_string(),
        timeout_secs: 5,
        ..UpdateConfig::default()
    };
    UpdateChecker::new(&config).unwrap().with_abi("arm64-v8a")
}

const RELEASE_1_3_0: &str = r#"{
  "tag_name": "v1.3.0",
  "name": "AListLite v1.3.0 (AList v3.40.0)",
  "body": "* Faster directory listing\n* Fix WebDAV uploads",
  "assets": [
    {"name": "app-release.apk", "browser_download_url": "https://github.com/LeoHaoVIP/AListLiteAndroid/releases/download/v1.3.0/app-release.apk"}
  ]
}"#;

#[tokio::test]
async fn test_newer_release_is_reported() {
    let endpoint = serve(200, RELEASE_1_3_0).await;
    let info = checker(endpoint).check_for_update("1.2.0").await.unwrap();

    assert_eq!(info.version, "1.3.0");
    assert_eq!(info.engine_version.as_deref(), Some("3.40.0"));
    assert!(info.changelog.contains("WebDAV"));
    assert_eq!(info.download_urls.len(), 2);
    assert_eq!(
        info.download_urls[0],
        "https://mirror.example.com/apk/AListLite-v1.3.0-arm64-v8a-release.apk"
    );
    assert!(info.download_urls[1].ends_with("/v1.3.0/app-release.apk"));
}

#[tokio::test]
async fn test_same_version_reports_nothing() {
    let endpoint = serve(200, r#"{"tag_name": "v1.2.0", "assets": []}"#).await;
    assert!(checker(endpoint).check_for_update("1.2.0").await.is_none());
}

#[tokio::test]
async fn test_server_error_reports_nothing() {
    let endpoint = serve(500, r#"{"message": "boom"}"#).await;
    let checker = checker(endpoint);

    assert!(checker.check_for_update("1.2.0").await.is_none());
    assert!(matches!(
        checker.fetch_latest().await,
        Err(UpdateError::Status(500))
    ));
}

#[tokio::test]
async fn test_malformed_body_reports_nothing() {
    let endpoint = serve(200, "<html>rate limited</html>").await;
    let checker = checker(endpoint);

    assert!(checker.check_for_update("1.2.0").await.is_none());
    assert!(matches!(
        checker.check("1.2.0").await,
        Err(UpdateError::Malformed(_))
    ));
}

#[tokio::test]
async fn test_missing_tag_reports_nothing() {
    let endpoint = serve(200, r#"{"name": "untagged", "assets": []}"#).await;
    let checker = checker(endpoint);

    assert!(checker.check_for_update("1.2.0").await.is_none());
    assert!(matches!(
        checker.fetch_latest().await,
        Err(UpdateError::Malformed(_))
    ));
}

#[tokio::test]
async fn test_unreachable_server_reports_nothing() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let checker = checker(format!("http://{}/latest", addr));
    assert!(checker.check_for_update("1.2.0").await.is_none());
    assert!(matches!(checker.check("1.2.0").await, Err(UpdateError::Http(_))));
}

#[tokio::test]
async fn test_release_without_assets_has_mirror_only() {
    let endpoint = serve(200, r#"{"tag_name": "v2.0.0"}"#).await;
    let info = checker(endpoint).check("1.9.9").await.unwrap().unwrap();

    assert_eq!(
        info.download_urls,
        vec!["https://mirror.example.com/apk/AListLite-v2.0.0-arm64-v8a-release.apk".to_string()]
    );
    assert_eq!(info.engine_version, None);
    assert_eq!(info.changelog, "");
}
