//! Handshakes over real TCP sockets through the listener.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

use backup_authd::auth::{JobKeyRegistry, RolePolicy, TracingSink};
use backup_authd::config::Settings;
use backup_authd::error::AuthErrorKind;
use backup_authd::socket::{connect, failure_throttle, handshake_context, SocketListener};

const STORAGE: &str = r#"
[daemon]
name = "bacula-sd"
class = "storage"
listen = "127.0.0.1:0"

[security]
failure_delay_ms = 20

[[peers]]
name = "bacula-dir"
class = "director"
password = "dir-sd-secret"
"#;

fn director(password: &str) -> Settings {
    Settings::parse(&format!(
        r#"
        [daemon]
        name = "bacula-dir"
        class = "director"

        [security]
        failure_delay_ms = 20

        [[peers]]
        name = "bacula-sd"
        class = "storage"
        password = "{}"
        "#,
        password
    ))
    .unwrap()
}

#[tokio::test]
async fn test_director_connects_to_listening_storage() {
    let temp_dir = TempDir::new().unwrap();
    let audit_path = temp_dir.path().join("audit.log");
    let settings = Settings::parse(&format!(
        "{}\n[audit]\nenabled = true\nlog_path = {:?}\n",
        STORAGE,
        audit_path.to_str().unwrap()
    ))
    .unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let listener = SocketListener::bind(&settings, Arc::new(JobKeyRegistry::new()))
        .await
        .unwrap()
        .with_handoff(tx);
    let addr = listener.local_addr().unwrap();
    let metrics = listener.metrics();
    let listener = Arc::new(listener);
    let shutdown = Arc::new(Notify::new());

    let server = tokio::spawn({
        let listener = Arc::clone(&listener);
        let shutdown = Arc::clone(&shutdown);
        async move { listener.run(shutdown).await }
    });

    let client_settings = director("dir-sd-secret");
    let ctx = handshake_context(
        &client_settings,
        Arc::new(JobKeyRegistry::new()),
        failure_throttle(&client_settings),
    );
    let connection = connect(
        addr,
        RolePolicy::DirectorProvesToStorage,
        "bacula-sd",
        ctx,
        Arc::new(TracingSink),
        4096,
    )
    .await
    .unwrap();
    assert_eq!(connection.auth.remote_version, 5);

    let accepted = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.auth.peer_name, "bacula-dir");
    assert_eq!(accepted.auth.role, RolePolicy::StorageAcceptsDirector);

    listener.wait_for_drain().await;
    assert_eq!(metrics.total_handshakes(), 1);
    assert_eq!(metrics.failed_handshakes(), 0);

    let audit = std::fs::read_to_string(&audit_path).unwrap();
    let entry: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(entry["result"]["status"], "success");
    assert_eq!(entry["peer_name"], "bacula-dir");

    shutdown.notify_waiters();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_password_over_tcp() {
    let settings = Settings::parse(STORAGE).unwrap();
    let listener = Arc::new(
        SocketListener::bind(&settings, Arc::new(JobKeyRegistry::new()))
            .await
            .unwrap(),
    );
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    let server = tokio::spawn({
        let listener = Arc::clone(&listener);
        let shutdown = Arc::clone(&shutdown);
        async move { listener.run(shutdown).await }
    });

    let client_settings = director("wrong");
    let throttle = failure_throttle(&client_settings);
    let ctx = handshake_context(
        &client_settings,
        Arc::new(JobKeyRegistry::new()),
        Arc::clone(&throttle),
    );
    let result = connect(
        addr,
        RolePolicy::DirectorProvesToStorage,
        "bacula-sd",
        ctx,
        Arc::new(TracingSink),
        4096,
    )
    .await;

    assert_eq!(
        result.err().and_then(|e| e.auth_kind().cloned()),
        Some(AuthErrorKind::CredentialMismatch)
    );
    assert_eq!(throttle.penalties(), 1);

    listener.wait_for_drain().await;
    assert_eq!(listener.metrics().failed_handshakes(), 1);
    assert_eq!(listener.throttle().penalties(), 1);

    shutdown.notify_waiters();
    server.await.unwrap().unwrap();
}
