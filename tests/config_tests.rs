use sqlstore::{MemoryEngine, SqlStore, SqliteDialect, StoreConfig, StoreError};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn config_loads_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{ "query_retries": 3, "transaction_retries": 2, "min_retry_delay_ms": 5, "max_retry_delay_ms": 80 }}"#
    )
    .expect("write config");

    let config = StoreConfig::from_file(file.path()).await.expect("load config");

    assert_eq!(config.query_retries, 3);
    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.min_delay, Duration::from_millis(5));
    assert_eq!(policy.max_delay, Duration::from_millis(80));
    assert_eq!(config.transaction_retry_policy().max_attempts, 2);
}

#[tokio::test]
async fn missing_config_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = StoreConfig::from_file(dir.path().join("sqlstore.json"))
        .await
        .expect_err("missing file");

    assert!(matches!(err, StoreError::Config(_)));
}

#[tokio::test]
async fn invalid_file_contents_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, r#"{{ "min_retry_delay_ms": 500, "max_retry_delay_ms": 100 }}"#)
        .expect("write config");

    let err = StoreConfig::from_file(file.path())
        .await
        .expect_err("min above max");
    assert!(err.to_string().contains("min_retry_delay_ms"));
}

#[test]
fn store_round_trips_its_config() {
    let config = StoreConfig::new().query_retries(9);
    let store = SqlStore::new(Arc::new(MemoryEngine::new()), Arc::new(SqliteDialect), config.clone())
        .expect("open store");

    assert_eq!(store.config(), &config);
    assert_eq!(store.dialect().name(), "sqlite3");

    let json = serde_json::to_string(store.config()).expect("serialize");
    assert_eq!(StoreConfig::from_json_str(&json).expect("parse"), config);
}
