use odac_common::config::modules::{RunStatus, Website};
use odac_common::config::ConfigStore;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::main]
/// # Config Store Integration Test
///
/// Verifies the durable behavior of the configuration store on a real
/// filesystem:
/// 1.  A mutation marks its module dirty and a flush writes `<m>.json`.
/// 2.  A second flush leaves the previous generation in `<m>.json.bak`.
/// 3.  A corrupted primary file is set aside as `<m>.json.corrupted` and the
///     backup is promoted on the next load.
/// 4.  No `.tmp` file survives a completed flush.
async fn main() {
    let dir = tempdir().expect("Failed to create temporary directory");
    let config_dir = dir.path().to_path_buf();

    // 1. First generation
    {
        let store = Arc::new(ConfigStore::load(&config_dir).expect("load store"));
        store
            .web
            .mutate(|web| {
                web.websites.insert(
                    "example.com".to_string(),
                    Website {
                        root: config_dir.join("example.com"),
                        port: 10001,
                        pid: None,
                        subdomains: vec!["www".to_string()],
                        cert: None,
                        status: RunStatus::Stopped,
                        created_at: 1,
                        updated_at: 1,
                    },
                );
            })
            .await;
        store.force().await.expect("first flush");

        // 2. Second generation produces a backup of the first
        store
            .web
            .mutate(|web| {
                if let Some(site) = web.websites.get_mut("example.com") {
                    site.port = 10002;
                }
            })
            .await;
        store.force().await.expect("second flush");
    }

    let current = std::fs::read_to_string(config_dir.join("web.json")).expect("web.json");
    assert!(current.contains("10002"), "current generation on disk");
    let backup = std::fs::read_to_string(config_dir.join("web.json.bak")).expect("web.json.bak");
    assert!(backup.contains("10001"), "previous generation in backup");
    assert!(
        !config_dir.join("web.json.tmp").exists(),
        "no tmp file after flush"
    );

    // 3. Corrupt the primary and reload: the backup must be promoted
    std::fs::write(config_dir.join("web.json"), b"{ truncated").expect("corrupt file");
    {
        let store = Arc::new(ConfigStore::load(&config_dir).expect("reload store"));
        let port = store
            .web
            .read(|web| web.websites.get("example.com").map(|s| s.port))
            .await;
        assert_eq!(port, Some(10001), "backup generation recovered");
    }
    assert!(
        config_dir.join("web.json.corrupted").exists(),
        "corrupt file preserved for inspection"
    );

    println!("test_config_store: OK");
}
