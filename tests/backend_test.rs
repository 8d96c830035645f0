use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use acquire_engine::orchestrator::{PreWarmRequest, TrackResolver};
use acquire_engine::track_cache::{CatalogId, Service};
use acquire_engine::{AcquisitionBackend, Collaborators, EngineConfig};

#[derive(Default)]
struct QobuzResolver {
    calls: AtomicUsize,
}

#[async_trait]
impl TrackResolver for QobuzResolver {
    async fn search_by_identifier(&self, _request: &PreWarmRequest) -> anyhow::Result<Option<CatalogId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(CatalogId::Text("123456".into())))
    }
}

fn backend(root: &std::path::Path, resolver: Arc<QobuzResolver>) -> AcquisitionBackend {
    let config = EngineConfig {
        extensions_data_dir: root.join("extensions"),
        allowed_download_dirs: vec![root.join("library")],
        ..Default::default()
    };
    let collaborators = Collaborators {
        resolvers: vec![(Service::Qobuz, resolver as Arc<dyn TrackResolver>)],
        ..Default::default()
    };
    AcquisitionBackend::new(config, collaborators).unwrap()
}

#[tokio::test]
async fn construction_prepares_directories() {
    let root = tempfile::tempdir().unwrap();
    let backend = backend(root.path(), Arc::default());

    assert!(root.path().join("extensions").is_dir());
    assert_eq!(backend.allowed_download_dirs(), vec![root.path().join("library")]);

    backend.add_allowed_download_dir(&root.path().join("other"));
    assert_eq!(backend.allowed_download_dirs().len(), 2);
    backend.set_allowed_download_dirs(&[]);
    assert!(backend.allowed_download_dirs().is_empty());
}

#[tokio::test]
async fn pre_warm_from_json_fills_cache() {
    let root = tempfile::tempdir().unwrap();
    let resolver = Arc::new(QobuzResolver::default());
    let backend = backend(root.path(), Arc::clone(&resolver));

    let tracks = r#"[
        { "isrc": "GBAYE0601498", "service": "qobuz" },
        { "identifier": "usum71703861", "track_name": "x", "service": "qobuz" }
    ]"#;
    let stats = backend.pre_warm_cache_json(tracks).unwrap().wait().await.unwrap();
    assert_eq!(stats.resolved, 2);
    assert_eq!(backend.cache_size(), 2);

    let entry = backend.track_cache().get("USUM71703861").unwrap();
    assert_eq!(entry.qobuz_track_id, Some(123456));

    backend.clear_track_cache();
    assert_eq!(backend.cache_size(), 0);

    assert!(backend.pre_warm_cache_json("{not json").is_err());
}
