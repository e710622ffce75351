#![allow(dead_code)]

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use ferry_core::prelude::*;
use ferry_packages::{
    ArchiveBackend, AssetObject, AssetResult, BackendError, Backends, BundleBackend, LoadedArchive,
    LoadedBundle,
};
use ferry_storage::ReadStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Clone, Default)]
struct Files {
    data: Arc<HashMap<String, Vec<u8>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn serve_file(State(files): State<Files>, Path(name): Path<String>) -> Response {
    files.requests.lock().push(name.clone());
    match files.data.get(&name) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// An in-process remote serving `/files/{name}`.
pub struct Remote {
    files: Files,
    pub base_url: String,
    _runtime: Runtime,
}

impl Remote {
    pub fn start(files: &[(&str, &str)]) -> Self {
        let files = Files {
            data: Arc::new(
                files
                    .iter()
                    .map(|(name, data)| (name.to_string(), data.as_bytes().to_vec()))
                    .collect(),
            ),
            requests: Arc::default(),
        };
        let runtime = Runtime::new().unwrap();
        let app = Router::new()
            .route("/files/{name}", get(serve_file))
            .with_state(files.clone());
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let base_url = format!("http://{}/files", listener.local_addr().unwrap());
        runtime.spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            files,
            base_url,
            _runtime: runtime,
        }
    }

    /// Names requested so far, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.files.requests.lock().clone()
    }
}

struct Bundles;

impl BundleBackend for Bundles {
    fn open(&self, package: &str, mut stream: ReadStream) -> Result<Box<dyn LoadedBundle>, BackendError> {
        let mut data = String::new();
        stream.read_to_string(&mut data)?;
        Ok(Box::new(Bundle {
            package: package.to_string(),
        }))
    }
}

struct Bundle {
    package: String,
}

impl LoadedBundle for Bundle {
    fn load_asset(&mut self, name: &str) -> Result<Option<AssetObject>, BackendError> {
        Ok(Some(Arc::new(format!("{}:{name}", self.package))))
    }

    fn unload(&mut self) {}
}

// "name=content" per line
struct Archives;

impl ArchiveBackend for Archives {
    fn open(&self, _package: &str, mut stream: ReadStream) -> Result<Box<dyn LoadedArchive>, BackendError> {
        let mut data = String::new();
        stream.read_to_string(&mut data)?;
        let entries = data
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(name, content)| (name.to_string(), content.as_bytes().to_vec()))
            .collect();
        Ok(Box::new(Archive { entries }))
    }
}

struct Archive {
    entries: HashMap<String, Vec<u8>>,
}

impl LoadedArchive for Archive {
    fn open_entry(&mut self, name: &str) -> Option<Box<dyn Read + Send>> {
        let data = self.entries.get(name)?.clone();
        Some(Box::new(Cursor::new(data)))
    }
}

pub fn backends() -> Backends {
    Backends {
        bundle: Arc::new(Bundles),
        archive: Arc::new(Archives),
    }
}

pub const CORE: &str = "core bundle bytes";
pub const UI: &str = "ui bundle bytes";
pub const DOCS: &str = "Docs/readme.md=# Ferry\nDocs/guide.md=Read me first";

/// `ui` depends on `core`; `docs` is an archive; `ghost` is never served
/// and `haunted` depends on it.
pub fn library() -> ContentLibrary {
    let mut library = ContentLibrary::new();
    let core = library.add_package("core", PackageKind::Bundle, ContentDigest::of(CORE.as_bytes()), Vec::<String>::new());
    let ui = library.add_package("ui", PackageKind::Bundle, ContentDigest::of(UI.as_bytes()), ["core"]);
    let docs = library.add_package("docs", PackageKind::Archive, ContentDigest::of(DOCS.as_bytes()), Vec::<String>::new());
    let ghost = library.add_package("ghost", PackageKind::Bundle, ContentDigest::of(b"boo"), Vec::<String>::new());
    let haunted = library.add_package("haunted", PackageKind::Bundle, ContentDigest::of(CORE.as_bytes()), ["ghost"]);

    library.add_package_entry(core, "Assets/logo.txt").unwrap();
    library.add_package_entry(ui, "Assets/UI/button.txt").unwrap();
    library.add_package_entry(docs, "Docs/readme.md").unwrap();
    library.add_package_entry(docs, "Docs/guide.md").unwrap();
    library.add_package_entry(ghost, "Assets/ghost.txt").unwrap();
    library.add_package_entry(haunted, "Assets/haunted.txt").unwrap();
    library
}

pub fn remote() -> Remote {
    Remote::start(&[("core", CORE), ("ui", UI), ("docs", DOCS), ("haunted", CORE)])
}

pub fn config(remote: &Remote, root: &std::path::Path) -> ContentConfig {
    ContentConfig {
        storage_root: root.to_path_buf(),
        base_url: remote.base_url.clone(),
        pump_interval_ms: 1,
        ..ContentConfig::default()
    }
}

pub fn describe(result: AssetResult) -> String {
    match result {
        Ok(Some(object)) => object
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| {
                object
                    .downcast_ref::<bytes::Bytes>()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            })
            .unwrap_or_else(|| "?".to_string()),
        Ok(None) => "none".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

pub fn settle(scheduler: &Scheduler, predicate: impl FnMut() -> bool) {
    assert!(scheduler.wait_until_timeout(predicate, Duration::from_secs(10)));
}
