use crate::error::{DownloadError, Result};
use ferry_core::prelude::*;
use ferry_storage::{LocalStorage, WriteStream};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{LOCATION, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url, redirect};
use std::collections::VecDeque;
use std::io::{Seek, SeekFrom, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Callback = Box<dyn FnOnce(&DownloadResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// What a completion callback receives.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub success: bool,
    pub name: String,
    /// Final HTTP status, `None` when no response arrived.
    pub status: Option<StatusCode>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub name: String,
    pub expected_size: Option<u32>,
    pub received_bytes: u64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(SlotHandle);

struct JobState {
    status: JobStatus,
    callbacks: SlotTable<Callback>,
    result: Option<DownloadResult>,
}

struct Job {
    name: String,
    expected_size: Option<u32>,
    storage: LocalStorage,
    cancel: CancellationToken,
    done: AtomicBool,
    received: AtomicU64,
    state: Mutex<JobState>,
}

impl Job {
    fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            expected_size: self.expected_size,
            received_bytes: self.received.load(Ordering::Relaxed),
            status: self.state.lock().status,
        }
    }

    fn set_status(&self, status: JobStatus) {
        self.state.lock().status = status;
    }

    /// Marks the job cancelled and drops every pending callback.
    fn abort(&self) {
        self.cancel.cancel();
        self.done.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.status = JobStatus::Cancelled;
        state.callbacks.clear();
    }
}

/// A caller's view of a queued or finished job.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn info(&self) -> JobInfo {
        self.job.info()
    }

    pub fn is_done(&self) -> bool {
        self.job.done.load(Ordering::Acquire)
    }

    /// Registers a completion callback. On a job that already finished the
    /// callback runs right away; on a cancelled job it is dropped.
    pub fn bind(&self, callback: impl FnOnce(&DownloadResult) + Send + 'static) -> CallbackId {
        let mut state = self.job.state.lock();
        if state.status == JobStatus::Cancelled {
            return CallbackId(SlotHandle::NONE);
        }
        match state.result.clone() {
            Some(result) => {
                drop(state);
                invoke(Box::new(callback), &result);
                CallbackId(SlotHandle::NONE)
            }
            None => CallbackId(state.callbacks.add(Box::new(callback))),
        }
    }

    pub fn unbind(&self, id: CallbackId) -> bool {
        self.job.state.lock().callbacks.remove(id.0)
    }

    pub fn is_bound(&self, id: CallbackId) -> bool {
        self.job.state.lock().callbacks.contains(id.0)
    }

    /// Whether both handles point at the same job.
    pub fn same_job(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.job, &other.job)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("info", &self.info()).finish()
    }
}

fn invoke(callback: Callback, result: &DownloadResult) {
    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        error!("Download callback for {} panicked", result.name);
    }
}

#[derive(Default)]
struct Queues {
    active: VecDeque<Arc<Job>>,
    waiting: VecDeque<Arc<Job>>,
    shutdown: bool,
}

impl Queues {
    fn find(&self, name: &str) -> Option<&Arc<Job>> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .find(|job| job.name == name)
    }
}

struct Settings {
    max_active: usize,
    chunk_size: usize,
    throttle_bytes: u64,
    throttle_window: Duration,
}

struct DownloaderInner {
    scheduler: Scheduler,
    runtime: Handle,
    client: Client,
    resolver: Arc<dyn UriResolver>,
    settings: Settings,
    queues: Mutex<Queues>,
}

/// Bounded-concurrency, resumable package fetcher.
///
/// Queue mutation and callbacks happen on the control context only; the
/// transfer itself runs on `runtime`.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    pub fn new(
        scheduler: Scheduler,
        runtime: Handle,
        resolver: Arc<dyn UriResolver>,
        config: &ContentConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(config.request_timeout())
            .read_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            inner: Arc::new(DownloaderInner {
                scheduler,
                runtime,
                client,
                resolver,
                settings: Settings {
                    max_active: config.max_concurrent_downloads.max(1),
                    chunk_size: config.chunk_size.max(1),
                    throttle_bytes: config.throttle_bytes,
                    throttle_window: config.throttle_window(),
                },
                queues: Mutex::new(Queues::default()),
            }),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    fn ensure_control(&self) -> Result<()> {
        if self.inner.scheduler.is_control_thread() {
            Ok(())
        } else {
            Err(DownloadError::NotControlContext)
        }
    }

    /// Queues a fetch of `name` into `storage`. A job already queued for the
    /// same name is shared instead of starting a second transfer.
    pub fn enqueue(
        &self,
        storage: &LocalStorage,
        name: &str,
        expected_size: Option<u32>,
    ) -> Result<JobHandle> {
        self.ensure_control()?;

        let job = {
            let mut queues = self.inner.queues.lock();
            if queues.shutdown {
                return Err(DownloadError::Shutdown);
            }
            if let Some(job) = queues.find(name) {
                return Ok(JobHandle { job: job.clone() });
            }

            let job = Arc::new(Job {
                name: name.to_string(),
                expected_size,
                storage: storage.clone(),
                cancel: CancellationToken::new(),
                done: AtomicBool::new(false),
                received: AtomicU64::new(0),
                state: Mutex::new(JobState {
                    status: JobStatus::Waiting,
                    callbacks: SlotTable::new(),
                    result: None,
                }),
            });

            if queues.active.len() >= self.inner.settings.max_active {
                debug!("Queued download {name}");
                queues.waiting.push_back(job.clone());
                return Ok(JobHandle { job });
            }
            queues.active.push_back(job.clone());
            job
        };

        self.dispatch(job.clone());
        Ok(JobHandle { job })
    }

    /// Aborts the job for `name`. Its callbacks never fire.
    pub fn cancel(&self, name: &str) -> bool {
        if self.ensure_control().is_err() {
            warn!("cancel({name}) called off the control context");
            return false;
        }

        let job = {
            let mut queues = self.inner.queues.lock();
            let position = |queue: &VecDeque<Arc<Job>>| queue.iter().position(|j| j.name == name);
            if let Some(index) = position(&queues.active) {
                queues.active.remove(index)
            } else if let Some(index) = position(&queues.waiting) {
                queues.waiting.remove(index)
            } else {
                None
            }
        };

        let Some(job) = job else {
            return false;
        };
        job.abort();
        info!("Cancelled download {name}");
        self.promote();
        true
    }

    /// Drops waiting jobs and cancels active ones. Later enqueues fail.
    pub fn shutdown(&self) {
        let jobs: Vec<Arc<Job>> = {
            let mut queues = self.inner.queues.lock();
            queues.shutdown = true;
            let mut jobs: Vec<_> = queues.waiting.drain(..).collect();
            jobs.extend(queues.active.drain(..));
            jobs
        };
        for job in jobs {
            debug!("Aborting download {} at shutdown", job.name);
            job.abort();
        }
    }

    /// Pumps the control context until every queued job has completed.
    pub fn wait_all(&self) -> Result<()> {
        self.ensure_control()?;
        self.inner.scheduler.wait_until(|| self.is_idle());
        Ok(())
    }

    /// Pumps the control context until no job for `name` is queued.
    pub fn wait_for(&self, name: &str) -> Result<()> {
        self.ensure_control()?;
        self.inner
            .scheduler
            .wait_until(|| self.inner.queues.lock().find(name).is_none());
        Ok(())
    }

    /// Active plus waiting jobs.
    pub fn len(&self) -> usize {
        let queues = self.inner.queues.lock();
        queues.active.len() + queues.waiting.len()
    }

    pub fn active_len(&self) -> usize {
        self.inner.queues.lock().active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.len() == 0
    }

    pub fn job_status(&self, name: &str) -> Option<JobStatus> {
        let queues = self.inner.queues.lock();
        queues.find(name).map(|job| job.state.lock().status)
    }

    pub fn received_bytes(&self, name: &str) -> Option<u64> {
        let queues = self.inner.queues.lock();
        queues
            .find(name)
            .map(|job| job.received.load(Ordering::Relaxed))
    }

    fn dispatch(&self, job: Arc<Job>) {
        job.set_status(JobStatus::Running);
        debug!("Starting download {}", job.name);

        let inner = Arc::downgrade(&self.inner);
        let scheduler = self.inner.scheduler.clone();
        let client = self.inner.client.clone();
        let resolver = self.inner.resolver.clone();
        let settings = Transfer {
            chunk_size: self.inner.settings.chunk_size,
            throttle_bytes: self.inner.settings.throttle_bytes,
            throttle_window: self.inner.settings.throttle_window,
        };

        self.inner.runtime.spawn(async move {
            let outcome = tokio::select! {
                _ = job.cancel.cancelled() => Err(DownloadError::Cancelled),
                outcome = settings.run(&client, resolver.as_ref(), &job) => outcome,
            };
            job.done.store(true, Ordering::Release);
            scheduler.post(move || on_job_completed(inner, job, outcome));
        });
    }

    fn promote(&self) {
        loop {
            let job = {
                let mut queues = self.inner.queues.lock();
                if queues.shutdown || queues.active.len() >= self.inner.settings.max_active {
                    return;
                }
                let Some(job) = queues.waiting.pop_front() else {
                    return;
                };
                queues.active.push_back(job.clone());
                job
            };
            self.dispatch(job);
        }
    }
}

/// Runs on the control context once a transfer ends.
fn on_job_completed(
    inner: Weak<DownloaderInner>,
    job: Arc<Job>,
    outcome: Result<StatusCode>,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let downloader = Downloader { inner };
    downloader
        .inner
        .queues
        .lock()
        .active
        .retain(|active| !Arc::ptr_eq(active, &job));

    if job.cancel.is_cancelled() {
        debug!("Download {} ended after cancellation", job.name);
        downloader.promote();
        return;
    }

    let result = match &outcome {
        Ok(status) => {
            info!(
                "Downloaded {} ({} bytes)",
                job.name,
                job.received.load(Ordering::Relaxed)
            );
            DownloadResult {
                success: true,
                name: job.name.clone(),
                status: Some(*status),
            }
        }
        Err(e) => {
            warn!("Download of {} failed: {e}", job.name);
            DownloadResult {
                success: false,
                name: job.name.clone(),
                status: e.status(),
            }
        }
    };

    let mut callbacks = Vec::new();
    {
        let mut state = job.state.lock();
        state.status = if result.success {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        state.result = Some(result.clone());
        while let Some((_, callback)) = state.callbacks.take_first() {
            callbacks.push(callback);
        }
    }
    for callback in callbacks {
        invoke(callback, &result);
    }

    downloader.promote();
}

struct Transfer {
    chunk_size: usize,
    throttle_bytes: u64,
    throttle_window: Duration,
}

impl Transfer {
    async fn run(&self, client: &Client, resolver: &dyn UriResolver, job: &Job) -> Result<StatusCode> {
        let mut stream = job.storage.open_write(&job.name)?;
        let mut offset = stream.len();
        match job.expected_size {
            Some(expected) if offset < expected as u64 => {}
            _ if offset > 0 => {
                debug!("{} has {offset} stale bytes, restarting", job.name);
                stream.set_len(0)?;
                offset = 0;
            }
            _ => {}
        }
        stream.seek(SeekFrom::Start(offset))?;

        let url = resolver.uri(&job.name);
        let user_agent = resolver.user_agent();
        let mut response = send(client, &url, offset, user_agent.as_deref()).await?;

        if response.status().is_redirection() {
            let target = redirect_target(&response)?;
            debug!("Redirect {url} => {target}");
            response = send(client, target.as_str(), offset, user_agent.as_deref()).await?;
        }

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if offset > 0 => {
                debug!("Range ignored for {}, restarting from zero", job.name);
                stream.set_len(0)?;
                stream.seek(SeekFrom::Start(0))?;
                offset = 0;
            }
            StatusCode::OK => {}
            _ => {
                warn!("Rejected response for {url}: {status}");
                return Err(DownloadError::Status(status));
            }
        }

        let remaining = job.expected_size.map(|expected| expected as u64 - offset);
        if let Some(remaining) = remaining
            && response.content_length() != Some(remaining)
        {
            warn!(
                "Rejected response for {url}: expected {remaining} bytes, got {:?}",
                response.content_length()
            );
            return Err(DownloadError::LengthMismatch {
                expected: remaining,
                actual: response.content_length(),
            });
        }

        job.received.store(offset, Ordering::Relaxed);
        self.copy_body(response, &mut stream, job).await?;

        if let Some(expected) = job.expected_size
            && stream.len() != expected as u64
        {
            return Err(DownloadError::LengthMismatch {
                expected: expected as u64,
                actual: Some(stream.len()),
            });
        }

        let digest = stream.close()?;
        debug!("{} stored as {digest}", job.name);
        Ok(status)
    }

    async fn copy_body(&self, response: Response, stream: &mut WriteStream, job: &Job) -> Result<()> {
        let mut body = response.bytes_stream();
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for piece in chunk.chunks(self.chunk_size) {
                stream.write_all(piece)?;
                job.received.fetch_add(piece.len() as u64, Ordering::Relaxed);
                window_bytes += piece.len() as u64;

                let elapsed = window_start.elapsed();
                if elapsed >= self.throttle_window {
                    window_start = Instant::now();
                    window_bytes = 0;
                } else if window_bytes >= self.throttle_bytes {
                    tokio::time::sleep(self.throttle_window - elapsed).await;
                    window_start = Instant::now();
                    window_bytes = 0;
                }
            }
        }
        Ok(())
    }
}

async fn send(client: &Client, url: &str, offset: u64, user_agent: Option<&str>) -> Result<Response> {
    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    if let Some(user_agent) = user_agent {
        request = request.header(USER_AGENT, user_agent);
    }
    Ok(request.send().await?)
}

fn redirect_target(response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(DownloadError::Status(response.status()))?;
    response
        .url()
        .join(location)
        .map_err(|e| DownloadError::InvalidUrl(format!("{location}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::BaseUrlResolver;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, header};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use ferry_fs::OsFileSystem;
    use std::collections::HashMap;
    use tokio::runtime::Runtime;

    #[derive(Clone, Default)]
    struct Remote {
        files: Arc<HashMap<String, Vec<u8>>>,
        // "<route> <name> <range>" per request
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Remote {
        fn with(files: &[(&str, Vec<u8>)]) -> Self {
            Self {
                files: Arc::new(
                    files
                        .iter()
                        .map(|(name, data)| (name.to_string(), data.clone()))
                        .collect(),
                ),
                log: Arc::default(),
            }
        }

        fn record(&self, entry: String) {
            self.log.lock().push(entry);
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    fn range_start(headers: &HeaderMap) -> Option<usize> {
        headers
            .get(header::RANGE)?
            .to_str()
            .ok()?
            .strip_prefix("bytes=")?
            .trim_end_matches('-')
            .parse()
            .ok()
    }

    async fn ranged(State(remote): State<Remote>, Path(name): Path<String>, headers: HeaderMap) -> AxumResponse {
        let start = range_start(&headers);
        remote.record(format!("files {name} {start:?}"));
        let Some(data) = remote.files.get(&name) else {
            return axum::http::StatusCode::NOT_FOUND.into_response();
        };
        match start {
            Some(start) if start < data.len() => {
                (axum::http::StatusCode::PARTIAL_CONTENT, data[start..].to_vec()).into_response()
            }
            _ => data.clone().into_response(),
        }
    }

    async fn plain(State(remote): State<Remote>, Path(name): Path<String>, headers: HeaderMap) -> AxumResponse {
        remote.record(format!("plain {name} {:?}", range_start(&headers)));
        match remote.files.get(&name) {
            Some(data) => data.clone().into_response(),
            None => axum::http::StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn moved(State(remote): State<Remote>, Path(name): Path<String>) -> AxumResponse {
        remote.record(format!("moved {name}"));
        (
            axum::http::StatusCode::FOUND,
            [(header::LOCATION, format!("/files/{name}"))],
        )
            .into_response()
    }

    async fn looping(Path(name): Path<String>) -> AxumResponse {
        (
            axum::http::StatusCode::FOUND,
            [(header::LOCATION, format!("/loop/{name}"))],
        )
            .into_response()
    }

    struct Harness {
        runtime: Runtime,
        scheduler: Scheduler,
        storage: LocalStorage,
        remote: Remote,
        base: String,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(remote: Remote) -> Self {
            let runtime = Runtime::new().unwrap();
            let app = Router::new()
                .route("/files/{name}", get(ranged))
                .route("/plain/{name}", get(plain))
                .route("/moved/{name}", get(moved))
                .route("/loop/{name}", get(looping))
                .with_state(remote.clone());
            let listener = runtime
                .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
                .unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            runtime.spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            let dir = tempfile::tempdir().unwrap();
            let storage = LocalStorage::new(Arc::new(OsFileSystem::new(dir.path())), ".pak").unwrap();
            Self {
                runtime,
                scheduler: Scheduler::new(Duration::from_millis(1)),
                storage,
                remote,
                base,
                _dir: dir,
            }
        }

        fn downloader(&self, route: &str, max: usize) -> Downloader {
            self.downloader_with(
                route,
                ContentConfig {
                    max_concurrent_downloads: max,
                    ..ContentConfig::default()
                },
            )
        }

        fn downloader_with(&self, route: &str, config: ContentConfig) -> Downloader {
            let resolver =
                BaseUrlResolver::new(&format!("{}/{route}", self.base), Some("ferry-test".into())).unwrap();
            Downloader::new(
                self.scheduler.clone(),
                self.runtime.handle().clone(),
                Arc::new(resolver),
                &config,
            )
            .unwrap()
        }

        fn seed(&self, alias: &str, bytes: &[u8]) {
            let mut stream = self.storage.open_write(alias).unwrap();
            stream.write_all(bytes).unwrap();
            stream.close().unwrap();
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn capture(handle: &JobHandle) -> Arc<Mutex<Vec<DownloadResult>>> {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        handle.bind(move |result| sink.lock().push(result.clone()));
        results
    }

    #[test]
    fn fetched_bytes_verify() {
        let data = payload(100);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));
        let downloader = h.downloader("files", 3);

        let job = downloader.enqueue(&h.storage, "A", Some(100)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].status, Some(StatusCode::OK));
        assert_eq!(job.info().status, JobStatus::Succeeded);
        assert_eq!(job.info().received_bytes, 100);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
    }

    #[test]
    fn throttle_spreads_transfer_over_windows() {
        let data = payload(1000);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));
        let downloader = h.downloader_with(
            "files",
            ContentConfig {
                chunk_size: 25,
                throttle_bytes: 100,
                throttle_window_ms: 50,
                ..ContentConfig::default()
            },
        );

        let started = std::time::Instant::now();
        let job = downloader.enqueue(&h.storage, "A", Some(1000)).unwrap();
        downloader.wait_all().unwrap();
        let elapsed = started.elapsed();

        // 1000 bytes at 100 per window naps at least nine times
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert_eq!(job.info().status, JobStatus::Succeeded);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
    }

    #[test]
    fn same_name_shares_one_job() {
        let h = Harness::new(Remote::with(&[("A", payload(64))]));
        let downloader = h.downloader("files", 3);

        let first = downloader.enqueue(&h.storage, "A", Some(64)).unwrap();
        let second = downloader.enqueue(&h.storage, "A", Some(64)).unwrap();
        assert!(first.same_job(&second));
        assert_eq!(downloader.len(), 1);

        let a = capture(&first);
        let b = capture(&second);
        downloader.wait_all().unwrap();

        assert_eq!(h.remote.requests().len(), 1);
        assert_eq!(a.lock().len(), 1);
        assert_eq!(b.lock().len(), 1);
    }

    #[test]
    fn waiting_job_starts_after_callback() {
        let remote = Remote::with(&[("A", payload(10)), ("B", payload(20))]);
        let h = Harness::new(remote.clone());
        let downloader = h.downloader("files", 1);

        let a = downloader.enqueue(&h.storage, "A", Some(10)).unwrap();
        let b = downloader.enqueue(&h.storage, "B", Some(20)).unwrap();
        assert_eq!(downloader.active_len(), 1);
        assert_eq!(downloader.job_status("B"), Some(JobStatus::Waiting));

        let log = remote.log.clone();
        a.bind(move |_| log.lock().push("A done".to_string()));
        let log = remote.log.clone();
        b.bind(move |_| log.lock().push("B done".to_string()));
        downloader.wait_all().unwrap();

        assert_eq!(
            remote.requests(),
            vec!["files A None", "A done", "files B None", "B done"]
        );
    }

    #[test]
    fn many_jobs_all_complete_within_limit() {
        let files: Vec<(String, Vec<u8>)> = (0..8).map(|i| (format!("P{i}"), payload(50 + i))).collect();
        let refs: Vec<(&str, Vec<u8>)> = files.iter().map(|(n, d)| (n.as_str(), d.clone())).collect();
        let h = Harness::new(Remote::with(&refs));
        let downloader = h.downloader("files", 2);

        let handles: Vec<_> = files
            .iter()
            .map(|(name, data)| downloader.enqueue(&h.storage, name, Some(data.len() as u32)).unwrap())
            .collect();
        let done = Arc::new(AtomicU64::new(0));
        for handle in &handles {
            let done = done.clone();
            handle.bind(move |result| {
                assert!(result.success);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        h.scheduler.wait_until(|| {
            assert!(downloader.active_len() <= 2);
            downloader.is_idle()
        });
        assert_eq!(done.load(Ordering::SeqCst), 8);
        for (name, data) in &files {
            assert!(h.storage.verify(name, &ContentDigest::of(data)));
        }
    }

    #[test]
    fn cancelled_job_never_calls_back() {
        let h = Harness::new(Remote::with(&[("A", payload(100))]));
        let downloader = h.downloader("files", 3);

        let job = downloader.enqueue(&h.storage, "A", Some(100)).unwrap();
        let results = capture(&job);
        assert!(downloader.cancel("A"));
        assert!(!downloader.cancel("A"));
        assert!(downloader.is_idle());

        let deadline = std::time::Instant::now() + Duration::from_millis(200);
        h.scheduler.wait_until(|| std::time::Instant::now() >= deadline);

        assert!(results.lock().is_empty());
        assert_eq!(job.info().status, JobStatus::Cancelled);
        // late binds on a cancelled job are dropped too
        let late = capture(&job);
        assert!(late.lock().is_empty());
    }

    #[test]
    fn missing_file_fails_with_status() {
        let h = Harness::new(Remote::default());
        let downloader = h.downloader("files", 3);

        let job = downloader.enqueue(&h.storage, "nope", Some(10)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();

        let results = results.lock();
        assert!(!results[0].success);
        assert_eq!(results[0].status, Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let h = Harness::new(Remote::with(&[("A", payload(100))]));
        let downloader = h.downloader("files", 3);

        let job = downloader.enqueue(&h.storage, "A", Some(50)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();

        assert!(!results.lock()[0].success);
        assert_eq!(job.info().status, JobStatus::Failed);
    }

    #[test]
    fn follows_a_single_redirect() {
        let data = payload(80);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));

        let downloader = h.downloader("moved", 3);
        let job = downloader.enqueue(&h.storage, "A", Some(80)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();
        assert!(results.lock()[0].success);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
        assert_eq!(h.remote.requests(), vec!["moved A", "files A None"]);

        let looping = h.downloader("loop", 3);
        let job = looping.enqueue(&h.storage, "A", Some(80)).unwrap();
        let results = capture(&job);
        looping.wait_all().unwrap();
        assert!(!results.lock()[0].success);
        assert_eq!(results.lock()[0].status, Some(StatusCode::FOUND));
    }

    #[test]
    fn resumes_partial_content() {
        let data = payload(100);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));
        h.seed("A", &data[..40]);

        let downloader = h.downloader("files", 3);
        let job = downloader.enqueue(&h.storage, "A", Some(100)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();

        assert_eq!(results.lock()[0].status, Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(h.remote.requests(), vec!["files A Some(40)"]);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
    }

    #[test]
    fn full_answer_to_range_restarts() {
        let data = payload(100);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));
        h.seed("A", &[0xEE; 40]);

        let downloader = h.downloader("plain", 3);
        let job = downloader.enqueue(&h.storage, "A", Some(100)).unwrap();
        let results = capture(&job);
        downloader.wait_all().unwrap();

        assert!(results.lock()[0].success);
        assert_eq!(h.remote.requests(), vec!["plain A Some(40)"]);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
    }

    #[test]
    fn oversized_local_copy_is_refetched() {
        let data = payload(100);
        let h = Harness::new(Remote::with(&[("A", data.clone())]));
        h.seed("A", &[0xEE; 100]);

        let downloader = h.downloader("files", 3);
        downloader.enqueue(&h.storage, "A", Some(100)).unwrap();
        downloader.wait_all().unwrap();

        assert_eq!(h.remote.requests(), vec!["files A None"]);
        assert!(h.storage.verify("A", &ContentDigest::of(&data)));
    }

    #[test]
    fn enqueue_off_control_context_fails() {
        let h = Harness::new(Remote::default());
        let downloader = h.downloader("files", 3);
        let storage = h.storage.clone();

        let result = std::thread::spawn(move || downloader.enqueue(&storage, "A", None).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(DownloadError::NotControlContext)));
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let h = Harness::new(Remote::with(&[("A", payload(10))]));
        let downloader = h.downloader("files", 1);

        let a = downloader.enqueue(&h.storage, "A", Some(10)).unwrap();
        let b = downloader.enqueue(&h.storage, "B", Some(10)).unwrap();
        downloader.shutdown();

        assert!(downloader.is_idle());
        assert_eq!(a.info().status, JobStatus::Cancelled);
        assert_eq!(b.info().status, JobStatus::Cancelled);
        assert!(matches!(
            downloader.enqueue(&h.storage, "C", None),
            Err(DownloadError::Shutdown)
        ));
    }
}
