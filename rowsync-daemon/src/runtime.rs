use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use rowsync_core::config::LogFormat;
use rowsync_core::{paths, SyncType};
use rowsync_sync::{pipeline, AutoSyncResult, SyncOrchestrator};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{daemon_log_writer, rotate_logs, RotationPolicy};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Quiet period after the last source write before a watcher sync fires.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

const ROTATION_INTERVAL: Duration = Duration::from_secs(5);
const QUEUE_CAPACITY: usize = 64;

/// What asked for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Watcher,
    Socket { force: bool },
}

impl Trigger {
    fn label(self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Watcher => "watcher",
            Trigger::Socket { .. } => "socket",
        }
    }
}

struct SyncJob {
    trigger: Trigger,
    respond_to: Option<oneshot::Sender<AutoSyncResult>>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = rowsync_core::config::load_at(home)?;
    ensure_runtime_dirs(home)?;
    init_tracing(home, config.log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until ctrl-c or a `stop` request.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let (config, orchestrator) = pipeline::load_and_build_at(&home)?;
    let orchestrator = Arc::new(orchestrator);
    let started_at = Instant::now();
    let started_at_unix = chrono::Utc::now().timestamp();

    tracing::info!(
        home = %home.display(),
        source = %config.source_path_at(&home).display(),
        poll_seconds = config.poll_interval_seconds,
        "daemon starting",
    );

    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(QUEUE_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let timer_handle = {
        let shutdown = shutdown_tx.clone();
        let sync_tx = sync_tx.clone();
        let period = config.poll_interval();
        tokio::spawn(async move {
            let result = timer_task(period, sync_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let sync_tx = sync_tx.clone();
        let source = config.source_path_at(&home);
        let enabled = config.watch_source;
        tokio::spawn(async move {
            let result = if enabled {
                watcher_task(source, sync_tx, shutdown.subscribe()).await
            } else {
                let mut shutdown_rx = shutdown.subscribe();
                let _ = shutdown_rx.recv().await;
                Ok(())
            };
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result = sync_processor_task(orchestrator, sync_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let context = ClientContext {
            home: home.clone(),
            orchestrator: orchestrator.clone(),
            sync_tx: sync_tx.clone(),
            shutdown_tx: shutdown.clone(),
            started_at,
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        let _ = shutdown.send(());
                        Ok(())
                    }
                    Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                }
            }
        })
    };
    drop(sync_tx);

    let (timer, watcher, processor, socket, rotation, signal) = tokio::join!(
        timer_handle,
        watcher_handle,
        processor_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("timer", timer)?;
    handle_join("watcher", watcher)?;
    handle_join("sync_processor", processor)?;
    handle_join("socket_server", socket)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Freshness check on every tick, including one at startup.
async fn timer_task(
    period: Duration,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => submit(&sync_tx, Trigger::Timer),
        }
    }
    Ok(())
}

async fn watcher_task(
    source: PathBuf,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let dir = source
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    // Watch events arrive with real paths, so compare against the canonical form.
    let dir = fs::canonicalize(&dir).unwrap_or(dir);
    let target = match source.file_name() {
        Some(name) => dir.join(name),
        None => {
            return Err(DaemonError::Protocol(format!(
                "source path has no file name: {}",
                source.display()
            )))
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %target.display(), "watching source file");

    debounce_source_events(&target, DEBOUNCE_WINDOW, event_rx, &sync_tx, shutdown_rx).await;
    drop(watcher);
    Ok(())
}

/// Collapse bursts of writes to `target` into one [`Trigger::Watcher`] job,
/// fired once the file has been quiet for `window`.
async fn debounce_source_events(
    target: &Path,
    window: Duration,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    sync_tx: &mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = wait_until(deadline) => {
                debouncer.clear();
                tracing::info!(path = %target.display(), "source changed, re-checking freshness");
                submit(sync_tx, Trigger::Watcher);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) if is_source_event(&event, target) => debouncer.note(Instant::now()),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "watcher event error"),
                }
            }
        }
    }
}

/// Trailing-edge debounce state.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last_event: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: None,
        }
    }

    fn note(&mut self, at: Instant) {
        self.last_event = Some(at);
    }

    fn deadline(&self) -> Option<Instant> {
        self.last_event.map(|at| at + self.window)
    }

    fn clear(&mut self) {
        self.last_event = None;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_source_event(event: &Event, target: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path == target || path.file_name() == target.file_name())
}

/// Fire-and-forget enqueue. A full queue already holds a pending check, so
/// the trigger is dropped.
fn submit(sync_tx: &mpsc::Sender<SyncJob>, trigger: Trigger) {
    let job = SyncJob {
        trigger,
        respond_to: None,
    };
    if let Err(err) = sync_tx.try_send(job) {
        tracing::debug!(trigger = trigger.label(), error = %err, "sync queue busy, trigger dropped");
    }
}

async fn enqueue_and_wait(
    sync_tx: &mpsc::Sender<SyncJob>,
    trigger: Trigger,
) -> Result<AutoSyncResult, DaemonError> {
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            trigger,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))
}

async fn sync_processor_task(
    orchestrator: Arc<SyncOrchestrator>,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let result = execute(&orchestrator, job.trigger).await;
                log_result(job.trigger, &result);
                if let Some(respond_to) = job.respond_to {
                    let _ = respond_to.send(result);
                }
            }
        }
    }
    Ok(())
}

async fn execute(orchestrator: &SyncOrchestrator, trigger: Trigger) -> AutoSyncResult {
    let threshold = orchestrator.settings().stale_after_minutes;
    let invalidate = matches!(trigger, Trigger::Watcher | Trigger::Socket { force: true });
    if invalidate {
        if let Err(err) = orchestrator.invalidate().await {
            tracing::warn!(error = %err, "cache invalidation failed");
        }
    }
    match trigger {
        Trigger::Timer | Trigger::Watcher => orchestrator.sync_if_stale(threshold).await,
        Trigger::Socket { .. } => {
            orchestrator
                .sync_if_stale_as(threshold, SyncType::Manual)
                .await
        }
    }
}

fn log_result(trigger: Trigger, result: &AutoSyncResult) {
    if !result.triggered {
        tracing::debug!(trigger = trigger.label(), reason = %result.reason, "sync skipped");
    } else if result.success {
        tracing::info!(
            trigger = trigger.label(),
            reason = %result.reason,
            added = result.records_added,
            updated = result.records_updated,
            deleted = result.records_deleted,
            failed = result.errors.len(),
            duration_ms = result.duration_ms,
            "sync completed",
        );
    } else {
        tracing::error!(
            trigger = trigger.label(),
            reason = %result.reason,
            error = result.error.as_deref().unwrap_or("partial failure"),
            failed = result.errors.len(),
            "sync failed",
        );
    }
}

/// Shared state handed to every socket client.
#[derive(Clone)]
struct ClientContext {
    home: PathBuf,
    orchestrator: Arc<SyncOrchestrator>,
    sync_tx: mpsc::Sender<SyncJob>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
    started_at_unix: i64,
}

async fn socket_server_task(
    context: ClientContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = paths::socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, context: ClientContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match build_status_payload(&context).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "sync" => {
                let trigger = Trigger::Socket {
                    force: request.force.unwrap_or(false),
                };
                match enqueue_and_wait(&context.sync_tx, trigger).await {
                    Ok(result) => DaemonResponse::ok(json!(result)),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            "metrics" => {
                DaemonResponse::ok(Value::String(
                    context.orchestrator.metrics().render_prometheus().await,
                ))
            }
            "stop" => {
                let _ = context.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// The tracker's status surface with daemon fields merged in.
async fn build_status_payload(context: &ClientContext) -> Result<Value, DaemonError> {
    let surface = context.orchestrator.tracker().status_surface().await;
    let mut payload = serde_json::to_value(&surface)?;
    if let Value::Object(map) = &mut payload {
        map.insert("running".into(), json!(true));
        map.insert("startedAtUnix".into(), json!(context.started_at_unix));
        map.insert(
            "uptimeSeconds".into(),
            json!(context.started_at.elapsed().as_secs()),
        );
        map.insert(
            "syncInFlight".into(),
            json!(context.orchestrator.is_running()),
        );
        map.insert(
            "socket".into(),
            json!(paths::socket_path(&context.home).display().to_string()),
        );
    }
    Ok(payload)
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick is immediate; startup never rotates.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                tokio::task::spawn_blocking(move || rotate_logs(&home, &RotationPolicy::default()))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [paths::root(home), paths::run_dir(home), paths::logs_dir(home)] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &DaemonResponse) -> Result<(), DaemonError>
where
    W: AsyncWriteExt + Unpin,
{
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Log to the terminal and to the files under `logs/`.
fn init_tracing(home: &Path, format: LogFormat) {
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(daemon_log_writer(home)));
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};
    use rowsync_core::SyncConfig;
    use tempfile::TempDir;
    use tokio::time::advance;

    fn write_source(home: &Path, rows: Value) -> SyncConfig {
        let config = SyncConfig::default();
        fs::create_dir_all(paths::root(home)).unwrap();
        fs::write(config.source_path_at(home), rows.to_string()).unwrap();
        config
    }

    fn context(home: &Path) -> (ClientContext, mpsc::Receiver<SyncJob>, broadcast::Receiver<()>) {
        let config = write_source(home, json!([{"id": 1, "name": "a"}]));
        let orchestrator = Arc::new(pipeline::build_at(home, &config).unwrap());
        let (sync_tx, sync_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let context = ClientContext {
            home: home.to_path_buf(),
            orchestrator,
            sync_tx,
            shutdown_tx,
            started_at: Instant::now(),
            started_at_unix: 1_000_000,
        };
        (context, sync_rx, shutdown_rx)
    }

    fn source_event(path: &Path) -> notify::Result<Event> {
        Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path.to_path_buf()))
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn rapid_source_writes_collapse_to_one_trigger() {
        let target = PathBuf::from("/data/source.json");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sync_tx, mut sync_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let loop_target = target.clone();
        let handle = tokio::spawn(async move {
            debounce_source_events(
                &loop_target,
                Duration::from_millis(100),
                event_rx,
                &sync_tx,
                shutdown_rx,
            )
            .await;
        });

        for _ in 0..5 {
            event_tx.send(source_event(&target)).unwrap();
            advance(Duration::from_millis(20)).await;
        }
        assert!(sync_rx.try_recv().is_err(), "must wait for the quiet period");

        advance(Duration::from_millis(150)).await;
        let job = sync_rx.recv().await.expect("one watcher job");
        assert_eq!(job.trigger, Trigger::Watcher);
        assert!(sync_rx.try_recv().is_err(), "burst must produce exactly one job");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn unrelated_files_are_ignored() {
        let target = PathBuf::from("/data/source.json");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sync_tx, mut sync_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let loop_target = target.clone();
        let handle = tokio::spawn(async move {
            debounce_source_events(&loop_target, DEBOUNCE_WINDOW, event_rx, &sync_tx, shutdown_rx)
                .await;
        });

        event_tx
            .send(Ok(Event::new(EventKind::Create(CreateKind::File))
                .add_path(PathBuf::from("/data/other.json"))))
            .unwrap();
        advance(DEBOUNCE_WINDOW * 2).await;
        assert!(sync_rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn debouncer_deadline_tracks_last_event() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        assert_eq!(debouncer.deadline(), None);

        debouncer.note(start);
        debouncer.note(start + Duration::from_millis(300));
        assert_eq!(
            debouncer.deadline(),
            Some(start + Duration::from_millis(800))
        );

        debouncer.clear();
        assert_eq!(debouncer.deadline(), None);
    }

    #[tokio::test]
    async fn status_payload_merges_surface_and_daemon_fields() {
        let home = TempDir::new().unwrap();
        let (context, _sync_rx, _shutdown_rx) = context(home.path());

        let payload = build_status_payload(&context).await.unwrap();
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["startedAtUnix"], json!(1_000_000));
        assert_eq!(payload["lastSync"], Value::Null);
        assert_eq!(payload["status"], json!("healthy"));
        assert_eq!(payload["syncInFlight"], json!(false));
        assert!(payload["uptimeSeconds"].is_u64());
    }

    #[tokio::test]
    async fn processor_runs_socket_sync_and_replies() {
        let home = TempDir::new().unwrap();
        let (context, sync_rx, _shutdown_rx) = context(home.path());
        let (shutdown_tx, _) = broadcast::channel(1);
        let processor = tokio::spawn(sync_processor_task(
            context.orchestrator.clone(),
            sync_rx,
            shutdown_tx.subscribe(),
        ));

        let first = enqueue_and_wait(&context.sync_tx, Trigger::Socket { force: false })
            .await
            .unwrap();
        assert!(first.triggered);
        assert_eq!(first.records_added, 1);

        let second = enqueue_and_wait(&context.sync_tx, Trigger::Socket { force: false })
            .await
            .unwrap();
        assert!(!second.triggered, "fresh cache skips");

        let forced = enqueue_and_wait(&context.sync_tx, Trigger::Socket { force: true })
            .await
            .unwrap();
        assert!(forced.triggered, "force drops the cache first");

        let last = context.orchestrator.tracker().last_sync().await.unwrap();
        assert_eq!(last.sync_type, SyncType::Manual);

        shutdown_tx.send(()).unwrap();
        processor.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socket_client_answers_each_command() {
        let home = TempDir::new().unwrap();
        let (context, _sync_rx, mut shutdown_rx) = context(home.path());
        let (client, server) = UnixStream::pair().unwrap();
        let served = tokio::spawn(handle_socket_client(server, context));

        let (reader, mut writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut responses = Vec::new();
        for line in [
            r#"{"cmd":"status"}"#,
            r#"{"cmd":"metrics"}"#,
            r#"{"cmd":"bogus"}"#,
            "not json",
            r#"{"cmd":"stop"}"#,
        ] {
            writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            let reply = lines.next_line().await.unwrap().expect("response line");
            responses.push(serde_json::from_str::<DaemonResponse>(&reply).unwrap());
        }

        assert!(responses[0].ok);
        let metrics = responses[1].data.as_ref().and_then(Value::as_str).unwrap();
        assert!(metrics.contains("# TYPE rowsync_syncs_total counter"));
        assert!(!responses[2].ok);
        assert!(responses[2].error.as_deref().unwrap().contains("unknown command"));
        assert!(responses[3].error.as_deref().unwrap().starts_with("invalid request JSON"));
        assert_eq!(responses[4].data, Some(json!({"stopping": true})));

        shutdown_rx.recv().await.expect("stop broadcasts shutdown");
        served.await.unwrap().unwrap();
    }

    #[test]
    fn stale_socket_file_is_removed_before_bind() {
        let home = TempDir::new().unwrap();
        let socket = home.path().join("daemon.sock");
        fs::write(&socket, b"").unwrap();

        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }
}
