use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;

use observa_core::config::AgentConfig;
use observa_core::types::{ClusterId, ClusterState, ResourceKind, SyncCycleResult};
use observa_source::{HttpSource, InventorySource};
use observa_sync::sink::{open_sink, SinkAdapter};
use observa_sync::run_cycle;

use crate::error::{io_err, AgentError};
use crate::paths::{observa_root, socket_path};
use crate::protocol::{AgentRequest, AgentResponse};

/// Shared flags the status endpoint reports. Both long-running tasks update
/// these without holding any lock across each other.
#[derive(Debug, Default)]
pub struct AgentState {
    pub source_connected: AtomicBool,
    pub sink_connected: AtomicBool,
    pub event_watch_active: AtomicBool,
    pub cycle_active: AtomicBool,
    pub last_cycle: RwLock<Option<SyncCycleResult>>,
}

/// Everything the two concurrent tasks share: the source and sink handles and
/// the observable state. Passed explicitly; no globals.
pub struct AgentContext {
    pub config: AgentConfig,
    pub cluster: ClusterId,
    pub source: Arc<dyn InventorySource>,
    pub sink: Arc<dyn SinkAdapter>,
    pub state: Arc<AgentState>,
}

struct CycleJob {
    trigger: &'static str,
    respond_to: oneshot::Sender<Result<SyncCycleResult, String>>,
}

/// Start the agent runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, config: AgentConfig) -> Result<(), AgentError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the agent runtime.
///
/// Only startup may fail hard: an unreachable sink or source here terminates
/// the process so an external supervisor can restart it. Once the tasks are
/// up, every error is contained and the terminal disconnect write runs on
/// every exit path.
pub async fn run(home: PathBuf, config: AgentConfig) -> Result<(), AgentError> {
    let root = observa_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let sink = open_sink(&config.sink())?;
    let source: Arc<dyn InventorySource> = Arc::new(HttpSource::new(&config.source));

    // Startup probe: one listing call against the cheapest kind. Failure here
    // is the one case allowed to take the process down.
    let probe_source = source.clone();
    tokio::task::spawn_blocking(move || probe_source.list(ResourceKind::Namespace))
        .await
        .map_err(|err| AgentError::Protocol(format!("startup probe join error: {err}")))??;

    let cluster = config.cluster();
    let state = Arc::new(AgentState::default());
    state.source_connected.store(true, Ordering::SeqCst);
    state.sink_connected.store(true, Ordering::SeqCst);

    let ctx = Arc::new(AgentContext {
        config,
        cluster,
        source,
        sink,
        state,
    });
    tracing::info!(
        cluster = %ctx.cluster,
        sync_mode = %ctx.sink.mode(),
        interval_secs = ctx.config.sync_interval_secs,
        "agent started",
    );

    let result = run_tasks(ctx.clone(), home).await;
    finalize(&ctx).await;
    result
}

async fn run_tasks(ctx: Arc<AgentContext>, home: PathBuf) -> Result<(), AgentError> {
    let (job_tx, job_rx) = mpsc::channel::<CycleJob>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(ctx, job_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    // The forwarder does not rebroadcast shutdown: an ungraceful stream end
    // leaves the rest of the agent running (supervisor restarts the process
    // to restore the watch; an explicit operational contract).
    let forwarder_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { event_forwarder_task(ctx, shutdown.subscribe()).await })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let ctx = ctx.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, ctx, job_tx, shutdown.clone(), shutdown.subscribe())
                    .await;
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
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down agent");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(AgentError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, forwarder_result, socket_result, signal_result) = tokio::join!(
        scheduler_handle,
        forwarder_handle,
        socket_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("event_forwarder", forwarder_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Terminal writes, reached on every exit path once startup has succeeded:
/// mark the cluster disconnected exactly once, then release the connection.
async fn finalize(ctx: &Arc<AgentContext>) {
    let sink = ctx.sink.clone();
    let cluster = ctx.cluster.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        sink.set_cluster_state(&cluster, ClusterState::Disconnected)?;
        sink.close()
    })
    .await;

    match outcome {
        Ok(Ok(())) => tracing::info!("cluster marked disconnected"),
        Ok(Err(err)) => tracing::error!(error = %err, "failed to mark cluster disconnected"),
        Err(err) => tracing::error!(error = %err, "disconnect task join failure"),
    }
    ctx.state.sink_connected.store(false, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Sync scheduler
// ---------------------------------------------------------------------------

/// Periodic reconciliation loop. Manual trigger requests arrive on the job
/// queue and run through the identical cycle path.
///
/// The shutdown signal is only raced against the inter-cycle sleep: a cycle
/// already in flight always runs to completion, and no new cycle starts after
/// the signal.
async fn scheduler_task(
    ctx: Arc<AgentContext>,
    mut job_rx: mpsc::Receiver<CycleJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    let mut interval = tokio::time::interval(ctx.config.sync_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    // First cycle up front so the sink converges before the first interval.
    let _ = execute_cycle(&ctx, "startup").await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let _ = execute_cycle(&ctx, "interval").await;
            }
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let outcome = execute_cycle(&ctx, job.trigger).await;
                let _ = job.respond_to.send(outcome.map_err(|e| e.to_string()));
            }
        }
    }

    Ok(())
}

async fn execute_cycle(
    ctx: &Arc<AgentContext>,
    trigger: &'static str,
) -> Result<SyncCycleResult, AgentError> {
    let started = Instant::now();
    ctx.state.cycle_active.store(true, Ordering::SeqCst);

    let source = ctx.source.clone();
    let sink = ctx.sink.clone();
    let cluster = ctx.cluster.clone();
    let outcome =
        tokio::task::spawn_blocking(move || run_cycle(source.as_ref(), sink.as_ref(), &cluster))
            .await;

    ctx.state.cycle_active.store(false, Ordering::SeqCst);

    match outcome {
        Ok(cycle) => {
            ctx.state
                .sink_connected
                .store(!cycle.commit_error, Ordering::SeqCst);
            tracing::info!(
                trigger,
                collected = cycle.total_collected(),
                deleted = cycle.total_deleted(),
                error_kinds = cycle.error_kinds(),
                duration_ms = started.elapsed().as_millis() as u64,
                "sync cycle completed",
            );
            *ctx.state.last_cycle.write().await = Some(cycle.clone());
            Ok(cycle)
        }
        Err(err) => Err(AgentError::Protocol(format!("cycle task join error: {err}"))),
    }
}

async fn enqueue_cycle(
    job_tx: &mpsc::Sender<CycleJob>,
    trigger: &'static str,
) -> Result<SyncCycleResult, AgentError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(CycleJob {
            trigger,
            respond_to: tx,
        })
        .await
        .map_err(|_| AgentError::ChannelClosed("cycle queue"))?;

    let outcome = rx
        .await
        .map_err(|_| AgentError::ChannelClosed("cycle response"))?;
    outcome.map_err(AgentError::Protocol)
}

// ---------------------------------------------------------------------------
// Event forwarder
// ---------------------------------------------------------------------------

/// Unbounded consume-forward loop over the live notification stream.
///
/// Exits on shutdown (graceful) or when the upstream stream ends
/// (ungraceful); it never reconnects by itself.
async fn event_forwarder_task(
    ctx: Arc<AgentContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    if !ctx.config.watch_events {
        tracing::info!("event watch disabled by configuration");
        return Ok(());
    }

    let subscribe_source = ctx.source.clone();
    let subscribed = tokio::task::spawn_blocking(move || subscribe_source.subscribe())
        .await
        .map_err(|err| AgentError::Protocol(format!("subscribe join error: {err}")))?;
    let mut events = match subscribed {
        Ok(events) => events,
        Err(err) => {
            tracing::error!(error = %err, "event subscription failed; watch inactive");
            return Ok(());
        }
    };

    ctx.state.event_watch_active.store(true, Ordering::SeqCst);
    tracing::info!("event watch started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    tracing::warn!("event stream ended; supervisor restart required to resume");
                    break;
                };
                tracing::debug!(
                    kind = %event.involved_kind,
                    name = %event.involved_name,
                    reason = %event.reason,
                    "cluster event",
                );

                let record = event.into_record(Utc::now());
                let sink = ctx.sink.clone();
                let cluster = ctx.cluster.clone();
                let written =
                    tokio::task::spawn_blocking(move || sink.insert_event(&cluster, &record))
                        .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "event insert failed; event dropped");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "event insert join failure");
                    }
                }
            }
        }
    }

    ctx.state.event_watch_active.store(false, Ordering::SeqCst);
    Ok(())
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    ctx: Arc<AgentContext>,
    job_tx: mpsc::Sender<CycleJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_socket_client(stream, ctx, job_tx, shutdown_tx).await
                    {
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

async fn handle_socket_client(
    stream: UnixStream,
    ctx: Arc<AgentContext>,
    job_tx: mpsc::Sender<CycleJob>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), AgentError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("agent socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<AgentRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &AgentResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => AgentResponse::ok(build_status_payload(&ctx).await),
            "sync" => match enqueue_cycle(&job_tx, "socket").await {
                Ok(cycle) => AgentResponse::ok(json!(cycle)),
                Err(err) => AgentResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                AgentResponse::ok(json!({ "stopping": true }))
            }
            other => AgentResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(ctx: &Arc<AgentContext>) -> Value {
    let last_cycle = {
        let guard = ctx.state.last_cycle.read().await;
        guard.as_ref().map(|cycle| json!(cycle))
    };

    json!({
        "cluster_id": ctx.cluster.0,
        "source_connected": ctx.state.source_connected.load(Ordering::SeqCst),
        "sink_connected": ctx.state.sink_connected.load(Ordering::SeqCst),
        "sync_mode": ctx.sink.mode().to_string(),
        "event_watch_active": ctx.state.event_watch_active.load(Ordering::SeqCst),
        "cycle_active": ctx.state.cycle_active.load(Ordering::SeqCst),
        "timestamp": Utc::now().to_rfc3339(),
        "last_cycle": last_cycle.unwrap_or(Value::Null),
    })
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), AgentError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(AgentError::Protocol(format!(
                "agent socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale agent socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &AgentResponse,
) -> Result<(), AgentError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("agent socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("agent socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(AgentError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), AgentError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use chrono::DateTime;
    use serde_json::Map;
    use tokio::sync::mpsc::UnboundedReceiver;

    use observa_core::types::{
        EventRecord, KindSyncResult, NamespaceId, ResourceKey, ResourceRecord,
    };
    use observa_source::{ResourceDescriptor, SourceError, SourceEvent};
    use observa_sync::sink::SyncMode;
    use observa_sync::SinkError;

    // ── Fakes ──────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeSource {
        pods: Mutex<Vec<(String, String)>>,
        list_delay: Option<Duration>,
        namespace_lists: AtomicUsize,
        event_tx: Mutex<Option<mpsc::UnboundedSender<SourceEvent>>>,
    }

    impl FakeSource {
        fn with_delay(delay: Duration) -> Self {
            Self {
                list_delay: Some(delay),
                ..Self::default()
            }
        }

        fn push_event(&self, name: &str) {
            let guard = self.event_tx.lock().expect("event_tx lock");
            let tx = guard.as_ref().expect("subscribe must be called first");
            tx.send(SourceEvent {
                event_type: "Normal".to_string(),
                reason: "Scheduled".to_string(),
                message: "ok".to_string(),
                involved_kind: "Pod".to_string(),
                involved_name: name.to_string(),
                involved_namespace: Some("default".to_string()),
                source_component: None,
                first_seen_at: None,
                last_seen_at: None,
            })
            .expect("send event");
        }

        fn drop_event_stream(&self) {
            self.event_tx.lock().expect("event_tx lock").take();
        }
    }

    impl InventorySource for FakeSource {
        fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceDescriptor>, SourceError> {
            if let Some(delay) = self.list_delay {
                std::thread::sleep(delay);
            }
            match kind {
                ResourceKind::Namespace => {
                    self.namespace_lists.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![ResourceDescriptor {
                        name: "default".to_string(),
                        namespace: None,
                        created_at: None,
                        attributes: Map::new(),
                    }])
                }
                ResourceKind::Pod => Ok(self
                    .pods
                    .lock()
                    .expect("pods lock")
                    .iter()
                    .map(|(name, namespace)| ResourceDescriptor {
                        name: name.clone(),
                        namespace: Some(namespace.clone()),
                        created_at: None,
                        attributes: Map::new(),
                    })
                    .collect()),
                _ => Ok(vec![]),
            }
        }

        fn subscribe(&self) -> Result<UnboundedReceiver<SourceEvent>, SourceError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.event_tx.lock().expect("event_tx lock") = Some(tx);
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct CountingSink {
        records: Mutex<HashMap<(ResourceKind, ResourceKey), ResourceRecord>>,
        namespaces: Mutex<BTreeMap<String, NamespaceId>>,
        events: Mutex<Vec<EventRecord>>,
        disconnects: AtomicUsize,
        closes: AtomicUsize,
        commits: AtomicUsize,
    }

    impl SinkAdapter for CountingSink {
        fn upsert(&self, record: &ResourceRecord) -> Result<(), SinkError> {
            if record.kind == ResourceKind::Namespace {
                let mut namespaces = self.namespaces.lock().expect("namespaces lock");
                let next = namespaces.len() as i64 + 1;
                namespaces
                    .entry(record.name.clone())
                    .or_insert(NamespaceId(next));
                return Ok(());
            }
            self.records
                .lock()
                .expect("records lock")
                .insert((record.kind, record.key()), record.clone());
            Ok(())
        }

        fn delete(
            &self,
            _cluster: &ClusterId,
            kind: ResourceKind,
            key: &ResourceKey,
        ) -> Result<(), SinkError> {
            self.records
                .lock()
                .expect("records lock")
                .remove(&(kind, key.clone()));
            Ok(())
        }

        fn existing_keys(
            &self,
            _cluster: &ClusterId,
            kind: ResourceKind,
        ) -> Result<HashSet<ResourceKey>, SinkError> {
            Ok(self
                .records
                .lock()
                .expect("records lock")
                .keys()
                .filter(|(k, _)| *k == kind)
                .map(|(_, key)| key.clone())
                .collect())
        }

        fn namespace_index(
            &self,
            _cluster: &ClusterId,
        ) -> Result<BTreeMap<String, NamespaceId>, SinkError> {
            Ok(self.namespaces.lock().expect("namespaces lock").clone())
        }

        fn insert_event(
            &self,
            _cluster: &ClusterId,
            event: &EventRecord,
        ) -> Result<(), SinkError> {
            self.events.lock().expect("events lock").push(event.clone());
            Ok(())
        }

        fn set_cluster_state(
            &self,
            _cluster: &ClusterId,
            state: ClusterState,
        ) -> Result<(), SinkError> {
            if state == ClusterState::Disconnected {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn commit_cycle(
            &self,
            _cluster: &ClusterId,
            _collected_at: DateTime<Utc>,
        ) -> Result<(), SinkError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> Result<(), SinkError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn mode(&self) -> SyncMode {
            SyncMode::Direct
        }
    }

    fn test_config(interval_secs: u64) -> AgentConfig {
        AgentConfig {
            cluster_id: "c-test".to_string(),
            sync_interval_secs: interval_secs,
            ..AgentConfig::default()
        }
    }

    fn test_context(source: Arc<FakeSource>, sink: Arc<CountingSink>) -> Arc<AgentContext> {
        Arc::new(AgentContext {
            config: test_config(3600),
            cluster: ClusterId::from("c-test"),
            source,
            sink,
            state: Arc::new(AgentState::default()),
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    // ── Scheduler ──────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_mid_cycle_lets_the_cycle_finish() {
        let source = Arc::new(FakeSource::with_delay(Duration::from_millis(50)));
        source
            .pods
            .lock()
            .expect("pods lock")
            .push(("p1".to_string(), "default".to_string()));
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source.clone(), sink.clone());

        let (_job_tx, job_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(4);
        let handle = {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { scheduler_task(ctx, job_rx, shutdown_rx).await })
        };

        // Catch the startup cycle mid-flight, then signal shutdown.
        let state = ctx.state.clone();
        wait_until(move || state.cycle_active.load(Ordering::SeqCst)).await;
        shutdown_tx.send(()).expect("send shutdown");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("bounded grace period")
            .expect("join")
            .expect("scheduler result");

        // The in-flight cycle completed: its result was recorded and the sink
        // saw exactly one commit, with no new cycle started afterwards.
        assert!(ctx.state.last_cycle.read().await.is_some());
        assert_eq!(sink.commits.load(Ordering::SeqCst), 1);
        assert_eq!(source.namespace_lists.load(Ordering::SeqCst), 1);
        assert!(!ctx.state.cycle_active.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_reuses_the_cycle_path() {
        let source = Arc::new(FakeSource::default());
        source
            .pods
            .lock()
            .expect("pods lock")
            .push(("p1".to_string(), "default".to_string()));
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source, sink.clone());

        let (job_tx, job_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(4);
        let handle = {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { scheduler_task(ctx, job_rx, shutdown_rx).await })
        };

        let cycle = enqueue_cycle(&job_tx, "socket").await.expect("cycle");
        assert_eq!(
            cycle.kind(ResourceKind::Pod).expect("pods").collected,
            1,
            "manual trigger must run the same diff path"
        );
        assert!(sink.commits.load(Ordering::SeqCst) >= 1);

        shutdown_tx.send(()).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("timely exit")
            .expect("join")
            .expect("scheduler result");
    }

    // ── Event forwarder ────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn forwarder_stops_when_the_stream_ends() {
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source.clone(), sink.clone());

        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let handle = {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { event_forwarder_task(ctx, shutdown_rx).await })
        };

        let state = ctx.state.clone();
        wait_until(move || state.event_watch_active.load(Ordering::SeqCst)).await;

        for i in 0..5 {
            source.push_event(&format!("pod-{i}"));
        }
        source.drop_event_stream();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("forwarder exits on stream end")
            .expect("join")
            .expect("forwarder result");

        assert_eq!(sink.events.lock().expect("events lock").len(), 5);
        assert!(!ctx.state.event_watch_active.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interleaved_event_and_cycle_writes_lose_nothing() {
        let source = Arc::new(FakeSource::default());
        source
            .pods
            .lock()
            .expect("pods lock")
            .push(("p1".to_string(), "default".to_string()));
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source.clone(), sink.clone());

        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let forwarder = {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { event_forwarder_task(ctx, shutdown_rx).await })
        };
        let state = ctx.state.clone();
        wait_until(move || state.event_watch_active.load(Ordering::SeqCst)).await;

        // 1,000 event writes interleaved with concurrent reconciliation
        // cycles through the same sink handle.
        for i in 0..1_000 {
            source.push_event(&format!("pod-{i}"));
            if i % 100 == 0 {
                execute_cycle(&ctx, "interval").await.expect("cycle");
            }
        }
        source.drop_event_stream();

        tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .expect("forwarder drains and exits")
            .expect("join")
            .expect("forwarder result");

        assert_eq!(
            sink.events.lock().expect("events lock").len(),
            1_000,
            "no event write may vanish"
        );
        let records = sink.records.lock().expect("records lock");
        assert!(records
            .keys()
            .any(|(kind, key)| *kind == ResourceKind::Pod && key.name == "p1"));
    }

    // ── Finalize ───────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn finalize_writes_disconnect_exactly_once_and_closes() {
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source, sink.clone());
        ctx.state.sink_connected.store(true, Ordering::SeqCst);

        finalize(&ctx).await;

        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert!(!ctx.state.sink_connected.load(Ordering::SeqCst));
    }

    // ── Status payload ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn status_payload_reports_all_fields() {
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(CountingSink::default());
        let ctx = test_context(source, sink);
        ctx.state.source_connected.store(true, Ordering::SeqCst);
        ctx.state.sink_connected.store(true, Ordering::SeqCst);

        let payload = build_status_payload(&ctx).await;
        assert_eq!(payload["cluster_id"], json!("c-test"));
        assert_eq!(payload["source_connected"], json!(true));
        assert_eq!(payload["sink_connected"], json!(true));
        assert_eq!(payload["sync_mode"], json!("direct"));
        assert_eq!(payload["event_watch_active"], json!(false));
        assert_eq!(payload["cycle_active"], json!(false));
        assert_eq!(payload["last_cycle"], Value::Null);
        assert!(payload["timestamp"].is_string());

        let mut pods = KindSyncResult::new(ResourceKind::Pod);
        pods.collected = 2;
        *ctx.state.last_cycle.write().await = Some(SyncCycleResult {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            kinds: vec![pods],
            commit_error: false,
        });

        let payload = build_status_payload(&ctx).await;
        assert_eq!(payload["last_cycle"]["kinds"][0]["collected"], json!(2));
    }

    // ── Protocol ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn socket_protocol_status_and_stop_over_in_memory_channels() {
        let (request_tx, mut request_rx) = mpsc::channel::<Vec<u8>>(8);
        let (response_tx, mut response_rx) = mpsc::channel::<Vec<u8>>(8);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        tokio::spawn(async move {
            while let Some(bytes) = request_rx.recv().await {
                let line = String::from_utf8(bytes).expect("utf8");
                let request: AgentRequest = serde_json::from_str(line.trim()).expect("request");
                let response = match request.cmd.as_str() {
                    "status" => AgentResponse::ok(json!({"source_connected": true})),
                    "stop" => {
                        let _ = shutdown_tx.send(());
                        AgentResponse::ok(json!({"stopping": true}))
                    }
                    other => AgentResponse::error(format!("unknown command '{other}'")),
                };
                let encoded = serde_json::to_vec(&response).expect("encode response");
                if response_tx.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        request_tx
            .send(br#"{"cmd":"status"}"#.to_vec())
            .await
            .expect("send status request");
        let status_response = response_rx.recv().await.expect("status response");
        let status_json: Value = serde_json::from_slice(&status_response).expect("decode status");
        assert_eq!(status_json["ok"], Value::Bool(true));

        request_tx
            .send(br#"{"cmd":"unknown"}"#.to_vec())
            .await
            .expect("send bogus request");
        let bogus = response_rx.recv().await.expect("bogus response");
        let bogus_json: Value = serde_json::from_slice(&bogus).expect("decode bogus");
        assert_eq!(bogus_json["ok"], Value::Bool(false));

        request_tx
            .send(br#"{"cmd":"stop"}"#.to_vec())
            .await
            .expect("send stop request");
        let stop_response = response_rx.recv().await.expect("stop response");
        let stop_json: Value = serde_json::from_slice(&stop_response).expect("decode stop");
        assert_eq!(stop_json["ok"], Value::Bool(true));

        shutdown_rx.recv().await.expect("shutdown signal");
    }
}
