use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use serde::Serialize;

use crate::attributes::AttributeCatalog;
use crate::engine::{Outcome, Reconciler};
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::resource::ResourceSpec;
use crate::transport::TransportSettings;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    ResourceStarted {
        id: String,
    },
    ResourceLog {
        id: String,
        line: String,
    },
    ResourceFinished {
        id: String,
        ok: bool,
        changed: bool,
        summary: Option<String>,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Line-oriented progress on stdout, with a summary block at the end.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    started: usize,
    in_sync: usize,
    changed: usize,
    failed: usize,
    log_lines: usize,
    total_ms: u128,
    failed_ids: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::ResourceStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started = s.started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::ResourceLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::ResourceFinished {
                id,
                ok,
                changed,
                summary,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.total_ms = s.total_ms.saturating_add(elapsed_ms);
                    if !ok {
                        s.failed = s.failed.saturating_add(1);
                        s.failed_ids.push(id.clone());
                    } else if changed {
                        s.changed = s.changed.saturating_add(1);
                    } else {
                        s.in_sync = s.in_sync.saturating_add(1);
                    }
                }
                if ok {
                    println!(
                        "DONE: {id} ({elapsed_ms}ms) {}",
                        summary.unwrap_or_default()
                    );
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  resources: started={} in_sync={} changed={} failed={}\n",
                    s.started, s.in_sync, s.changed, s.failed
                ));
                summary.push_str(&format!("  logs: {}\n", s.log_lines));
                summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
                summary.push_str(&format!(
                    "  summed_resource_time: {}\n",
                    format_elapsed_hms((s.total_ms / 1000) as u64)
                ));
                if !s.failed_ids.is_empty() {
                    s.failed_ids.sort();
                    summary.push_str(&format!("  failed: {}\n", s.failed_ids.join(", ")));
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                *s = StdoutSinkState::default();
                print!("{summary}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

pub struct NullSink;

impl ExecSink for NullSink {
    fn emit(&self, _ev: ExecEvent) {}
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_resource: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_resource: None,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_resource(&mut self, id: impl Into<String>) {
        self.current_resource = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let line = sanitize_log_line(msg);
        if line.is_empty() {
            return;
        }
        let id = self
            .current_resource
            .clone()
            .unwrap_or_else(|| "<none>".into());
        tracing::debug!(resource = %id, "{line}");
        self.sink.emit(ExecEvent::ResourceLog { id, line });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceFailure {
    pub id: String,
    pub error: String,
}

/// Result of one run over a manifest. Outcomes keep manifest order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<Outcome>,
    pub failures: Vec<ResourceFailure>,
    /// Resources never started because the run was cancelled.
    pub skipped: usize,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }

    pub fn changed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.in_sync()).count()
    }

    fn error_summary(&self) -> Option<String> {
        if self.skipped > 0 {
            return Some(format!("cancelled; {} resource(s) not started", self.skipped));
        }
        match self.failures.len() {
            0 => None,
            1 => Some(format!(
                "resource '{}' failed: {}",
                self.failures[0].id, self.failures[0].error
            )),
            n => Some(format!("{n} resources failed")),
        }
    }
}

/// Shared inputs for reconciling a list of resources.
#[derive(Clone)]
pub struct RunInputs<'a> {
    pub resources: &'a [ResourceSpec],
    pub settings: &'a TransportSettings,
    pub catalog: Arc<dyn AttributeCatalog>,
}

fn reconcile_one(inputs: &RunInputs<'_>, spec: &ResourceSpec, ctx: &ExecCtx) -> Result<Outcome> {
    Reconciler::new(spec.clone(), inputs.settings)?
        .with_catalog(Arc::clone(&inputs.catalog))
        .reconcile(ctx)
}

fn finished(id: String, res: &Result<Outcome>, elapsed_ms: u128) -> ExecEvent {
    match res {
        Ok(o) => ExecEvent::ResourceFinished {
            id,
            ok: true,
            changed: !o.in_sync(),
            summary: Some(o.summary()),
            error: None,
            elapsed_ms,
        },
        Err(e) => ExecEvent::ResourceFinished {
            id,
            ok: false,
            changed: false,
            summary: None,
            error: Some(e.to_string()),
            elapsed_ms,
        },
    }
}

fn done(report: &RunReport, ctx: &ExecCtx) {
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: report.ok(),
        error: report.error_summary(),
    });
}

/// Reconcile resources one after another. A failing resource does not
/// stop the others; cancellation is honored between resources.
pub fn execute_resources(inputs: &RunInputs<'_>, ctx: &mut ExecCtx) -> Result<RunReport> {
    let mut report = RunReport::default();
    for (i, spec) in inputs.resources.iter().enumerate() {
        if ctx.cancelled() {
            report.skipped = inputs.resources.len() - i;
            break;
        }
        let id = spec.id();
        ctx.sink.emit(ExecEvent::ResourceStarted { id: id.clone() });
        ctx.set_resource(id.clone());
        let start = Instant::now();
        let res = reconcile_one(inputs, spec, ctx);
        ctx.sink
            .emit(finished(id.clone(), &res, start.elapsed().as_millis()));
        match res {
            Ok(o) => report.outcomes.push(o),
            Err(e) => {
                tracing::warn!(resource = %id, error = %e, "reconcile failed");
                report.failures.push(ResourceFailure {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }
    done(&report, ctx);
    Ok(report)
}

/// Reconcile resources on a bounded pool of worker threads. `max_parallel`
/// of 0 means one worker per CPU. Results are reported in manifest order.
pub fn execute_resources_parallel(
    inputs: &RunInputs<'_>,
    ctx_template: &ExecCtx,
    max_parallel: usize,
) -> Result<RunReport> {
    let workers = match max_parallel {
        0 => num_cpus::get(),
        n => n,
    }
    .min(inputs.resources.len());
    if workers <= 1 {
        let mut ctx = ctx_template.clone();
        return execute_resources(inputs, &mut ctx);
    }

    let queue: Mutex<VecDeque<(usize, &ResourceSpec)>> =
        Mutex::new(inputs.resources.iter().enumerate().collect());
    let (tx, rx) = mpsc::channel::<(usize, String, Result<Outcome>, u128)>();
    let mut slots: Vec<Option<std::result::Result<Outcome, ResourceFailure>>> =
        (0..inputs.resources.len()).map(|_| None).collect();
    let mut panicked = None::<String>;

    std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let ctx = ctx_template.clone();
            handles.push(s.spawn(move || {
                let mut local_ctx = ctx;
                loop {
                    if local_ctx.cancelled() {
                        break;
                    }
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some((idx, spec)) = next else {
                        break;
                    };
                    let id = spec.id();
                    local_ctx
                        .sink
                        .emit(ExecEvent::ResourceStarted { id: id.clone() });
                    local_ctx.set_resource(id.clone());
                    let start = Instant::now();
                    let r = reconcile_one(inputs, spec, &local_ctx);
                    let _ = tx.send((idx, id, r, start.elapsed().as_millis()));
                }
            }));
        }
        drop(tx);

        for (idx, id, res, elapsed_ms) in rx {
            ctx_template.sink.emit(finished(id.clone(), &res, elapsed_ms));
            slots[idx] = Some(res.map_err(|e| {
                tracing::warn!(resource = %id, error = %e, "reconcile failed");
                ResourceFailure {
                    id,
                    error: e.to_string(),
                }
            }));
        }

        for h in handles {
            if let Err(p) = h.join() {
                panicked = Some(format!("worker panicked: {p:?}"));
            }
        }
    });

    if let Some(msg) = panicked {
        ctx_template.sink.emit(ExecEvent::ExecutorDone {
            ok: false,
            error: Some(msg.clone()),
        });
        return Err(Error::msg(msg));
    }

    let mut report = RunReport::default();
    for slot in slots {
        match slot {
            Some(Ok(o)) => report.outcomes.push(o),
            Some(Err(f)) => report.failures.push(f),
            None => report.skipped += 1,
        }
    }
    done(&report, ctx_template);
    Ok(report)
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
