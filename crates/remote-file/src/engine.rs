use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attributes::AttributeCatalog;
use crate::checksum;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::install;
use crate::resource::{Ensure, ResourceSpec};
use crate::timestamp;
use crate::transport::{self, Transport, TransportSettings};

/// What is on disk at the destination, relative to the declared checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed {
    Absent,
    PresentMismatched,
    PresentMatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Remove,
    Fetch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub path: PathBuf,
    pub ensure: Ensure,
    pub observed: Observed,
    pub action: Action,
    /// False for dry runs and for no-op outcomes.
    pub applied: bool,
    pub bytes: Option<u64>,
    /// Remote modification time (unix seconds) of the installed content.
    pub version: Option<i64>,
}

impl Outcome {
    pub fn in_sync(&self) -> bool {
        self.action == Action::None
    }

    pub fn summary(&self) -> String {
        let verb = match (self.action, self.applied) {
            (Action::None, _) => return "in sync".into(),
            (Action::Remove, true) => "removed",
            (Action::Remove, false) => "would remove",
            (Action::Fetch, true) => "fetched",
            (Action::Fetch, false) => "would fetch",
        };
        let mut out = verb.to_string();
        if let Some(b) = self.bytes {
            out.push_str(&format!(" {b} bytes"));
        }
        if let Some(v) = self.version {
            out.push_str(&format!(" (version {v})"));
        }
        out
    }
}

/// Brings one destination path into its declared state. Holds the
/// transport for the source scheme and, optionally, the catalog that
/// enforces ownership and mode.
pub struct Reconciler {
    spec: ResourceSpec,
    transport: Box<dyn Transport>,
    catalog: Option<Arc<dyn AttributeCatalog>>,
}

impl Reconciler {
    pub fn new(spec: ResourceSpec, settings: &TransportSettings) -> Result<Self> {
        let transport = transport::for_spec(&spec, settings)?;
        Ok(Self::with_transport(spec, transport))
    }

    pub fn with_transport(spec: ResourceSpec, transport: Box<dyn Transport>) -> Self {
        Self {
            spec,
            transport,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn AttributeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn observe(&self) -> Result<Observed> {
        let path = &self.spec.path;
        match fs::metadata(path) {
            Ok(m) if !m.is_file() => {
                return Err(Error::msg(format!(
                    "{} exists but is not a regular file",
                    path.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Observed::Absent),
            Err(e) => return Err(Error::io(format!("failed to stat {}", path.display()), e)),
        }
        let Some(cs) = &self.spec.checksum else {
            return Ok(Observed::PresentMatching);
        };
        let Some(actual) = cs.current(path)? else {
            return Ok(Observed::Absent);
        };
        Ok(if cs.is_satisfied_by(&actual) {
            Observed::PresentMatching
        } else {
            Observed::PresentMismatched
        })
    }

    pub fn reconcile(&self, ctx: &ExecCtx) -> Result<Outcome> {
        let spec = &self.spec;
        if spec.ensure == Ensure::Latest && !self.transport.supports_metadata() {
            return Err(Error::UnsupportedOperation(format!(
                "ensure = latest needs remote modification times, which {} sources cannot provide",
                spec.source.scheme()
            )));
        }
        if spec.ensure != Ensure::Absent {
            self.delegate_attributes(ctx)?;
        }

        let observed = self.observe()?;
        let mut outcome = Outcome {
            path: spec.path.clone(),
            ensure: spec.ensure,
            observed,
            action: Action::None,
            applied: false,
            bytes: None,
            version: None,
        };

        match spec.ensure {
            Ensure::Absent => {
                if observed != Observed::Absent {
                    outcome.action = Action::Remove;
                }
            }
            Ensure::Present => {
                if observed != Observed::PresentMatching {
                    outcome.action = Action::Fetch;
                }
            }
            Ensure::Latest => {
                let remote = match timestamp::local_mtime(&spec.path)? {
                    None => None,
                    Some(local) => {
                        let remote = self.transport.head(&spec.source)?.last_modified;
                        if timestamp::same_second(local, remote)
                            && observed == Observed::PresentMatching
                        {
                            ctx.log(&format!(
                                "local mtime {} matches remote",
                                local.timestamp()
                            ));
                            return Ok(outcome);
                        }
                        ctx.log(&format!(
                            "local mtime {} differs from remote {}",
                            local.timestamp(),
                            remote.timestamp()
                        ));
                        Some(remote)
                    }
                };
                outcome.action = Action::Fetch;
                outcome.version = remote.map(|t| t.timestamp());
                if !ctx.dry_run {
                    return self.fetch_into(outcome, remote, ctx);
                }
            }
        }

        if outcome.action == Action::None {
            ctx.log(&format!("{} is in sync", spec.path.display()));
            return Ok(outcome);
        }
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {}", outcome.summary()));
            return Ok(outcome);
        }

        match outcome.action {
            Action::Remove => {
                remove_file(&spec.path)?;
                ctx.log(&format!("removed {}", spec.path.display()));
                outcome.applied = true;
                Ok(outcome)
            }
            Action::Fetch => self.fetch_into(outcome, None, ctx),
            Action::None => Ok(outcome),
        }
    }

    fn delegate_attributes(&self, ctx: &ExecCtx) -> Result<()> {
        let attrs = &self.spec.attributes;
        if attrs.is_empty() {
            return Ok(());
        }
        let Some(catalog) = &self.catalog else {
            tracing::debug!(
                path = %self.spec.path.display(),
                %attrs,
                "no attribute catalog; attributes not delegated"
            );
            return Ok(());
        };
        catalog.request_file(&self.spec.path, attrs)?;
        ctx.log(&format!("delegated attributes {attrs}"));
        Ok(())
    }

    fn fetch_into(
        &self,
        mut outcome: Outcome,
        remote_hint: Option<DateTime<Utc>>,
        ctx: &ExecCtx,
    ) -> Result<Outcome> {
        let spec = &self.spec;
        ctx.log(&format!("fetching {} -> {}", spec.source, spec.path.display()));
        let (res, mtime) = install::install_with(&spec.path, |staging| {
            let res = self.transport.fetch(&spec.source, staging)?;
            let mtime = res.last_modified.or(remote_hint);
            // Latest is tracked by remote time; never install a copy without one.
            if spec.ensure == Ensure::Latest && mtime.is_none() {
                return Err(Error::MissingLastModified {
                    uri: spec.source.to_string(),
                });
            }
            Ok((res, mtime))
        })?;
        if res.redirects > 0 {
            ctx.log(&format!(
                "followed {} redirect(s) to {}",
                res.redirects, res.final_uri
            ));
        }

        outcome.applied = true;
        outcome.bytes = Some(res.bytes);
        outcome.version = mtime.map(|t| t.timestamp()).or(outcome.version);

        if let Some(cs) = &spec.checksum {
            let actual = cs.kind.digest_file(&spec.path)?;
            if !checksum::matches(&cs.expected, &actual) {
                return Err(Error::ChecksumMismatch {
                    path: spec.path.clone(),
                    expected: cs.expected.clone(),
                    actual,
                });
            }
            ctx.log(&format!("{} checksum verified", cs.kind));
        }
        ctx.log(&outcome.summary());
        Ok(outcome)
    }
}

fn remove_file(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("failed to remove {}", path.display()), e)),
    }
}
