//! One invocation, start to finish: load history, fetch or reuse the plan,
//! decide whether this pass checks in, run whatever is due, ship the batch,
//! persist. Invoked every minute or every hour, the outcome must be the
//! same state on disk.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use super::checkin::CheckinAggregator;
use super::error::PluginError;
use super::history::HistoryStore;
use super::lock::{self, Acquisition};
use super::plan::{self, PlanOutcome};
use super::runner::{Outcome, PluginRunner};
use super::scheduler;
use super::transport::ServerClient;

/// How a pass ended, for callers mapping to an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    CheckedIn,
    /// Checkin was due but no plugin was; nothing transmitted.
    NothingDue,
    NotTimeYet,
    AlreadyRunning,
}

pub struct CheckinEngine {
    client: ServerClient,
    history: HistoryStore,
    /// Directory holding the pid file, conventionally the history file's.
    lock_dir: PathBuf,
    force: bool,
}

impl CheckinEngine {
    pub fn new(client: ServerClient, history: HistoryStore, lock_dir: PathBuf, force: bool) -> Self {
        Self {
            client,
            history,
            lock_dir,
            force,
        }
    }

    pub async fn run_pass(&mut self) -> Result<PassStatus> {
        let outcome = plan::fetch(&self.client, self.history.data.plan_token.as_deref()).await?;
        let has_new_plan = match outcome {
            PlanOutcome::Unchanged => false,
            PlanOutcome::Fresh {
                plugins,
                directives,
                token,
            } => {
                self.history.data.plan = plugins;
                self.history.data.directives = directives;
                self.history.data.plan_token = token;
                true
            }
        };

        if !scheduler::should_checkin(
            self.history.data.last_checkin,
            self.history.data.directives.interval,
            has_new_plan,
            self.force,
        ) {
            info!("Not time to checkin yet.");
            return Ok(PassStatus::NotTimeYet);
        }

        let _lock = match lock::acquire(&self.lock_dir)? {
            Acquisition::Held(pid) => {
                warn!("Process {} was already running; exiting.", pid);
                return Ok(PassStatus::AlreadyRunning);
            }
            Acquisition::Acquired(lock) => lock,
        };

        let plan = self.history.data.plan.clone();
        let mut aggregator = CheckinAggregator::default();
        let mut ran_any = false;

        for spec in &plan {
            info!("Processing the {} plugin:", spec.name);
            let key = spec.key();
            let mut record = self.history.record(&key, spec.legacy_key());
            let outcome = PluginRunner::run(spec, &record).await;
            let now = Utc::now();

            match outcome {
                Outcome::Skipped => continue,
                Outcome::Completed(data) => {
                    ran_any = true;
                    aggregator.absorb(spec.id, &data);
                    record.last_run = Some(now);
                    if let Some(memory) = data.memory {
                        record.memory = Some(memory);
                    }
                    self.history.commit(&key, spec.legacy_key(), record);
                }
                Outcome::Failed(err) => {
                    ran_any = true;
                    warn!("Plugin {} failed: {}", spec.label(), err);
                    let (subject, body) = err.to_entry();
                    aggregator.absorb_error(spec.id, &subject, body.as_deref());
                    match err {
                        // timeout produced no valid state; leave the record so
                        // the plugin is retried promptly
                        PluginError::TimedOut(_) => {}
                        // the unit never existed, nothing to record
                        PluginError::LoadFailed(_) => {}
                        // a broken plugin still advances, or it would re-run
                        // and spam errors every pass
                        PluginError::RunFailed(_) => {
                            record.last_run = Some(now);
                            self.history.commit(&key, spec.legacy_key(), record);
                        }
                    }
                }
            }
        }

        if !ran_any {
            self.history.save()?;
            info!("No plugins were due; nothing to transmit.");
            return Ok(PassStatus::NothingDue);
        }

        let batch = aggregator.finalize();
        // durable before the wire: a checkin failure must not roll back the
        // fact that plugins ran and advanced their schedule
        self.history.save()?;

        let (reports, alerts, errors, summaries) = batch.counts();
        info!(
            "Checking in ({} reports, {} alerts, {} errors, {} summaries)...",
            reports, alerts, errors, summaries
        );
        let sent = self.client.post_checkin(&batch).await;
        self.history.data.last_checkin = Some(Utc::now());
        self.history.save()?;
        sent?;
        info!("Checkin complete.");
        Ok(PassStatus::CheckedIn)
    }
}
