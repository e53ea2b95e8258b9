//! One recurring trigger per active backup definition.

pub mod next_fire;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::store::BackupDefinition;
pub use next_fire::{CronSchedule, next_fire_time, parse_time_zone};

struct Registration {
    cron_expression: String,
    time_zone: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Registration {
    fn matches(&self, definition: &BackupDefinition) -> bool {
        self.cron_expression == definition.cron_expression && self.time_zone == definition.time_zone
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    registrations: Mutex<HashMap<Uuid, Registration>>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let root = engine.shutdown_token().child_token();
        Self {
            engine,
            registrations: Mutex::new(HashMap::new()),
            root,
        }
    }

    /// Registers, re-registers or removes the trigger for `definition`.
    /// An unchanged schedule keeps its running trigger.
    pub fn register(&self, definition: &BackupDefinition) -> Result<()> {
        if !definition.is_active {
            self.deregister(definition.id);
            return Ok(());
        }
        definition.validate()?;
        let schedule = CronSchedule::parse(&definition.cron_expression, &definition.time_zone)?;

        let mut registrations = self.registrations.lock();
        if registrations
            .get(&definition.id)
            .is_some_and(|existing| existing.matches(definition))
        {
            return Ok(());
        }

        let cancel = self.root.child_token();
        let handle = tokio::spawn(trigger_loop(
            Arc::clone(&self.engine),
            definition.id,
            schedule,
            cancel.clone(),
        ));
        let previous = registrations.insert(
            definition.id,
            Registration {
                cron_expression: definition.cron_expression.clone(),
                time_zone: definition.time_zone.clone(),
                cancel,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(
            backup_id = %definition.id,
            cron = %definition.cron_expression,
            tz = %definition.time_zone,
            "schedule registered"
        );
        Ok(())
    }

    /// Stops future fires. A run already in flight is left to finish.
    pub fn deregister(&self, backup_id: Uuid) -> bool {
        match self.registrations.lock().remove(&backup_id) {
            Some(registration) => {
                registration.cancel.cancel();
                info!(%backup_id, "schedule removed");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, backup_id: Uuid) -> bool {
        self.registrations.lock().contains_key(&backup_id)
    }

    pub fn registered(&self) -> Vec<Uuid> {
        self.registrations.lock().keys().copied().collect()
    }

    /// Reconciles triggers with the active definitions in the repository.
    /// Invalid definitions are logged and left unregistered.
    pub async fn sync_all(&self) -> Result<usize> {
        let definitions = self.engine.repository().list_active_backup_definitions().await?;
        let active: HashSet<Uuid> = definitions.iter().map(|d| d.id).collect();

        for stale in self
            .registered()
            .into_iter()
            .filter(|id| !active.contains(id))
        {
            self.deregister(stale);
        }
        for definition in &definitions {
            if let Err(err) = self.register(definition) {
                self.deregister(definition.id);
                error!(backup_id = %definition.id, error = %err, "cannot schedule backup");
            }
        }
        Ok(self.registrations.lock().len())
    }

    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<_> = self
            .registrations
            .lock()
            .drain()
            .map(|(_, registration)| registration.handle)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Sleeps until each fire time and starts a run without waiting for it.
/// Fires missed while a run is in flight are skipped, never queued.
async fn trigger_loop(
    engine: Arc<Engine>,
    backup_id: Uuid,
    schedule: CronSchedule,
    cancel: CancellationToken,
) {
    let mut last_fire = Utc::now();
    loop {
        let next = match schedule.next_after(Utc::now().max(last_fire)) {
            Ok(next) => next,
            Err(err) => {
                error!(%backup_id, error = %err, "schedule has no next fire time");
                return;
            }
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(%backup_id, next = %next, "waiting for next fire");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return,
        }
        last_fire = next;

        match engine.start_backup(backup_id).await {
            Ok(started) => {
                debug!(%backup_id, execution_id = %started.execution_id, "scheduled backup started");
            }
            Err(EngineError::OverlapSkipped(_)) => {
                info!(%backup_id, "previous run still in flight, fire skipped");
            }
            Err(err) => {
                warn!(%backup_id, error = %err, "scheduled backup could not start");
            }
        }
    }
}
