//! Cron-triggered direct transfers. A `ScheduledMigration` persists across
//! restarts in the `scheduled_migrations` collection; `Scheduler::tick`
//! finds every due schedule, hands it to the caller to execute, and
//! advances `last_run`/`next_run` from the cron expression regardless of
//! whether the execution succeeded, so a failing schedule does not spin.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::migration::package::ConflictResolutionPolicy;
use crate::store::Store;
use crate::util::{new_id, now_unix_seconds};

pub const SCHEDULES_COLLECTION: &str = "scheduled_migrations";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMigration {
    pub schedule_id: String,
    pub owner_id: String,
    pub source_instance_id: String,
    pub target_instance_id: String,
    pub collections: Vec<String>,
    pub conflict_policy: ConflictResolutionPolicy,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run: Option<i64>,
    pub next_run: i64,
    pub created_at: i64,
}

fn next_occurrence(cron_expression: &str, after: chrono::DateTime<Utc>) -> Result<i64> {
    let schedule = CronSchedule::from_str(cron_expression)
        .map_err(|e| ClusterError::Validation(format!("invalid cron expression '{cron_expression}': {e}")))?;
    schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| ClusterError::Validation(format!("cron expression '{cron_expression}' has no future occurrence")))
}

pub struct ScheduleRegistry {
    store: Arc<dyn Store>,
}

impl ScheduleRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        owner_id: &str,
        source_instance_id: &str,
        target_instance_id: &str,
        collections: Vec<String>,
        conflict_policy: ConflictResolutionPolicy,
        cron_expression: &str,
    ) -> Result<ScheduledMigration> {
        let now = now_unix_seconds();
        let next_run = next_occurrence(cron_expression, Utc::now())?;
        let schedule = ScheduledMigration {
            schedule_id: format!("sched-{}", new_id()),
            owner_id: owner_id.to_string(),
            source_instance_id: source_instance_id.to_string(),
            target_instance_id: target_instance_id.to_string(),
            collections,
            conflict_policy,
            cron_expression: cron_expression.to_string(),
            enabled: true,
            last_run: None,
            next_run,
            created_at: now,
        };
        self.store
            .insert(SCHEDULES_COLLECTION, &schedule.schedule_id, serde_json::to_value(&schedule)?)
            .await?;
        Ok(schedule)
    }

    pub async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledMigration>> {
        match self.store.get(SCHEDULES_COLLECTION, schedule_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<ScheduledMigration>> {
        let docs = self.store.list(SCHEDULES_COLLECTION).await?;
        let mut schedules = Vec::new();
        for (_, doc) in docs {
            let schedule: ScheduledMigration = serde_json::from_value(doc)?;
            if schedule.owner_id == owner_id {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        self.store.delete(SCHEDULES_COLLECTION, schedule_id).await
    }

    pub async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<()> {
        let mut schedule = self
            .get(schedule_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("schedule {schedule_id}")))?;
        schedule.enabled = enabled;
        self.store
            .replace(SCHEDULES_COLLECTION, schedule_id, serde_json::to_value(&schedule)?)
            .await
    }

    /// Returns every enabled schedule whose `next_run` has passed.
    pub async fn due(&self) -> Result<Vec<ScheduledMigration>> {
        let docs = self.store.list(SCHEDULES_COLLECTION).await?;
        let now = now_unix_seconds();
        let mut due = Vec::new();
        for (_, doc) in docs {
            let schedule: ScheduledMigration = serde_json::from_value(doc)?;
            if schedule.enabled && schedule.next_run <= now {
                due.push(schedule);
            }
        }
        Ok(due)
    }

    /// Records that `schedule_id` ran at `ran_at` and advances `next_run`
    /// from its cron expression. Called regardless of whether the triggered
    /// transfer succeeded, so a single failing run doesn't retry in a tight
    /// loop.
    pub async fn record_run(&self, schedule_id: &str, ran_at: i64) -> Result<()> {
        let mut schedule = self
            .get(schedule_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("schedule {schedule_id}")))?;
        schedule.last_run = Some(ran_at);
        schedule.next_run = next_occurrence(
            &schedule.cron_expression,
            chrono::DateTime::from_timestamp(ran_at, 0).unwrap_or_else(Utc::now),
        )?;
        self.store
            .replace(SCHEDULES_COLLECTION, schedule_id, serde_json::to_value(&schedule)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn registry() -> ScheduleRegistry {
        ScheduleRegistry::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn create_computes_a_future_next_run() {
        let reg = registry();
        let schedule = reg
            .create("tenant-a", "src", "tgt", vec!["widgets".to_string()], ConflictResolutionPolicy::Skip, "0 0 * * * *")
            .await
            .unwrap();
        assert!(schedule.next_run > now_unix_seconds());
        assert!(schedule.last_run.is_none());
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let reg = registry();
        let err = reg
            .create("tenant-a", "src", "tgt", vec![], ConflictResolutionPolicy::Skip, "not a cron expression")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
    }

    #[tokio::test]
    async fn due_only_returns_enabled_schedules_past_next_run() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let reg = ScheduleRegistry::new(store.clone());
        let schedule = reg
            .create("tenant-a", "src", "tgt", vec![], ConflictResolutionPolicy::Skip, "0 0 * * * *")
            .await
            .unwrap();
        assert!(reg.due().await.unwrap().is_empty());

        // Force it due by rewinding next_run directly through the store.
        let mut doc = schedule.clone();
        doc.next_run = now_unix_seconds() - 1;
        store
            .replace(SCHEDULES_COLLECTION, &doc.schedule_id, serde_json::to_value(&doc).unwrap())
            .await
            .unwrap();
        let due = reg.due().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].schedule_id, schedule.schedule_id);
    }

    #[tokio::test]
    async fn record_run_sets_last_run_and_advances_next_run() {
        let reg = registry();
        let schedule = reg
            .create("tenant-a", "src", "tgt", vec![], ConflictResolutionPolicy::Skip, "0 0 * * * *")
            .await
            .unwrap();
        let ran_at = schedule.next_run;
        reg.record_run(&schedule.schedule_id, ran_at).await.unwrap();
        let updated = reg.get(&schedule.schedule_id).await.unwrap().unwrap();
        assert_eq!(updated.last_run, Some(ran_at));
        assert!(updated.next_run > ran_at);
    }
}
