//! The single-writer event loop: the only code that mutates the plan table
//! and the executing table. Everything else communicates with it through
//! channels.

use crate::cron::ParsedSchedule;
use crate::model::{ExecError, ExecuteInfo, ExecuteResult, Job, JobEvent, SchedulePlan};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default sleep when no plan has a future fire time; bounds how quickly a
/// freshly-saved job can be picked up.
const IDLE_TICK: Duration = Duration::from_secs(1);

pub struct Scheduler {
    plan_table: HashMap<String, SchedulePlan>,
    executing_table: HashMap<String, ExecuteInfo>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            plan_table: HashMap::new(),
            executing_table: HashMap::new(),
        }
    }

    /// Run until `shutdown` fires. `dispatch_tx` hands off firings to the
    /// executor pool; `log_tx` hands completed firings to the log sink.
    pub async fn run(
        mut self,
        mut job_events: mpsc::Receiver<JobEvent>,
        mut results: mpsc::Receiver<ExecuteResult>,
        dispatch_tx: mpsc::Sender<ExecuteInfo>,
        log_tx: mpsc::Sender<ExecuteResult>,
        shutdown: CancellationToken,
    ) {
        let mut sleep = Box::pin(tokio::time::sleep(IDLE_TICK));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                event = job_events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            warn!("job event channel closed, scheduler stopping");
                            return;
                        }
                    }
                }
                result = results.recv() => {
                    match result {
                        Some(result) => self.handle_result(result, &log_tx).await,
                        None => {
                            warn!("result channel closed, scheduler stopping");
                            return;
                        }
                    }
                }
                _ = &mut sleep => {}
            }

            let next_sleep = self.try_schedule(&dispatch_tx).await;
            sleep = Box::pin(tokio::time::sleep(next_sleep));
        }
    }

    fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Save(job) => self.handle_save(job),
            JobEvent::Delete(name) => {
                self.plan_table.remove(&name);
            }
            JobEvent::Kill(name) => {
                if let Some(info) = self.executing_table.remove(&name) {
                    info.cancel.cancel();
                }
            }
        }
    }

    fn handle_save(&mut self, job: Job) {
        let schedule = match ParsedSchedule::parse(&job.cron_expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(job = %job.name, error = %e, "dropping job with unparsable cron expression");
                return;
            }
        };
        let next_fire_time = match schedule.next_after(Utc::now()) {
            Ok(t) => t,
            Err(e) => {
                warn!(job = %job.name, error = %e, "cron expression has no future occurrence");
                return;
            }
        };

        self.plan_table.insert(
            job.name.clone(),
            SchedulePlan {
                job,
                next_fire_time,
            },
        );
    }

    async fn handle_result(&mut self, result: ExecuteResult, log_tx: &mpsc::Sender<ExecuteResult>) {
        self.executing_table.remove(&result.info.job.name);

        if matches!(result.error, Some(ExecError::LockAlreadyHeld)) {
            return;
        }

        let _ = log_tx.send(result).await;
    }

    /// Walk the plan table once, dispatching every plan whose fire time has
    /// arrived, and return how long to sleep until the next one is due.
    async fn try_schedule(&mut self, dispatch_tx: &mpsc::Sender<ExecuteInfo>) -> Duration {
        let now = Utc::now();
        let mut names_to_fire = Vec::new();

        for (name, plan) in self.plan_table.iter() {
            if plan.next_fire_time <= now {
                names_to_fire.push(name.clone());
            }
        }

        for name in names_to_fire {
            let plan_time = self.plan_table[&name].next_fire_time;
            self.try_start(&name, plan_time, dispatch_tx).await;

            if let Some(plan) = self.plan_table.get_mut(&name) {
                match ParsedSchedule::parse(&plan.job.cron_expr) {
                    Ok(schedule) => match schedule.next_after(now) {
                        Ok(next) => plan.next_fire_time = next,
                        Err(e) => {
                            warn!(job = %name, error = %e, "cron expression exhausted, dropping plan");
                            self.plan_table.remove(&name);
                        }
                    },
                    Err(e) => {
                        warn!(job = %name, error = %e, "cron expression became invalid, dropping plan");
                        self.plan_table.remove(&name);
                    }
                }
            }
        }

        self.plan_table
            .values()
            .map(|plan| plan.next_fire_time)
            .min()
            .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_TICK)
    }

    /// Dispatch a firing unless this worker is still running the previous
    /// one for the same job — the local concurrency gate on top of the
    /// cluster-wide distributed lock.
    async fn try_start(
        &mut self,
        name: &str,
        plan_time: chrono::DateTime<Utc>,
        dispatch_tx: &mpsc::Sender<ExecuteInfo>,
    ) {
        if self.executing_table.contains_key(name) {
            info!(job = %name, "still running, skipping this firing");
            return;
        }

        let Some(plan) = self.plan_table.get(name) else {
            return;
        };
        let info = ExecuteInfo::new(plan.job.clone(), plan_time);
        self.executing_table.insert(name.to_string(), info.clone());

        if dispatch_tx.send(info).await.is_err() {
            warn!(job = %name, "executor channel closed, dropping firing");
            self.executing_table.remove(name);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            command: "echo hi".to_string(),
            cron_expr: "* * * * * * *".to_string(),
        }
    }

    #[test]
    fn save_inserts_plan_with_a_future_fire_time() {
        let mut s = Scheduler::new();
        s.handle_save(job("j1"));
        let plan = s.plan_table.get("j1").expect("plan should be present");
        assert!(plan.next_fire_time > Utc::now() - chrono::Duration::seconds(1));
    }

    #[test]
    fn save_with_bad_cron_is_dropped_silently() {
        let mut s = Scheduler::new();
        s.handle_save(Job {
            cron_expr: "not a cron expr".into(),
            ..job("j1")
        });
        assert!(s.plan_table.is_empty());
    }

    #[test]
    fn delete_removes_the_plan() {
        let mut s = Scheduler::new();
        s.handle_save(job("j1"));
        s.handle_event(JobEvent::Delete("j1".into()));
        assert!(s.plan_table.is_empty());
    }

    #[test]
    fn kill_on_unknown_job_is_a_no_op() {
        let mut s = Scheduler::new();
        s.handle_event(JobEvent::Kill("never-started".into()));
        assert!(s.executing_table.is_empty());
    }

    #[tokio::test]
    async fn duplicate_firing_is_suppressed_while_executing() {
        let mut s = Scheduler::new();
        s.handle_save(job("j1"));
        let (tx, mut rx) = mpsc::channel(4);

        s.try_start("j1", Utc::now(), &tx).await;
        assert_eq!(s.executing_table.len(), 1);
        // second attempt while still executing must not dispatch again
        s.try_start("j1", Utc::now(), &tx).await;
        assert_eq!(rx.len(), 1);

        rx.recv().await.unwrap();
    }
}
