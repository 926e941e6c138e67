use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::payments::Payment;
use crate::store::Stores;
use crate::subscriptions::Subscription;
use crate::users::User;

/// Notification tasks waiting for a worker
const QUEUE_SIZE: usize = 1_000;

pub const DEFAULT_NOTIFICATION_WORKERS: usize = 2;

/// Work items consumed by the notification workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTask {
    /// Tell the user their purchase is active
    SubscriptionConfirmation { user_id: Uuid, payment_id: Uuid },
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Outbound channel to viewers (email in production)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_subscription_confirmation(
        &self,
        user: &User,
        payment: &Payment,
        subscription: &Subscription,
    ) -> Result<()>;

    async fn send_expiry_reminder(&self, user: &User, subscription: &Subscription) -> Result<()>;
}

/// Producer side of the notification queue.
///
/// Enqueueing never blocks the caller. When the queue is full the task is
/// dropped and logged; the entitlement it describes is already committed.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: flume::Sender<NotificationTask>,
}

impl NotificationQueue {
    pub fn new() -> (Self, flume::Receiver<NotificationTask>) {
        let (tx, rx) = flume::bounded(QUEUE_SIZE);
        (Self { tx }, rx)
    }

    /// Returns whether the task was queued
    pub fn enqueue(&self, task: NotificationTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => {
                metrics::counter!("notifications.enqueued").increment(1);
                true
            }
            Err(flume::TrySendError::Full(task)) => {
                warn!(?task, "Notification queue full, dropping task");
                metrics::counter!("notifications.dropped", "reason" => "queue_full").increment(1);
                false
            }
            Err(flume::TrySendError::Disconnected(task)) => {
                warn!(?task, "Notification queue closed, dropping task");
                metrics::counter!("notifications.dropped", "reason" => "disconnected")
                    .increment(1);
                false
            }
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted
pub async fn deliver_with_retry<F, Fut>(policy: RetryPolicy, label: &str, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let total = policy.total_attempts();
    let mut attempt_number = 1;

    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt_number < total => {
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt_number, total, e, policy.delay
                );
                attempt_number += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                error!("{} failed after {} attempts: {}", label, total, e);
                return Err(e);
            }
        }
    }
}

/// Consumer side: resolves tasks against the stores and hands them to a
/// [`Notifier`]
#[derive(Clone)]
pub struct NotificationWorker {
    stores: Stores,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl NotificationWorker {
    pub fn new(stores: Stores, notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            stores,
            notifier,
            policy,
        }
    }

    /// Spawn `num_workers` tasks draining the queue until every sender is gone
    pub fn spawn(
        self,
        rx: flume::Receiver<NotificationTask>,
        num_workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let handles = (0..num_workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let worker = self.clone();

                tokio::spawn(
                    async move {
                        debug!("Notification worker {} started", worker_id);
                        while let Ok(task) = rx.recv_async().await {
                            worker.handle(task).await;
                            metrics::gauge!("notifications.queue_depth").set(rx.len() as f64);
                        }
                        debug!("Notification worker {} stopped", worker_id);
                    }
                    .instrument(tracing::info_span!("notification_worker", worker_id)),
                )
            })
            .collect();

        info!("Spawned {} notification workers", num_workers);
        handles
    }

    /// Deliver one task under the retry policy. Failures end here.
    pub async fn handle(&self, task: NotificationTask) {
        let label = format!("{:?}", task);
        let task = &task;
        let result = deliver_with_retry(self.policy, &label, move || self.process(task)).await;

        match result {
            Ok(()) => metrics::counter!("notifications.sent").increment(1),
            Err(_) => {
                metrics::counter!("notifications.failed").increment(1);
            }
        }
    }

    /// One delivery attempt. Missing records are not worth retrying and
    /// count as done.
    pub async fn process(&self, task: &NotificationTask) -> Result<()> {
        match task {
            NotificationTask::SubscriptionConfirmation {
                user_id,
                payment_id,
            } => {
                let Some(user) = self.stores.users.get_user(*user_id).await? else {
                    warn!(%user_id, "Skipping confirmation for unknown user");
                    return Ok(());
                };
                let Some(payment) = self.stores.payments.get_by_id(*payment_id).await? else {
                    warn!(%payment_id, "Skipping confirmation for unknown payment");
                    return Ok(());
                };
                let Some(subscription) = self.stores.subscriptions.get_by_user(*user_id).await?
                else {
                    warn!(%user_id, "Skipping confirmation, user has no subscription");
                    return Ok(());
                };

                self.notifier
                    .send_subscription_confirmation(&user, &payment, &subscription)
                    .await?;

                info!(%user_id, %payment_id, "Sent subscription confirmation");
                Ok(())
            }
        }
    }
}
