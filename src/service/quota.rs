use std::time::Duration;

use cyder_tools::log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::error::GatewayError;
use crate::database::department::Department;
use crate::database::reservation::{QuotaReservation, SettleOutcome};
use crate::database::{run_blocking, DbPool, DbResult};
use crate::schema::enum_def::ReservationStatus;
use crate::utils::billing::micros_to_amount;
use crate::utils::{now_millis, ID_GENERATOR};

const SWEEP_BATCH: i64 = 200;

/// A PENDING hold on a department's budget, owned by one chat request.
#[derive(Debug, Clone)]
pub struct ReservationHandle {
    pub id: i64,
    pub department_id: i64,
    pub user_id: i64,
    pub model_name: String,
    pub estimated_cost: i64,
    pub estimated_tokens: i64,
    pub expires_at: i64,
}

/// A department's budget as seen by its members.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub department_id: i64,
    pub department_name: String,
    pub enforce_quota: bool,
    pub monthly_budget: f64,
    pub used_cost: f64,
    pub reserved_cost: f64,
    pub remaining_budget: f64,
    pub request_limit: Option<i64>,
    pub request_count: i64,
    pub reserved_requests: i64,
    pub token_limit: Option<i64>,
    pub token_count: i64,
    pub reserved_tokens: i64,
    pub remaining_tokens: Option<i64>,
}

impl From<&Department> for QuotaStatus {
    fn from(department: &Department) -> Self {
        Self {
            department_id: department.id,
            department_name: department.name.clone(),
            enforce_quota: department.enforce_quota,
            monthly_budget: micros_to_amount(department.monthly_budget),
            used_cost: micros_to_amount(department.used_cost),
            reserved_cost: micros_to_amount(department.reserved_cost),
            remaining_budget: micros_to_amount(department.remaining()),
            request_limit: department.request_limit,
            request_count: department.request_count,
            reserved_requests: department.reserved_requests,
            token_limit: department.token_limit,
            token_count: department.token_count,
            reserved_tokens: department.reserved_tokens,
            remaining_tokens: department.remaining_tokens(),
        }
    }
}

/// Budget reservations against department rows. All state lives in the
/// database, so the guarantees hold across gateway processes.
#[derive(Clone)]
pub struct QuotaGuard {
    db: DbPool,
    ttl: Duration,
}

impl QuotaGuard {
    pub fn new(db: DbPool, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub async fn reserve(
        &self,
        department_id: i64,
        user_id: i64,
        model_name: &str,
        estimated_cost: i64,
        estimated_tokens: i64,
    ) -> DbResult<ReservationHandle> {
        if estimated_cost < 0 || estimated_tokens < 0 {
            return Err(GatewayError::ParamInvalid(
                "estimates must not be negative".to_string(),
            ));
        }
        let now = now_millis();
        let data = QuotaReservation {
            id: ID_GENERATOR.generate_id(),
            department_id,
            user_id,
            model_name: model_name.to_string(),
            estimated_cost,
            estimated_tokens,
            actual_cost: None,
            actual_tokens: None,
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
            settled_at: None,
        };

        let result = run_blocking(&self.db, move |conn| QuotaReservation::reserve(conn, &data)).await;
        match result {
            Ok(reservation) => {
                debug!(
                    "reserved {} ({} tokens) for department {} (reservation {})",
                    estimated_cost, estimated_tokens, department_id, reservation.id
                );
                Ok(ReservationHandle {
                    id: reservation.id,
                    department_id,
                    user_id,
                    model_name: reservation.model_name,
                    estimated_cost,
                    estimated_tokens,
                    expires_at: reservation.expires_at,
                })
            }
            Err(GatewayError::QuotaExceeded { remaining }) => {
                warn!(
                    "department {} quota exceeded: requested {}, remaining {}",
                    department_id, estimated_cost, remaining
                );
                Err(GatewayError::QuotaExceeded { remaining })
            }
            Err(e) => Err(e),
        }
    }

    /// Converts the hold into actual usage. Safe to call more than once.
    ///
    /// The actual cost is charged in full even when it exceeds the estimate,
    /// so `used_cost` can end above the budget; the department then rejects
    /// new reservations until the period resets.
    pub async fn reconcile(
        &self,
        handle: &ReservationHandle,
        actual_cost: i64,
        actual_tokens: i64,
    ) -> DbResult<SettleOutcome> {
        let reservation_id = handle.id;
        let actual_cost = actual_cost.max(0);
        let actual_tokens = actual_tokens.max(0);
        let outcome = run_blocking(&self.db, move |conn| {
            QuotaReservation::reconcile(conn, reservation_id, actual_cost, actual_tokens, now_millis())
        })
        .await?;
        match outcome {
            SettleOutcome::Reconciled => debug!(
                "reservation {} reconciled: estimated {}, actual {}",
                reservation_id, handle.estimated_cost, actual_cost
            ),
            SettleOutcome::LateCharged => warn!(
                "reservation {} reconciled after expiry, charged {}",
                reservation_id, actual_cost
            ),
            SettleOutcome::AlreadySettled => {
                debug!("reservation {} already settled", reservation_id)
            }
        }
        Ok(outcome)
    }

    /// Returns the full hold. No-op when already settled.
    pub async fn release(&self, handle: &ReservationHandle) -> DbResult<bool> {
        let reservation_id = handle.id;
        let released = run_blocking(&self.db, move |conn| {
            QuotaReservation::release(conn, reservation_id, now_millis())
        })
        .await?;
        if released {
            debug!("reservation {} released", reservation_id);
        }
        Ok(released)
    }

    pub async fn status(&self, department_id: i64) -> DbResult<QuotaStatus> {
        let department = run_blocking(&self.db, move |conn| Department::get(conn, department_id)).await?;
        Ok(QuotaStatus::from(&department))
    }

    pub async fn sweep_expired(&self) -> DbResult<usize> {
        self.sweep_expired_at(now_millis()).await
    }

    /// Expires every PENDING reservation whose deadline is at or before `now`.
    /// Returns how many this call expired; reservations expired concurrently by
    /// another sweeper are not counted.
    pub async fn sweep_expired_at(&self, now: i64) -> DbResult<usize> {
        let expired = run_blocking(&self.db, move |conn| {
            let mut expired = 0;
            loop {
                let ids = QuotaReservation::list_expired(conn, now, SWEEP_BATCH)?;
                let batch_len = ids.len();
                let mut progressed = false;
                for id in ids {
                    if QuotaReservation::expire(conn, id, now)? {
                        expired += 1;
                        progressed = true;
                    }
                }
                if (batch_len as i64) < SWEEP_BATCH || !progressed {
                    break;
                }
            }
            Ok(expired)
        })
        .await?;
        if expired > 0 {
            info!("expired {} stale reservation(s)", expired);
        }
        Ok(expired)
    }

    /// Periodically expires stale reservations until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("reservation sweeper started, interval {:?}", interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("reservation sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = guard.sweep_expired().await {
                            error!("reservation sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
