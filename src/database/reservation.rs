use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::schema::enum_def::ReservationStatus;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = quota_reservation)]
    pub struct QuotaReservation {
        pub id: i64,
        pub department_id: i64,
        pub user_id: i64,
        pub model_name: String,
        pub estimated_cost: i64,
        pub estimated_tokens: i64,
        pub actual_cost: Option<i64>,
        pub actual_tokens: Option<i64>,
        pub status: ReservationStatus,
        pub created_at: i64,
        pub expires_at: i64,
        pub settled_at: Option<i64>,
    }
}

/// Result of settling a reservation with its actual cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// PENDING hold converted into usage.
    Reconciled,
    /// Reservation had already expired; only the usage was charged.
    LateCharged,
    /// Already settled earlier, nothing changed.
    AlreadySettled,
}

impl QuotaReservation {
    /// Holds `estimated_cost`, `estimated_tokens` and one request against the
    /// department and records the PENDING reservation, all in one transaction.
    ///
    /// The hold is a single conditional UPDATE on the department row, so two
    /// concurrent reservations can never both pass a check that only one of
    /// them fits into.
    pub fn reserve(conn: &mut DbConnection, data: &QuotaReservation) -> DbResult<QuotaReservation> {
        let department_id = data.department_id;
        let estimate = data.estimated_cost;
        let tokens = data.estimated_tokens;
        db_execute!(conn, {
            conn.transaction::<_, GatewayError, _>(|conn| {
                let held = diesel::update(
                    department::table
                        .filter(department::id.eq(department_id))
                        .filter(
                            department::enforce_quota.eq(false).or(
                                (department::used_cost + department::reserved_cost + estimate)
                                    .le(department::monthly_budget)
                                    .and(department::request_limit.is_null().or(
                                        (department::request_count
                                            + department::reserved_requests
                                            + 1i64)
                                            .le(department::request_limit.assume_not_null()),
                                    ))
                                    .and(department::token_limit.is_null().or(
                                        (department::token_count
                                            + department::reserved_tokens
                                            + tokens)
                                            .le(department::token_limit.assume_not_null()),
                                    )),
                            ),
                        ),
                )
                .set((
                    department::reserved_cost.eq(department::reserved_cost + estimate),
                    department::reserved_requests.eq(department::reserved_requests + 1i64),
                    department::reserved_tokens.eq(department::reserved_tokens + tokens),
                    department::updated_at.eq(data.created_at),
                ))
                .execute(conn)?;

                if held == 0 {
                    let balance = department::table
                        .find(department_id)
                        .select((
                            department::monthly_budget,
                            department::used_cost,
                            department::reserved_cost,
                        ))
                        .first::<(i64, i64, i64)>(conn)
                        .optional()?;
                    return Err(match balance {
                        Some((budget, used, reserved)) => GatewayError::QuotaExceeded {
                            remaining: (budget - used - reserved).max(0),
                        },
                        None => GatewayError::NotFound(format!(
                            "department {} not found",
                            department_id
                        )),
                    });
                }

                let inserted = diesel::insert_into(quota_reservation::table)
                    .values(QuotaReservationDb::to_db(data))
                    .returning(QuotaReservationDb::as_returning())
                    .get_result::<QuotaReservationDb>(conn)?;
                Ok(inserted.from_db())
            })
        })
    }

    /// Settles the reservation with its actual cost and tokens. PENDING holds are
    /// converted into usage; a reservation that expired meanwhile is only
    /// charged, since its hold was already returned. Repeated calls are no-ops.
    pub fn reconcile(
        conn: &mut DbConnection,
        reservation_id: i64,
        actual_cost: i64,
        actual_tokens: i64,
        now: i64,
    ) -> DbResult<SettleOutcome> {
        db_execute!(conn, {
            conn.transaction::<_, GatewayError, _>(|conn| {
                let pending = diesel::update(
                    quota_reservation::table
                        .filter(quota_reservation::id.eq(reservation_id))
                        .filter(quota_reservation::status.eq(ReservationStatus::Pending)),
                )
                .set((
                    quota_reservation::status.eq(ReservationStatus::Reconciled),
                    quota_reservation::actual_cost.eq(Some(actual_cost)),
                    quota_reservation::actual_tokens.eq(Some(actual_tokens)),
                    quota_reservation::settled_at.eq(Some(now)),
                ))
                .returning(QuotaReservationDb::as_returning())
                .get_result::<QuotaReservationDb>(conn)
                .optional()?;

                if let Some(reservation) = pending {
                    let reservation = reservation.from_db();
                    diesel::update(department::table.find(reservation.department_id))
                        .set((
                            department::reserved_cost
                                .eq(department::reserved_cost - reservation.estimated_cost),
                            department::reserved_requests
                                .eq(department::reserved_requests - 1i64),
                            department::reserved_tokens
                                .eq(department::reserved_tokens - reservation.estimated_tokens),
                            department::used_cost.eq(department::used_cost + actual_cost),
                            department::request_count.eq(department::request_count + 1i64),
                            department::token_count.eq(department::token_count + actual_tokens),
                            department::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    return Ok(SettleOutcome::Reconciled);
                }

                let expired = diesel::update(
                    quota_reservation::table
                        .filter(quota_reservation::id.eq(reservation_id))
                        .filter(quota_reservation::status.eq(ReservationStatus::Expired)),
                )
                .set((
                    quota_reservation::status.eq(ReservationStatus::Reconciled),
                    quota_reservation::actual_cost.eq(Some(actual_cost)),
                    quota_reservation::actual_tokens.eq(Some(actual_tokens)),
                    quota_reservation::settled_at.eq(Some(now)),
                ))
                .returning(QuotaReservationDb::as_returning())
                .get_result::<QuotaReservationDb>(conn)
                .optional()?;

                if let Some(reservation) = expired {
                    let reservation = reservation.from_db();
                    diesel::update(department::table.find(reservation.department_id))
                        .set((
                            department::used_cost.eq(department::used_cost + actual_cost),
                            department::request_count.eq(department::request_count + 1i64),
                            department::token_count.eq(department::token_count + actual_tokens),
                            department::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                    return Ok(SettleOutcome::LateCharged);
                }

                Ok(SettleOutcome::AlreadySettled)
            })
        })
    }

    /// Returns a PENDING hold to the department. Returns false when the
    /// reservation was already settled.
    pub fn release(conn: &mut DbConnection, reservation_id: i64, now: i64) -> DbResult<bool> {
        Self::return_hold(conn, reservation_id, ReservationStatus::Released, None, now)
    }

    /// Expires a PENDING reservation whose deadline has passed.
    pub fn expire(conn: &mut DbConnection, reservation_id: i64, now: i64) -> DbResult<bool> {
        Self::return_hold(conn, reservation_id, ReservationStatus::Expired, Some(now), now)
    }

    fn return_hold(
        conn: &mut DbConnection,
        reservation_id: i64,
        next_status: ReservationStatus,
        expired_before: Option<i64>,
        now: i64,
    ) -> DbResult<bool> {
        db_execute!(conn, {
            conn.transaction::<_, GatewayError, _>(|conn| {
                let pending = quota_reservation::table
                    .filter(quota_reservation::id.eq(reservation_id))
                    .filter(quota_reservation::status.eq(ReservationStatus::Pending));
                let changes = (
                    quota_reservation::status.eq(next_status),
                    quota_reservation::settled_at.eq(Some(now)),
                );
                let settled = match expired_before {
                    Some(deadline) => diesel::update(
                        pending.filter(quota_reservation::expires_at.le(deadline)),
                    )
                    .set(changes)
                    .returning(QuotaReservationDb::as_returning())
                    .get_result::<QuotaReservationDb>(conn)
                    .optional()?,
                    None => diesel::update(pending)
                        .set(changes)
                        .returning(QuotaReservationDb::as_returning())
                        .get_result::<QuotaReservationDb>(conn)
                        .optional()?,
                };

                match settled.map(|r| r.from_db()) {
                    Some(reservation) => {
                        diesel::update(department::table.find(reservation.department_id))
                            .set((
                                department::reserved_cost
                                    .eq(department::reserved_cost - reservation.estimated_cost),
                                department::reserved_requests
                                    .eq(department::reserved_requests - 1i64),
                                department::reserved_tokens
                                    .eq(department::reserved_tokens - reservation.estimated_tokens),
                                department::updated_at.eq(now),
                            ))
                            .execute(conn)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
        })
    }

    /// Ids of PENDING reservations past their deadline, oldest first.
    pub fn list_expired(conn: &mut DbConnection, now: i64, limit: i64) -> DbResult<Vec<i64>> {
        db_execute!(conn, {
            let ids = quota_reservation::table
                .filter(quota_reservation::status.eq(ReservationStatus::Pending))
                .filter(quota_reservation::expires_at.le(now))
                .order(quota_reservation::expires_at.asc())
                .limit(limit)
                .select(quota_reservation::id)
                .load::<i64>(conn)?;
            Ok(ids)
        })
    }

    pub fn get(conn: &mut DbConnection, reservation_id: i64) -> DbResult<QuotaReservation> {
        db_execute!(conn, {
            let reservation = quota_reservation::table
                .find(reservation_id)
                .select(QuotaReservationDb::as_select())
                .first::<QuotaReservationDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => GatewayError::NotFound(format!(
                        "reservation {} not found",
                        reservation_id
                    )),
                    _ => GatewayError::from(e),
                })?;
            Ok(reservation.from_db())
        })
    }
}
