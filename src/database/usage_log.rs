use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = usage_log)]
    pub struct UsageLog {
        pub id: i64,
        pub user_id: i64,
        pub department_id: i64,
        pub reservation_id: Option<i64>,
        pub conversation_id: Option<i64>,
        pub model_name: String,
        pub provider: String,
        pub input_tokens: i32,
        pub output_tokens: i32,
        pub total_tokens: i32,
        pub cost: i64,
        pub response_time_ms: i64,
        pub first_chunk_ms: Option<i64>,
        pub chunk_count: i32,
        pub success: bool,
        pub error_kind: Option<String>,
        pub error_message: Option<String>,
        pub created_at: i64,
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A row for the same reservation already exists.
    Duplicate,
}

impl UsageLog {
    /// Appends one attempt. Rows are never updated afterwards; a second write
    /// for the same reservation is reported as `Duplicate` rather than failing.
    pub fn append(conn: &mut DbConnection, log: &UsageLog) -> DbResult<AppendOutcome> {
        db_execute!(conn, {
            let result = diesel::insert_into(usage_log::table)
                .values(UsageLogDb::to_db(log))
                .execute(conn);
            match result {
                Ok(_) => Ok(AppendOutcome::Inserted),
                Err(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                )) if log.reservation_id.is_some() => Ok(AppendOutcome::Duplicate),
                Err(e) => Err(GatewayError::Database(format!(
                    "failed to insert usage log: {}",
                    e
                ))),
            }
        })
    }

    /// Most recent attempts of a department, newest first.
    #[cfg(test)]
    pub fn list_by_department(
        conn: &mut DbConnection,
        department_id: i64,
        limit: i64,
    ) -> DbResult<Vec<UsageLog>> {
        db_execute!(conn, {
            let rows = usage_log::table
                .filter(usage_log::department_id.eq(department_id))
                .order((usage_log::created_at.desc(), usage_log::id.desc()))
                .limit(limit)
                .select(UsageLogDb::as_select())
                .load::<UsageLogDb>(conn)?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }

    #[cfg(test)]
    pub fn count_by_reservation(conn: &mut DbConnection, reservation_id: i64) -> DbResult<i64> {
        db_execute!(conn, {
            let count = usage_log::table
                .filter(usage_log::reservation_id.eq(reservation_id))
                .count()
                .get_result::<i64>(conn)?;
            Ok(count)
        })
    }
}
