use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = department)]
    pub struct Department {
        pub id: i64,
        pub name: String,
        pub monthly_budget: i64,
        pub used_cost: i64,
        pub reserved_cost: i64,
        pub request_limit: Option<i64>,
        pub request_count: i64,
        pub reserved_requests: i64,
        pub token_limit: Option<i64>,
        pub token_count: i64,
        pub reserved_tokens: i64,
        pub enforce_quota: bool,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

impl Department {
    /// Budget still available for new reservations, never negative.
    pub fn remaining(&self) -> i64 {
        (self.monthly_budget - self.used_cost - self.reserved_cost).max(0)
    }

    pub fn remaining_tokens(&self) -> Option<i64> {
        self.token_limit
            .map(|limit| (limit - self.token_count - self.reserved_tokens).max(0))
    }

    /// Whether a reservation of `cost` and `tokens` would be accepted right
    /// now. Same condition as the reserving UPDATE, evaluated on a snapshot.
    pub fn admits(&self, cost: i64, tokens: i64) -> bool {
        if !self.enforce_quota {
            return true;
        }
        let requests_fit = self
            .request_limit
            .is_none_or(|limit| self.request_count + self.reserved_requests + 1 <= limit);
        let tokens_fit = self
            .token_limit
            .is_none_or(|limit| self.token_count + self.reserved_tokens + tokens <= limit);
        self.used_cost + self.reserved_cost + cost <= self.monthly_budget && requests_fit && tokens_fit
    }

    pub fn get(conn: &mut DbConnection, department_id: i64) -> DbResult<Department> {
        db_execute!(conn, {
            let department_db = department::table
                .find(department_id)
                .select(DepartmentDb::as_select())
                .first::<DepartmentDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => GatewayError::NotFound(format!(
                        "department {} not found",
                        department_id
                    )),
                    _ => GatewayError::Database(format!(
                        "error fetching department {}: {}",
                        department_id, e
                    )),
                })?;
            Ok(department_db.from_db())
        })
    }

    #[cfg(test)]
    pub fn insert(conn: &mut DbConnection, data: &Department) -> DbResult<Department> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(department::table)
                .values(DepartmentDb::to_db(data))
                .returning(DepartmentDb::as_returning())
                .get_result::<DepartmentDb>(conn)
                .map_err(|e| {
                    GatewayError::Database(format!("failed to insert department: {}", e))
                })?;
            Ok(inserted.from_db())
        })
    }
}
