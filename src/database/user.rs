use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::schema::enum_def::UserRole;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = app_user)]
    pub struct AppUser {
        pub id: i64,
        pub username: String,
        pub department_id: Option<i64>,
        pub role: UserRole,
        pub is_active: bool,
        pub created_at: i64,
    }
}

impl AppUser {
    pub fn find(conn: &mut DbConnection, user_id: i64) -> DbResult<Option<AppUser>> {
        db_execute!(conn, {
            let user = app_user::table
                .find(user_id)
                .select(AppUserDb::as_select())
                .first::<AppUserDb>(conn)
                .optional()?;
            Ok(user.map(|u| u.from_db()))
        })
    }

    #[cfg(test)]
    pub fn insert(conn: &mut DbConnection, data: &AppUser) -> DbResult<AppUser> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(app_user::table)
                .values(AppUserDb::to_db(data))
                .returning(AppUserDb::as_returning())
                .get_result::<AppUserDb>(conn)?;
            Ok(inserted.from_db())
        })
    }
}
