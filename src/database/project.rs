use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = project)]
    pub struct Project {
        pub id: i64,
        pub user_id: i64,
        pub name: String,
        pub system_prompt: Option<String>,
        pub created_at: i64,
    }
}

impl Project {
    pub fn get_owned(conn: &mut DbConnection, project_id: i64, user_id: i64) -> DbResult<Project> {
        let found = db_execute!(conn, {
            project::table
                .find(project_id)
                .select(ProjectDb::as_select())
                .first::<ProjectDb>(conn)
                .optional()?
                .map(|row| row.from_db())
        });
        match found {
            Some(p) if p.user_id == user_id => Ok(p),
            Some(_) => Err(GatewayError::Forbidden(format!(
                "project {} belongs to another user",
                project_id
            ))),
            None => Err(GatewayError::NotFound(format!("project {} not found", project_id))),
        }
    }

    #[cfg(test)]
    pub fn insert(conn: &mut DbConnection, data: &Project) -> DbResult<Project> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(project::table)
                .values(ProjectDb::to_db(data))
                .returning(ProjectDb::as_returning())
                .get_result::<ProjectDb>(conn)?;
            Ok(inserted.from_db())
        })
    }
}
