use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = file_attachment)]
    pub struct FileAttachment {
        pub id: i64,
        pub user_id: i64,
        pub filename: String,
        pub extracted_text: Option<String>,
        pub created_at: i64,
    }
}

impl FileAttachment {
    /// Loads the requested attachments in the order given. Every id must exist
    /// and belong to `user_id`.
    pub fn list_owned(
        conn: &mut DbConnection,
        ids: &[i64],
        user_id: i64,
    ) -> DbResult<Vec<FileAttachment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<FileAttachment> = db_execute!(conn, {
            file_attachment::table
                .filter(file_attachment::id.eq_any(ids.to_vec()))
                .select(FileAttachmentDb::as_select())
                .load::<FileAttachmentDb>(conn)?
                .into_iter()
                .map(|row| row.from_db())
                .collect()
        });

        ids.iter()
            .map(|id| match rows.iter().find(|a| a.id == *id) {
                Some(a) if a.user_id == user_id => Ok(a.clone()),
                Some(_) => Err(GatewayError::Forbidden(format!(
                    "attachment {} belongs to another user",
                    id
                ))),
                None => Err(GatewayError::NotFound(format!("attachment {} not found", id))),
            })
            .collect()
    }

    #[cfg(test)]
    pub fn insert(conn: &mut DbConnection, data: &FileAttachment) -> DbResult<FileAttachment> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(file_attachment::table)
                .values(FileAttachmentDb::to_db(data))
                .returning(FileAttachmentDb::as_returning())
                .get_result::<FileAttachmentDb>(conn)?;
            Ok(inserted.from_db())
        })
    }
}
