use diesel::prelude::*;
use serde::Serialize;

use super::{DbConnection, DbResult};
use crate::controller::error::GatewayError;
use crate::schema::enum_def::MessageRole;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = conversation)]
    pub struct Conversation {
        pub id: i64,
        pub user_id: i64,
        pub project_id: Option<i64>,
        pub title: String,
        pub model_name: String,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(Queryable, Selectable, Identifiable, Insertable, Serialize, Debug, Clone)]
    #[diesel(table_name = chat_message)]
    pub struct ChatMessage {
        pub id: i64,
        pub conversation_id: i64,
        pub role: MessageRole,
        pub content: String,
        pub model_name: Option<String>,
        pub input_tokens: Option<i32>,
        pub output_tokens: Option<i32>,
        pub cost: Option<i64>,
        pub created_at: i64,
    }
}

impl Conversation {
    pub fn create(conn: &mut DbConnection, data: &Conversation) -> DbResult<Conversation> {
        db_execute!(conn, {
            let inserted = diesel::insert_into(conversation::table)
                .values(ConversationDb::to_db(data))
                .returning(ConversationDb::as_returning())
                .get_result::<ConversationDb>(conn)
                .map_err(|e| {
                    GatewayError::Database(format!("failed to create conversation: {}", e))
                })?;
            Ok(inserted.from_db())
        })
    }

    /// Loads a conversation that must belong to `user_id`.
    pub fn get_owned(
        conn: &mut DbConnection,
        conversation_id: i64,
        user_id: i64,
    ) -> DbResult<Conversation> {
        let found = db_execute!(conn, {
            conversation::table
                .find(conversation_id)
                .select(ConversationDb::as_select())
                .first::<ConversationDb>(conn)
                .optional()?
                .map(|row| row.from_db())
        });
        match found {
            Some(c) if c.user_id == user_id => Ok(c),
            Some(_) => Err(GatewayError::Forbidden(format!(
                "conversation {} belongs to another user",
                conversation_id
            ))),
            None => Err(GatewayError::NotFound(format!(
                "conversation {} not found",
                conversation_id
            ))),
        }
    }

    #[cfg(test)]
    pub fn list_by_user(conn: &mut DbConnection, user_id: i64) -> DbResult<Vec<Conversation>> {
        db_execute!(conn, {
            let rows = conversation::table
                .filter(conversation::user_id.eq(user_id))
                .order(conversation::created_at.asc())
                .select(ConversationDb::as_select())
                .load::<ConversationDb>(conn)?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }
}

impl ChatMessage {
    /// Appends a message and bumps the conversation's `updated_at`.
    pub fn append(conn: &mut DbConnection, message: &ChatMessage) -> DbResult<ChatMessage> {
        db_execute!(conn, {
            conn.transaction::<_, GatewayError, _>(|conn| {
                let inserted = diesel::insert_into(chat_message::table)
                    .values(ChatMessageDb::to_db(message))
                    .returning(ChatMessageDb::as_returning())
                    .get_result::<ChatMessageDb>(conn)?;
                diesel::update(conversation::table.find(message.conversation_id))
                    .set(conversation::updated_at.eq(message.created_at))
                    .execute(conn)?;
                Ok(inserted.from_db())
            })
        })
    }

    /// The last `limit` messages of a conversation, in chronological order.
    pub fn recent(
        conn: &mut DbConnection,
        conversation_id: i64,
        limit: i64,
    ) -> DbResult<Vec<ChatMessage>> {
        db_execute!(conn, {
            let mut rows = chat_message::table
                .filter(chat_message::conversation_id.eq(conversation_id))
                .order((chat_message::created_at.desc(), chat_message::id.desc()))
                .limit(limit)
                .select(ChatMessageDb::as_select())
                .load::<ChatMessageDb>(conn)?;
            rows.reverse();
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }

    pub fn list(conn: &mut DbConnection, conversation_id: i64) -> DbResult<Vec<ChatMessage>> {
        db_execute!(conn, {
            let rows = chat_message::table
                .filter(chat_message::conversation_id.eq(conversation_id))
                .order((chat_message::created_at.asc(), chat_message::id.asc()))
                .select(ChatMessageDb::as_select())
                .load::<ChatMessageDb>(conn)?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }
}
