use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    Connection, PgConnection, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::fs::File;
use std::path::Path;

use crate::controller::error::GatewayError;

pub mod attachment;
pub mod conversation;
pub mod department;
pub mod project;
pub mod reservation;
pub mod usage_log;
pub mod user;

#[cfg(test)]
pub mod testing;

pub enum DbType {
    Postgres,
    Sqlite,
}

/// Connection pool handle. Cheap to clone; clones share the underlying pool.
#[derive(Clone)]
pub enum DbPool {
    Postgres(Pool<ConnectionManager<PgConnection>>),
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
}

pub enum DbConnection {
    Postgres(PooledConnection<ConnectionManager<PgConnection>>),
    Sqlite(PooledConnection<ConnectionManager<SqliteConnection>>),
}

fn parse_db_type(db_url: &str) -> DbType {
    if db_url.starts_with("postgres") {
        DbType::Postgres
    } else {
        DbType::Sqlite
    }
}

impl DbPool {
    /// Opens the pool for `db_url` and applies pending migrations.
    pub fn establish(db_url: &str) -> DbResult<Self> {
        match parse_db_type(db_url) {
            DbType::Postgres => Ok(DbPool::Postgres(init_pg_pool(db_url)?)),
            DbType::Sqlite => Ok(DbPool::Sqlite(init_sqlite_pool(db_url)?)),
        }
    }

    pub fn get_connection(&self) -> DbResult<DbConnection> {
        match self {
            DbPool::Postgres(pool) => Ok(DbConnection::Postgres(pool.get()?)),
            DbPool::Sqlite(pool) => Ok(DbConnection::Sqlite(pool.get()?)),
        }
    }
}

/// Runs synchronous diesel work on the blocking thread pool.
pub async fn run_blocking<T, F>(pool: &DbPool, f: F) -> DbResult<T>
where
    F: FnOnce(&mut DbConnection) -> DbResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get_connection()?;
        f(&mut conn)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("database task failed: {}", e)))?
}

#[path = "../schema/sqlite.rs"]
pub mod _sqlite_schema;

#[path = "../schema/postgres.rs"]
pub mod _postgres_schema;

#[macro_export]
macro_rules! db_object {
    (
        $(
            $( #[$attr:meta] )*
            pub struct $name:ident {
                $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty ),+
                $(,)?
            }
        )+
    ) => {
        $(
            #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
            pub struct $name { $( $vis $field : $typ, )+ }
        )+

        pub mod _postgres_model {
            $( $crate::db_object! { @expand postgres |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
        pub mod _sqlite_model {
            $( $crate::db_object! { @expand sqlite |  $( #[$attr] )* | $name |  $( $( #[$field_attr] )* $field : $typ ),+ } )+
        }
    };
    ( @expand $db_type:ident | $( #[$attr:meta] )* | $name:ident | $( $( #[$field_attr:meta] )* $vis:vis $field:ident : $typ:ty),+) => {
        paste::paste! {
            #[allow(unused_imports)] use super::*;
            #[allow(unused_imports)] use crate::database::[<_ $db_type _schema>]::*;
            #[allow(unused_imports)] use diesel::prelude::*;

            $( #[$attr] )*
            pub struct [<$name Db>] { $(
                $( #[$field_attr] )* $vis $field : $typ,
            )+ }

            impl [<$name Db>] {
                #[allow(dead_code)]
                #[inline(always)]
                pub fn from_db(self) -> super::$name {
                    super::$name { $( $field: self.$field, )+ }
                }

                #[allow(dead_code)]
                #[inline(always)]
                pub fn to_db(x: &super::$name) -> Self {
                    Self {
                        $( $field: x.$field.clone(), )+
                    }
                }
            }
        }
    }
}

#[macro_export]
macro_rules! db_execute {
    ($conn:ident, $block:block) => {
        match $conn {
            crate::database::DbConnection::Postgres($conn) => {
                use crate::database::_postgres_schema::*;
                #[allow(unused_imports)]
                use _postgres_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
            crate::database::DbConnection::Sqlite($conn) => {
                use crate::database::_sqlite_schema::*;
                #[allow(unused_imports)]
                use _sqlite_model::*;
                #[allow(unused_imports)]
                use diesel::prelude::*;

                $block
            }
        }
    };
}

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

/// Concurrent reservations contend on the department row; writers wait on the
/// lock instead of failing with SQLITE_BUSY.
const SQLITE_PRAGMAS: &str =
    "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;";

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(SQLITE_PRAGMAS)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

fn migration_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Database(format!("failed to run migrations: {}", e))
}

fn init_sqlite_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<SqliteConnection>>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir).map_err(|e| {
                    GatewayError::Database(format!("failed to create database directory: {}", e))
                })?;
            }
        }
        File::create(db_path)
            .map_err(|e| GatewayError::Database(format!("failed to create database file: {}", e)))?;
    }

    let mut connection = SqliteConnection::establish(db_url)
        .map_err(|e| GatewayError::Database(format!("failed to open {}: {}", db_url, e)))?;
    connection.batch_execute(SQLITE_PRAGMAS)?;
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .map_err(migration_error)?;

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Ok(Pool::builder()
        .test_on_check_out(true)
        .max_size(5)
        .connection_customizer(Box::new(SqlitePragmas))
        .build(manager)?)
}

fn init_pg_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<PgConnection>>> {
    let mut connection = PgConnection::establish(db_url)
        .map_err(|e| GatewayError::Database(format!("failed to connect to postgres: {}", e)))?;
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .map_err(migration_error)?;

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Ok(Pool::builder().max_size(10).build(manager)?)
}

pub type DbResult<T> = Result<T, GatewayError>;
