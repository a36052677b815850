use tempfile::TempDir;

use super::attachment::FileAttachment;
use super::department::Department;
use super::project::Project;
use super::user::AppUser;
use super::DbPool;
use crate::schema::enum_def::UserRole;
use crate::utils::{now_millis, ID_GENERATOR};

/// SQLite database in a temporary directory, removed on drop.
pub struct TestDb {
    pub pool: DbPool,
    _dir: TempDir,
}

pub fn test_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");
    let pool = DbPool::establish(path.to_str().unwrap()).unwrap();
    TestDb { pool, _dir: dir }
}

pub fn seed_department(
    pool: &DbPool,
    monthly_budget: i64,
    used_cost: i64,
    request_limit: Option<i64>,
) -> Department {
    insert_department(pool, monthly_budget, used_cost, request_limit, None, true)
}

pub fn seed_token_limited_department(pool: &DbPool, monthly_budget: i64, token_limit: i64) -> Department {
    insert_department(pool, monthly_budget, 0, None, Some(token_limit), true)
}

pub fn seed_unenforced_department(pool: &DbPool, monthly_budget: i64) -> Department {
    insert_department(pool, monthly_budget, 0, None, None, false)
}

fn insert_department(
    pool: &DbPool,
    monthly_budget: i64,
    used_cost: i64,
    request_limit: Option<i64>,
    token_limit: Option<i64>,
    enforce_quota: bool,
) -> Department {
    let now = now_millis();
    let data = Department {
        id: ID_GENERATOR.generate_id(),
        name: "research".to_string(),
        monthly_budget,
        used_cost,
        reserved_cost: 0,
        request_limit,
        request_count: 0,
        reserved_requests: 0,
        token_limit,
        token_count: 0,
        reserved_tokens: 0,
        enforce_quota,
        created_at: now,
        updated_at: now,
    };
    Department::insert(&mut pool.get_connection().unwrap(), &data).unwrap()
}

pub fn seed_user(pool: &DbPool, department_id: Option<i64>) -> AppUser {
    let data = AppUser {
        id: ID_GENERATOR.generate_id(),
        username: format!("user-{}", ID_GENERATOR.generate_id()),
        department_id,
        role: UserRole::Member,
        is_active: true,
        created_at: now_millis(),
    };
    AppUser::insert(&mut pool.get_connection().unwrap(), &data).unwrap()
}

pub fn seed_inactive_user(pool: &DbPool, department_id: i64) -> AppUser {
    let data = AppUser {
        id: ID_GENERATOR.generate_id(),
        username: format!("user-{}", ID_GENERATOR.generate_id()),
        department_id: Some(department_id),
        role: UserRole::Member,
        is_active: false,
        created_at: now_millis(),
    };
    AppUser::insert(&mut pool.get_connection().unwrap(), &data).unwrap()
}

pub fn seed_attachment(pool: &DbPool, user_id: i64, filename: &str, text: &str) -> FileAttachment {
    let data = FileAttachment {
        id: ID_GENERATOR.generate_id(),
        user_id,
        filename: filename.to_string(),
        extracted_text: Some(text.to_string()),
        created_at: now_millis(),
    };
    FileAttachment::insert(&mut pool.get_connection().unwrap(), &data).unwrap()
}

pub fn seed_project(pool: &DbPool, user_id: i64, system_prompt: &str) -> Project {
    let data = Project {
        id: ID_GENERATOR.generate_id(),
        user_id,
        name: "handbook".to_string(),
        system_prompt: Some(system_prompt.to_string()),
        created_at: now_millis(),
    };
    Project::insert(&mut pool.get_connection().unwrap(), &data).unwrap()
}
