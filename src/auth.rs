use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Superadmin,
    DepartmentAdmin,
    Evaluator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::DepartmentAdmin => "department_admin",
            Role::Evaluator => "evaluator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "superadmin" => Some(Role::Superadmin),
            "department_admin" => Some(Role::DepartmentAdmin),
            "evaluator" => Some(Role::Evaluator),
            _ => None,
        }
    }
}

/// Cost 10 matches the `$2a$10$` rows bcryptjs already wrote to the users table.
const BCRYPT_COST: u32 = 10;

pub fn hash_password(password: &str) -> bcrypt::BcryptResult<String> {
    bcrypt::hash(password, BCRYPT_COST)
}

/// Malformed or non-bcrypt stored values never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

/// `password_hash` comes from [`hash_password`]; hashing stays outside the
/// caller's transaction.
pub fn create_user(
    conn: &Connection,
    name: &str,
    email: &str,
    password_hash: &str,
    role: Role,
) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, email, name, password_hash, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            email,
            name,
            password_hash,
            role.as_str(),
            crate::db::now_rfc3339(),
        ),
    )?;
    Ok(id)
}

pub fn email_taken(conn: &Connection, email: &str, except_user: Option<&str>) -> rusqlite::Result<bool> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE lower(email) = lower(?)",
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match (owner, except_user) {
        (None, _) => false,
        (Some(o), Some(me)) => o != me,
        (Some(_), None) => true,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub department_id: Option<String>,
    pub evaluator_id: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Credential check only. `Ok(None)` for an unknown email or a wrong password.
pub fn authenticate(
    conn: &Connection,
    email: &str,
    password: &str,
) -> anyhow::Result<Option<AuthenticatedUser>> {
    let row: Option<(String, String, String, String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, email, name, password_hash, role, created_at, updated_at
             FROM users
             WHERE lower(email) = lower(?)",
            [email.trim()],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .context("failed to look up user")?;
    let Some((id, email, name, hash, role_raw, created_at, updated_at)) = row else {
        return Ok(None);
    };
    if !verify_password(password, &hash) {
        return Ok(None);
    }
    let role = Role::parse(&role_raw)
        .with_context(|| format!("user {} has unknown role {}", id, role_raw))?;

    let (department_id, evaluator_id) = match role {
        Role::Superadmin => (None, None),
        Role::DepartmentAdmin => {
            let dept: Option<String> = conn
                .query_row(
                    "SELECT department_id FROM department_admins WHERE user_id = ?",
                    [&id],
                    |r| r.get(0),
                )
                .optional()?;
            (dept, None)
        }
        Role::Evaluator => {
            let ev: Option<(String, String)> = conn
                .query_row(
                    "SELECT id, department_id FROM evaluators WHERE user_id = ?",
                    [&id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            match ev {
                Some((ev_id, dept)) => (Some(dept), Some(ev_id)),
                None => (None, None),
            }
        }
    };

    Ok(Some(AuthenticatedUser {
        id,
        email,
        name,
        role,
        department_id,
        evaluator_id,
        created_at,
        updated_at,
    }))
}
