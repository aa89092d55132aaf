//! User domain - DB queries for accounts and credit balances
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use sqlx::{Executor, Postgres};

use crate::models::UserAccount;

pub async fn get_user_by_email<'e, E>(
    executor: E,
    email: &str,
) -> Result<Option<UserAccount>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as("SELECT user_id, email, name, credits FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(executor)
        .await
}

/// Insert a user unless the email is already registered.
/// Returns None when a row for the email already existed.
pub async fn insert_user_if_absent<'e, E>(
    executor: E,
    user: &UserAccount,
) -> Result<Option<UserAccount>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        INSERT INTO users (email, user_id, name, credits)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO NOTHING
        RETURNING user_id, email, name, credits
        "#,
    )
    .bind(&user.email)
    .bind(&user.user_id)
    .bind(&user.name)
    .bind(user.credits)
    .fetch_optional(executor)
    .await
}

/// Atomically take one credit, never going below zero.
/// Returns the new balance, or None if the user does not exist.
pub async fn decrement_credits<'e, E>(executor: E, email: &str) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE users
        SET credits = GREATEST(credits - 1, 0)
        WHERE email = $1
        RETURNING credits
        "#,
    )
    .bind(email)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(credits,)| credits))
}
