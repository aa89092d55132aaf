//! User registration (/auth)

use axum::{Json, Router, extract::State, routing::post};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;
use crate::models::UserAccount;
use crate::services::error::AppError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth", post(register))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    message: &'static str,
    user_id: String,
    credits: i64,
}

/// POST /auth - Register a user on first sign-in; repeat calls are no-ops
async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let (Some(name), Some(email)) = (
        req.name.filter(|v| !v.trim().is_empty()),
        req.email.filter(|v| !v.trim().is_empty()),
    ) else {
        return Err(AppError::Validation("Missing 'name' or 'email'".to_string()));
    };

    let candidate = UserAccount {
        user_id: Uuid::new_v4().to_string(),
        email: email.trim().to_string(),
        name: name.trim().to_string(),
        credits: state.starting_credits,
    };

    let (user, created) = state.metadata.register_user(candidate).await?;
    if created {
        tracing::info!(email = %user.email, user_id = %user.user_id, "user registered");
    }

    Ok(Json(RegisterResponse {
        message: if created {
            "User saved"
        } else {
            "user already exists"
        },
        user_id: user.user_id,
        credits: user.credits,
    }))
}
