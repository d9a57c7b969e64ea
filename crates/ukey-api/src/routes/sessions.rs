//! Admin session listing — the audit view over authentication attempts.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;
use ukey_common::error::{ApiResponse, UkeyError, UkeyResult};
use ukey_common::models::auth_session::{AuthSession, AuthStatus};
use ukey_db::repository::auth_sessions;

use super::Pagination;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/admin/sessions", get(list_sessions))
}

#[derive(Debug, Deserialize)]
struct SessionFilter {
    status: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SessionFilter>,
) -> UkeyResult<Json<ApiResponse<Vec<AuthSession>>>> {
    let status = match &filter.status {
        Some(raw) => Some(AuthStatus::from_str(raw).ok_or_else(|| UkeyError::Validation {
            message: format!("unknown status '{raw}'"),
        })?),
        None => None,
    };

    let (limit, offset) =
        Pagination { page: filter.page, page_size: filter.page_size }.limits();
    let items = auth_sessions::list_sessions(&state.db.pool, status, limit, offset).await?;
    let total = auth_sessions::count_sessions(&state.db.pool, status).await?;
    Ok(Json(ApiResponse::list(items, total)))
}
