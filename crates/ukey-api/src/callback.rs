//! Callback dispatcher — signed completion notifications to the caller.
//!
//! Deliveries run in their own task and never feed back into session state.
//! Retry schedule: up to three attempts, waiting 5s then 10s then 30s
//! before each retry.

use std::time::Duration;

use chrono::Utc;
use ukey_common::callback::{self as sig, CallbackRequest, STATUS_FAILED, STATUS_SUCCESS};
use ukey_common::models::auth_session::{AuthResult, AuthSession, AuthStatus};

/// Per-attempt HTTP timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Waits before each retry.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];
/// Total delivery attempts.
const MAX_ATTEMPTS: usize = 3;

/// Build the signed body and deliver it in a background task.
pub fn spawn_delivery(session: AuthSession, username: String, signing_secret: String) {
    let Some(url) = session.callback_url.clone() else {
        return;
    };

    let mut body = CallbackRequest {
        session_id: session.id.to_string(),
        username,
        status: callback_status(&session),
        challenge: session.challenge.clone(),
        action: session.action.clone(),
        device_id: session
            .responding_device_id
            .map(|d| d.to_string())
            .unwrap_or_default(),
        timestamp: Utc::now().timestamp(),
        signature: String::new(),
    };
    body.signature = sig::generate_signature(&body, &signing_secret);

    tokio::spawn(async move {
        let delivered = deliver_with_retries(&url, &body, &RETRY_DELAYS, MAX_ATTEMPTS).await;
        if !delivered {
            tracing::error!(session_id = %body.session_id, url = %url,
                "callback_failed: exhausted all delivery attempts");
        }
    });
}

fn callback_status(session: &AuthSession) -> String {
    if session.status == AuthStatus::Completed && session.result == Some(AuthResult::Success) {
        STATUS_SUCCESS.into()
    } else {
        STATUS_FAILED.into()
    }
}

/// POST the body until a 2xx lands or the attempt budget is spent. The
/// delays slice is injected so tests don't wait wall-clock seconds.
pub async fn deliver_with_retries(
    url: &str,
    body: &CallbackRequest,
    delays: &[Duration],
    max_attempts: usize,
) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .user_agent("EasyUKey-Callback/1.0")
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build callback HTTP client");
            return false;
        }
    };

    for attempt in 0..max_attempts {
        match client.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(session_id = %body.session_id, attempt = attempt + 1,
                    "Callback delivered");
                return true;
            }
            Ok(resp) => {
                tracing::warn!(session_id = %body.session_id, attempt = attempt + 1,
                    status = %resp.status(), "Callback rejected");
            }
            Err(e) => {
                tracing::warn!(session_id = %body.session_id, attempt = attempt + 1,
                    error = %e, "Callback request failed");
            }
        }

        if attempt + 1 < max_attempts {
            if let Some(delay) = delays.get(attempt) {
                tokio::time::sleep(*delay).await;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, extract::State, routing::post};

    async fn flaky_endpoint(
        State(state): State<Arc<(AtomicUsize, usize)>>,
        axum::Json(body): axum::Json<CallbackRequest>,
    ) -> axum::http::StatusCode {
        assert!(!body.signature.is_empty());
        let n = state.0.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= state.1 {
            axum::http::StatusCode::OK
        } else {
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    /// Serve a callback sink that fails until `succeed_on` attempts, and
    /// return (url, hit counter).
    async fn serve_flaky(succeed_on: usize) -> (String, Arc<(AtomicUsize, usize)>) {
        let state = Arc::new((AtomicUsize::new(0), succeed_on));
        let app = Router::new()
            .route("/cb", post(flaky_endpoint))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/cb"), state)
    }

    fn body() -> CallbackRequest {
        let mut body = CallbackRequest {
            session_id: uuid::Uuid::new_v4().to_string(),
            username: "alice".into(),
            status: STATUS_SUCCESS.into(),
            challenge: "C0FFEE".into(),
            action: "pay".into(),
            device_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
            signature: String::new(),
        };
        body.signature = sig::generate_signature(&body, "secret");
        body
    }

    const FAST: [Duration; 3] = [
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(10),
    ];

    #[tokio::test]
    async fn delivers_on_first_success() {
        let (url, hits) = serve_flaky(1).await;
        assert!(deliver_with_retries(&url, &body(), &FAST, 3).await);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_on_third_attempt() {
        let (url, hits) = serve_flaky(3).await;
        assert!(deliver_with_retries(&url, &body(), &FAST, 3).await);
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let (url, hits) = serve_flaky(10).await;
        assert!(!deliver_with_retries(&url, &body(), &FAST, 3).await);
        assert_eq!(hits.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_refused_counts_as_an_attempt() {
        // Nothing listens on this port.
        assert!(!deliver_with_retries("http://127.0.0.1:1/cb", &body(), &FAST, 2).await);
    }
}
