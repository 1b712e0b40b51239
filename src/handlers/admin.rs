//! Admin endpoints, mounted under `/admin` behind the admin guard.
//!
//! - `GET /admin/limiter` - Rate limiter snapshot

use axum::extract::State;
use tracing::instrument;

use crate::json::JsonResponse;
use crate::models::LimiterStatus;
use crate::state::AppState;

/// Report the limiter's parameters and how many client keys it tracks.
///
/// # Response Body
///
/// ```json
/// { "enabled": true, "keys": 17, "rate": 10.0, "burst": 20 }
/// ```
#[instrument(skip(state))]
pub async fn limiter_status(State(state): State<AppState>) -> JsonResponse<LimiterStatus> {
    let status = match &state.limiter {
        Some(registry) => LimiterStatus {
            enabled: true,
            keys: registry.len(),
            rate: registry.rate(),
            burst: registry.burst(),
        },
        None => LimiterStatus::disabled(),
    };
    JsonResponse(status)
}
