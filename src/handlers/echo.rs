//! `POST /echo` - strict JSON in, pretty JSON out.
//!
//! The body must be `application/json` and contain exactly one `message`
//! field; anything else is answered with 415 or 400 by [`StrictJson`].

use axum::extract::State;

use crate::context::RequestContext;
use crate::json::{PrettyJson, StrictJson};
use crate::logging::Field;
use crate::models::{EchoRequest, EchoResponse};
use crate::state::AppState;

pub async fn echo(
    State(state): State<AppState>,
    cx: RequestContext,
    StrictJson(request): StrictJson<EchoRequest>,
) -> PrettyJson<EchoResponse> {
    state.logger.info(
        &cx,
        "Echo received",
        vec![Field::new("length", request.message.len())],
    );

    PrettyJson(EchoResponse {
        message: request.message,
        request_id: cx.request_id().map(|id| id.to_string()),
    })
}
