//! `POST /relay`: decode one request envelope, dispatch it in the caller's
//! session, encode one response envelope.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use bytes::Bytes;
use devrelay_core::{codec, decode_request, encode_response, ResponseEnvelope};
use tower::ServiceExt;
use tracing::{debug, warn};

use super::AppState;
use crate::network::HealthState;
use crate::service::Call;
use crate::session::{Session, SessionId, SESSION_COOKIE};

fn session_cookie(session: &Session) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session.key()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build()
}

/// Handles one RPC exchange.
///
/// Codec faults answer with an empty body: 400 when the request cannot be
/// decoded, 500 when the response cannot be encoded. Once shutdown has begun
/// new exchanges answer 503 with an empty body. Every dispatch failure is
/// captured into the response envelope and answers 200.
pub async fn relay_handler(State(state): State<AppState>, jar: CookieJar, body: Bytes) -> Response {
    let health = state.shutdown.health_state();
    if matches!(health, HealthState::Draining | HealthState::Stopped) {
        debug!(state = health.as_str(), "exchange refused during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let _in_flight = state.shutdown.in_flight_guard();

    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, len = body.len(), "request decode failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let presented = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| cookie.value().parse::<SessionId>().ok());
    let (session, created) = state.sessions.get_or_create(presented);
    session.touch();

    let call_id = state.call_ids.fetch_add(1, Ordering::Relaxed);
    let call = Call::new(call_id, Arc::clone(&session), request);
    let response = match state.pipeline.clone().oneshot(call).await {
        Ok(response) => response,
        Err(err) => {
            debug!(call_id, kind = err.kind(), error = %err, "dispatch failed");
            ResponseEnvelope::failure(err.into_failure())
        }
    };

    let encoded = match encode_response(&response) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(call_id, error = %err, "response encode failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let jar = if session.is_closed() {
        jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
    } else if created {
        jar.add(session_cookie(&session))
    } else {
        jar
    };

    (jar, [(header::CONTENT_TYPE, codec::CONTENT_TYPE)], encoded).into_response()
}
