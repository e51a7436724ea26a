//! `GET /relay` operational page and `GET /metrics`.

use std::fmt::Write as _;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use sysinfo::System;

use super::AppState;
use crate::telemetry::UsageSnapshot;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

impl MemoryReport {
    fn sample() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            total: system.total_memory(),
            free: system.free_memory(),
            used: system.used_memory(),
        }
    }
}

/// Renders the page body. Every table is sorted by key.
#[must_use]
pub fn render_diagnostics(
    uptime_secs: u64,
    sessions: usize,
    usage: &UsageSnapshot,
    memory: MemoryReport,
) -> String {
    let mut page = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(page, "RELAY RUNNING : uptime {uptime_secs}s");
    let _ = writeln!(page, "Sessions : {sessions}");
    let _ = writeln!(page);

    for (action, access, removals) in usage.access_rows() {
        let _ = writeln!(page, "{action}:{access}:{removals}");
    }
    let _ = writeln!(page, "Total Memory : {}", memory.total);
    let _ = writeln!(page, "Free Memory : {}", memory.free);
    let _ = writeln!(page, "Used Memory : {}", memory.used);
    let _ = writeln!(page);

    let _ = writeln!(page, "Classes uses :");
    for (action, uses) in &usage.uses {
        let creations = usage.creations.get(action).copied().unwrap_or(0);
        let _ = writeln!(page, "{action}:{creations}:{uses}");
    }
    let _ = writeln!(page);

    let _ = writeln!(page, "Method uses :");
    for (method, count) in &usage.methods {
        let _ = writeln!(page, "{method}:{count}");
    }
    page
}

pub async fn diagnostics_handler(State(state): State<AppState>) -> Response {
    let page = render_diagnostics(
        state.start_time.elapsed().as_secs(),
        state.sessions.count(),
        &state.telemetry.snapshot(),
        MemoryReport::sample(),
    );
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], page).into_response()
}

/// Prometheus text exposition, or 404 when no recorder is installed.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => ([(header::CONTENT_TYPE, TEXT_PLAIN)], handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
