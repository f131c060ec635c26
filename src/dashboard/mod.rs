// src/dashboard/mod.rs
//! Read-only HTTP view over the store.
//!
//! Requests share one snapshot of the newest rows; it is reloaded once it is older
//! than the configured TTL, so pages may lag the store by up to that long.

mod page;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};
use crate::metrics::Metrics;
use crate::status::{self, StatusReport};
use crate::store::{ColorToken, Signal, Store};

const DEFAULT_API_LIMIT: usize = 100;

/// Rows and aggregates read in one go.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<Signal>,
    pub sources: Vec<String>,
    pub status: StatusReport,
    pub loaded_at_rfc3339: String,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            sources: Vec::new(),
            status: StatusReport::default(),
            loaded_at_rfc3339: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Read the newest `row_limit` rows. A missing file or table is an empty snapshot.
pub fn load_snapshot(db_path: &Path, row_limit: usize) -> Result<Snapshot> {
    let Some(store) = Store::open_read_only(db_path)? else {
        return Ok(Snapshot::empty());
    };
    if !store.has_signals_table()? {
        return Ok(Snapshot::empty());
    }
    let rows = store.recent(row_limit)?;
    let sources: BTreeSet<String> = rows
        .iter()
        .filter_map(|r| r.source.clone())
        .filter(|s| !s.is_empty())
        .collect();
    Ok(Snapshot {
        status: status::report_from(&store, 10, 20)?,
        sources: sources.into_iter().collect(),
        rows,
        loaded_at_rfc3339: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub db_path: PathBuf,
    pub cache_ttl: Duration,
    pub row_limit: usize,
}

impl DashboardSettings {
    pub fn from_config(cfg: &AtlasConfig) -> Self {
        Self {
            db_path: cfg.store.path.clone(),
            cache_ttl: Duration::from_secs(cfg.dashboard.cache_ttl_secs),
            row_limit: cfg.dashboard.row_limit,
        }
    }
}

struct Cached {
    at: Instant,
    snap: Arc<Snapshot>,
}

#[derive(Clone)]
pub struct AppState {
    settings: Arc<DashboardSettings>,
    cache: Arc<RwLock<Option<Cached>>>,
}

impl AppState {
    pub fn new(settings: DashboardSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    fn cached(&self) -> Option<Arc<Snapshot>> {
        let guard = match self.cache.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        guard
            .as_ref()
            .filter(|c| c.at.elapsed() < self.settings.cache_ttl)
            .map(|c| Arc::clone(&c.snap))
    }

    /// Current snapshot and whether it came from the cache.
    pub async fn snapshot(&self) -> Result<(Arc<Snapshot>, bool)> {
        if let Some(s) = self.cached() {
            return Ok((s, true));
        }
        let db = self.settings.db_path.clone();
        let limit = self.settings.row_limit;
        let snap = tokio::task::spawn_blocking(move || load_snapshot(&db, limit))
            .await
            .map_err(|e| AtlasError::Io(std::io::Error::other(e)))??;
        let snap = Arc::new(snap);
        tracing::debug!(target: "dashboard", rows = snap.rows.len(), "snapshot reloaded");

        let mut guard = match self.cache.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        *guard = Some(Cached {
            at: Instant::now(),
            snap: Arc::clone(&snap),
        });
        Ok((snap, false))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalQuery {
    pub limit: Option<usize>,
    pub source: Option<String>,
    pub color: Option<String>,
    pub q: Option<String>,
}

/// Apply source/color/text filters. Empty filter values are ignored; an
/// unrecognised color matches nothing.
pub fn filter_rows<'a>(rows: &'a [Signal], q: &SignalQuery) -> Vec<&'a Signal> {
    let source = q.source.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let color = q.color.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let wanted = color.map(ColorToken::parse);
    let needle = q
        .q
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    rows.iter()
        .filter(|r| source.map_or(true, |s| r.source.as_deref() == Some(s)))
        .filter(|r| match wanted {
            None => true,
            Some(None) => false,
            Some(Some(c)) => r.color_token() == Some(c),
        })
        .filter(|r| {
            needle.as_deref().map_or(true, |n| {
                [&r.title, &r.text, &r.summary, &r.url]
                    .into_iter()
                    .filter_map(|v| v.as_deref())
                    .any(|v| v.to_lowercase().contains(n))
            })
        })
        .collect()
}

pub struct ApiError(AtlasError);

impl From<AtlasError> for ApiError {
    fn from(e: AtlasError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_store_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        tracing::warn!(target: "dashboard", error = %self.0, "request failed");
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "OK" }))
        .route("/api/signals", get(api_signals))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Dashboard routes plus `/metrics` when a recorder is installed.
pub fn router_with_metrics(state: AppState, metrics: Option<&Metrics>) -> Router {
    let app = router(state);
    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

async fn index(
    State(state): State<AppState>,
    Query(q): Query<SignalQuery>,
) -> std::result::Result<Html<String>, ApiError> {
    let (snap, _) = state.snapshot().await?;
    let rows = filter_rows(&snap.rows, &q);
    Ok(Html(page::render(&snap, &q, &rows)))
}

async fn api_signals(
    State(state): State<AppState>,
    Query(q): Query<SignalQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let (snap, hit) = state.snapshot().await?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_API_LIMIT)
        .min(state.settings.row_limit);
    let rows: Vec<&Signal> = filter_rows(&snap.rows, &q).into_iter().take(limit).collect();
    let body = serde_json::json!({
        "loaded_at": snap.loaded_at_rfc3339,
        "count": rows.len(),
        "rows": rows,
    });
    Ok(([("x-atlas-cache", if hit { "HIT" } else { "MISS" })], Json(body)))
}

async fn api_status(
    State(state): State<AppState>,
) -> std::result::Result<Json<StatusReport>, ApiError> {
    let (snap, _) = state.snapshot().await?;
    Ok(Json(snap.status.clone()))
}

/// Bind and serve until Ctrl-C or SIGTERM.
pub async fn serve(cfg: &AtlasConfig, port: u16) -> anyhow::Result<()> {
    use anyhow::Context;

    let metrics = match Metrics::init(cfg.dashboard.cache_ttl_secs) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(target: "dashboard", error = %e, "metrics recorder not installed");
            None
        }
    };
    let app = router_with_metrics(
        AppState::new(DashboardSettings::from_config(cfg)),
        metrics.as_ref(),
    );

    let addr = format!("{}:{port}", cfg.dashboard.bind);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(target: "dashboard", %addr, db = %cfg.store.path.display(), "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("dashboard server")?;
    tracing::info!(target: "dashboard", "dashboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
}
