//! JSON review and linking API over an in-memory import session.
//!
//! The upload/merge/review/commit workflow mirrors the operator's import
//! flow: each sheet upload triggers its own parse, the merge only proceeds
//! once all four sheets are present (a guard condition, not synchronization),
//! and commit is disabled while an import is in flight.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use cir_backend::{BackendApi, HttpBackend, ImportOutcome, SheetVault, DEFAULT_BATCH_SIZE};
use cir_core::{ContactRow, EstimateRow, Jobsite, JobsiteRow, LeadRow};
use cir_merge::{
    compare_with_existing, extract_valid_ids, merge_sheets, validate_references,
    ComparisonResult, ImportPipeline, LinkOverrides, MergedData, ReferenceReport, ValidIds,
};
use cir_sheets::{
    parse_contacts, parse_estimates, parse_jobsites, parse_leads, ParseOutcome, ParseStats,
    RawSheet, SheetConfig, SheetKind,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

pub const CRATE_NAME: &str = "cir-web";

#[derive(Default)]
struct ImportSession {
    contacts: Option<ParseOutcome<ContactRow>>,
    leads: Option<ParseOutcome<LeadRow>>,
    estimates: Option<ParseOutcome<EstimateRow>>,
    jobsites: Option<ParseOutcome<JobsiteRow>>,
    overrides: LinkOverrides,
    merged: Option<MergedData>,
    valid_ids: Option<ValidIds>,
    reference_report: Option<ReferenceReport>,
    comparison: Option<ComparisonResult>,
    import_in_progress: bool,
    last_outcome: Option<ImportOutcome>,
}

impl ImportSession {
    fn sheets_loaded(&self) -> bool {
        self.contacts.is_some()
            && self.leads.is_some()
            && self.estimates.is_some()
            && self.jobsites.is_some()
    }

    /// Re-run the merge from the stored parse outcomes, applying the current
    /// manual overrides. Clears any cached comparison.
    fn remerge(&mut self) -> Result<(), String> {
        let (Some(contacts), Some(leads), Some(estimates), Some(jobsites)) = (
            self.contacts.as_ref(),
            self.leads.as_ref(),
            self.estimates.as_ref(),
            self.jobsites.as_ref(),
        ) else {
            return Err("all four sheets must be uploaded before merging".to_string());
        };
        for (kind, outcome_error) in [
            (SheetKind::Contacts, &contacts.stats.error),
            (SheetKind::Leads, &leads.stats.error),
            (SheetKind::Estimates, &estimates.stats.error),
            (SheetKind::Jobsites, &jobsites.stats.error),
        ] {
            if let Some(error) = outcome_error {
                return Err(format!("{} sheet blocked the merge: {error}", kind.as_str()));
            }
        }

        let valid_ids = extract_valid_ids(
            &contacts.records,
            &leads.records,
            &estimates.records,
            &jobsites.records,
        );
        let merged = merge_sheets(
            &contacts.records,
            &leads.records,
            &estimates.records,
            &jobsites.records,
            &self.overrides,
        );
        self.reference_report = Some(validate_references(&merged, &valid_ids));
        self.merged = Some(merged);
        self.valid_ids = Some(valid_ids);
        self.comparison = None;
        Ok(())
    }
}

pub struct AppState {
    session: RwLock<ImportSession>,
    backend: Arc<dyn BackendApi>,
    vault: SheetVault,
    sheet_config: SheetConfig,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn BackendApi>,
        vault: SheetVault,
        sheet_config: SheetConfig,
    ) -> Self {
        Self {
            session: RwLock::new(ImportSession::default()),
            backend,
            vault,
            sheet_config,
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/sheets/{kind}", post(upload_sheet_handler))
        .route("/merge", post(merge_handler))
        .route("/merge/stats", get(merge_stats_handler))
        .route("/merge/warnings", get(merge_warnings_handler))
        .route("/validation", get(validation_handler))
        .route("/comparison", get(comparison_handler))
        .route("/jobsites/orphaned", get(orphaned_jobsites_handler))
        .route("/jobsites/{id}/link", post(link_jobsite_handler))
        .route("/commit", post(commit_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CIR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8700);
    let vault_dir = std::env::var("CIR_VAULT_DIR").unwrap_or_else(|_| "./vault".to_string());
    let backend: Arc<dyn BackendApi> = Arc::new(HttpBackend::from_env()?);
    let state = Arc::new(AppState::new(
        backend,
        SheetVault::new(vault_dir),
        SheetConfig::default(),
    ));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "review api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// --- handlers -----------------------------------------------------------------

#[derive(Serialize)]
struct SheetStatus {
    loaded: bool,
    stats: Option<ParseStats>,
}

#[derive(Serialize)]
struct StatusResponse {
    sheets: BTreeMap<&'static str, SheetStatus>,
    merged: bool,
    manual_overrides: usize,
    import_in_progress: bool,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.read().await;
    let mut sheets = BTreeMap::new();
    sheets.insert(
        SheetKind::Contacts.as_str(),
        SheetStatus {
            loaded: session.contacts.is_some(),
            stats: session.contacts.as_ref().map(|o| o.stats.clone()),
        },
    );
    sheets.insert(
        SheetKind::Leads.as_str(),
        SheetStatus {
            loaded: session.leads.is_some(),
            stats: session.leads.as_ref().map(|o| o.stats.clone()),
        },
    );
    sheets.insert(
        SheetKind::Estimates.as_str(),
        SheetStatus {
            loaded: session.estimates.is_some(),
            stats: session.estimates.as_ref().map(|o| o.stats.clone()),
        },
    );
    sheets.insert(
        SheetKind::Jobsites.as_str(),
        SheetStatus {
            loaded: session.jobsites.is_some(),
            stats: session.jobsites.as_ref().map(|o| o.stats.clone()),
        },
    );
    Json(StatusResponse {
        sheets,
        merged: session.merged.is_some(),
        manual_overrides: session.overrides.len(),
        import_in_progress: session.import_in_progress,
    })
    .into_response()
}

async fn upload_sheet_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    body: Bytes,
) -> Response {
    let Some(kind) = SheetKind::parse(&kind) else {
        return error_response(StatusCode::NOT_FOUND, "unknown sheet kind");
    };

    let extension = if body.starts_with(b"PK\x03\x04") { "xlsx" } else { "csv" };
    if let Err(err) = state
        .vault
        .store(kind.as_str(), Utc::now(), extension, &body)
        .await
    {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("archiving sheet: {err}"),
        );
    }

    let sheet = match RawSheet::from_bytes(&body) {
        Ok(sheet) => sheet,
        Err(err) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &format!("decoding sheet: {err}"),
            )
        }
    };

    let mut session = state.session.write().await;
    let stats = match kind {
        SheetKind::Contacts => {
            let outcome = parse_contacts(&sheet, state.sheet_config.map_for(kind));
            let stats = outcome.stats.clone();
            session.contacts = Some(outcome);
            stats
        }
        SheetKind::Leads => {
            let outcome = parse_leads(&sheet, state.sheet_config.map_for(kind));
            let stats = outcome.stats.clone();
            session.leads = Some(outcome);
            stats
        }
        SheetKind::Estimates => {
            let outcome = parse_estimates(&sheet, state.sheet_config.map_for(kind));
            let stats = outcome.stats.clone();
            session.estimates = Some(outcome);
            stats
        }
        SheetKind::Jobsites => {
            let outcome = parse_jobsites(&sheet, state.sheet_config.map_for(kind));
            let stats = outcome.stats.clone();
            session.jobsites = Some(outcome);
            stats
        }
    };

    // A new upload invalidates any previous merge output. The merge is then
    // re-attempted right away, but only proceeds once all four sheets are
    // present and none is blocked.
    session.merged = None;
    session.valid_ids = None;
    session.reference_report = None;
    session.comparison = None;
    if session.sheets_loaded() {
        let _ = session.remerge();
    }

    if let Some(error) = &stats.error {
        let message = error.clone();
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "stats": stats, "error": message })),
        )
            .into_response();
    }
    Json(serde_json::json!({ "kind": kind.as_str(), "stats": stats })).into_response()
}

async fn merge_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut session = state.session.write().await;
    if !session.sheets_loaded() {
        return error_response(
            StatusCode::CONFLICT,
            "all four sheets must be uploaded before merging",
        );
    }
    match session.remerge() {
        Ok(()) => {
            let merged = session.merged.as_ref().expect("merge just ran");
            Json(serde_json::json!({
                "stats": merged.stats,
                "orphaned_jobsites": merged.orphaned_jobsites,
                "warnings": merged.warnings,
            }))
            .into_response()
        }
        Err(message) => error_response(StatusCode::CONFLICT, &message),
    }
}

async fn merge_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.read().await;
    match &session.merged {
        Some(merged) => Json(&merged.stats).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no merge has run yet"),
    }
}

async fn merge_warnings_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.read().await;
    match &session.merged {
        Some(merged) => Json(serde_json::json!({ "warnings": merged.warnings })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no merge has run yet"),
    }
}

async fn validation_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.read().await;
    match &session.reference_report {
        Some(report) => Json(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no merge has run yet"),
    }
}

async fn comparison_handler(State(state): State<Arc<AppState>>) -> Response {
    {
        let session = state.session.read().await;
        if let Some(comparison) = &session.comparison {
            return Json(comparison).into_response();
        }
        if session.merged.is_none() {
            return error_response(StatusCode::NOT_FOUND, "no merge has run yet");
        }
    }

    let fetched = async {
        let accounts = state.backend.fetch_existing(cir_backend::Entity::Accounts).await?;
        let contacts = state.backend.fetch_existing(cir_backend::Entity::Contacts).await?;
        let estimates = state.backend.fetch_existing(cir_backend::Entity::Estimates).await?;
        let jobsites = state.backend.fetch_existing(cir_backend::Entity::Jobsites).await?;
        Ok::<_, cir_backend::BackendError>((accounts, contacts, estimates, jobsites))
    }
    .await;

    let (accounts, contacts, estimates, jobsites) = match fetched {
        Ok(data) => data,
        Err(err) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("fetching existing data: {err}"),
            )
        }
    };

    let mut session = state.session.write().await;
    let (Some(merged), Some(valid_ids)) = (&session.merged, &session.valid_ids) else {
        return error_response(StatusCode::NOT_FOUND, "no merge has run yet");
    };
    let comparison = compare_with_existing(
        merged, &accounts, &contacts, &estimates, &jobsites, valid_ids,
    );
    session.comparison = Some(comparison);
    Json(session.comparison.as_ref().expect("just cached")).into_response()
}

async fn orphaned_jobsites_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.read().await;
    match &session.merged {
        Some(merged) => {
            let orphans: Vec<&Jobsite> = merged
                .jobsites
                .iter()
                .filter(|site| merged.orphaned_jobsites.contains(&site.external_id))
                .collect();
            Json(orphans).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "no merge has run yet"),
    }
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    #[serde(default)]
    account_id: Option<String>,
    /// Drop the manual override and restore the automatic cascade result.
    #[serde(default)]
    reset: bool,
}

async fn link_jobsite_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(jobsite_id): AxumPath<String>,
    Json(request): Json<LinkRequest>,
) -> Response {
    let mut session = state.session.write().await;
    let Some(merged) = &session.merged else {
        return error_response(StatusCode::NOT_FOUND, "no merge has run yet");
    };
    if !merged.jobsites.iter().any(|j| j.external_id == jobsite_id) {
        return error_response(StatusCode::NOT_FOUND, "unknown jobsite id");
    }
    if let Some(account_id) = &request.account_id {
        let known = merged.accounts.iter().any(|a| &a.external_id == account_id);
        if !known {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "unknown account id");
        }
    }

    if request.reset {
        session.overrides.reset(&jobsite_id);
    } else {
        session
            .overrides
            .set(jobsite_id.as_str(), request.account_id.clone());
    }
    if let Err(message) = session.remerge() {
        return error_response(StatusCode::CONFLICT, &message);
    }

    let merged = session.merged.as_ref().expect("merge just ran");
    Json(serde_json::json!({
        "jobsite_linking": merged.stats.jobsite_linking,
        "orphaned_jobsites": merged.orphaned_jobsites,
    }))
    .into_response()
}

async fn commit_handler(State(state): State<Arc<AppState>>) -> Response {
    let batches = {
        let mut session = state.session.write().await;
        if session.import_in_progress {
            return error_response(StatusCode::CONFLICT, "an import is already in progress");
        }
        let (Some(merged), Some(valid_ids)) = (&session.merged, &session.valid_ids) else {
            return error_response(StatusCode::CONFLICT, "no merge to commit");
        };
        let batches = ImportPipeline::upload_batches(merged, valid_ids);
        session.import_in_progress = true;
        batches
    };

    let outcome = cir_backend::push_import(state.backend.as_ref(), &batches, DEFAULT_BATCH_SIZE).await;
    info!(
        errors = outcome.errors.len(),
        "import commit finished"
    );

    let mut session = state.session.write().await;
    session.import_in_progress = false;
    session.last_outcome = Some(outcome);
    Json(session.last_outcome.as_ref().expect("just stored")).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
