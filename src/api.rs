use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Status},
    error::{ErrorKind, ReviewError},
    keyboard::KeyEvent,
    models::{Dataset, Decision, Permissions, ReviewMode},
    review::{Advance, KeyOutcome, KeyResponse, ReviewSession, SessionView},
};

type ApiError = (StatusCode, Json<Value>);

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct StartReviewPayload {
    dataset: String,
    /// `"random"` o el id de una entidad concreta.
    what: String,
}

#[derive(Deserialize)]
pub struct FilterPayload {
    text: String,
}

/// Corrección de la copia local de la entidad. Los campos ausentes no cambian.
#[derive(Deserialize)]
pub struct EditEntityPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct DecisionPayload {
    decision: Decision,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    advance: Advance,
    view: SessionView,
}

#[derive(Serialize)]
pub struct KeyPressResponse {
    #[serde(flatten)]
    response: KeyResponse,
    view: SessionView,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/review", post(start_review_handler))
        .route(
            "/api/review/:session_id",
            get(view_handler).delete(close_handler),
        )
        .route("/api/review/:session_id/load", post(load_handler))
        .route("/api/review/:session_id/filter", post(filter_handler))
        .route("/api/review/:session_id/entity", post(edit_entity_handler))
        .route("/api/review/:session_id/decision", post(decision_handler))
        .route("/api/review/:session_id/submit", post(submit_handler))
        .route("/api/review/:session_id/key", post(key_handler))
        .route("/api/datasets/:name", get(dataset_handler))
        .route("/api/authz", delete(authz_teardown_handler))
        .route("/api/authz/:dataset", get(authz_handler))
        .route("/api/status", get(status_handler))
        .route("/api/upstream", get(upstream_info_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Errores ---

fn review_error(err: ReviewError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
    };
    if status == StatusCode::BAD_GATEWAY {
        error!("Error con la API de nomenklatura: {}", err);
    }
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "errors": err.field_errors(),
        })),
    )
}

fn unknown_session(id: &Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("No existe la sesión de revisión {id}."), "kind": ErrorKind::NotFound})),
    )
}

fn find_session(state: &AppState, id: &Uuid) -> Result<std::sync::Arc<ReviewSession>, ApiError> {
    state.session(id).ok_or_else(|| unknown_session(id))
}

fn count_review(state: &AppState) {
    state.status().reviewed_total += 1;
}

// --- Handlers de Revisión ---

#[axum::debug_handler]
async fn start_review_handler(
    State(state): State<AppState>,
    Json(payload): Json<StartReviewPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.dataset.trim().is_empty() || payload.what.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Debe indicar el dataset y qué entidad revisar."})),
        ));
    }

    state
        .authz
        .require_edit(&payload.dataset)
        .await
        .map_err(review_error)?;

    let session = ReviewSession::new(
        state.backend.clone(),
        &payload.dataset,
        ReviewMode::from_route(&payload.what),
        state.config.review.clone(),
    );
    info!(
        "Nueva sesión de revisión {} sobre {} ({:?})",
        session.id(),
        payload.dataset,
        session.mode()
    );
    session.load_dataset_context().await;
    state.register(session.clone());

    match session.load_entity().await {
        Ok(()) => {
            // Con la cola vacía la vista recibe la navegación y la sesión termina.
            let view = session.view();
            state.retire_if_finished(&session);
            Ok((StatusCode::CREATED, Json(view)))
        }
        Err(err @ ReviewError::NotFound(_)) => {
            state.remove(&session.id());
            Err(review_error(err))
        }
        Err(err) => {
            // La sesión sigue viva: el frontend puede reintentar con /load.
            let (status, Json(mut body)) = review_error(err);
            body["session_id"] = json!(session.id());
            Err((status, Json(body)))
        }
    }
}

#[axum::debug_handler]
async fn view_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(find_session(&state, &session_id)?.view()))
}

#[axum::debug_handler]
async fn load_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let session = find_session(&state, &session_id)?;
    session.load_entity().await.map_err(review_error)?;
    let view = session.view();
    state.retire_if_finished(&session);
    Ok(Json(view))
}

#[axum::debug_handler]
async fn filter_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<FilterPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let session = find_session(&state, &session_id)?;
    session.change_filter(&payload.text).map_err(review_error)?;
    Ok((StatusCode::ACCEPTED, Json(session.view())))
}

#[axum::debug_handler]
async fn edit_entity_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<EditEntityPayload>,
) -> Result<Json<SessionView>, ApiError> {
    let session = find_session(&state, &session_id)?;
    session
        .edit_entity(payload.name.as_deref(), payload.attributes)
        .map_err(review_error)?;
    Ok(Json(session.view()))
}

#[axum::debug_handler]
async fn decision_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<DecisionPayload>,
) -> Result<Json<SessionView>, ApiError> {
    let session = find_session(&state, &session_id)?;
    session
        .select_decision(payload.decision)
        .map_err(review_error)?;
    Ok(Json(session.view()))
}

#[axum::debug_handler]
async fn submit_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let session = find_session(&state, &session_id)?;
    let advance = session.submit_and_advance().await.map_err(review_error)?;
    count_review(&state);
    let view = session.view();
    state.retire_if_finished(&session);
    Ok(Json(SubmitResponse { advance, view }))
}

#[axum::debug_handler]
async fn key_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(event): Json<KeyEvent>,
) -> Result<Json<KeyPressResponse>, ApiError> {
    let session = find_session(&state, &session_id)?;
    let response = session.handle_key(&event).await.map_err(review_error)?;

    match &response.outcome {
        KeyOutcome::Submitted(_) => count_review(&state),
        KeyOutcome::OpenUrl(url) if state.config.open_browser => {
            if webbrowser::open(url).is_err() {
                warn!("No se pudo abrir el navegador para {}", url);
            }
        }
        _ => {}
    }

    let view = session.view();
    state.retire_if_finished(&session);
    Ok(Json(KeyPressResponse { response, view }))
}

#[axum::debug_handler]
async fn close_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .remove(&session_id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| unknown_session(&session_id))
}

// --- Contexto: datasets y permisos ---

#[axum::debug_handler]
async fn dataset_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Dataset>, ApiError> {
    state
        .backend
        .dataset(&name)
        .await
        .map(Json)
        .map_err(review_error)
}

#[axum::debug_handler]
async fn authz_handler(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> Result<Json<Permissions>, ApiError> {
    state
        .authz
        .permissions(&dataset)
        .await
        .map(Json)
        .map_err(review_error)
}

#[axum::debug_handler]
async fn authz_teardown_handler(State(state): State<AppState>) -> StatusCode {
    state.authz.teardown().await;
    StatusCode::NO_CONTENT
}

// --- Estado, salud y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    let active_sessions = state.sessions().len();
    let authz_datasets = state.authz.cached_datasets().await;
    let mut status = state.status().clone();
    status.active_sessions = active_sessions;
    status.authz_datasets = authz_datasets;
    Json(status)
}

#[axum::debug_handler]
async fn upstream_info_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    match state.backend.session().await {
        Ok(session) => Ok(Json(json!({
            "status": "ok",
            "api_url": state.config.api_url.to_string(),
            "logged_in": session.logged_in,
            "account": session.account,
        }))),
        Err(e) => {
            error!("Error en el health check de la API de nomenklatura: {}", e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    state.teardown().await;
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::error::FieldErrors;
    use crate::review::tests::{candidate, entity, FakeBackend};
    use std::sync::Arc;

    async fn spawn_app(backend: Arc<FakeBackend>) -> (String, AppState) {
        let config = AppConfig::for_tests("http://nomenklatura.test");
        let state = AppState::new(config, backend, None);
        let app = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn acme_backend() -> Arc<FakeBackend> {
        let backend = Arc::new(FakeBackend::default());
        backend.add_entity(entity(42, "Acme Corp"));
        backend.set_matches(vec![
            candidate(100, "ACME Corporation", 92.0),
            candidate(101, "Acme Corp.", 88.0),
            candidate(102, "Acme Holdings", 61.0),
        ]);
        backend
    }

    async fn start(base: &str, what: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{base}/api/review"))
            .json(&json!({"dataset": "companies", "what": what}))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn review_session_round_trip_over_http() {
        let backend = acme_backend();
        let (base, state) = spawn_app(backend.clone()).await;

        let created = start(&base, "42").await;
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        let view: Value = created.json().await.unwrap();
        assert_eq!(view["phase"], json!("ready"));
        assert_eq!(view["candidates"].as_array().unwrap().len(), 3);
        let id = view["session_id"].as_str().unwrap().to_string();

        let pressed: Value = reqwest::Client::new()
            .post(format!("{base}/api/review/{id}/key"))
            .json(&json!({"key": "2"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(pressed["command"], json!("select_candidate"));
        assert_eq!(pressed["value"], json!(1));
        assert_eq!(pressed["outcome"], json!("submitted"));
        assert_eq!(pressed["detail"]["path"], json!("/entities/42"));
        assert_eq!(pressed["view"]["phase"], json!("completed"));

        assert_eq!(backend.updates()[0].canonical.as_ref().map(|c| c.id), Some(101));
        assert_eq!(state.status().reviewed_total, 1);
        // Guardada la entidad concreta, la sesión deja de existir.
        assert!(state.sessions().is_empty());
    }

    #[tokio::test]
    async fn validation_errors_come_back_per_field() {
        let backend = acme_backend();
        let (base, _) = spawn_app(backend.clone()).await;
        let view: Value = start(&base, "42").await.json().await.unwrap();
        let id = view["session_id"].as_str().unwrap().to_string();

        let mut fields = FieldErrors::new();
        fields.insert("name".into(), "Entity already exists.".into());
        backend.fail_next_update(ReviewError::Validation(fields));

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/api/review/{id}/submit"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], json!("validation"));
        assert_eq!(body["errors"]["name"], json!("Entity already exists."));

        let view: Value = reqwest::get(format!("{base}/api/review/{id}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["phase"], json!("ready"));

        let edited: Value = client
            .post(format!("{base}/api/review/{id}/entity"))
            .json(&json!({"name": "Acme Corp S.L."}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(edited["entity"]["name"], json!("Acme Corp S.L."));
        assert_eq!(edited["field_errors"], json!({}));

        let response = client
            .post(format!("{base}/api/review/{id}/submit"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(backend.updates()[0].name, "Acme Corp S.L.");
    }

    #[tokio::test]
    async fn self_merge_decision_is_rejected() {
        let (base, _) = spawn_app(acme_backend()).await;
        let view: Value = start(&base, "42").await.json().await.unwrap();
        let id = view["session_id"].as_str().unwrap().to_string();

        let response = reqwest::Client::new()
            .post(format!("{base}/api/review/{id}/decision"))
            .json(&json!({"decision": {"kind": "merged", "target": 42}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json().await.unwrap();
        assert!(body["errors"]["canonical"].is_string());
    }

    #[tokio::test]
    async fn empty_review_queue_sends_the_browser_back_to_the_dataset() {
        let (base, state) = spawn_app(acme_backend()).await;

        let response = start(&base, "random").await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let view: Value = response.json().await.unwrap();
        assert_eq!(view["phase"], json!("exhausted"));
        assert_eq!(view["navigation"], json!("/datasets/companies"));
        assert!(state.sessions().is_empty());
    }

    #[tokio::test]
    async fn unknown_entity_and_session_are_not_found() {
        let (base, state) = spawn_app(acme_backend()).await;

        let response = start(&base, "999").await;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(state.sessions().len(), 0);

        let response = reqwest::get(format!("{base}/api/review/{}", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reviewing_requires_edit_permission() {
        let backend = acme_backend();
        backend.set_permissions("companies", Permissions { view: true, edit: false, manage: false });
        let (base, _) = spawn_app(backend).await;

        let response = start(&base, "random").await;
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    }
}
