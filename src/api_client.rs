//! Cliente HTTP tipado para la API de nomenklatura (`/api/2/...`).
//!
//! El controlador de revisión sólo conoce el trait `ReviewBackend`; la
//! implementación real es `ApiClient`, basada en reqwest. Las respuestas
//! se validan en este borde contra los modelos de `models`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};
use url::Url;

use crate::config::AppConfig;
use crate::error::{FieldErrors, ReviewError, ReviewResult};
use crate::models::{
    CandidateMatch, Dataset, Entity, EntityUpdate, MatchPage, MatchQuery, Permissions, SessionInfo,
};

/// Operaciones remotas que necesita el flujo de revisión.
#[async_trait]
pub trait ReviewBackend: Send + Sync + 'static {
    /// `GET /api/2/entities/{id}`
    async fn entity(&self, id: &str) -> ReviewResult<Entity>;
    /// `GET /api/2/review/{dataset}`: siguiente entidad sin revisar, al azar.
    async fn next_for_review(&self, dataset: &str) -> ReviewResult<Entity>;
    /// `GET /api/2/match`
    async fn find_matches(&self, query: &MatchQuery) -> ReviewResult<Vec<CandidateMatch>>;
    /// `POST /api/2/entities/{id}`
    async fn update_entity(&self, entity: &Entity) -> ReviewResult<Entity>;
    /// `GET /api/2/datasets/{name}`
    async fn dataset(&self, name: &str) -> ReviewResult<Dataset>;
    /// `GET /api/2/sessions`
    async fn session(&self) -> ReviewResult<SessionInfo>;
    /// `GET /api/2/sessions/authz?dataset=`
    async fn permissions(&self, dataset: &str) -> ReviewResult<Permissions>;
}

pub struct ApiClient {
    http: Client,
    base: Url,
}

impl ApiClient {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        if cfg.api_url.cannot_be_a_base() {
            return Err(anyhow!("NOMENKLATURA_API_URL no puede usarse como base: {}", cfg.api_url));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = &cfg.api_key {
            let value = HeaderValue::from_str(&format!("ApiKey {key}"))
                .context("NOMENKLATURA_API_KEY contiene caracteres no válidos")?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(cfg.http_timeout)
            .default_headers(headers)
            .build()
            .context("No se pudo crear el cliente HTTP")?;

        info!("Cliente de la API de nomenklatura apuntando a {}", cfg.api_url);
        Ok(Self {
            http,
            base: cfg.api_url.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> ReviewResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ReviewError::Decode(format!("URL base no válida: {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "2"])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> ReviewResult<T> {
        debug!("GET {url}");
        let response = self.http.get(url).send().await?;
        read_json(response, what).await
    }
}

#[async_trait]
impl ReviewBackend for ApiClient {
    async fn entity(&self, id: &str) -> ReviewResult<Entity> {
        let url = self.endpoint(&["entities", id])?;
        self.get_json(url, &format!("entidad {id}")).await
    }

    async fn next_for_review(&self, dataset: &str) -> ReviewResult<Entity> {
        let url = self.endpoint(&["review", dataset])?;
        self.get_json(url, &format!("entidad pendiente en {dataset}"))
            .await
    }

    async fn find_matches(&self, query: &MatchQuery) -> ReviewResult<Vec<CandidateMatch>> {
        let mut url = self.endpoint(&["match"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("dataset", &query.dataset)
                .append_pair("name", &query.name)
                .append_pair("exclude", &query.exclude.to_string())
                .append_pair("limit", &query.limit.to_string());
            if let Some(filter) = &query.filter {
                pairs.append_pair("filter", filter);
            }
        }
        let page: MatchPage = self
            .get_json(url, &format!("coincidencias de {}", query.name))
            .await?;
        Ok(page.results)
    }

    async fn update_entity(&self, entity: &Entity) -> ReviewResult<Entity> {
        let url = self.endpoint(&["entities", &entity.id.to_string()])?;
        debug!("POST {url}");
        let response = self
            .http
            .post(url)
            .json(&EntityUpdate::from(entity))
            .send()
            .await?;
        read_json(response, &format!("entidad {}", entity.id)).await
    }

    async fn dataset(&self, name: &str) -> ReviewResult<Dataset> {
        let url = self.endpoint(&["datasets", name])?;
        self.get_json(url, &format!("dataset {name}")).await
    }

    async fn session(&self) -> ReviewResult<SessionInfo> {
        let url = self.endpoint(&["sessions"])?;
        self.get_json(url, "sesión").await
    }

    async fn permissions(&self, dataset: &str) -> ReviewResult<Permissions> {
        let mut url = self.endpoint(&["sessions", "authz"])?;
        url.query_pairs_mut().append_pair("dataset", dataset);
        // La respuesta viene indexada por nombre de dataset.
        let mut by_dataset: HashMap<String, Permissions> =
            self.get_json(url, &format!("permisos de {dataset}")).await?;
        Ok(by_dataset.remove(dataset).unwrap_or_default())
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> ReviewResult<T> {
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        return serde_json::from_slice(&bytes)
            .map_err(|e| ReviewError::Decode(format!("{what}: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::BAD_REQUEST => ReviewError::Validation(parse_field_errors(&body)),
        StatusCode::NOT_FOUND => ReviewError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ReviewError::Forbidden(what.to_string()),
        _ => ReviewError::Server {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        },
    })
}

/// Extrae el mapa campo → mensaje de un cuerpo 400. Acepta `{"errors": {...}}`
/// o el mapa directamente; cualquier otra cosa queda bajo la clave `_form`.
fn parse_field_errors(body: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let map = parsed.as_ref().and_then(|v| match v.get("errors") {
        Some(Value::Object(map)) => Some(map),
        _ => v.as_object(),
    });

    match map {
        Some(map) => {
            for (field, message) in map {
                if field == "status" {
                    continue;
                }
                let text = match message {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                errors.insert(field.clone(), text);
            }
        }
        None => {
            errors.insert("_form".to_string(), body.trim().to_string());
        }
    }

    if errors.is_empty() {
        errors.insert("_form".to_string(), "Petición rechazada por la API.".to_string());
    }
    errors
}
