//! Controlador de una sesión de revisión de duplicados.
//!
//! Flujo por paso:
//!   1. Se carga la entidad (al azar o la indicada) y se infiere la decisión por defecto.
//!   2. Se consultan inmediatamente sus posibles duplicados.
//!   3. El revisor cambia la decisión o el filtro (re-consulta con debounce).
//!   4. Se envía la decisión; en modo aleatorio se vuelve al paso 1,
//!      en modo concreto se navega a la vista de la entidad.
//!
//! En modo aleatorio, cuando la API ya no devuelve entidades pendientes la
//! sesión termina y la vista vuelve al dataset.
//!
//! Las respuestas de coincidencias llevan un número de generación; si
//! llega una respuesta de una consulta ya superada se descarta.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api_client::ReviewBackend;
use crate::config::ReviewSettings;
use crate::debounce::Debouncer;
use crate::error::{ErrorKind, FieldErrors, ReviewError, ReviewResult};
use crate::keyboard::{self, Direction, KeyCommand, KeyEvent};
use crate::models::{CandidateMatch, Dataset, Decision, Entity, MatchQuery, ReviewMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LoadingEntity,
    Ready,
    Submitting,
    /// Modo concreto: decisión guardada, la vista debe navegar a la entidad.
    Completed,
    /// Falló la carga de la entidad; puede reintentarse.
    Failed,
    /// La entidad pedida no existe. No hay nada que recuperar.
    NotFound,
    /// Modo aleatorio: no quedan entidades pendientes en el dataset.
    Exhausted,
}

/// Aviso visible para el usuario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ReviewError> for Notice {
    fn from(err: &ReviewError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Qué hace la vista tras un envío correcto.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "advance", rename_all = "snake_case")]
pub enum Advance {
    NextEntity,
    Navigate { path: String, entity: Entity },
    /// No quedan entidades por revisar; volver a la vista del dataset.
    Exhausted { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusTarget {
    NewEntity,
    Filter,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum KeyOutcome {
    Submitted(Advance),
    Focus(FocusTarget),
    OpenUrl(String),
    SelectionMoved(Option<usize>),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyResponse {
    #[serde(flatten)]
    pub command: KeyCommand,
    #[serde(flatten)]
    pub outcome: KeyOutcome,
}

/// Instantánea serializable de la sesión para el frontend.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub dataset: String,
    pub dataset_info: Option<Dataset>,
    pub mode: ReviewMode,
    pub phase: Phase,
    pub entity: Option<Entity>,
    pub decision: Decision,
    pub candidates: Vec<CandidateMatch>,
    pub selection: Option<usize>,
    pub filter: String,
    pub field_errors: FieldErrors,
    pub notice: Option<Notice>,
    pub navigation: Option<String>,
    pub reviewed_count: u64,
    pub created_at: DateTime<Utc>,
}

struct SessionState {
    phase: Phase,
    dataset_info: Option<Dataset>,
    entity: Option<Entity>,
    decision: Decision,
    candidates: Vec<CandidateMatch>,
    selection: Option<usize>,
    filter: String,
    match_generation: u64,
    field_errors: FieldErrors,
    notice: Option<Notice>,
    navigation: Option<String>,
    reviewed_count: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::LoadingEntity,
            dataset_info: None,
            entity: None,
            decision: Decision::Distinct,
            candidates: Vec::new(),
            selection: None,
            filter: String::new(),
            match_generation: 0,
            field_errors: FieldErrors::new(),
            notice: None,
            navigation: None,
            reviewed_count: 0,
        }
    }

    fn ensure_editable(&self) -> ReviewResult<()> {
        match self.phase {
            Phase::Ready => Ok(()),
            Phase::Submitting => Err(ReviewError::SubmissionInFlight),
            _ => Err(ReviewError::NotReady),
        }
    }

    /// Comprueba que la decisión es aplicable a la entidad cargada.
    fn check_decision(&self, decision: Decision) -> ReviewResult<()> {
        let entity = self.entity.as_ref().ok_or(ReviewError::NotReady)?;
        match decision {
            Decision::Distinct => Ok(()),
            Decision::Invalid => {
                // Sin contexto del dataset se asume el valor por defecto.
                let allowed = self
                    .dataset_info
                    .as_ref()
                    .map_or(true, |d| d.enable_invalid);
                if allowed {
                    Ok(())
                } else {
                    Err(ReviewError::field(
                        "invalid",
                        "Este dataset no admite marcar entidades como inválidas.",
                    ))
                }
            }
            Decision::Merged(target) if target == entity.id => Err(ReviewError::field(
                "canonical",
                "Una entidad no puede fusionarse consigo misma.",
            )),
            Decision::Merged(target) => {
                let on_record = entity.canonical.as_ref().is_some_and(|c| c.id == target);
                let listed = self.candidates.iter().any(|c| c.entity.id == target);
                if on_record || listed {
                    Ok(())
                } else {
                    Err(ReviewError::field(
                        "canonical",
                        "El destino de la fusión no está entre los candidatos.",
                    ))
                }
            }
        }
    }

    /// Mantiene la selección de la lista alineada con la decisión.
    fn sync_selection(&mut self) {
        self.selection = self.decision.target().and_then(|target| {
            self.candidates
                .iter()
                .position(|c| c.entity.id == target)
        });
    }
}

struct MatchTicket {
    generation: u64,
    query: MatchQuery,
}

pub struct ReviewSession {
    id: Uuid,
    dataset: String,
    mode: ReviewMode,
    settings: ReviewSettings,
    backend: Arc<dyn ReviewBackend>,
    debouncer: Debouncer,
    state: Mutex<SessionState>,
    created_at: DateTime<Utc>,
    last_touched: Mutex<Instant>,
}

impl ReviewSession {
    pub fn new(
        backend: Arc<dyn ReviewBackend>,
        dataset: &str,
        mode: ReviewMode,
        settings: ReviewSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            dataset: dataset.to_string(),
            mode,
            debouncer: Debouncer::new(settings.debounce),
            settings,
            backend,
            state: Mutex::new(SessionState::new()),
            created_at: Utc::now(),
            last_touched: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> &ReviewMode {
        &self.mode
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registra actividad del navegador sobre la sesión.
    pub fn touch(&self) {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// La sesión ya no admite más trabajo.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.lock().phase,
            Phase::Completed | Phase::Exhausted | Phase::NotFound
        )
    }

    pub fn view(&self) -> SessionView {
        let st = self.lock();
        SessionView {
            session_id: self.id,
            dataset: self.dataset.clone(),
            dataset_info: st.dataset_info.clone(),
            mode: self.mode.clone(),
            phase: st.phase,
            entity: st.entity.clone(),
            decision: st.decision,
            candidates: st.candidates.clone(),
            selection: st.selection,
            filter: st.filter.clone(),
            field_errors: st.field_errors.clone(),
            notice: st.notice.clone(),
            navigation: st.navigation.clone(),
            reviewed_count: st.reviewed_count,
            created_at: self.created_at,
        }
    }

    /// Carga el contexto del dataset para la cabecera. Sólo es informativo.
    pub async fn load_dataset_context(&self) {
        match self.backend.dataset(&self.dataset).await {
            Ok(dataset) => self.lock().dataset_info = Some(dataset),
            Err(e) => warn!("No se pudo cargar el dataset {}: {}", self.dataset, e),
        }
    }

    pub async fn load_entity(&self) -> ReviewResult<()> {
        {
            let st = self.lock();
            if st.phase == Phase::Submitting {
                return Err(ReviewError::SubmissionInFlight);
            }
            if st.phase == Phase::NotFound {
                return Err(ReviewError::NotFound(self.describe_source()));
            }
        }
        self.fetch_entity().await
    }

    async fn fetch_entity(&self) -> ReviewResult<()> {
        {
            let mut st = self.lock();
            st.phase = Phase::LoadingEntity;
            // Invalida cualquier respuesta de coincidencias todavía en vuelo.
            st.match_generation += 1;
            st.entity = None;
            st.candidates.clear();
            st.selection = None;
            st.filter.clear();
            st.field_errors.clear();
            st.notice = None;
            st.navigation = None;
        }
        self.debouncer.cancel();

        let result = match &self.mode {
            ReviewMode::Random => self.backend.next_for_review(&self.dataset).await,
            ReviewMode::Specific(id) => self.backend.entity(id).await,
        };

        let entity = match result {
            Ok(entity) => entity,
            Err(ReviewError::NotFound(_)) if self.mode == ReviewMode::Random => {
                info!(
                    "Sesión {}: no quedan entidades por revisar en {}",
                    self.id, self.dataset
                );
                let mut st = self.lock();
                st.phase = Phase::Exhausted;
                st.navigation = Some(self.dataset_path());
                return Ok(());
            }
            Err(err) => {
                error!("Error cargando {}: {}", self.describe_source(), err);
                let mut st = self.lock();
                st.phase = match &err {
                    ReviewError::NotFound(_) => Phase::NotFound,
                    _ => Phase::Failed,
                };
                st.notice = Some(Notice::from(&err));
                return Err(err);
            }
        };

        info!(
            "Sesión {}: revisando la entidad {} ({})",
            self.id, entity.id, entity.name
        );
        let ticket = {
            let mut st = self.lock();
            st.decision = Decision::infer(&entity);
            st.entity = Some(entity);
            st.phase = Phase::Ready;
            self.begin_match_query(&mut st)
        };
        if let Some(ticket) = ticket {
            self.run_match_query(ticket).await;
        }
        Ok(())
    }

    fn dataset_path(&self) -> String {
        format!("/datasets/{}", self.dataset)
    }

    fn describe_source(&self) -> String {
        match &self.mode {
            ReviewMode::Random => format!("entidad pendiente en {}", self.dataset),
            ReviewMode::Specific(id) => format!("entidad {id}"),
        }
    }

    fn begin_match_query(&self, st: &mut SessionState) -> Option<MatchTicket> {
        let entity = st.entity.as_ref()?;
        let query =
            MatchQuery::for_entity(&self.dataset, entity, self.settings.match_limit, &st.filter);
        st.match_generation += 1;
        Some(MatchTicket {
            generation: st.match_generation,
            query,
        })
    }

    async fn run_match_query(&self, ticket: MatchTicket) -> bool {
        let result = self.backend.find_matches(&ticket.query).await;
        self.apply_matches(ticket.generation, result)
    }

    /// Aplica una respuesta de coincidencias si sigue siendo la más reciente.
    fn apply_matches(
        &self,
        generation: u64,
        result: ReviewResult<Vec<CandidateMatch>>,
    ) -> bool {
        let mut st = self.lock();
        if st.match_generation != generation {
            warn!(
                "Sesión {}: descartada respuesta de coincidencias obsoleta ({} < {})",
                self.id, generation, st.match_generation
            );
            return false;
        }
        match result {
            Ok(candidates) => {
                st.candidates = candidates;
                st.sync_selection();
            }
            Err(err) => {
                error!("Sesión {}: error consultando coincidencias: {}", self.id, err);
                st.notice = Some(Notice::from(&err));
            }
        }
        true
    }

    /// Cambio del filtro de texto libre. La consulta sale tras el periodo
    /// de silencio configurado; sólo cuenta la última.
    pub fn change_filter(self: &Arc<Self>, text: &str) -> ReviewResult<()> {
        let generation = {
            let mut st = self.lock();
            if st.entity.is_none() {
                return Err(ReviewError::NotReady);
            }
            st.filter = text.to_string();
            st.match_generation += 1;
            st.match_generation
        };
        self.schedule_match_query(generation);
        Ok(())
    }

    /// Corrige la copia local de la entidad (campo "nueva entidad").
    /// Nada se guarda hasta el siguiente envío; un cambio de nombre vuelve
    /// a consultar las coincidencias tras el periodo de silencio.
    pub fn edit_entity(
        self: &Arc<Self>,
        name: Option<&str>,
        attributes: Option<Map<String, Value>>,
    ) -> ReviewResult<()> {
        let generation = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.ensure_editable()?;
            let entity = st.entity.as_mut().ok_or(ReviewError::NotReady)?;

            let renamed = match name.map(str::trim) {
                Some("") => {
                    return Err(ReviewError::field("name", "El nombre no puede estar vacío."))
                }
                Some(new_name) if new_name != entity.name => {
                    entity.name = new_name.to_string();
                    true
                }
                _ => false,
            };
            if let Some(attributes) = attributes {
                entity.attributes = attributes;
                st.field_errors.remove("attributes");
            }
            if renamed {
                st.field_errors.remove("name");
            }
            if st.field_errors.is_empty()
                && st.notice.as_ref().is_some_and(|n| n.kind == ErrorKind::Validation)
            {
                st.notice = None;
            }

            renamed.then(|| {
                st.match_generation += 1;
                st.match_generation
            })
        };

        if let Some(generation) = generation {
            self.schedule_match_query(generation);
        }
        Ok(())
    }

    fn schedule_match_query(self: &Arc<Self>, generation: u64) {
        let session = Arc::clone(self);
        self.debouncer.schedule(async move {
            let ticket = {
                let mut st = session.lock();
                if st.match_generation != generation {
                    return;
                }
                session.begin_match_query(&mut st)
            };
            if let Some(ticket) = ticket {
                session.run_match_query(ticket).await;
            }
        });
    }

    pub fn select_decision(&self, decision: Decision) -> ReviewResult<()> {
        let mut st = self.lock();
        st.ensure_editable()?;
        st.check_decision(decision)?;
        st.decision = decision;
        st.sync_selection();
        Ok(())
    }

    pub fn select_candidate(&self, index: usize) -> ReviewResult<()> {
        let mut st = self.lock();
        st.ensure_editable()?;
        let target = st
            .candidates
            .get(index)
            .map(|c| c.entity.id)
            .ok_or(ReviewError::NotReady)?;
        st.decision = Decision::Merged(target);
        st.selection = Some(index);
        Ok(())
    }

    pub fn move_selection(&self, direction: Direction) -> ReviewResult<Option<usize>> {
        let next = {
            let st = self.lock();
            st.ensure_editable()?;
            keyboard::move_selection(st.selection, st.candidates.len(), direction)
        };
        if let Some(index) = next {
            self.select_candidate(index)?;
        }
        Ok(next)
    }

    /// Fija la decisión y la envía.
    pub async fn record_decision(&self, decision: Decision) -> ReviewResult<Advance> {
        self.select_decision(decision)?;
        self.submit_and_advance().await
    }

    /// Envía la decisión actual. Nada cambia localmente hasta que el
    /// servidor confirma; sólo se admite un envío a la vez.
    pub async fn submit_and_advance(&self) -> ReviewResult<Advance> {
        let patch = {
            let mut st = self.lock();
            st.ensure_editable()?;
            let mut patch = st.entity.clone().ok_or(ReviewError::NotReady)?;
            if st.decision.target() == Some(patch.id) {
                return Err(ReviewError::field(
                    "canonical",
                    "Una entidad no puede fusionarse consigo misma.",
                ));
            }
            st.decision.apply_to(&mut patch);
            st.phase = Phase::Submitting;
            st.field_errors.clear();
            st.notice = None;
            patch
        };

        let updated = match self.backend.update_entity(&patch).await {
            Ok(updated) => updated,
            Err(err) => {
                warn!("Sesión {}: no se pudo guardar la entidad {}: {}", self.id, patch.id, err);
                let mut st = self.lock();
                st.phase = Phase::Ready;
                if let Some(fields) = err.field_errors() {
                    st.field_errors = fields.clone();
                }
                st.notice = Some(Notice::from(&err));
                return Err(err);
            }
        };

        info!(
            "Sesión {}: entidad {} revisada ({:?})",
            self.id,
            updated.id,
            Decision::infer(&updated)
        );
        self.lock().reviewed_count += 1;

        match &self.mode {
            ReviewMode::Random => {
                // Un fallo aquí ya queda reflejado en la fase y el aviso;
                // la decisión sí se guardó.
                let _ = self.fetch_entity().await;
                if self.lock().phase == Phase::Exhausted {
                    Ok(Advance::Exhausted {
                        path: self.dataset_path(),
                    })
                } else {
                    Ok(Advance::NextEntity)
                }
            }
            ReviewMode::Specific(_) => {
                let path = format!("/entities/{}", updated.id);
                let mut st = self.lock();
                st.phase = Phase::Completed;
                st.decision = Decision::infer(&updated);
                st.entity = Some(updated.clone());
                st.navigation = Some(path.clone());
                Ok(Advance::Navigate {
                    path,
                    entity: updated,
                })
            }
        }
    }

    pub async fn handle_key(&self, event: &KeyEvent) -> ReviewResult<KeyResponse> {
        let rendered = self.lock().candidates.len();
        let command = keyboard::dispatch(event, rendered);

        let outcome = match command {
            KeyCommand::SelectCandidate(index) => {
                self.select_candidate(index)?;
                KeyOutcome::Submitted(self.submit_and_advance().await?)
            }
            KeyCommand::Submit => KeyOutcome::Submitted(self.submit_and_advance().await?),
            KeyCommand::MarkInvalid => {
                KeyOutcome::Submitted(self.record_decision(Decision::Invalid).await?)
            }
            KeyCommand::FocusNewEntity => KeyOutcome::Focus(FocusTarget::NewEntity),
            KeyCommand::FocusFilter => KeyOutcome::Focus(FocusTarget::Filter),
            KeyCommand::Blur => KeyOutcome::Focus(FocusTarget::None),
            KeyCommand::ExternalSearch => {
                let st = self.lock();
                let entity = st.entity.as_ref().ok_or(ReviewError::NotReady)?;
                KeyOutcome::OpenUrl(keyboard::external_search_url(
                    &self.settings.external_search_url,
                    &entity.name,
                ))
            }
            KeyCommand::MoveSelection(direction) => {
                KeyOutcome::SelectionMoved(self.move_selection(direction)?)
            }
            KeyCommand::Ignore => KeyOutcome::Ignored,
        };

        Ok(KeyResponse { command, outcome })
    }

    /// Cierra la sesión: cancela la consulta pendiente del filtro.
    pub fn close(&self) {
        self.debouncer.cancel();
        info!("Sesión de revisión {} cerrada.", self.id);
    }
}
