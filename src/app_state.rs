use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::{api_client::ReviewBackend, authz::AuthzService, config::AppConfig, review::ReviewSession};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub backend: Arc<dyn ReviewBackend>,
    pub authz: Arc<AuthzService>,
    pub sessions: Arc<Mutex<HashMap<Uuid, Arc<ReviewSession>>>>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub message: String,
    pub active_sessions: usize,
    pub authz_datasets: usize,
    pub reviewed_total: u64,
    pub expired_sessions: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn ReviewBackend>,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            config,
            authz: Arc::new(AuthzService::new(backend.clone())),
            backend,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(Mutex::new(Status {
                message: "Servidor listo.".to_string(),
                ..Status::default()
            })),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }

    pub fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ReviewSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Busca una sesión y la marca como activa.
    pub fn session(&self, id: &Uuid) -> Option<Arc<ReviewSession>> {
        let session = self.sessions().get(id).cloned()?;
        session.touch();
        Some(session)
    }

    pub fn register(&self, session: Arc<ReviewSession>) {
        session.touch();
        self.sessions().insert(session.id(), session);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<ReviewSession>> {
        let removed = self.sessions().remove(id);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Saca del mapa una sesión que ya terminó (entidad guardada en modo
    /// concreto, cola agotada o entidad inexistente).
    pub fn retire_if_finished(&self, session: &ReviewSession) -> bool {
        session.is_finished() && self.remove(&session.id()).is_some()
    }

    /// Cierra las sesiones sin actividad durante más de `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Arc<ReviewSession>> = {
            let mut sessions = self.sessions();
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > max_idle)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.close();
        }
        if !expired.is_empty() {
            info!("{} sesión(es) de revisión expiradas por inactividad.", expired.len());
            self.status().expired_sessions += expired.len() as u64;
        }
        expired.len()
    }

    /// Lanza la tarea que expira periódicamente las sesiones abandonadas.
    pub fn spawn_idle_sweeper(&self, max_idle: Duration) -> JoinHandle<()> {
        let state = self.clone();
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                state.sweep_idle(max_idle);
            }
        })
    }

    /// Cierra todas las sesiones y vacía la caché de permisos.
    pub async fn teardown(&self) {
        let sessions: Vec<_> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
        self.authz.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewSettings;
    use crate::models::ReviewMode;
    use crate::review::tests::{entity, FakeBackend};

    fn state_with(backend: &Arc<FakeBackend>) -> AppState {
        AppState::new(AppConfig::for_tests("http://nomenklatura.test"), backend.clone(), None)
    }

    fn new_session(backend: &Arc<FakeBackend>, mode: ReviewMode) -> Arc<ReviewSession> {
        ReviewSession::new(backend.clone(), "companies", mode, ReviewSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept_and_active_ones_survive() {
        let backend = Arc::new(FakeBackend::default());
        let state = state_with(&backend);
        let stale = new_session(&backend, ReviewMode::Random);
        let active = new_session(&backend, ReviewMode::Random);
        state.register(stale.clone());
        state.register(active.clone());

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        assert!(state.session(&active.id()).is_some());
        tokio::time::advance(Duration::from_secs(15 * 60)).await;

        assert_eq!(state.sweep_idle(Duration::from_secs(30 * 60)), 1);
        assert!(state.session(&stale.id()).is_none());
        assert!(state.session(&active.id()).is_some());
        assert_eq!(state.status().expired_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_expires_abandoned_sessions() {
        let backend = Arc::new(FakeBackend::default());
        let state = state_with(&backend);
        state.register(new_session(&backend, ReviewMode::Random));

        let sweeper = state.spawn_idle_sweeper(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(state.sessions().is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn finished_sessions_are_retired() {
        let backend = Arc::new(FakeBackend::default());
        backend.add_entity(entity(42, "Acme Corp"));
        let state = state_with(&backend);

        let ongoing = new_session(&backend, ReviewMode::Specific("42".to_string()));
        state.register(ongoing.clone());
        ongoing.load_entity().await.unwrap();
        assert!(!state.retire_if_finished(&ongoing));
        assert!(state.session(&ongoing.id()).is_some());

        ongoing.submit_and_advance().await.unwrap();
        assert!(state.retire_if_finished(&ongoing));
        assert!(state.sessions().is_empty());
    }
}
