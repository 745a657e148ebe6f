//! Caché de autorizaciones por dataset.
//!
//! Se crea vacía al arrancar, se rellena de forma perezosa la primera vez
//! que se consulta un dataset y se vacía explícitamente con `teardown`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::api_client::ReviewBackend;
use crate::error::{ReviewError, ReviewResult};
use crate::models::Permissions;

pub struct AuthzService {
    backend: Arc<dyn ReviewBackend>,
    // tokio::Mutex: se mantiene bloqueado durante la petición para que dos
    // comprobaciones simultáneas del mismo dataset no dupliquen la llamada.
    cache: Mutex<HashMap<String, Permissions>>,
}

impl AuthzService {
    pub fn new(backend: Arc<dyn ReviewBackend>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn permissions(&self, dataset: &str) -> ReviewResult<Permissions> {
        let mut cache = self.cache.lock().await;
        if let Some(perms) = cache.get(dataset) {
            return Ok(*perms);
        }

        debug!("Consultando permisos para el dataset {dataset}");
        let perms = self.backend.permissions(dataset).await?;
        cache.insert(dataset.to_string(), perms);
        Ok(perms)
    }

    /// Exige permiso de edición; revisar entidades las modifica.
    pub async fn require_edit(&self, dataset: &str) -> ReviewResult<()> {
        if self.permissions(dataset).await?.edit {
            Ok(())
        } else {
            Err(ReviewError::Forbidden(format!(
                "no tiene permiso para editar el dataset {dataset}"
            )))
        }
    }

    pub async fn teardown(&self) {
        let mut cache = self.cache.lock().await;
        let n = cache.len();
        cache.clear();
        info!("Caché de autorizaciones vaciada ({n} dataset(s)).");
    }

    pub async fn cached_datasets(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::tests::FakeBackend;

    #[tokio::test]
    async fn permissions_are_fetched_once_per_dataset() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_permissions("companies", Permissions { view: true, edit: true, manage: false });
        let authz = AuthzService::new(backend.clone());

        assert!(authz.permissions("companies").await.unwrap().edit);
        assert!(authz.permissions("companies").await.unwrap().edit);
        assert_eq!(backend.permission_calls(), 1);
        assert_eq!(authz.cached_datasets().await, 1);
    }

    #[tokio::test]
    async fn teardown_forces_a_refetch() {
        let backend = Arc::new(FakeBackend::default());
        let authz = AuthzService::new(backend.clone());

        authz.permissions("companies").await.unwrap();
        authz.teardown().await;
        assert_eq!(authz.cached_datasets().await, 0);
        authz.permissions("companies").await.unwrap();
        assert_eq!(backend.permission_calls(), 2);
    }

    #[tokio::test]
    async fn edit_is_required_to_review() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_permissions("people", Permissions { view: true, edit: false, manage: false });
        let authz = AuthzService::new(backend);

        let err = authz.require_edit("people").await.unwrap_err();
        assert!(matches!(err, ReviewError::Forbidden(_)));
    }
}
