//! Taxonomía de errores del flujo de revisión.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Mensajes de validación indexados por campo (`{"name": "Entity already exists."}`).
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("la validación falló en {} campo(s)", .0.len())]
    Validation(FieldErrors),

    #[error("no existe la entidad solicitada: {0}")]
    NotFound(String),

    #[error("sin permiso: {0}")]
    Forbidden(String),

    #[error("error de red al contactar con la API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("la API respondió {status}: {message}")]
    Server { status: u16, message: String },

    #[error("respuesta de la API no válida: {0}")]
    Decode(String),

    #[error("ya hay una decisión enviándose; espere a que termine")]
    SubmissionInFlight,

    #[error("no hay ninguna entidad lista para revisar")]
    NotReady,
}

/// Clase de error que ve la capa de presentación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Transport,
    Busy,
}

impl ReviewError {
    /// Error de validación sobre un único campo.
    pub fn field(field: &str, message: &str) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), message.to_string());
        ReviewError::Validation(errors)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReviewError::Validation(_) => ErrorKind::Validation,
            ReviewError::NotFound(_) => ErrorKind::NotFound,
            ReviewError::Forbidden(_) => ErrorKind::Forbidden,
            ReviewError::Transport(_) | ReviewError::Server { .. } | ReviewError::Decode(_) => {
                ErrorKind::Transport
            }
            ReviewError::SubmissionInFlight | ReviewError::NotReady => ErrorKind::Busy,
        }
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            ReviewError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

pub type ReviewResult<T> = Result<T, ReviewError>;
