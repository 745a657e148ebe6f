//! Modelos de dominio: registros tipados que devuelve la API de nomenklatura
//! y los valores transitorios del flujo de revisión.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub type EntityId = i64;

/// Entidad curada tal como la devuelve `GET /api/2/entities/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dataset: Option<String>,
    // Las versiones antiguas del servidor llaman `data` a los atributos.
    #[serde(default, alias = "data")]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub reviewed: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub canonical: Option<EntityRef>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<NaiveDateTime>,
}

/// Referencia a otra entidad. El servidor la envía como id numérico
/// o como objeto superficial `{id, name, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEntityRef")]
pub struct EntityRef {
    pub id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(id: EntityId) -> Self {
        Self { id, name: None }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntityRef {
    Id(EntityId),
    Object { id: EntityId, name: Option<String> },
}

impl From<RawEntityRef> for EntityRef {
    fn from(raw: RawEntityRef) -> Self {
        match raw {
            RawEntityRef::Id(id) => Self { id, name: None },
            RawEntityRef::Object { id, name } => Self { id, name },
        }
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }))
}

/// Cuerpo de `POST /api/2/entities/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdate {
    pub name: String,
    pub attributes: Map<String, Value>,
    pub reviewed: bool,
    pub invalid: bool,
    pub canonical: Option<EntityId>,
}

impl From<&Entity> for EntityUpdate {
    fn from(entity: &Entity) -> Self {
        Self {
            name: entity.name.clone(),
            attributes: entity.attributes.clone(),
            reviewed: entity.reviewed,
            invalid: entity.invalid,
            canonical: entity.canonical.as_ref().map(|c| c.id),
        }
    }
}

/// Contexto de presentación del dataset (`GET /api/2/datasets/{name}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub public_edit: bool,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub match_aliases: bool,
    /// Si es `false`, el dataset no admite marcar entidades como inválidas.
    #[serde(default = "enabled")]
    pub enable_invalid: bool,
}

fn enabled() -> bool {
    true
}

/// Posible duplicado propuesto por el servicio de coincidencias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    #[serde(default)]
    pub score: f64,
    pub entity: Entity,
}

/// Respuesta paginada de `GET /api/2/match`. Los resultados llegan
/// ordenados por puntuación descendente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPage {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub results: Vec<CandidateMatch>,
}

/// Parámetros de la consulta de coincidencias.
///
/// Sólo se construye a partir de la entidad en revisión, de modo que
/// `exclude` siempre es el id de esa entidad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchQuery {
    pub dataset: String,
    pub name: String,
    pub exclude: EntityId,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl MatchQuery {
    pub fn for_entity(dataset: &str, entity: &Entity, limit: usize, filter: &str) -> Self {
        let filter = filter.trim();
        Self {
            dataset: dataset.to_string(),
            name: entity.name.clone(),
            exclude: entity.id,
            limit,
            filter: (!filter.is_empty()).then(|| filter.to_string()),
        }
    }
}

/// Decisión del revisor. Exactamente una variante está activa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Decision {
    Distinct,
    Invalid,
    Merged(EntityId),
}

impl Decision {
    /// Decisión por defecto a partir de lo que ya está registrado en el servidor.
    pub fn infer(entity: &Entity) -> Self {
        if let Some(canonical) = &entity.canonical {
            Decision::Merged(canonical.id)
        } else if entity.invalid {
            Decision::Invalid
        } else {
            Decision::Distinct
        }
    }

    /// Marca la entidad como revisada y limpia los campos de las otras variantes.
    pub fn apply_to(self, entity: &mut Entity) {
        entity.reviewed = true;
        match self {
            Decision::Distinct => {
                entity.invalid = false;
                entity.canonical = None;
            }
            Decision::Invalid => {
                entity.invalid = true;
                entity.canonical = None;
            }
            Decision::Merged(target) => {
                entity.invalid = false;
                entity.canonical = Some(EntityRef::new(target));
            }
        }
    }

    pub fn target(&self) -> Option<EntityId> {
        match self {
            Decision::Merged(target) => Some(*target),
            _ => None,
        }
    }
}

/// Origen de las entidades de una sesión. Se fija al crear la sesión.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "entity_id", rename_all = "snake_case")]
pub enum ReviewMode {
    Random,
    Specific(String),
}

impl ReviewMode {
    /// Interpreta el segmento `what` de la ruta `/datasets/:dataset/review/:what`.
    pub fn from_route(what: &str) -> Self {
        match what.trim() {
            "random" => ReviewMode::Random,
            id => ReviewMode::Specific(id.to_string()),
        }
    }
}

/// Permisos del usuario sobre un dataset (`GET /api/2/sessions/authz`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub view: bool,
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub manage: bool,
}

/// Estado de la sesión del usuario en el servidor (`GET /api/2/sessions`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default)]
    pub account: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: EntityId, name: &str) -> Entity {
        Entity {
            id,
            name: name.to_string(),
            dataset: Some("companies".to_string()),
            attributes: Map::new(),
            reviewed: false,
            invalid: false,
            canonical: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn decision_clears_fields_of_other_variants() {
        let mut e = entity(1, "Acme");
        e.invalid = true;
        e.canonical = Some(EntityRef::new(7));

        let mut distinct = e.clone();
        Decision::Distinct.apply_to(&mut distinct);
        assert!(distinct.reviewed);
        assert!(!distinct.invalid);
        assert_eq!(distinct.canonical, None);

        let mut invalid = e.clone();
        Decision::Invalid.apply_to(&mut invalid);
        assert!(invalid.reviewed);
        assert!(invalid.invalid);
        assert_eq!(invalid.canonical, None);

        let mut merged = e;
        Decision::Merged(9).apply_to(&mut merged);
        assert!(merged.reviewed);
        assert!(!merged.invalid);
        assert_eq!(merged.canonical.map(|c| c.id), Some(9));
    }

    #[test]
    fn decision_is_inferred_from_existing_fields() {
        let mut e = entity(1, "Acme");
        assert_eq!(Decision::infer(&e), Decision::Distinct);
        e.invalid = true;
        assert_eq!(Decision::infer(&e), Decision::Invalid);
        e.canonical = Some(EntityRef::new(3));
        assert_eq!(Decision::infer(&e), Decision::Merged(3));
    }

    #[test]
    fn entity_accepts_both_canonical_shapes_and_legacy_data_field() {
        let as_id: Entity = serde_json::from_value(json!({
            "id": 42, "name": "Acme Corp", "canonical": 7, "data": {"country": "ES"}
        }))
        .unwrap();
        assert_eq!(as_id.canonical, Some(EntityRef::new(7)));
        assert_eq!(as_id.attributes.get("country"), Some(&json!("ES")));

        let as_object: Entity = serde_json::from_value(json!({
            "id": 42, "name": "Acme Corp", "canonical": {"id": 7, "name": "ACME"},
            "created_at": "2014-03-01T10:20:30.123456"
        }))
        .unwrap();
        assert_eq!(as_object.canonical.unwrap().name.as_deref(), Some("ACME"));
        assert!(as_object.created_at.is_some());
    }

    #[test]
    fn update_payload_sends_canonical_as_id() {
        let mut e = entity(42, "Acme Corp");
        Decision::Merged(5).apply_to(&mut e);
        let body = serde_json::to_value(EntityUpdate::from(&e)).unwrap();
        assert_eq!(body["canonical"], json!(5));
        assert_eq!(body["reviewed"], json!(true));
    }

    #[test]
    fn match_query_always_excludes_the_source_entity() {
        let e = entity(42, "Acme Corp");
        let q = MatchQuery::for_entity("companies", &e, 10, "  ");
        assert_eq!(q.exclude, 42);
        assert_eq!(q.name, "Acme Corp");
        assert_eq!(q.filter, None);

        let q = MatchQuery::for_entity("companies", &e, 10, "corp");
        assert_eq!(q.filter.as_deref(), Some("corp"));
    }

    #[test]
    fn dataset_allows_invalid_unless_disabled() {
        let plain: Dataset = serde_json::from_value(json!({"name": "companies"})).unwrap();
        assert!(plain.enable_invalid);

        let strict: Dataset =
            serde_json::from_value(json!({"name": "people", "enable_invalid": false})).unwrap();
        assert!(!strict.enable_invalid);
    }

    #[test]
    fn review_mode_from_route() {
        assert_eq!(ReviewMode::from_route("random"), ReviewMode::Random);
        assert_eq!(
            ReviewMode::from_route("42"),
            ReviewMode::Specific("42".to_string())
        );
    }
}
