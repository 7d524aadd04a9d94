//! Core domain model for the forestry work-order backend.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "forestal-core";

/// Field every stored document is keyed by.
pub const ID_FIELD: &str = "_id";

pub type Document = serde_json::Map<String, JsonValue>;

/// Store identifier. The variant used by a collection is fixed by its [`KeyKind`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocKey {
    Int(i64),
    Text(String),
}

impl DocKey {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Int(v) => JsonValue::from(*v),
            Self::Text(v) => JsonValue::from(v.as_str()),
        }
    }

    /// Textual form used as the primary-key column of the relational backend.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn new_text() -> Self {
        Self::Text(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("missing identifier")]
    Missing,
    #[error("invalid {kind} identifier: {value}")]
    Invalid { kind: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Integer,
    Text,
    /// Integer when the value is numeric, text otherwise.
    IntegerOrText,
}

impl KeyKind {
    fn label(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text => "text",
            Self::IntegerOrText => "integer or text",
        }
    }

    fn invalid(self, value: impl Into<String>) -> KeyError {
        KeyError::Invalid {
            kind: self.label(),
            value: value.into(),
        }
    }

    /// Interpret a JSON identifier value. `null` and empty strings count as missing.
    pub fn key_from_json(self, value: &JsonValue) -> Result<DocKey, KeyError> {
        match value {
            JsonValue::Null => Err(KeyError::Missing),
            JsonValue::String(s) if s.trim().is_empty() => Err(KeyError::Missing),
            JsonValue::String(s) => self.parse_key(s),
            JsonValue::Number(n) => match self {
                Self::Integer => integral(n).ok_or_else(|| self.invalid(n.to_string())),
                Self::IntegerOrText => Ok(integral(n).unwrap_or_else(|| DocKey::Text(n.to_string()))),
                Self::Text => Ok(DocKey::Text(n.to_string())),
            },
            other => Err(self.invalid(other.to_string())),
        }
    }

    /// Parse an identifier coming from a URL path segment or query string.
    pub fn parse_key(self, raw: &str) -> Result<DocKey, KeyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KeyError::Missing);
        }
        match self {
            Self::Integer => raw
                .parse::<i64>()
                .map(DocKey::Int)
                .map_err(|_| self.invalid(raw)),
            Self::IntegerOrText => Ok(raw
                .parse::<i64>()
                .map_or_else(|_| DocKey::Text(raw.to_string()), DocKey::Int)),
            Self::Text => Ok(DocKey::Text(raw.to_string())),
        }
    }
}

fn integral(n: &serde_json::Number) -> Option<DocKey> {
    if let Some(v) = n.as_i64() {
        return Some(DocKey::Int(v));
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(DocKey::Int(f as i64)),
        _ => None,
    }
}

/// Static description of one stored collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub key_kind: KeyKind,
    /// Field the upstream payload carries the identifier in; remapped to `_id` on write.
    pub natural_key: &'static str,
}

impl CollectionSpec {
    const fn new(name: &'static str, key_kind: KeyKind, natural_key: &'static str) -> Self {
        Self {
            name,
            key_kind,
            natural_key,
        }
    }

    pub fn remaps_key(&self) -> bool {
        self.natural_key != ID_FIELD
    }
}

pub const WORK_ORDERS: CollectionSpec =
    CollectionSpec::new("ordenesTrabajoAPI", KeyKind::Integer, ID_FIELD);
pub const PROGRESS_RECORDS: CollectionSpec =
    CollectionSpec::new("avancesTrabajo", KeyKind::Text, ID_FIELD);
pub const CREWS: CollectionSpec = CollectionSpec::new("cuadrillas", KeyKind::Text, ID_FIELD);

/// Reference-data families mirrored from the upstream administrative endpoint.
/// The payload category name equals the collection name. Upstream ids are
/// mostly GIS table ids, but some families (`usuarios`) carry hex object ids.
pub const ADMIN_COLLECTIONS: [CollectionSpec; 11] = [
    CollectionSpec::new("zonas", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("propietarios", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("campos", KeyKind::IntegerOrText, "idcampo"),
    CollectionSpec::new("empresas", KeyKind::IntegerOrText, "idempresa"),
    CollectionSpec::new("actividades", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("usuarios", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("tiposUso", KeyKind::IntegerOrText, "idtipouso"),
    CollectionSpec::new("especies", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("ambientales", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("insumos", KeyKind::IntegerOrText, ID_FIELD),
    CollectionSpec::new("jefes_de_area", KeyKind::IntegerOrText, ID_FIELD),
];

pub fn admin_collection(name: &str) -> Option<CollectionSpec> {
    ADMIN_COLLECTIONS.iter().copied().find(|c| c.name == name)
}

/// WorkOrder lifecycle state, stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum WorkOrderStatus {
    Initial,
    Pending,
    Finalized,
}

impl WorkOrderStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Initial => 1,
            Self::Pending => 2,
            Self::Finalized => 3,
        }
    }
}

impl From<WorkOrderStatus> for i64 {
    fn from(value: WorkOrderStatus) -> Self {
        value.code()
    }
}

impl TryFrom<i64> for WorkOrderStatus {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Initial),
            2 => Ok(Self::Pending),
            3 => Ok(Self::Finalized),
            other => Err(format!("unknown work order status {other}")),
        }
    }
}

const AREA_EPSILON: f64 = 1e-9;

/// Status implied by the cumulative worked area of a work order.
///
/// Only the area sum is consulted. Without a positive target the order can
/// become pending but never finalized.
pub fn derive_status(worked_area: f64, target_area: Option<f64>) -> WorkOrderStatus {
    if worked_area.is_nan() || worked_area <= AREA_EPSILON {
        return WorkOrderStatus::Initial;
    }
    match target_area {
        Some(target) if target > 0.0 && worked_area + AREA_EPSILON >= target => {
            WorkOrderStatus::Finalized
        }
        _ => WorkOrderStatus::Pending,
    }
}

fn lenient_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn de_lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(lenient_f64))
}

fn de_lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| KeyKind::Integer.key_from_json(v).ok())
        .and_then(|k| k.as_int()))
}

fn de_work_order_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let key = KeyKind::Integer
        .key_from_json(&value)
        .map_err(serde::de::Error::custom)?;
    key.as_int()
        .ok_or_else(|| serde::de::Error::custom("work order id must be an integer"))
}

/// Typed view over a stored work order document. Unknown upstream fields are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    #[serde(rename = "_id", deserialize_with = "de_work_order_id")]
    pub id: i64,
    #[serde(default, deserialize_with = "de_lenient_i64", skip_serializing_if = "Option::is_none")]
    pub estado: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64", skip_serializing_if = "Option::is_none")]
    pub superficie: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_i64", skip_serializing_if = "Option::is_none")]
    pub cod_zona: Option<i64>,
    #[serde(default, deserialize_with = "de_lenient_i64", skip_serializing_if = "Option::is_none")]
    pub cod_campo: Option<i64>,
    #[serde(default, deserialize_with = "de_lenient_i64", skip_serializing_if = "Option::is_none")]
    pub cod_empres: Option<i64>,
    #[serde(default, deserialize_with = "de_lenient_i64", skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Document,
}

impl WorkOrder {
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(doc))
    }

    pub fn status(&self) -> Option<WorkOrderStatus> {
        self.estado.and_then(|code| WorkOrderStatus::try_from(code).ok())
    }
}

/// Completion flag carried by each progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressState {
    #[default]
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "C")]
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Unit of work ("avance") logged by a crew against a work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(deserialize_with = "de_work_order_id")]
    pub orden_trabajo_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_orden: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proveedor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proveedor_nombre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha: Option<String>,
    #[serde(default)]
    pub actividad: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rodal: Option<String>,
    pub superficie: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cantidad_plantas: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuadrilla_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuadrilla_nombre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cant_personal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jornada: Option<f64>,
    #[serde(default)]
    pub estado: ProgressState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observaciones: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imagenes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordenadas: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_registro: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ultima_actualizacion: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(doc))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.superficie.is_finite() || self.superficie < 0.0 {
            return Err(ValidationError(format!(
                "superficie must be a non-negative number, got {}",
                self.superficie
            )));
        }
        if let Some(plants) = self.cantidad_plantas {
            if plants < 0.0 {
                return Err(ValidationError("cantidadPlantas must not be negative".into()));
            }
        }
        if self.cant_personal == Some(0) {
            return Err(ValidationError("cantPersonal must be at least 1".into()));
        }
        if let Some(jornada) = self.jornada {
            if jornada < 0.0 {
                return Err(ValidationError("jornada must not be negative".into()));
            }
        }
        if let Some(c) = self.coordenadas {
            if !(-90.0..=90.0).contains(&c.lat) || !(-180.0..=180.0).contains(&c.lng) {
                return Err(ValidationError("coordenadas out of range".into()));
            }
        }
        Ok(())
    }
}
