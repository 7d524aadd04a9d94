use std::cmp::Ordering;

use forestal_core::Document;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: JsonValue },
    /// Inclusive lexicographic range over a string field.
    Range {
        field: String,
        gte: Option<String>,
        lte: Option<String>,
    },
    /// Field present and not `null`.
    Exists { field: String },
}

impl Condition {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Eq { field, value } => doc.get(field) == Some(value),
            Self::Range { field, gte, lte } => {
                let Some(actual) = doc.get(field).and_then(|v| v.as_str()) else {
                    return false;
                };
                gte.as_deref().map_or(true, |lo| actual >= lo)
                    && lte.as_deref().map_or(true, |hi| actual <= hi)
            }
            Self::Exists { field } => doc.get(field).is_some_and(|v| !v.is_null()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        gte: Option<String>,
        lte: Option<String>,
    ) -> Self {
        if gte.is_some() || lte.is_some() {
            self.conditions.push(Condition::Range {
                field: field.into(),
                gte,
                lte,
            });
        }
        self
    }

    /// Field present and holding a string.
    pub fn text(mut self, field: impl Into<String>) -> Self {
        self.conditions.push(Condition::Range {
            field: field.into(),
            gte: None,
            lte: None,
        });
        self
    }

    pub fn exists(mut self, field: impl Into<String>) -> Self {
        self.conditions.push(Condition::Exists {
            field: field.into(),
        });
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| c.matches(doc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Missing and `null` values sort last in both directions.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let va = a.get(&self.field).filter(|v| !v.is_null());
        let vb = b.get(&self.field).filter(|v| !v.is_null());
        match (va, vb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_json(x, y);
                match self.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            }
        }
    }
}

fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::String(_) => 1,
        JsonValue::Number(_) => 2,
        JsonValue::Bool(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Object(_) => 5,
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn page(mut self, skip: u64, limit: u64) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }

    pub fn first(mut self) -> Self {
        self.limit = Some(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn range_is_inclusive_and_ignores_non_strings() {
        let filter = Filter::new().range(
            "fecha",
            Some("2024-01-02".into()),
            Some("2024-01-03".into()),
        );
        assert!(!filter.matches(&doc(json!({"fecha": "2024-01-01"}))));
        assert!(filter.matches(&doc(json!({"fecha": "2024-01-02"}))));
        assert!(filter.matches(&doc(json!({"fecha": "2024-01-03"}))));
        assert!(!filter.matches(&doc(json!({"fecha": 20240102}))));
        assert!(!filter.matches(&doc(json!({}))));
    }

    #[test]
    fn empty_range_adds_no_condition() {
        let filter = Filter::new().range("fecha", None, None);
        assert!(filter.conditions.is_empty());
    }

    #[test]
    fn sort_puts_missing_values_last() {
        let sort = Sort::desc("fecha");
        let mut docs = vec![
            doc(json!({"_id": 1})),
            doc(json!({"_id": 2, "fecha": "2024-01-01"})),
            doc(json!({"_id": 3, "fecha": "2024-02-01"})),
            doc(json!({"_id": 4, "fecha": null})),
        ];
        docs.sort_by(|a, b| sort.compare(a, b));
        let ids: Vec<_> = docs.iter().map(|d| d["_id"].clone()).collect();
        assert_eq!(ids[..2], [json!(3), json!(2)]);
    }

    #[test]
    fn equality_is_type_strict() {
        let filter = Filter::new().eq("estado", 2);
        assert!(filter.matches(&doc(json!({"estado": 2}))));
        assert!(!filter.matches(&doc(json!({"estado": "2"}))));
    }
}
