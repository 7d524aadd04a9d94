use chrono::{DateTime, Days, NaiveDate, NaiveDateTime};
use forestal_adapters::DATE_FIELD;
use forestal_core::WORK_ORDERS;
use forestal_storage::{DocumentStore, Filter, FindQuery, Sort, StoreError};
use serde::Serialize;
use tracing::{info, warn};

/// Days subtracted from the latest stored date to pick up late upstream records.
pub const SAFETY_MARGIN_DAYS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSource {
    Override,
    ForcedResync,
    LatestStored,
    EpochFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub since: String,
    pub source: WatermarkSource,
}

/// Lenient parse of the date shapes the upstream uses for `fecha`.
pub fn parse_record_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.date());
        }
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Most recent string `fecha` among stored work orders, as stored.
pub async fn latest_work_order_date(store: &dyn DocumentStore) -> Result<Option<String>, StoreError> {
    let query = FindQuery::filtered(Filter::new().text(DATE_FIELD))
        .sorted(Sort::desc(DATE_FIELD))
        .first();
    let docs = store.find(WORK_ORDERS.name, &query).await?;
    Ok(docs
        .into_iter()
        .next()
        .and_then(|doc| doc.get(DATE_FIELD).and_then(|v| v.as_str()).map(str::to_string)))
}

/// Override beats forced resync, which beats the latest stored date minus the
/// safety margin; an empty store falls back to `epoch`.
pub async fn resolve_watermark(
    store: &dyn DocumentStore,
    override_date: Option<&str>,
    force: bool,
    epoch: &str,
) -> Result<Watermark, StoreError> {
    if let Some(date) = override_date.map(str::trim).filter(|d| !d.is_empty()) {
        info!(since = date, "watermark overridden by caller");
        return Ok(Watermark {
            since: date.to_string(),
            source: WatermarkSource::Override,
        });
    }
    if force {
        info!(since = epoch, "forced full resync");
        return Ok(Watermark {
            since: epoch.to_string(),
            source: WatermarkSource::ForcedResync,
        });
    }

    let fallback = || Watermark {
        since: epoch.to_string(),
        source: WatermarkSource::EpochFallback,
    };
    let Some(latest) = latest_work_order_date(store).await? else {
        info!(since = epoch, "no stored work orders, starting from epoch");
        return Ok(fallback());
    };
    let Some(since) = parse_record_date(&latest)
        .and_then(|date| date.checked_sub_days(Days::new(SAFETY_MARGIN_DAYS)))
    else {
        warn!(latest = %latest, "latest stored fecha is not a date, starting from epoch");
        return Ok(fallback());
    };

    let since = since.format("%Y-%m-%d").to_string();
    info!(latest = %latest, since = %since, "watermark from latest stored work order");
    Ok(Watermark {
        since,
        source: WatermarkSource::LatestStored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use forestal_core::DocKey;
    use forestal_storage::MemoryDocumentStore;
    use serde_json::{json, Value as JsonValue};

    const EPOCH: &str = "2020-01-01";

    async fn store_with(dates: &[&str]) -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        for (i, fecha) in dates.iter().enumerate() {
            let JsonValue::Object(doc) = json!({"fecha": fecha}) else { unreachable!() };
            store
                .upsert_merge(WORK_ORDERS.name, &DocKey::Int(i as i64 + 1), doc)
                .await
                .expect("seed");
        }
        store
    }

    #[tokio::test]
    async fn override_wins_over_everything() {
        let store = store_with(&["2024-03-10"]).await;
        let wm = resolve_watermark(&store, Some("2023-05-05"), true, EPOCH)
            .await
            .expect("watermark");
        assert_eq!(wm.since, "2023-05-05");
        assert_eq!(wm.source, WatermarkSource::Override);
    }

    #[tokio::test]
    async fn blank_override_is_ignored() {
        let store = store_with(&[]).await;
        let wm = resolve_watermark(&store, Some("  "), false, EPOCH).await.expect("watermark");
        assert_eq!(wm.source, WatermarkSource::EpochFallback);
    }

    #[tokio::test]
    async fn force_uses_epoch_even_with_stored_orders() {
        let store = store_with(&["2024-03-10"]).await;
        let wm = resolve_watermark(&store, None, true, EPOCH).await.expect("watermark");
        assert_eq!(wm.since, EPOCH);
        assert_eq!(wm.source, WatermarkSource::ForcedResync);
    }

    #[tokio::test]
    async fn latest_stored_date_minus_margin() {
        let store = store_with(&["2024-01-01", "2024-03-01", "2024-02-15"]).await;
        let wm = resolve_watermark(&store, None, false, EPOCH).await.expect("watermark");
        assert_eq!(wm.since, "2024-02-28");
        assert_eq!(wm.source, WatermarkSource::LatestStored);
    }

    #[tokio::test]
    async fn empty_store_falls_back_to_epoch() {
        let store = store_with(&[]).await;
        let JsonValue::Object(undated) = json!({"estado": 1}) else { unreachable!() };
        store
            .upsert_merge(WORK_ORDERS.name, &DocKey::Int(9), undated)
            .await
            .expect("seed");
        let wm = resolve_watermark(&store, None, false, EPOCH).await.expect("watermark");
        assert_eq!(wm.since, EPOCH);
        assert_eq!(wm.source, WatermarkSource::EpochFallback);
    }

    #[tokio::test]
    async fn non_string_fecha_does_not_hide_latest_date() {
        let store = store_with(&["2024-03-01"]).await;
        let JsonValue::Object(numeric) = json!({"fecha": 20240401}) else { unreachable!() };
        store
            .upsert_merge(WORK_ORDERS.name, &DocKey::Int(50), numeric)
            .await
            .expect("seed");
        assert_eq!(
            latest_work_order_date(&store).await.expect("latest").as_deref(),
            Some("2024-03-01")
        );
        let wm = resolve_watermark(&store, None, false, EPOCH).await.expect("watermark");
        assert_eq!(wm.since, "2024-02-28");
        assert_eq!(wm.source, WatermarkSource::LatestStored);
    }

    #[tokio::test]
    async fn unparseable_latest_date_falls_back_to_epoch() {
        let store = store_with(&["sin fecha"]).await;
        let wm = resolve_watermark(&store, None, false, EPOCH).await.expect("watermark");
        assert_eq!(wm.source, WatermarkSource::EpochFallback);
    }

    #[test]
    fn record_dates_accept_common_upstream_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 3);
        assert_eq!(parse_record_date("2024-01-03"), expected);
        assert_eq!(parse_record_date("2024-01-03T10:00:00Z"), expected);
        assert_eq!(parse_record_date("2024-01-03T10:00:00.123"), expected);
        assert_eq!(parse_record_date("2024-01-03 10:00:00"), expected);
        assert_eq!(parse_record_date("03/01/2024"), None);
    }
}
