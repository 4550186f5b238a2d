//! Download handler (C9): bulk CSV/JSON export over arbitrary time ranges,
//! querying the Store directly (bypassing the live path entirely).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::series::Kind;
use crate::store::Store;

#[derive(Clone)]
pub struct DownloadState {
    pub config: Arc<Config>,
}

const ALLOWED_PARAMS: &[&str] = &["quantity", "bucket_size", "oldest", "newest", "format"];

struct ParsedQuery {
    quantity: Kind,
    bucket_size: Option<i64>,
    oldest: Option<i64>,
    newest: Option<i64>,
    format: Format,
}

#[derive(Clone, Copy, PartialEq)]
enum Format {
    Csv,
    CsvBe,
}

enum DownloadError {
    BadRequest(String),
    TooManyItems,
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers
}

fn parse_query(
    params: &HashMap<String, String>,
    ext: &str,
    download_max_items: u64,
) -> Result<ParsedQuery, DownloadError> {
    let unused: Vec<&String> = params
        .keys()
        .filter(|k| !ALLOWED_PARAMS.contains(&k.as_str()))
        .collect();
    if !unused.is_empty() {
        let names = unused
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DownloadError::BadRequest(format!("Unused parameters {names}")));
    }

    let quantity = match params.get("quantity") {
        None => return Err(DownloadError::BadRequest("Missing parameter 'quantity'".to_string())),
        Some(raw) => Kind::from_str(raw)
            .ok_or_else(|| DownloadError::BadRequest("Invalid parameter 'quantity'".to_string()))?,
    };

    let bucket_size = match params.get("bucket_size").map(|s| s.as_str()) {
        None | Some("null") => None,
        Some(raw) => {
            let n: i64 = raw
                .parse()
                .map_err(|_| DownloadError::BadRequest("Invalid parameter 'bucket_size'".to_string()))?;
            if n <= 0 {
                return Err(DownloadError::BadRequest("Invalid parameter 'bucket_size'".to_string()));
            }
            // "1" is normalized to null (spec §4.7): one row per raw sample.
            if n == 1 {
                None
            } else {
                Some(n)
            }
        }
    };

    let oldest = parse_optional_i64(params, "oldest")?;
    let newest = parse_optional_i64(params, "newest")?;

    let format = if ext == "csv" {
        match params.get("format").map(|s| s.as_str()) {
            None | Some("csv") => Format::Csv,
            Some("csv-be") => Format::CsvBe,
            Some(_) => return Err(DownloadError::BadRequest("Invalid parameter 'format'".to_string())),
        }
    } else {
        Format::Csv
    };

    if ext == "json" {
        check_json_bounded(oldest, newest, bucket_size, download_max_items)?;
    }

    Ok(ParsedQuery {
        quantity,
        bucket_size,
        oldest,
        newest,
        format,
    })
}

fn parse_optional_i64(params: &HashMap<String, String>, key: &str) -> Result<Option<i64>, DownloadError> {
    match params.get(key).map(|s| s.as_str()) {
        None | Some("null") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| DownloadError::BadRequest(format!("Invalid parameter '{key}'"))),
    }
}

/// JSON materializes the whole Series in memory, so unlike CSV it must
/// reject requests whose row count can't be bounded up front (spec §4.7).
fn check_json_bounded(
    oldest: Option<i64>,
    newest: Option<i64>,
    bucket_size: Option<i64>,
    download_max_items: u64,
) -> Result<(), DownloadError> {
    let (Some(oldest), Some(newest)) = (oldest, newest) else {
        return Err(DownloadError::TooManyItems);
    };
    let effective_bucket = bucket_size.unwrap_or(1);
    if effective_bucket <= 0 || (newest - oldest) / effective_bucket > download_max_items as i64 {
        return Err(DownloadError::TooManyItems);
    }
    Ok(())
}

fn bad_request_html(message: &str) -> Response {
    let escaped = html_escape::encode_text(message);
    (
        StatusCode::OK,
        no_cache_headers(),
        format!("<html><body><p>{escaped}</p></body></html>"),
    )
        .into_response()
}

fn too_many_items_json() -> Response {
    let body = serde_json::json!({ "error": "too many items requested" });
    (StatusCode::OK, no_cache_headers(), axum::Json(body)).into_response()
}

fn split_filename(filename: &str) -> Option<(&str, &str)> {
    let (stem, ext) = filename.rsplit_once('.')?;
    Some((stem, ext))
}

pub async fn handler(
    State(state): State<DownloadState>,
    Path(filename): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some((_, ext)) = split_filename(&filename) else {
        return bad_request_html("Invalid parameter 'filename'");
    };
    if ext != "csv" && ext != "json" {
        return bad_request_html("Invalid parameter 'filename'");
    }

    let query = match parse_query(&params, ext, state.config.download_max_items) {
        Ok(q) => q,
        Err(DownloadError::BadRequest(msg)) => return bad_request_html(&msg),
        Err(DownloadError::TooManyItems) => return too_many_items_json(),
    };

    if ext == "csv" {
        csv_response(state, query)
    } else {
        json_response(state, query)
    }
}

fn format_csv_value(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        v.to_string()
    }
}

fn csv_row(timestamp: i64, cols: &[f64], be: bool) -> String {
    let mut fields: Vec<String> = Vec::with_capacity(cols.len() + 1);
    fields.push(timestamp.to_string());
    for v in cols {
        fields.push(format_csv_value(*v));
    }
    if be {
        fields
            .iter()
            .map(|f| f.replace('.', ","))
            .collect::<Vec<_>>()
            .join("\t")
    } else {
        fields.join(",")
    }
}

fn csv_header(kind: Kind, be: bool) -> String {
    let mut fields = vec!["timestamp".to_string()];
    fields.extend(kind.column_names().iter().map(|s| s.to_string()));
    if be {
        fields.join("\t")
    } else {
        fields.join(",")
    }
}

fn csv_response(state: DownloadState, query: ParsedQuery) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let database_path = state.config.database_path.clone();
    let water_tank_area_m2 = state.config.water_tank_area_m2;
    let batch_rows = state.config.download_batch_rows;
    let be = query.format == Format::CsvBe;

    tokio::task::spawn_blocking(move || {
        let header = csv_header(query.quantity, be) + "\n";
        if tx.blocking_send(Ok(Bytes::from(header))).is_err() {
            return;
        }

        let store = match Store::open_reader(&database_path) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to open store for csv download");
                return;
            }
        };

        let result = store.stream_rows(
            query.quantity,
            query.bucket_size,
            query.oldest,
            query.newest,
            water_tank_area_m2,
            batch_rows,
            |batch| {
                let mut out = String::new();
                for (ts, cols) in batch {
                    out.push_str(&csv_row(*ts, cols, be));
                    out.push('\n');
                }
                tx.blocking_send(Ok(Bytes::from(out)))
                    .map_err(|_| crate::error::TelemetryError::ClientClosed)
            },
        );
        if let Err(err) = result {
            tracing::warn!(error = %err, "csv download query failed");
        }
    });

    let stream = ReceiverStream::new(rx);
    let body = axum::body::Body::from_stream(stream);
    let mut headers = no_cache_headers();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
    (StatusCode::OK, headers, body).into_response()
}

fn json_response(state: DownloadState, query: ParsedQuery) -> Response {
    let database_path = state.config.database_path.clone();
    let water_tank_area_m2 = state.config.water_tank_area_m2;

    let store = match Store::open_reader(&database_path) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to open store for json download");
            return bad_request_html("Store unavailable");
        }
    };

    let rows = match store.fetch_rows(
        query.quantity,
        query.bucket_size,
        query.oldest,
        query.newest,
        water_tank_area_m2,
    ) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(error = %err, "json download query failed");
            return bad_request_html("Store query failed");
        }
    };

    let mut series = crate::series::Series::empty(
        query.quantity,
        crate::series::Buckets::new(
            query.newest.unwrap_or(0) - query.oldest.unwrap_or(0),
            query.bucket_size,
        ),
    );
    series.timestamps = rows.iter().map(|(t, _)| *t).collect();
    series.values = (0..query.quantity.column_count())
        .map(|c| rows.iter().map(|(_, cols)| cols[c]).collect())
        .collect();

    let body = serde_json::to_value(series.encode()).unwrap_or(serde_json::Value::Null);
    let headers = no_cache_headers();
    (StatusCode::OK, headers, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn csv_header_matches_power_fixture() {
        assert_eq!(
            csv_header(Kind::Power, false) + "\n",
            "timestamp,instant_power_1,instant_power_2,instant_power_3\n"
        );
    }

    #[test]
    fn csv_row_is_bit_exact_for_fixture() {
        let row = csv_row(1_700_000_000, &[0.123, 0.0, 0.0], false);
        assert_eq!(row, "1700000000,0.123,0,0");
    }

    #[test]
    fn csv_be_row_uses_tabs_and_comma_decimals() {
        let row = csv_row(1_700_000_000, &[0.123, 0.0, 0.0], true);
        assert_eq!(row, "1700000000\t0,123\t0\t0");
    }

    #[test]
    fn missing_quantity_is_bad_request() {
        let err = parse_query(&params(&[]), "csv", 1_000_000);
        assert!(matches!(err, Err(DownloadError::BadRequest(m)) if m == "Missing parameter 'quantity'"));
    }

    #[test]
    fn unknown_param_is_rejected() {
        let err = parse_query(&params(&[("quantity", "power"), ("bogus", "1")]), "csv", 1_000_000);
        assert!(matches!(err, Err(DownloadError::BadRequest(_))));
    }

    #[test]
    fn bucket_size_of_one_normalizes_to_none() {
        let q = parse_query(&params(&[("quantity", "power"), ("bucket_size", "1")]), "csv", 1_000_000)
            .ok()
            .unwrap();
        assert_eq!(q.bucket_size, None);
    }

    #[test]
    fn json_without_bounds_is_too_many_items() {
        let err = parse_query(&params(&[("quantity", "power")]), "json", 1_000_000);
        assert!(matches!(err, Err(DownloadError::TooManyItems)));
    }

    #[test]
    fn json_within_bounds_is_accepted() {
        let ok = parse_query(
            &params(&[
                ("quantity", "power"),
                ("oldest", "0"),
                ("newest", "120"),
                ("bucket_size", "60"),
            ]),
            "json",
            1_000_000,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn json_exceeding_max_items_is_rejected() {
        let err = parse_query(
            &params(&[("quantity", "power"), ("oldest", "0"), ("newest", "1000")]),
            "json",
            500,
        );
        assert!(matches!(err, Err(DownloadError::TooManyItems)));
    }
}
