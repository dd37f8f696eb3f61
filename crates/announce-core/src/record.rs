/// Raw announcement records as returned by the upstream API, and the reduced summary
/// that is the only view of a record an AI backend ever sees.
///
/// Upstream fields vary in presence and type (numbers where strings are expected,
/// `null` where a value is missing), so every accessor here reads leniently and falls
/// back to an empty string.
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

/// One announcement exactly as decoded from the upstream JSON.
pub type RawRecord = serde_json::Map<String, Value>;

pub mod fields {
    pub const SERIAL_NUMBER: &str = "pbanc_sn";
    pub const TITLE: &str = "biz_pbanc_nm";
    pub const CONTENT: &str = "pbanc_ctnt";
    pub const CLASSIFICATION: &str = "supt_biz_clsfc";
    pub const START_DATE: &str = "pbanc_rcpt_bgng_dt";
    pub const END_DATE: &str = "pbanc_rcpt_end_dt";
    pub const TARGET_CONTENT: &str = "aply_trgt_ctnt";
    pub const EXCLUDED_TARGET_CONTENT: &str = "aply_excl_trgt_ctnt";
    pub const REGION: &str = "supt_regin";
    pub const ORGANIZATION: &str = "pbanc_ntrp_nm";
    pub const SUPERVISOR: &str = "sprv_inst";
    pub const DETAIL_URL: &str = "detl_pg_url";
    pub const TARGET: &str = "aply_trgt";
    pub const BUSINESS_YEARS: &str = "biz_enyy";
    pub const TARGET_AGE: &str = "biz_trgt_age";
    pub const RECRUITING: &str = "rcrt_prgs_yn";
    pub const INTEGRATED_NAME: &str = "intg_pbanc_biz_nm";
}

/// Read a field as text. Strings are returned as-is, numbers and booleans are
/// rendered, anything else (missing, `null`, arrays, objects) is empty.
pub fn field_text(record: &RawRecord, key: &str) -> String {
    match record.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// The record's serial number, if present and non-blank.
pub fn serial_number(record: &RawRecord) -> Option<String> {
    let sn = field_text(record, fields::SERIAL_NUMBER);
    let sn = sn.trim();
    (!sn.is_empty()).then(|| sn.to_string())
}

/// Parse an upstream date in either `YYYYMMDD` or `YYYY-MM-DD` form.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(raw, "%Y%m%d").ok();
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Normalise an upstream date to `YYYY-MM-DD`, or an empty string when it cannot be read.
pub fn normalize_date(raw: &str) -> String {
    parse_date(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Reduced, AI-facing view of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub title: String,
    /// Announcement body, or the application target text when the body is empty.
    pub content: String,
    pub target: String,
    pub start_date: String,
    pub end_date: String,
    pub region: String,
    pub organization: String,
    pub serial_number: String,
}

impl RecordSummary {
    pub fn from_record(record: &RawRecord) -> Self {
        let target = field_text(record, fields::TARGET);
        let content = field_text(record, fields::CONTENT);
        let content = if content.trim().is_empty() {
            target.clone()
        } else {
            content
        };

        Self {
            title: field_text(record, fields::TITLE),
            content,
            target,
            start_date: normalize_date(&field_text(record, fields::START_DATE)),
            end_date: normalize_date(&field_text(record, fields::END_DATE)),
            region: field_text(record, fields::REGION),
            organization: field_text(record, fields::ORGANIZATION),
            serial_number: serial_number(record).unwrap_or_default(),
        }
    }
}
