/// Typed announcement handed to whatever stores the results.
use chrono::NaiveDate;
use serde::Serialize;

use crate::record::{field_text, fields, parse_date, serial_number, RawRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Announcement {
    pub serial_number: String,
    pub title: String,
    pub content: String,
    pub classification: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub target_content: String,
    pub excluded_target_content: String,
    pub region: String,
    pub organization: String,
    pub supervising_institution: String,
    pub detail_url: String,
    pub target: String,
    pub business_years: String,
    pub target_age: String,
    pub recruiting: bool,
    pub integrated_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecruitmentStatus {
    Upcoming,
    Open,
    Closed,
    Unknown,
}

impl Announcement {
    /// `None` when the record has no serial number.
    pub fn from_raw(record: &RawRecord) -> Option<Self> {
        let serial_number = serial_number(record)?;
        let text = |key: &str| field_text(record, key).trim().to_string();
        let date = |key: &str| parse_date(&field_text(record, key));

        Some(Self {
            serial_number,
            title: text(fields::TITLE),
            content: text(fields::CONTENT),
            classification: text(fields::CLASSIFICATION),
            start_date: date(fields::START_DATE),
            end_date: date(fields::END_DATE),
            target_content: text(fields::TARGET_CONTENT),
            excluded_target_content: text(fields::EXCLUDED_TARGET_CONTENT),
            region: text(fields::REGION),
            organization: text(fields::ORGANIZATION),
            supervising_institution: text(fields::SUPERVISOR),
            detail_url: text(fields::DETAIL_URL),
            target: text(fields::TARGET),
            business_years: text(fields::BUSINESS_YEARS),
            target_age: text(fields::TARGET_AGE),
            recruiting: text(fields::RECRUITING).eq_ignore_ascii_case("Y"),
            integrated_name: text(fields::INTEGRATED_NAME),
        })
    }

    pub fn status_on(&self, today: NaiveDate) -> RecruitmentStatus {
        match (self.start_date, self.end_date) {
            (_, Some(end)) if today > end => RecruitmentStatus::Closed,
            (Some(start), _) if today < start => RecruitmentStatus::Upcoming,
            (Some(_), Some(_)) => RecruitmentStatus::Open,
            _ => RecruitmentStatus::Unknown,
        }
    }

    /// Countdown label to the closing date: `D-day` on the day itself, `D-<n>`
    /// before it, `-` after it or when there is no closing date.
    pub fn days_remaining(&self, today: NaiveDate) -> String {
        match self.end_date {
            Some(end) if end == today => "D-day".to_string(),
            Some(end) if end > today => format!("D-{}", (end - today).num_days()),
            _ => "-".to_string(),
        }
    }
}
