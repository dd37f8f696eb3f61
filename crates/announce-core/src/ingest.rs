/// One ingestion run end to end: collect every page, drop what is already stored,
/// optionally filter by a natural-language condition, and hand back typed
/// announcements.
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::announcement::{Announcement, RecruitmentStatus};
use crate::backend::{BackendFactory, DEFAULT_CHOICE};
use crate::config::{AiConfig, UpstreamConfig};
use crate::fetch::{FetchError, PageSource, SearchFilters};
use crate::filter::filter_records;
use crate::paginate::PaginationDriver;
use crate::record::{serial_number, RawRecord};

/// Reports which serial numbers are already stored.
#[async_trait]
pub trait KnownSerials: Send + Sync {
    /// The subset of `serials` that is already known.
    async fn known_among(&self, serials: &[String]) -> HashSet<String>;
}

#[async_trait]
impl KnownSerials for HashSet<String> {
    async fn known_among(&self, serials: &[String]) -> HashSet<String> {
        serials
            .iter()
            .filter(|sn| self.contains(*sn))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub filters: SearchFilters,
    pub per_page: u32,
    pub item_cap: Option<usize>,
    /// Natural-language condition. Blank or absent means no AI filtering.
    pub condition: Option<String>,
    /// Backend choice token, e.g. `gemini-2.0-flash-lite`.
    pub choice: String,
    pub chunk_size: usize,
    /// Reference day for recruitment status and countdown labels.
    pub today: NaiveDate,
}

impl IngestRequest {
    pub fn new(upstream: &UpstreamConfig, ai: &AiConfig) -> Self {
        Self {
            filters: SearchFilters::default(),
            per_page: upstream.per_page,
            item_cap: upstream.item_cap,
            condition: None,
            choice: DEFAULT_CHOICE.to_string(),
            chunk_size: ai.chunk_size,
            today: chrono::Local::now().date_naive(),
        }
    }
}

/// What happened to the AI filtering step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Filtering {
    NotRequested,
    Applied {
        choice: String,
        chunks: usize,
        failed_chunks: Vec<usize>,
    },
    /// The backend could not be used at all; candidates were passed through unfiltered.
    Unavailable { reason: String },
}

/// An announcement as reported, with its recruitment state on the run's reference day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedAnnouncement {
    #[serde(flatten)]
    pub announcement: Announcement,
    pub status: RecruitmentStatus,
    pub days_remaining: String,
}

impl ListedAnnouncement {
    fn on(announcement: Announcement, today: NaiveDate) -> Self {
        Self {
            status: announcement.status_on(today),
            days_remaining: announcement.days_remaining(today),
            announcement,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub match_count: u64,
    pub total_fetched: usize,
    /// Fetched records with a serial number that is not already stored.
    pub candidate_count: usize,
    pub filtering: Filtering,
    pub serial_numbers: Vec<String>,
    pub announcements: Vec<ListedAnnouncement>,
    /// Why collection stopped early, if a page after the first failed.
    pub interrupted: Option<String>,
}

pub async fn ingest(
    source: &dyn PageSource,
    known: &dyn KnownSerials,
    backends: &dyn BackendFactory,
    request: &IngestRequest,
) -> Result<IngestReport, FetchError> {
    let collected = PaginationDriver::new(source)
        .with_item_cap(request.item_cap)
        .collect(&request.filters.to_request(request.per_page))
        .await?;
    let total_fetched = collected.items.len();

    let fetched: Vec<String> = collected.items.iter().filter_map(serial_number).collect();
    let stored = known.known_among(&fetched).await;
    let candidates: Vec<RawRecord> = collected
        .items
        .into_iter()
        .filter(|r| serial_number(r).is_some_and(|sn| !stored.contains(&sn)))
        .collect();
    info!(
        total_fetched,
        without_serial = total_fetched - fetched.len(),
        already_stored = stored.len(),
        candidates = candidates.len(),
        "selected new announcements"
    );
    let candidate_count = candidates.len();

    let condition = request
        .condition
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    let (filtering, selected) = match condition {
        None => (Filtering::NotRequested, candidates),
        Some(condition) => {
            match filter_records(
                backends,
                candidates.clone(),
                condition,
                &request.choice,
                request.chunk_size,
            )
            .await
            {
                Ok(outcome) => {
                    let filtering = Filtering::Applied {
                        choice: request.choice.clone(),
                        chunks: outcome.chunks_attempted(),
                        failed_chunks: outcome.failed_chunks().to_vec(),
                    };
                    (filtering, outcome.into_parts().0)
                }
                Err(e) => {
                    warn!(
                        choice = %request.choice,
                        error = %e,
                        "AI filtering unavailable, returning unfiltered candidates"
                    );
                    (Filtering::Unavailable { reason: e.to_string() }, candidates)
                }
            }
        }
    };

    let announcements: Vec<ListedAnnouncement> = selected
        .iter()
        .filter_map(Announcement::from_raw)
        .map(|a| ListedAnnouncement::on(a, request.today))
        .collect();
    let serial_numbers = announcements
        .iter()
        .map(|a| a.announcement.serial_number.clone())
        .collect();
    info!(announcements = announcements.len(), "ingestion finished");

    Ok(IngestReport {
        match_count: collected.match_count,
        total_fetched,
        candidate_count,
        filtering,
        serial_numbers,
        announcements,
        interrupted: collected.interrupted.map(|e| e.to_string()),
    })
}
