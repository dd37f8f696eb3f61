/// Drives a [`PageSource`] across every page of a result set.
///
/// The first page decides how many pages exist. Pages are then requested one at a
/// time, in order, never twice. A failure after the first page ends collection but
/// keeps what was already gathered.
use tracing::{info, warn};

use crate::fetch::{FetchError, PageRequest, PageSource, RawEnvelope};
use crate::record::RawRecord;

/// The first page plus the pagination facts derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub items: Vec<RawRecord>,
    /// Matches reported by upstream, before any cap.
    pub match_count: u64,
    pub total_pages: u32,
}

impl PageResult {
    pub fn from_envelope(envelope: RawEnvelope, per_page: u32, item_cap: Option<usize>) -> Self {
        let match_count = envelope.match_count();
        let total_pages = if envelope.is_single_page() {
            u32::from(match_count > 0)
        } else {
            let effective = match item_cap {
                Some(cap) if match_count > cap as u64 => {
                    info!(match_count, cap, "item cap active, clamping match count");
                    cap as u64
                }
                _ => match_count,
            };
            let pages = effective.div_ceil(u64::from(per_page.max(1)));
            u32::try_from(pages).unwrap_or(u32::MAX)
        };

        Self {
            items: envelope.into_items(),
            match_count,
            total_pages,
        }
    }
}

/// Everything gathered by one pagination run.
#[derive(Debug)]
pub struct Collected {
    /// All items, first page first, in fetch order. Never deduplicated.
    pub items: Vec<RawRecord>,
    pub match_count: u64,
    pub total_pages: u32,
    pub pages_fetched: u32,
    /// The error that cut collection short, if any page after the first failed.
    pub interrupted: Option<FetchError>,
}

pub struct PaginationDriver<'a> {
    source: &'a dyn PageSource,
    item_cap: Option<usize>,
}

impl<'a> PaginationDriver<'a> {
    pub fn new(source: &'a dyn PageSource) -> Self {
        Self {
            source,
            item_cap: None,
        }
    }

    /// Limit the total number of items returned (capped/debug mode).
    pub fn with_item_cap(mut self, item_cap: Option<usize>) -> Self {
        self.item_cap = item_cap;
        self
    }

    /// Fetch `base` and every following page it implies.
    ///
    /// Returns an error only when the first page cannot be fetched; that is the
    /// "no data at all" case the caller reports separately.
    pub async fn collect(&self, base: &PageRequest) -> Result<Collected, FetchError> {
        let first = self.source.fetch(base).await?;
        let first = PageResult::from_envelope(first, base.per_page, self.item_cap);
        info!(
            match_count = first.match_count,
            total_pages = first.total_pages,
            first_page_items = first.items.len(),
            "pagination planned"
        );

        if first.match_count == 0 {
            info!("no announcements matched the query");
            return Ok(Collected {
                items: Vec::new(),
                match_count: 0,
                total_pages: 0,
                pages_fetched: 1,
                interrupted: None,
            });
        }

        let mut items = first.items;
        if let Some(cap) = self.item_cap {
            if items.len() > cap {
                warn!(cap, page_items = items.len(), "truncating first page to item cap");
                items.truncate(cap);
            }
        }

        let mut pages_fetched = 1;
        let mut interrupted = None;

        for page in base.page.saturating_add(1)..=first.total_pages {
            if let Some(cap) = self.item_cap {
                if items.len() >= cap {
                    warn!(cap, "item cap reached, not fetching further pages");
                    break;
                }
            }

            let mut page_items = match self.source.fetch(&base.at_page(page)).await {
                Ok(envelope) => envelope.into_items(),
                Err(e) => {
                    warn!(
                        page,
                        collected = items.len(),
                        error = %e,
                        "page fetch failed, keeping items collected so far"
                    );
                    interrupted = Some(e);
                    break;
                }
            };
            pages_fetched += 1;
            info!(page, page_items = page_items.len(), "fetched additional page");

            if let Some(cap) = self.item_cap {
                let remaining = cap.saturating_sub(items.len());
                if page_items.len() >= remaining {
                    if page_items.len() > remaining {
                        warn!(page, remaining, "truncating page to item cap");
                    }
                    page_items.truncate(remaining);
                    items.extend(page_items);
                    break;
                }
            }
            items.extend(page_items);
        }

        info!(
            items = items.len(),
            pages_fetched,
            total_pages = first.total_pages,
            "pagination finished"
        );

        Ok(Collected {
            items,
            match_count: first.match_count,
            total_pages: first.total_pages,
            pages_fetched,
            interrupted,
        })
    }
}
