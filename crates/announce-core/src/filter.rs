/// Natural-language filtering of announcement records through an AI backend.
///
/// Records are cut into fixed-size chunks by position. Each chunk is summarised,
/// embedded in one prompt together with the user's condition, and sent to the
/// backend on its own. The identifiers that come back are matched against that
/// chunk's records only.
///
/// A chunk whose backend call fails contributes nothing and the run carries on.
/// A configuration error (bad or missing credential) ends the run, since no later
/// chunk could succeed either.
use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::backend::{BackendChoice, BackendFactory, Classifier, Identifier};
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{ClassifyError, ConfigurationError};
use crate::merge::{FilterOutcome, ResultMerger};
use crate::record::{serial_number, RawRecord, RecordSummary};

/// A contiguous slice of the candidate list, classified as one unit.
#[derive(Debug, Clone, Copy)]
pub struct FilterChunk<'a> {
    pub index: usize,
    pub records: &'a [RawRecord],
}

/// Split `records` into order-preserving chunks of at most `chunk_size` records.
pub fn partition(records: &[RawRecord], chunk_size: usize) -> impl Iterator<Item = FilterChunk<'_>> {
    records
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, records)| FilterChunk { index, records })
}

pub fn build_prompt(condition: &str, summaries: &[RecordSummary]) -> String {
    let listing = serde_json::to_string_pretty(summaries).unwrap_or_default();
    format!(
        "You are an expert grant advisor helping a founder filter startup grant announcements.\n\
Below are announcements and the founder's condition for what they are looking for.\n\n\
Condition: {condition}\n\n\
Announcements:\n{listing}\n\n\
Check every announcement against the condition. Respond with a JSON object only, listing the \
`serial_number` values of the announcements that match, in this format:\n\
{{\"serial_numbers\": [\"175034\", \"175102\"]}}\n\
If nothing matches, respond with {{\"serial_numbers\": []}}."
    )
}

/// Maps backend identifiers back to positions within one chunk.
struct ChunkResolver<'a> {
    chunk: FilterChunk<'a>,
    serials: Vec<String>,
    positions: HashMap<String, usize>,
}

impl<'a> ChunkResolver<'a> {
    fn new(chunk: FilterChunk<'a>) -> Self {
        let serials: Vec<String> = chunk
            .records
            .iter()
            .map(|r| serial_number(r).unwrap_or_default())
            .collect();
        let mut positions = HashMap::with_capacity(serials.len());
        for (i, sn) in serials.iter().enumerate() {
            positions.entry(sn.clone()).or_insert(i);
        }
        Self {
            chunk,
            serials,
            positions,
        }
    }

    /// An integer inside the chunk bounds is a legacy positional index. Anything
    /// else is a serial number.
    fn resolve(&self, id: &Identifier) -> Option<usize> {
        match id {
            Identifier::Integer(n) => usize::try_from(*n)
                .ok()
                .filter(|&i| i < self.chunk.records.len())
                .or_else(|| self.lookup(&n.to_string())),
            Identifier::Text(s) => self.lookup(s.trim()),
        }
    }

    /// Exact serial match first, then numeric equality for serials that are
    /// numbers written differently (`"0175"` vs `175`).
    fn lookup(&self, serial: &str) -> Option<usize> {
        if let Some(&i) = self.positions.get(serial) {
            return Some(i);
        }
        let wanted: i64 = serial.parse().ok()?;
        self.serials
            .iter()
            .position(|sn| sn.parse::<i64>().ok() == Some(wanted))
    }
}

/// Resolve a backend's identifiers against one chunk, in response order.
/// Unresolvable identifiers are logged and skipped; repeats resolve once.
pub fn resolve_identifiers(chunk: FilterChunk<'_>, ids: &[Identifier]) -> Vec<(RawRecord, String)> {
    let resolver = ChunkResolver::new(chunk);
    let mut seen = HashSet::new();
    let mut matched = Vec::new();

    for id in ids {
        match resolver.resolve(id) {
            Some(pos) => {
                if seen.insert(pos) {
                    matched.push((chunk.records[pos].clone(), resolver.serials[pos].clone()));
                } else {
                    debug!(chunk = chunk.index, identifier = ?id, "identifier repeated, ignoring");
                }
            }
            None => warn!(chunk = chunk.index, identifier = ?id, "could not resolve identifier"),
        }
    }
    matched
}

pub struct RecordFilter<'a> {
    classifier: &'a dyn Classifier,
    model: String,
    chunk_size: usize,
}

impl<'a> RecordFilter<'a> {
    pub fn new(classifier: &'a dyn Classifier, model: impl Into<String>) -> Self {
        Self {
            classifier,
            model: model.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Filter `records` against `condition`, one chunk at a time, in order.
    pub async fn run(
        &self,
        records: Vec<RawRecord>,
        condition: &str,
    ) -> Result<FilterOutcome, ConfigurationError> {
        let total = records.len();
        let candidates: Vec<RawRecord> = records
            .into_iter()
            .filter(|r| serial_number(r).is_some())
            .collect();
        if candidates.len() < total {
            warn!(
                excluded = total - candidates.len(),
                "excluding records without a serial number"
            );
        }
        if candidates.is_empty() {
            info!("no records to filter");
            return Ok(FilterOutcome::default());
        }

        info!(
            records = candidates.len(),
            chunks = candidates.len().div_ceil(self.chunk_size),
            chunk_size = self.chunk_size,
            platform = %self.classifier.platform(),
            model = %self.model,
            "starting AI filtering"
        );

        let mut merger = ResultMerger::new();
        for chunk in partition(&candidates, self.chunk_size) {
            let summaries: Vec<RecordSummary> =
                chunk.records.iter().map(RecordSummary::from_record).collect();
            let prompt = build_prompt(condition, &summaries);
            debug!(
                chunk = chunk.index,
                records = chunk.records.len(),
                prompt_chars = prompt.len(),
                "classifying chunk"
            );

            match self.classifier.classify(&prompt, &self.model).await {
                Ok(ids) => {
                    let matched = resolve_identifiers(chunk, &ids);
                    info!(
                        chunk = chunk.index,
                        returned = ids.len(),
                        matched = matched.len(),
                        "chunk classified"
                    );
                    for (record, sn) in matched {
                        merger.push(record, sn);
                    }
                    merger.finish_chunk(chunk.index, true);
                }
                Err(ClassifyError::Configuration(e)) => {
                    error!(chunk = chunk.index, error = %e, "configuration error, aborting filtering");
                    return Err(e);
                }
                Err(ClassifyError::Backend(e)) => {
                    warn!(chunk = chunk.index, error = %e, "chunk classification failed, skipping chunk");
                    merger.finish_chunk(chunk.index, false);
                }
            }
        }

        let outcome = merger.finish();
        if outcome.is_empty() {
            warn!(
                chunks = outcome.chunks_attempted(),
                failed_chunks = outcome.failed_chunks().len(),
                "AI filtering matched no announcements"
            );
        } else {
            info!(
                matched = outcome.len(),
                chunks = outcome.chunks_attempted(),
                failed_chunks = outcome.failed_chunks().len(),
                "AI filtering finished"
            );
        }
        Ok(outcome)
    }
}

/// Select a backend from a `platform-modelVariant` choice and filter `records` with it.
///
/// The backend is resolved before anything else, so an unsupported choice or a
/// missing credential fails the whole call up front.
pub async fn filter_records(
    backends: &dyn BackendFactory,
    records: Vec<RawRecord>,
    condition: &str,
    choice: &str,
    chunk_size: usize,
) -> Result<FilterOutcome, ConfigurationError> {
    let choice = BackendChoice::parse(choice)?;
    let classifier = backends.build(choice.platform)?;
    RecordFilter::new(classifier.as_ref(), choice.model)
        .with_chunk_size(chunk_size)
        .run(records, condition)
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::AiConfig;
    use crate::error::BackendError;
    use crate::record::field_text;
    use crate::testing::{numbered_records, record_with_serial, ScriptedClassifier};

    fn abc() -> Vec<RawRecord> {
        ["A", "B", "C"].into_iter().map(record_with_serial).collect()
    }

    #[test]
    fn test_partition_counts() {
        for (len, expected) in [(0, 0), (1, 1), (50, 1), (151, 4)] {
            assert_eq!(partition(&numbered_records(len), 50).count(), expected, "{len}");
        }
    }

    #[test]
    fn test_partition_is_exhaustive_and_ordered() {
        for len in 0..=200 {
            let records = numbered_records(len);
            let chunks: Vec<_> = partition(&records, 50).collect();
            let rebuilt: Vec<RawRecord> = chunks
                .iter()
                .flat_map(|c| c.records.iter().cloned())
                .collect();
            assert_eq!(rebuilt, records, "{len}");
            assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
            assert!(chunks.iter().all(|c| !c.records.is_empty() && c.records.len() <= 50));
        }
    }

    #[test]
    fn test_resolve_serial_numbers_in_response_order() {
        let records = abc();
        let chunk = partition(&records, 50).next().unwrap();
        let matched = resolve_identifiers(
            chunk,
            &[
                Identifier::Text("C".to_string()),
                Identifier::Text("A".to_string()),
            ],
        );
        let serials: Vec<_> = matched.iter().map(|(_, sn)| sn.as_str()).collect();
        assert_eq!(serials, vec!["C", "A"]);
        assert_eq!(matched[0].0, records[2]);
    }

    #[test]
    fn test_resolve_numeric_serials() {
        let records: Vec<RawRecord> = [json!({"pbanc_sn": 175034}), json!({"pbanc_sn": "0175102"})]
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect();
        let chunk = partition(&records, 50).next().unwrap();

        let matched = resolve_identifiers(
            chunk,
            &[
                Identifier::Integer(175102),
                Identifier::Text(" 175034 ".to_string()),
                Identifier::Integer(1),
            ],
        );
        let serials: Vec<_> = matched.iter().map(|(_, sn)| sn.as_str()).collect();
        // The trailing `1` is an in-bounds index that repeats the first match.
        assert_eq!(serials, vec!["0175102", "175034"]);
    }

    #[test]
    fn test_unresolvable_identifiers_are_skipped() {
        let records = abc();
        let chunk = partition(&records, 50).next().unwrap();
        let matched = resolve_identifiers(
            chunk,
            &[
                Identifier::Text("Z".to_string()),
                Identifier::Integer(-1),
                Identifier::Integer(3),
                Identifier::Text("B".to_string()),
            ],
        );
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].1, "B");
    }

    #[test]
    fn test_prompt_carries_condition_and_summaries_only() {
        let mut record = record_with_serial("175034");
        record.insert("biz_pbanc_nm".into(), json!("Seoul seed fund"));
        record.insert("detl_pg_url".into(), json!("https://example.org/secret-detail"));
        let summaries = vec![RecordSummary::from_record(&record)];

        let prompt = build_prompt("pre-founders in Seoul", &summaries);
        assert!(prompt.contains("Condition: pre-founders in Seoul"));
        assert!(prompt.contains("\"serial_number\": \"175034\""));
        assert!(prompt.contains("Seoul seed fund"));
        assert!(!prompt.contains("secret-detail"));
    }

    #[tokio::test]
    async fn test_serial_number_response() {
        let classifier = ScriptedClassifier::answering(json!({"serial_numbers": ["A", "C"]}));
        let outcome = RecordFilter::new(&classifier, "m").run(abc(), "x").await.unwrap();

        let records = abc();
        let (matched, serials) = outcome.into_parts();
        assert_eq!(serials, vec!["A", "C"]);
        assert_eq!(matched, vec![records[0].clone(), records[2].clone()]);
    }

    #[tokio::test]
    async fn test_legacy_index_response() {
        let classifier = ScriptedClassifier::answering(json!({"indices": [0, 2]}));
        let outcome = RecordFilter::new(&classifier, "m").run(abc(), "x").await.unwrap();

        let records = abc();
        let (matched, serials) = outcome.into_parts();
        assert_eq!(serials, vec!["A", "C"]);
        assert_eq!(matched, vec![records[0].clone(), records[2].clone()]);
    }

    #[tokio::test]
    async fn test_empty_input_never_calls_backend() {
        let classifier = ScriptedClassifier::answering(json!({"serial_numbers": ["A"]}));
        let outcome = RecordFilter::new(&classifier, "m").run(Vec::new(), "x").await.unwrap();
        assert!(outcome.is_empty());
        assert!(outcome.serial_numbers().is_empty());
        assert_eq!(classifier.calls(), 0);

        let unnumbered = vec![json!({"biz_pbanc_nm": "no serial"}).as_object().cloned().unwrap()];
        let outcome = RecordFilter::new(&classifier, "m").run(unnumbered, "x").await.unwrap();
        assert!(outcome.is_empty());
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_later_chunks() {
        // Every chunk answers with all of its own serials, except the second.
        let classifier = ScriptedClassifier::from_fn(|call, prompt| {
            if call == 1 {
                return Err(BackendError::Upstream {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "overloaded".to_string(),
                }
                .into());
            }
            Ok(serials_in_prompt(prompt)
                .into_iter()
                .map(Identifier::Text)
                .collect())
        });

        let records = numbered_records(151);
        let outcome = RecordFilter::new(&classifier, "m")
            .with_chunk_size(50)
            .run(records.clone(), "x")
            .await
            .unwrap();

        assert_eq!(classifier.calls(), 4);
        assert_eq!(outcome.failed_chunks(), &[1]);
        assert_eq!(outcome.len(), outcome.serial_numbers().len());
        assert_eq!(outcome.len(), 101);

        let expected: Vec<String> = records[..50]
            .iter()
            .chain(&records[100..])
            .map(|r| field_text(r, "pbanc_sn"))
            .collect();
        assert_eq!(outcome.serial_numbers(), expected.as_slice());
    }

    #[tokio::test]
    async fn test_malformed_responses_yield_nothing_for_that_chunk() {
        let classifier = ScriptedClassifier::from_fn(|call, _| match call {
            0 => Err(BackendError::MalformedResponse("not json".into()).into()),
            _ => Ok(vec![Identifier::Integer(0)]),
        });
        let outcome = RecordFilter::new(&classifier, "m")
            .with_chunk_size(2)
            .run(abc(), "x")
            .await
            .unwrap();
        assert_eq!(outcome.serial_numbers(), &["C".to_string()]);
        assert_eq!(outcome.chunks_attempted(), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_aborts_run() {
        let classifier = ScriptedClassifier::from_fn(|call, _| match call {
            0 => Ok(vec![Identifier::Integer(0)]),
            _ => Err(ConfigurationError::RejectedCredential {
                platform: "openai".into(),
                status: reqwest::StatusCode::UNAUTHORIZED,
            }
            .into()),
        });
        let result = RecordFilter::new(&classifier, "m")
            .with_chunk_size(1)
            .run(abc(), "x")
            .await;

        assert!(matches!(
            result,
            Err(ConfigurationError::RejectedCredential { .. })
        ));
        assert_eq!(classifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_up_front() {
        let config = AiConfig::default();
        let result = filter_records(&config, abc(), "x", "openai-gpt-4o-mini", 50).await;
        assert!(matches!(
            result,
            Err(ConfigurationError::MissingCredential { env_var: "OPENAI_API_KEY", .. })
        ));

        let result = filter_records(&config, Vec::new(), "x", "gemini-2.0-flash-lite", 50).await;
        assert!(matches!(
            result,
            Err(ConfigurationError::MissingCredential { env_var: "GEMINI_API_KEY", .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_backend_is_rejected() {
        let result = filter_records(&AiConfig::default(), abc(), "x", "claude-3-haiku", 50).await;
        assert!(matches!(
            result,
            Err(ConfigurationError::UnsupportedBackend { .. })
        ));
    }

    fn serials_in_prompt(prompt: &str) -> Vec<String> {
        prompt
            .lines()
            .filter_map(|line| line.trim().strip_prefix("\"serial_number\": \""))
            .map(|rest| rest.trim_end_matches(['"', ',']).to_string())
            .collect()
    }
}
