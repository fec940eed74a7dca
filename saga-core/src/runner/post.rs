//! Bookkeeping after an installment is accepted: fact extraction, beat
//! detection and a summary. Each step only reads the installment text, so
//! the three run concurrently. Every step is optional enrichment.

use crate::beats::BeatType;
use crate::canon::{AuthorityLevel, Fact, FactCategory, FactValue};
use crate::generation::{repair, GenerationError, GenerationRequest, GenerationSettings, Generator, Purpose};
use crate::memory::InstallmentRecord;
use crate::prompts;
use crate::text;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Longest fallback summary.
const FALLBACK_SUMMARY_CHARS: usize = 400;

/// Why a post-processing step produced nothing.
#[derive(Debug, Error)]
pub(super) enum StepError {
    #[error("{0}")]
    Generation(#[from] GenerationError),

    #[error("unparseable output")]
    Unparseable,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    subject: String,
    predicate: String,
    value: FactValue,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Items of a top-level array, or of the array under `field`.
fn entries(value: Value, field: &str) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Parse extracted facts. Malformed entries are dropped.
pub(super) fn parse_facts(raw: &str, installment: u32) -> Option<Vec<Fact>> {
    let items = entries(repair::repair_json(raw)?, "facts")?;
    let facts = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawFact>(item).ok())
        .filter(|f| !f.subject.trim().is_empty() && !f.predicate.trim().is_empty())
        .map(|f| {
            let mut fact = Fact::new(f.subject, f.predicate, f.value, AuthorityLevel::Narrated)
                .with_source(installment)
                .with_confidence(f.confidence.unwrap_or(0.8));
            if let Some(category) = f.category.and_then(|c| c.parse::<FactCategory>().ok()) {
                fact = fact.with_category(category);
            }
            fact
        })
        .collect();
    Some(facts)
}

/// Parse detected beats. Unknown names are ignored.
pub(super) fn parse_beats(raw: &str) -> Option<Vec<BeatType>> {
    let items = entries(repair::repair_json(raw)?, "beats")?;
    let mut beats: Vec<BeatType> = items
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|name| name.parse().ok())
        .collect();
    beats.sort();
    beats.dedup();
    Some(beats)
}

/// First two sentences of the text.
pub(super) fn fallback_summary(record: &InstallmentRecord) -> String {
    let lead = text::sentences(&record.text).into_iter().take(2).collect::<Vec<_>>().join(" ");
    text::truncate_chars(&lead, FALLBACK_SUMMARY_CHARS)
}

fn installment_prompt(record: &InstallmentRecord) -> String {
    format!("Installment {}: {}\n\n{}", record.number, record.title, record.text)
}

pub(super) async fn extract_facts(
    generator: &dyn Generator,
    settings: &GenerationSettings,
    record: &InstallmentRecord,
) -> Result<Vec<Fact>, StepError> {
    let request = GenerationRequest::new(Purpose::FactExtraction, prompts::FACT_EXTRACTION, installment_prompt(record))
        .with_max_output_tokens(settings.auxiliary_max_tokens)
        .with_temperature(settings.analytic_temperature);
    let raw = generator.invoke(request).await?;
    parse_facts(&raw, record.number).ok_or(StepError::Unparseable)
}

pub(super) async fn detect_beats(
    generator: &dyn Generator,
    settings: &GenerationSettings,
    record: &InstallmentRecord,
) -> Result<Vec<BeatType>, StepError> {
    let request = GenerationRequest::new(Purpose::BeatDetection, prompts::BEAT_DETECTION, installment_prompt(record))
        .with_max_output_tokens(256)
        .with_temperature(settings.analytic_temperature);
    let raw = generator.invoke(request).await?;
    parse_beats(&raw).ok_or(StepError::Unparseable)
}

pub(super) async fn summarize(
    generator: &dyn Generator,
    settings: &GenerationSettings,
    record: &InstallmentRecord,
) -> Result<String, StepError> {
    let request = GenerationRequest::new(Purpose::Summary, prompts::SUMMARY, installment_prompt(record))
        .with_max_output_tokens(settings.auxiliary_max_tokens)
        .with_temperature(settings.analytic_temperature);
    let summary = generator.invoke(request).await?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(StepError::Unparseable);
    }
    Ok(summary.to_string())
}
