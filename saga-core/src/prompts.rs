//! System prompts for each kind of generation call.

pub const STORY_PLAN: &str = include_str!("prompts/story_plan.txt");
pub const CONSTRAINT_EXTRACTION: &str = include_str!("prompts/constraint_extraction.txt");
pub const INSTALLMENT: &str = include_str!("prompts/installment.txt");
pub const REWRITE: &str = include_str!("prompts/rewrite.txt");
pub const FACT_EXTRACTION: &str = include_str!("prompts/fact_extraction.txt");
pub const BEAT_DETECTION: &str = include_str!("prompts/beat_detection.txt");
pub const SUMMARY: &str = include_str!("prompts/summary.txt");
pub const SYNOPSIS_UPDATE: &str = include_str!("prompts/synopsis_update.txt");
pub const BIBLE_REFRESH: &str = include_str!("prompts/bible_refresh.txt");
