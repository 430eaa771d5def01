//! Backend-specific prompt rewrites.
//!
//! Each transform is independent and records a short before/after sample so callers can
//! see what changed without logging whole prompts.

use crate::context::ConversationContext;
use crate::types::{AppliedTransform, CapabilityDescriptor, PromptOptimization, TokenEstimator};

use super::dialect::{PromptProfile, StructureStyle};

pub const CONTEXT_SUMMARY: &str = "context_summary";
pub const STRUCTURE_MARKERS: &str = "structure_markers";
pub const TRUNCATE: &str = "truncate";

const SAMPLE_CHARS: usize = 80;
const TRUNCATION_MARKER: &str = "\n[truncated]";

fn sample(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(SAMPLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn record(applied: &mut Vec<AppliedTransform>, name: &str, before: &str, after: &str) {
    applied.push(AppliedTransform {
        name: name.to_string(),
        before: sample(before),
        after: sample(after),
    });
}

fn is_structured(text: &str, style: StructureStyle) -> bool {
    match style {
        StructureStyle::Xml => text.trim_start().starts_with('<'),
        StructureStyle::Markdown => text.trim_start().starts_with('#'),
    }
}

/// Applies, in order: context summary injection (backends without system messages only),
/// structure markers for multi-part prompts and truncation to the backend's prompt budget.
pub fn optimize_prompt(
    text: &str,
    context: Option<&ConversationContext>,
    profile: PromptProfile,
    capabilities: &CapabilityDescriptor,
    estimator: &TokenEstimator,
) -> PromptOptimization {
    let mut applied = Vec::new();
    let mut current = text.to_string();

    // backends with a system role get the summary there instead
    let inline_summary = !capabilities.supports_system_messages;
    if let Some(summary) = context
        .and_then(|ctx| ctx.branch_summary.as_deref())
        .filter(|_| inline_summary)
    {
        if !summary.trim().is_empty() && !current.contains(summary) {
            let next = match profile.structure {
                StructureStyle::Xml => format!("<context>{summary}</context>\n\n{current}"),
                StructureStyle::Markdown => format!("Context: {summary}\n\n{current}"),
            };
            record(&mut applied, CONTEXT_SUMMARY, &current, &next);
            current = next;
        }
    }

    if current.contains("\n\n") && !is_structured(text, profile.structure) {
        let next = match profile.structure {
            StructureStyle::Xml => format!("<request>\n{current}\n</request>"),
            StructureStyle::Markdown => format!("## Request\n\n{current}"),
        };
        record(&mut applied, STRUCTURE_MARKERS, &current, &next);
        current = next;
    }

    let budget_tokens = capabilities.max_context_tokens as usize
        * usize::from(profile.prompt_budget_percent)
        / 100;
    if estimator.estimate_text(&current) > budget_tokens {
        let keep = estimator
            .chars_for_tokens(budget_tokens)
            .saturating_sub(TRUNCATION_MARKER.len());
        let mut next: String = current.chars().take(keep).collect();
        next.push_str(TRUNCATION_MARKER);
        record(&mut applied, TRUNCATE, &current, &next);
        current = next;
    }

    PromptOptimization {
        optimized_text: current,
        applied,
    }
}
