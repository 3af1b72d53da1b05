//! System prompts for VLM-based page classification and recipe extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing the extraction contract (a new
//!    field, a different continuation rule) requires editing exactly one
//!    place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without
//!    spinning up a real VLM, making contract regressions easy to catch.
//!
//! Callers can override the default via
//! [`crate::config::ExtractionConfig::system_prompt`]; the constants here
//! are used only when no override is provided.

/// Default system prompt for classifying a cookbook page image and
/// extracting any recipes on it.
///
/// The model must answer with strict JSON matching
/// [`crate::model::PageOutcome`]'s wire shape; anything else is treated as
/// a failed attempt and retried.
pub const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You are an expert cookbook digitiser. You are shown one scanned page of a printed cookbook. Decide whether the page contains recipe content and, if so, extract every recipe on it.

Respond with ONLY a JSON object, no commentary, no markdown fences.

If the page contains no recipe (cover, table of contents, photo spread, advertisement, index, essay):
{"kind": "non_recipe", "category": "table_of_contents" | "photo" | "advertisement" | "index" | "other"}

If the page contains one or more recipes:
{"kind": "recipe", "recipes": [{
  "title": string,
  "ingredients": [{"name": string, "quantity": string|null, "unit": string|null}],
  "instructions": [{"step": number, "text": string, "minutes": number|null, "temperature": string|null}],
  "nutrition": {"calories": number|null, "protein_g": number|null, "fat_g": number|null, "carbs_g": number|null} | null,
  "dietary_flags": [string],
  "confidence": number,
  "continuation": boolean
}]}

Rules:
1. Extract ALL recipes on the page — two recipes per page is common.
2. Transcribe ingredient names exactly as printed; put amounts in quantity/unit.
3. Number instruction steps in reading order, starting at 1.
4. dietary_flags: only well-supported labels such as "vegetarian", "vegan", "gluten_free", "dairy_free".
5. confidence is your 0.0-1.0 estimate that the extraction is faithful to the page. Use lower values for smudged scans, handwriting, or cropped text.
6. continuation: true ONLY when this page merely continues a recipe begun on an earlier page (see the context message). Use the SAME title as the earlier page and include only what this page adds.
7. Estimate nutrition per serving only when the page prints it or the ingredients make a confident estimate possible; otherwise use null."#;

/// Build the context message describing recently processed pages, used for
/// multi-page recipe stitching.
///
/// Sent as a separate system message so the contract prompt stays byte-stable
/// across pages (provider-side prompt caching).
pub fn recent_pages_context(summaries: &[(u32, Vec<String>)]) -> String {
    let mut context = String::from("Recently processed pages of this cookbook:\n");
    for (page, titles) in summaries {
        if titles.is_empty() {
            context.push_str(&format!("- page {page}: no recipe content\n"));
        } else {
            context.push_str(&format!("- page {page}: {}\n", titles.join("; ")));
        }
    }
    context.push_str(
        "\nIf the current page only continues one of these recipes (more steps, \
         remaining ingredients), return it with continuation: true and the same title.",
    );
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_prompt_names_both_kinds() {
        assert!(CLASSIFIER_SYSTEM_PROMPT.contains("\"non_recipe\""));
        assert!(CLASSIFIER_SYSTEM_PROMPT.contains("\"recipe\""));
        assert!(CLASSIFIER_SYSTEM_PROMPT.contains("continuation"));
    }

    #[test]
    fn context_lists_pages_and_titles() {
        let ctx = recent_pages_context(&[
            (4, vec!["Beef Wellington".into()]),
            (5, vec![]),
        ]);
        assert!(ctx.contains("page 4: Beef Wellington"));
        assert!(ctx.contains("page 5: no recipe content"));
        assert!(ctx.contains("continuation: true"));
    }
}
