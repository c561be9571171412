//! Prompt assembly for section generation.
//!
//! Two context strategies exist on purpose: single-section regeneration sees
//! the current content of every *other* section (so an edit stays coherent
//! with the whole draft), while whole-document generation walks sections in
//! order and shows each one only the already-generated text of its
//! predecessors (a left-to-right, context-accumulating draft).

/// Default system instruction for the drafting model.
pub const SYSTEM_PROMPT: &str = "You are an expert writer of structured project documents. \
Generate professional, cohesive content in a formal tone. Ground every claim in the provided \
Knowledge Base sources and, when necessary, web search results. Cite sources inline with \
markers like [1], [2]. Use markdown formatting, especially for tables \
(e.g., | Column1 | Column2 |), and keep terminology consistent across sections.";

/// Prompt for regenerating one section with full sibling context.
pub fn section_prompt(
    document_title: &str,
    section_title: &str,
    siblings: &[(String, String)],
    instruction: Option<&str>,
) -> String {
    let sibling_context = siblings
        .iter()
        .map(|(title, content)| format!("## {title}\n{content}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Document title: {document_title}\n\
         Existing content from other sections:\n{sibling_context}\n\n\
         Now regenerate the section '{section_title}'. {}\n\
         Ensure markdown formatting for tables if the template calls for them.",
        instruction.unwrap_or("Draft content for this section."),
    )
}

/// Prompt for section *i* of a sequential whole-document draft.
///
/// `prior` holds only the already-generated content of sections before this
/// one; later sections must never appear here.
pub fn sequential_prompt(
    document_title: &str,
    section_title: &str,
    prior: &str,
    instruction: Option<&str>,
) -> String {
    format!(
        "You are drafting '{document_title}'.\n\n\
         Previously written sections:\n{}\n\n\
         Now generate the next section: '{section_title}'.\n\
         Follow template requirements, preserve markdown tables, use inline citations [1], [2].\n\n{}",
        if prior.is_empty() { "None yet" } else { prior },
        instruction.unwrap_or(""),
    )
}

/// Rolling-context entry appended after a section commits.
pub fn prior_context_entry(section_title: &str, content: &str) -> String {
    format!("\n\n## {section_title}\n{content}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_prompt_includes_siblings_and_instruction() {
        let siblings = vec![("Background".to_string(), "Context text.".to_string())];
        let prompt = section_prompt("Plan", "Budget", &siblings, Some("Keep it short."));
        assert!(prompt.contains("## Background"));
        assert!(prompt.contains("regenerate the section 'Budget'"));
        assert!(prompt.contains("Keep it short."));
    }

    #[test]
    fn sequential_prompt_marks_empty_prior_context() {
        let prompt = sequential_prompt("Plan", "Introduction", "", None);
        assert!(prompt.contains("None yet"));
        let later = sequential_prompt("Plan", "Budget", "## Introduction\ntext", None);
        assert!(later.contains("## Introduction"));
        assert!(!later.contains("None yet"));
    }
}
