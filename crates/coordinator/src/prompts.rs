//! Prompt construction for the initial description and the meta turn.
//!
//! Detail level only changes the word target; the page context text is
//! packed separately and travels next to the prompt, not inside it.

use shared::protocol::CaptureKind;
use shared::settings::UserSettings;

/// Prompt for the first answer about a screenshot or image
pub fn initial_prompt(kind: CaptureKind, user: &UserSettings, has_context: bool) -> String {
    let subject = match kind {
        CaptureKind::Screenshot => "the web page shown in this screenshot",
        CaptureKind::Image => "this image",
    };
    let context_hint = if has_context {
        "\nText extracted from the page follows the image. Use it to get names, headings and \
         numbers right, but describe what is actually visible."
    } else {
        ""
    };

    format!(
        r#"Describe {subject} for someone who cannot see it.

- Start with what it is and its purpose in one sentence.
- Then cover the most important content, layout and any text that matters.
- Use at most {max_words} words.
- Answer in the language with tag "{language}".{context_hint}"#,
        subject = subject,
        max_words = user.detail_level.max_words(),
        language = user.language,
        context_hint = context_hint,
    )
}

/// Synthetic follow-up asking for a title and suggested questions in one turn
pub fn meta_prompt(language: &str, max_actions: usize) -> String {
    format!(
        r#"Based on your description, reply with exactly two lines and nothing else:
perceptaTitle: "<a short title for this conversation, at most 6 words>"
perceptaActions: [<up to {max_actions} short follow-up questions the user might ask, as quoted strings>]
Write the title and questions in the language with tag "{language}"."#,
        max_actions = max_actions,
        language = language,
    )
}
