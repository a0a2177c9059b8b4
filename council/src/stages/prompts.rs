//! Prompt builders for the three deliberation stages and title
//! generation.

use crate::client::ChatMessage;
use crate::ranking::AggregateScore;

const RANKER_SYSTEM: &str = r"You are a peer reviewer on a council of language models. You will see the original question and several anonymized responses to it, labeled Response A, Response B, and so on.

For EACH response, give one line of feedback and a quality rating from 1 to 5 in the form (k/5).

Then finish with a block that starts with the exact line:
FINAL RANKING:
followed by the responses ordered best to worst, one per line, like:
1. Response B (4/5)
2. Response A (3/5)

Do not rank any response that is not shown to you.";

const REFINER_SYSTEM: &str = r"You are a member of a council of language models revising your answer after anonymous peer review. You will see the original question, your previous response, and the feedback reviewers gave about it.

Write an improved response that addresses the feedback. Output only the improved response, with no preamble about the revision.";

const CHAIRMAN_SYSTEM: &str = r"You are the chairman of a council of language models. Council members drafted answers to the user's question and cross-ranked each other's drafts. You will see the final drafts with their authors and aggregate peer scores.

Synthesize the single best answer to the user's question. Use the strongest material from the drafts, correct their mistakes, and do not mention the council or the review process.";

const TITLE_SYSTEM: &str = r"Generate a short title for a conversation that starts with the message below.

Rules:
- at most 5 words
- no trailing punctuation
- no quotes
- never answer the message, only title it
- never output boilerplate like 'New Conversation' or 'Untitled'";

/// Stage-2 ranking request for one ranker over its anonymized view.
pub fn ranking_messages(query: &str, view: &[(char, &str)]) -> Vec<ChatMessage> {
    let mut body = format!("Original question:\n{}\n\n", query);
    for (label, content) in view {
        body.push_str(&format!("Response {}:\n{}\n\n", label, content));
    }
    body.push_str("Review each response, then give your FINAL RANKING block.");
    vec![ChatMessage::system(RANKER_SYSTEM), ChatMessage::user(&body)]
}

/// Refinement request: the model's own previous response plus the
/// peer feedback that was directed at it.
pub fn refinement_messages(
    query: &str,
    own_response: &str,
    feedback: &[String],
) -> Vec<ChatMessage> {
    let feedback_block = if feedback.is_empty() {
        "(no specific feedback was extracted; improve clarity and correctness)".to_string()
    } else {
        feedback
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let body = format!(
        "Original question:\n{}\n\nYour previous response:\n{}\n\nPeer feedback about your response:\n{}\n\nWrite your improved response now.",
        query, own_response, feedback_block
    );
    vec![ChatMessage::system(REFINER_SYSTEM), ChatMessage::user(&body)]
}

/// Stage-3 synthesis request with real identities and aggregate scores.
pub fn synthesis_messages(
    query: &str,
    drafts: &[(String, String)],
    aggregate: &[AggregateScore],
) -> Vec<ChatMessage> {
    let mut body = format!("User question:\n{}\n\n", query);

    for (model, content) in drafts {
        let score_note = aggregate
            .iter()
            .find(|a| &a.model == model)
            .map(|a| match a.mean_score {
                Some(score) => format!(
                    " (peer rank {:.1}, mean score {:.1}/5)",
                    a.mean_position, score
                ),
                None => format!(" (peer rank {:.1})", a.mean_position),
            })
            .unwrap_or_default();
        body.push_str(&format!("Draft from {}{}:\n{}\n\n", model, score_note, content));
    }
    body.push_str("Synthesize the single best answer to the user question.");
    vec![ChatMessage::system(CHAIRMAN_SYSTEM), ChatMessage::user(&body)]
}

/// Title-generation request over the conversation's first user message.
pub fn title_messages(first_message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(TITLE_SYSTEM),
        ChatMessage::user(first_message),
    ]
}

/// Pull the feedback lines a set of rankers directed at one label.
/// Ranking lines from the FINAL RANKING block are skipped; what is
/// left is the per-response prose feedback.
pub fn feedback_for_label(label: char, raw_rankings: &[String]) -> Vec<String> {
    let needle = format!("Response {}", label);
    let mut lines = Vec::new();
    for raw in raw_rankings {
        for line in raw.lines() {
            let trimmed = line.trim();
            if !trimmed.contains(&needle) {
                continue;
            }
            // Ranking-block lines start with an ordinal; feedback lines don't.
            if trimmed
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == '#')
            {
                continue;
            }
            lines.push(trimmed.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranking_messages_contain_view_only() {
        let view = vec![('A', "first draft"), ('B', "second draft")];
        let messages = ranking_messages("what is rust?", &view);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("Response A:\nfirst draft"));
        assert!(messages[1].content.contains("Response B:\nsecond draft"));
        assert!(!messages[1].content.contains("Response C"));
    }

    #[test]
    fn test_refinement_messages_carry_feedback() {
        let feedback = vec!["Response B misses the edge case".to_string()];
        let messages = refinement_messages("q", "my old answer", &feedback);
        assert!(messages[1].content.contains("my old answer"));
        assert!(messages[1].content.contains("misses the edge case"));
    }

    #[test]
    fn test_synthesis_messages_use_real_identities() {
        let drafts = vec![
            ("phi-4-mini".to_string(), "draft 1".to_string()),
            ("gemma-3".to_string(), "draft 2".to_string()),
        ];
        let aggregate = vec![AggregateScore {
            model: "phi-4-mini".to_string(),
            mean_position: 1.0,
            mean_score: Some(4.5),
            rankers: 2,
        }];
        let messages = synthesis_messages("q", &drafts, &aggregate);
        assert!(messages[1].content.contains("Draft from phi-4-mini"));
        assert!(messages[1].content.contains("4.5/5"));
        assert!(messages[1].content.contains("Draft from gemma-3"));
    }

    #[test]
    fn test_feedback_extraction_skips_ranking_lines() {
        let raw = vec![
            "Response A is thorough but verbose. (4/5)\nResponse B misses the point. (2/5)\nFINAL RANKING:\n1. Response A (4/5)\n2. Response B (2/5)"
                .to_string(),
        ];
        let feedback = feedback_for_label('B', &raw);
        assert_eq!(feedback, vec!["Response B misses the point. (2/5)"]);
    }

    #[test]
    fn test_title_messages_rules() {
        let messages = title_messages("How do I install docker on ubuntu?");
        assert!(messages[0].content.contains("at most 5 words"));
        assert_eq!(messages[1].content, "How do I install docker on ubuntu?");
    }
}
