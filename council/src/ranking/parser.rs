//! Extracts ordered labels and quality scores from free-form ranking
//! text produced by council models.
//!
//! Models are prompted to end with a `FINAL RANKING` block of lines
//! like `1. Response A (4/5)`, but output drifts; the parser accepts
//! a marker block first and falls back to the last contiguous run of
//! ordinal lines.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `1.`, `2)`, `#1`, `3 -`
    RE.get_or_init(|| Regex::new(r"^\s*(?:#\d+|\d+\s*[.)\-:])\s*").expect("static regex"))
}

fn label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:Response\s+)?([A-Z])\b").expect("static regex"))
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*/\s*5").expect("static regex"))
}

/// One parsed ranking line, best-first position implied by order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub label: char,
    pub score: Option<f32>,
}

/// Non-fatal issues found while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseWarning {
    /// No ranking lines found at all.
    Unparseable,
    /// Fewer labels than the ranker was shown.
    MissingLabels { found: usize, expected: usize },
    /// A score fell outside [0, 5] and was dropped.
    ScoreOutOfRange { label: char },
    /// A ranked label was not in the anonymized set shown to the ranker.
    UnknownLabel { label: char },
}

/// Parser output: ordered entries (best first) plus warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRanking {
    pub entries: Vec<RankEntry>,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedRanking {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> Vec<char> {
        self.entries.iter().map(|e| e.label).collect()
    }
}

/// Parse free-form ranking text. `expected` is the number of labels
/// the ranker was shown; finding fewer produces a warning, finding
/// none produces an empty list with [`ParseWarning::Unparseable`].
pub fn parse_ranking(text: &str, expected: usize) -> ParsedRanking {
    let cleaned = think_re().replace_all(text, "");
    let lines: Vec<&str> = cleaned.lines().collect();

    let candidates = marker_block(&lines).unwrap_or_else(|| last_ordinal_run(&lines));

    let mut entries: Vec<RankEntry> = Vec::new();
    let mut warnings = Vec::new();

    for line in candidates {
        let Some(entry) = parse_line(line, &mut warnings) else {
            continue;
        };
        if entries.iter().any(|e| e.label == entry.label) {
            continue; // keep first occurrence
        }
        entries.push(entry);
    }

    if entries.is_empty() {
        warnings.push(ParseWarning::Unparseable);
    } else if entries.len() < expected {
        warnings.push(ParseWarning::MissingLabels {
            found: entries.len(),
            expected,
        });
    }

    ParsedRanking { entries, warnings }
}

/// Render entries in the canonical block form the prompt asks for.
/// `parse_ranking(render_ranking(r), n)` returns the same entries.
pub fn render_ranking(entries: &[RankEntry]) -> String {
    let mut out = String::from("FINAL RANKING:\n");
    for (i, entry) in entries.iter().enumerate() {
        match entry.score {
            Some(score) => {
                // Trim trailing zeros so 4.0 renders as 4.
                if (score.fract()).abs() < f32::EPSILON {
                    out.push_str(&format!(
                        "{}. Response {} ({}/5)\n",
                        i + 1,
                        entry.label,
                        score as u32
                    ));
                } else {
                    out.push_str(&format!(
                        "{}. Response {} ({}/5)\n",
                        i + 1,
                        entry.label,
                        score
                    ));
                }
            }
            None => out.push_str(&format!("{}. Response {}\n", i + 1, entry.label)),
        }
    }
    out
}

fn parse_line(line: &str, warnings: &mut Vec<ParseWarning>) -> Option<RankEntry> {
    let rest = ordinal_re().find(line).map(|m| &line[m.end()..])?;
    let label = label_re()
        .captures(rest)?
        .get(1)?
        .as_str()
        .chars()
        .next()?;

    let score = score_re().captures(rest).and_then(|c| {
        let value: f32 = c.get(1)?.as_str().parse().ok()?;
        if (0.0..=5.0).contains(&value) {
            Some(value)
        } else {
            warnings.push(ParseWarning::ScoreOutOfRange { label });
            None
        }
    });

    Some(RankEntry { label, score })
}

/// Lines following an explicit `FINAL RANKING` marker, if present.
fn marker_block<'a>(lines: &[&'a str]) -> Option<Vec<&'a str>> {
    let marker = lines
        .iter()
        .rposition(|line| line.to_ascii_lowercase().contains("final ranking"))?;

    let mut block = Vec::new();

    // The marker line itself may carry the first entry
    // ("FINAL RANKING: 1. Response A ...").
    let marker_line = lines[marker];
    if let Some(idx) = marker_line.to_ascii_lowercase().find("final ranking") {
        let rest = marker_line[idx + "final ranking".len()..]
            .trim_start_matches([':', ' ', '\t']);
        if is_ranking_line(rest) {
            block.push(rest);
        }
    }

    for line in &lines[marker + 1..] {
        if is_ranking_line(line) {
            block.push(*line);
        }
    }
    Some(block)
}

/// The last contiguous run of lines that each start with an ordinal
/// and mention a label.
fn last_ordinal_run<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut best: Vec<&str> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in lines {
        if is_ranking_line(line) {
            current.push(line);
        } else if !line.trim().is_empty() {
            if !current.is_empty() {
                best = std::mem::take(&mut current);
            }
        }
        // blank lines do not break a run
    }
    if !current.is_empty() {
        best = current;
    }
    best
}

fn is_ranking_line(line: &str) -> bool {
    match ordinal_re().find(line) {
        Some(m) => label_re().is_match(&line[m.end()..]),
        None => false,
    }
}
