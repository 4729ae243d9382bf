use serde::{Deserialize, Serialize};

/// One timed line of spoken content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A concept the analysis provider saw mentioned at a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMention {
    pub label: String,
    pub timestamp: f64,
}

/// Transcript of one segment as returned by content analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub lines: Vec<TranscriptLine>,
    #[serde(default)]
    pub key_concepts: Vec<ConceptMention>,
    #[serde(default)]
    pub synopsis: Option<String>,
}

impl Transcript {
    /// True when at least one line carries real words, not just
    /// whitespace, punctuation or `[music]`-style annotations.
    pub fn has_spoken_content(&self) -> bool {
        self.lines.iter().any(|line| is_spoken(&line.text))
    }

    /// All spoken text joined with single spaces.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .filter(|l| is_spoken(&l.text))
            .map(|l| l.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spoken text of lines that end inside `[end - window, end]`.
    pub fn trailing(&self, end: f64, window: f64) -> String {
        let cutoff = end - window;
        self.lines
            .iter()
            .filter(|l| l.end > cutoff && is_spoken(&l.text))
            .map(|l| l.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spoken text around a timestamp, used as generator context.
    pub fn around(&self, timestamp: f64, radius: f64) -> String {
        self.lines
            .iter()
            .filter(|l| l.end >= timestamp - radius && l.start <= timestamp + radius)
            .filter(|l| is_spoken(&l.text))
            .map(|l| l.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_spoken(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return false;
    }
    trimmed.chars().any(|c| c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(start: f64, end: f64, text: &str) -> TranscriptLine {
        TranscriptLine {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_empty_transcript_has_no_spoken_content() {
        assert!(!Transcript::default().has_spoken_content());
    }

    #[test]
    fn test_annotations_are_not_spoken_content() {
        let transcript = Transcript {
            lines: vec![line(0.0, 5.0, "[music]"), line(5.0, 9.0, "  ...  ")],
            ..Default::default()
        };
        assert!(!transcript.has_spoken_content());
        assert_eq!(transcript.text(), "");
    }

    #[test]
    fn test_trailing_keeps_only_the_window() {
        let transcript = Transcript {
            lines: vec![
                line(0.0, 100.0, "early"),
                line(100.0, 250.0, "middle"),
                line(250.0, 300.0, "late"),
            ],
            ..Default::default()
        };
        assert_eq!(transcript.trailing(300.0, 120.0), "middle late");
        assert_eq!(transcript.trailing(300.0, 40.0), "late");
    }

    #[test]
    fn test_around_selects_overlapping_lines() {
        let transcript = Transcript {
            lines: vec![
                line(0.0, 10.0, "intro"),
                line(10.0, 20.0, "core idea"),
                line(60.0, 70.0, "tangent"),
            ],
            ..Default::default()
        };
        assert_eq!(transcript.around(15.0, 5.0), "intro core idea");
    }
}
