use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A keyword hit in a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub keyword: String,
    pub severity: Severity,
}

// Case-insensitive whole-word keyword scan. Reports at most one match per
// message: the most severe keyword found. A keyword entry may carry a
// severity suffix, e.g. `scam:high`; the default is medium.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    keywords: Vec<(String, Severity)>,
}

impl KeywordFilter {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                if entry.is_empty() {
                    return None;
                }
                let (word, severity) = match entry.rsplit_once(':') {
                    Some((word, sev)) => match Severity::parse(sev.trim()) {
                        Some(severity) => (word.trim(), severity),
                        None => (entry, Severity::Medium),
                    },
                    None => (entry, Severity::Medium),
                };
                (!word.is_empty()).then(|| (word.to_lowercase(), severity))
            })
            .collect();
        Self { keywords }
    }

    /// Parse a comma-separated keyword list.
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn check(&self, text: &str) -> Option<KeywordMatch> {
        if self.keywords.is_empty() {
            return None;
        }
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        self.keywords
            .iter()
            .filter(|(keyword, _)| words.iter().any(|w| w == keyword))
            .max_by_key(|(_, severity)| *severity)
            .map(|(keyword, severity)| KeywordMatch {
                keyword: keyword.clone(),
                severity: *severity,
            })
    }
}
