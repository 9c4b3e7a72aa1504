use serde::{Deserialize, Serialize};

use super::domain::SubmissionStatus;

/// Phrases that mark a signed document as a refusal.
pub const REFUSAL_KEYWORDS: [&str; 6] = [
    "отказываюсь",
    "не согласен",
    "против",
    "отказ",
    "не даю согласие",
    "не разрешаю",
];

/// Outcome inferred from a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentOutcome {
    Accepted,
    Refused,
}

impl ConsentOutcome {
    pub const fn status(self) -> SubmissionStatus {
        match self {
            ConsentOutcome::Accepted => SubmissionStatus::Accepted,
            ConsentOutcome::Refused => SubmissionStatus::Refused,
        }
    }
}

/// Classification result together with the keyword that decided it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub outcome: ConsentOutcome,
    pub matched_keyword: Option<&'static str>,
}

/// Classify extracted document text. Any text is valid input; empty text is an acceptance.
pub fn classify(text: &str) -> ConsentOutcome {
    classify_with_evidence(text).outcome
}

pub fn classify_with_evidence(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let matched_keyword = REFUSAL_KEYWORDS
        .iter()
        .copied()
        .find(|keyword| lowered.contains(keyword));

    let outcome = match matched_keyword {
        Some(_) => ConsentOutcome::Refused,
        None => ConsentOutcome::Accepted,
    };

    Classification {
        outcome,
        matched_keyword,
    }
}
