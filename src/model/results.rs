use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::model::{id::SurveyId, question::SurveyQuestion, survey::SurveyOption};

/// Shown in place of a count or percentage that is not visible yet.
const HIDDEN_LABEL: &str = "-";

/// The outcome for a single option, as shown to the survey creator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionResult {
    /// Option label.
    pub title: String,
    /// Number of votes, or `None` while the results are hidden.
    pub votes: Option<u32>,
    /// Share of voters that picked this option, 0 while hidden.
    pub percent: f64,
}

impl OptionResult {
    pub fn is_hidden(&self) -> bool {
        self.votes.is_none()
    }

    /// The vote count, or a placeholder while hidden.
    pub fn votes_label(&self) -> String {
        match self.votes {
            Some(votes) => votes.to_string(),
            None => HIDDEN_LABEL.to_string(),
        }
    }

    /// The percentage with one decimal, or a placeholder while hidden.
    pub fn percent_label(&self) -> String {
        match self.votes {
            Some(_) => format!("{:.1}", self.percent),
            None => HIDDEN_LABEL.to_string(),
        }
    }

    /// Bar length in percent, scaled so that the largest option fills the bar.
    pub fn bar_percent(&self, max_percent: f64) -> f64 {
        if self.is_hidden() {
            return 0.0;
        }
        self.percent / max_percent * 100.0
    }

    /// The unfilled rest of the bar.
    pub fn bar_remainder(&self, max_percent: f64) -> f64 {
        if self.is_hidden() {
            return 100.0;
        }
        100.0 - self.percent / max_percent * 100.0
    }
}

impl Display for OptionResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({}%)",
            self.title,
            self.votes_label(),
            self.percent_label()
        )
    }
}

/// Compute per-option results. Percentages are relative to the number of
/// voters, not the number of selections, so multiple-choice surveys can sum
/// to more than 100%.
///
/// Returns the results together with the largest percentage (at least 1),
/// or 100 when hidden.
pub(crate) fn tally(
    options: &[SurveyOption],
    voters: usize,
    hidden: bool,
) -> (Vec<OptionResult>, f64) {
    if hidden {
        let results = options
            .iter()
            .map(|option| OptionResult {
                title: option.label.clone(),
                votes: None,
                percent: 0.0,
            })
            .collect();
        return (results, 100.0);
    }

    let total = voters.max(1) as f64;
    let mut max_percent: f64 = 0.0;
    let results = options
        .iter()
        .map(|option| {
            let percent = f64::from(option.votes) / total * 100.0;
            max_percent = max_percent.max(percent);
            OptionResult {
                title: option.label.clone(),
                votes: Some(option.votes),
                percent,
            }
        })
        .collect();

    (results, max_percent.max(1.0))
}

/// A snapshot of a survey's results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyResult {
    /// Question title.
    pub title: String,
    /// Base64 encoded QR code pointing voters at the survey.
    pub qr_code: String,
    /// Number of voters in the current round. Always visible.
    pub votes: usize,
    /// Per option results, in question order.
    pub options: Vec<OptionResult>,
    /// Largest percentage across options; bars are scaled against this.
    pub max_percent: f64,
    /// Survey revision this snapshot was taken at.
    pub revision: u64,
}

impl SurveyResult {
    pub fn is_hidden(&self) -> bool {
        self.options.iter().all(OptionResult::is_hidden)
    }
}

/// The currently open question, as shown to voters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenQuestion {
    /// The round a vote must quote to be accepted.
    pub round: u32,
    pub survey_id: SurveyId,
    pub question: SurveyQuestion,
}
