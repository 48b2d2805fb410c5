use thiserror::Error;

use crate::model::id::SurveyId;
use crate::qr::QrError;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong when operating on the registry.
/// None of these are fatal; they are returned to the caller to be turned
/// into a message for the user.
#[derive(Debug, Error)]
pub enum Error {
    /// The survey definition was rejected.
    #[error("Invalid survey: {0}")]
    Validation(String),
    /// The caller is not the creator of the survey.
    #[error("You are not the creator of this survey")]
    Ownership,
    /// No survey exists with the given ID.
    #[error("This survey does not exist")]
    NotFound,
    /// The vote was cast against a question that has since been redefined.
    #[error(
        "This survey has already ended (round {actual} was voted on, current round is {expected})"
    )]
    StaleRound { expected: u32, actual: u32 },
    /// The voter has already voted in the current round.
    #[error("You have already voted")]
    DuplicateVote,
    /// An option index outside the question's options.
    #[error("Invalid option {0}")]
    InvalidOption(usize),
    /// Revealing now would make it too easy to tell who voted for what.
    #[error("Not enough votes have been cast yet ({0} so far)")]
    InsufficientVotes(usize),
    /// Voting is closed because the results are already visible.
    #[error("The survey results are already visible")]
    Visibility,
    /// A freshly generated ID was already taken.
    #[error("Survey with ID {0} already exists")]
    Collision(SurveyId),
    #[error(transparent)]
    QrEncoding(#[from] QrError),
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
}
