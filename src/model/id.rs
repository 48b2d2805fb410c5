use std::fmt::{Display, Formatter};

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

/// Number of symbols in a generated identifier.
pub const LENGTH: usize = 30;

/// Number of leading symbols shown when an identifier is logged.
const LOG_PREFIX: usize = 6;

/// Generate a random token of [`LENGTH`] symbols drawn from `[a-zA-Z0-9]`.
///
/// This is meant to resist casual enumeration, not to be a secret key.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LENGTH)
        .map(char::from)
        .collect()
}

macro_rules! token_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn random() -> Self {
                Self(random_token())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Does this look like something we could have generated?
            pub fn is_well_formed(&self) -> bool {
                self.0.len() == LENGTH && self.0.bytes().all(|b| b.is_ascii_alphanumeric())
            }

            /// A prefix of the identifier that is safe to put in logs.
            pub fn short(&self) -> &str {
                let end = self
                    .0
                    .char_indices()
                    .nth(LOG_PREFIX)
                    .map(|(i, _)| i)
                    .unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

token_id!(
    /// Identifies a survey. Appears in vote URLs, so it must be hard to guess.
    SurveyId
);

token_id!(
    /// Identifies a browser/client, both as a survey creator and as a voter.
    UserId
);

/// Where the registry gets new survey IDs from.
pub trait IdSource: Send + Sync {
    fn next_survey_id(&self) -> SurveyId;
}

/// Fresh random IDs from the thread-local generator.
#[derive(Debug, Default, Copy, Clone)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_survey_id(&self) -> SurveyId {
        SurveyId::random()
    }
}
