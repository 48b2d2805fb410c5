use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a title or option label, in characters.
pub const MAX_TEXT_LEN: usize = 100;

/// A survey needs at least this many options.
pub const MIN_OPTIONS: usize = 2;

/// Separator used by the shareable definition string.
const SEPARATOR: char = ';';

/// The question a survey asks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyQuestion {
    /// Question title.
    pub title: String,
    /// Option labels, in display order.
    pub options: Vec<String>,
    /// May a voter pick more than one option?
    pub multiple: bool,
}

impl SurveyQuestion {
    pub fn new<T, O>(title: T, options: impl IntoIterator<Item = O>, multiple: bool) -> Self
    where
        T: Into<String>,
        O: Into<String>,
    {
        Self {
            title: title.into(),
            options: options.into_iter().map(Into::into).collect(),
            multiple,
        }
    }

    /// Cheap plausibility check, without trimming or length limits.
    pub fn is_complete(&self) -> bool {
        !self.title.is_empty() && self.options.len() >= MIN_OPTIONS
    }

    /// Trim the title and every option, and enforce the length and count limits.
    /// Returns the cleaned-up question.
    pub fn validate(self) -> Result<Self> {
        let mut options = Vec::with_capacity(self.options.len());
        for (i, option) in self.options.into_iter().enumerate() {
            let option = option.trim();
            if option.is_empty() {
                return Err(Error::validation(format!("option {} is empty", i + 1)));
            }
            if option.chars().count() > MAX_TEXT_LEN {
                return Err(Error::validation(format!(
                    "option {} is too long, at most {MAX_TEXT_LEN} characters are allowed",
                    i + 1
                )));
            }
            options.push(option.to_string());
        }

        let title = self.title.trim();
        if title.is_empty() {
            return Err(Error::validation("the title is missing"));
        }
        if title.chars().count() > MAX_TEXT_LEN {
            return Err(Error::validation(format!(
                "the title is too long, at most {MAX_TEXT_LEN} characters are allowed"
            )));
        }

        if options.len() < MIN_OPTIONS {
            return Err(Error::validation(format!(
                "at least {MIN_OPTIONS} options are required"
            )));
        }

        Ok(Self {
            title: title.to_string(),
            options,
            multiple: self.multiple,
        })
    }
}

/// Strip the separator and surrounding whitespace from a piece of text.
fn clean(text: &str) -> String {
    text.trim().replace(SEPARATOR, "")
}

/// Renders the shareable definition string: `title;m|s;option;option...`.
impl Display for SurveyQuestion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = if self.multiple { "m" } else { "s" };
        write!(f, "{}{SEPARATOR}{mode}", clean(&self.title))?;
        for option in self.options.iter().map(|o| clean(o)) {
            if !option.is_empty() {
                write!(f, "{SEPARATOR}{option}")?;
            }
        }
        Ok(())
    }
}

/// Parses the shareable definition string produced by the `Display` impl.
impl FromStr for SurveyQuestion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s.split(SEPARATOR).collect::<Vec<_>>();
        if parts.len() < 2 + MIN_OPTIONS {
            return Err(Error::validation("invalid survey definition"));
        }

        let question = Self {
            title: parts[0].trim().to_string(),
            multiple: parts[1] == "m",
            options: parts[2..]
                .iter()
                .map(|o| o.trim())
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
        };

        if !question.is_complete() {
            return Err(Error::validation("invalid survey definition"));
        }
        Ok(question)
    }
}
