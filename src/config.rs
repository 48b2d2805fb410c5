use chrono::Duration;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::model::survey::Policy;

/// File the configuration is read from, if present.
pub const CONFIG_FILE: &str = "FlashSurvey.toml";

/// Prefix of environment variables that override the file.
pub const ENV_PREFIX: &str = "FLASH_SURVEY_";

/// The sweeper never runs more often than this.
const MIN_SWEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Registry configuration, derived from `FlashSurvey.toml` and
/// `FLASH_SURVEY_*` environment variables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    host: String,
    survey_timeout: u32,
    debug: bool,
    vote_if_result_visible: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            survey_timeout: 30,
            debug: false,
            vote_if_result_visible: false,
        }
    }
}

impl Config {
    /// The layered configuration sources: defaults, then the file, then the environment.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load the configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The externally visible base URL, used in QR codes.
    /// Configured via `HOST`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// How long a survey lives after its last (re)definition.
    /// Configured in minutes via `SURVEY_TIMEOUT`.
    pub fn survey_timeout(&self) -> Duration {
        Duration::minutes(self.survey_timeout.into())
    }

    /// How often the sweeper looks for expired surveys: half the timeout.
    pub fn sweep_period(&self) -> std::time::Duration {
        (self.survey_timeout() / 2)
            .to_std()
            .unwrap_or(MIN_SWEEP_PERIOD)
            .max(MIN_SWEEP_PERIOD)
    }

    /// Debug mode lifts the minimum vote count for revealing results.
    /// Configured via `DEBUG`.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Whether votes are still accepted once the results are visible.
    /// Configured via `VOTE_IF_RESULT_VISIBLE`.
    pub fn vote_if_result_visible(&self) -> bool {
        self.vote_if_result_visible
    }

    /// The voting rules surveys are checked against.
    pub fn policy(&self) -> Policy {
        Policy {
            debug: self.debug,
            vote_if_result_visible: self.vote_if_result_visible,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_survey_timeout(mut self, minutes: u32) -> Self {
        self.survey_timeout = minutes;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_vote_if_result_visible(mut self, allowed: bool) -> Self {
        self.vote_if_result_visible = allowed;
        self
    }
}
