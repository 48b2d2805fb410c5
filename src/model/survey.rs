use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::model::{
    id::{SurveyId, UserId},
    question::SurveyQuestion,
    results::{tally, OpenQuestion, SurveyResult},
};

/// Revealing is refused while the number of voters is in this range, since a
/// creator could otherwise work out how one or two people voted.
const REVEAL_BLOCKED: std::ops::RangeInclusive<usize> = 1..=2;

/// A single answer option and its running count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurveyOption {
    pub label: String,
    pub votes: u32,
}

impl SurveyOption {
    fn fresh(label: &str) -> Self {
        Self {
            label: label.to_string(),
            votes: 0,
        }
    }
}

/// Voting and reveal rules, taken from the registry configuration.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Skip the minimum-votes check on reveal.
    pub debug: bool,
    /// Keep accepting votes after the results have been revealed.
    pub vote_if_result_visible: bool,
}

/// Everything about a survey that changes after creation.
#[derive(Debug)]
struct SurveyState {
    question: SurveyQuestion,
    options: Vec<SurveyOption>,
    /// Bumped when the question is redefined. Votes must quote the current round.
    round: u32,
    /// Bumped on every change, including votes. Only used for change notification.
    revision: u64,
    /// Who has voted in the current round.
    voters: HashSet<UserId>,
    result_hidden: bool,
    /// Creation time, reset on redefinition. The sweeper measures age from here.
    created_at: DateTime<Utc>,
    /// Fired and replaced on every change.
    gate: Arc<Gate>,
    /// Set once the survey has been removed from the registry.
    closed: bool,
}

impl SurveyState {
    /// Record a change: wake everyone waiting on the current gate and hand
    /// out a fresh one to later waiters. Must only be called with the survey
    /// lock held, which makes the three steps a single transition.
    fn changed(&mut self) {
        self.gate.fire();
        self.gate = Gate::new();
        self.revision += 1;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}

/// A live survey. Identity and ownership are fixed; everything else sits
/// behind the survey's own lock.
#[derive(Debug)]
pub struct Survey {
    id: SurveyId,
    creator: UserId,
    /// Base64 QR code of the vote URL. The URL depends only on the ID, so
    /// this survives redefinition.
    qr_code: String,
    state: Mutex<SurveyState>,
}

impl Survey {
    /// Create a survey in round 1, revision 1, with hidden results.
    /// The question must already be validated.
    pub(crate) fn new(
        id: SurveyId,
        creator: UserId,
        question: SurveyQuestion,
        qr_code: String,
        now: DateTime<Utc>,
    ) -> Self {
        let options = question.options.iter().map(|o| SurveyOption::fresh(o)).collect();
        Self {
            id,
            creator,
            qr_code,
            state: Mutex::new(SurveyState {
                question,
                options,
                round: 1,
                revision: 1,
                voters: HashSet::new(),
                result_hidden: true,
                created_at: now,
                gate: Gate::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SurveyId {
        &self.id
    }

    pub fn creator(&self) -> &UserId {
        &self.creator
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.creator == user
    }

    fn ensure_owner(&self, user: &UserId) -> Result<()> {
        if !self.is_owned_by(user) {
            return Err(Error::Ownership);
        }
        Ok(())
    }

    /// Replace the question in place. Starts a new round with no votes and
    /// hidden results.
    pub(crate) fn redefine(&self, question: SurveyQuestion, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.options = question.options.iter().map(|o| SurveyOption::fresh(o)).collect();
        state.question = question;
        state.round += 1;
        state.voters.clear();
        state.result_hidden = true;
        state.created_at = now;
        state.changed();
        Ok(())
    }

    /// Cast a vote for the options at the given indices.
    ///
    /// The voter is recorded before the options are counted, and options are
    /// counted one by one; an invalid index aborts the vote but leaves any
    /// earlier indices of the same ballot counted and the voter recorded.
    pub(crate) fn vote(
        &self,
        voter: &UserId,
        choices: &[usize],
        round: u32,
        policy: Policy,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if round != state.round {
            return Err(Error::StaleRound {
                expected: state.round,
                actual: round,
            });
        }
        if !policy.vote_if_result_visible && !state.result_hidden {
            return Err(Error::Visibility);
        }
        if !state.voters.insert(voter.clone()) {
            return Err(Error::DuplicateVote);
        }

        for &choice in choices {
            let option = state
                .options
                .get_mut(choice)
                .ok_or(Error::InvalidOption(choice))?;
            option.votes += 1;
        }

        state.changed();
        Ok(())
    }

    /// Make the results visible. Only the creator may do this.
    pub(crate) fn reveal(&self, caller: &UserId, policy: Policy) -> Result<()> {
        self.ensure_owner(caller)?;
        let mut state = self.state.lock();
        state.ensure_open()?;

        let votes = state.voters.len();
        if !policy.debug && REVEAL_BLOCKED.contains(&votes) {
            return Err(Error::InsufficientVotes(votes));
        }

        state.result_hidden = false;
        state.changed();
        Ok(())
    }

    /// Remove the survey from service: wake every waiter one last time and
    /// refuse further changes. The fired gate is kept, so late waiters never block.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.gate.fire();
    }

    /// Snapshot of the results. Counts are only included once revealed.
    pub fn result(&self) -> SurveyResult {
        let state = self.state.lock();
        let votes = state.voters.len();
        let (options, max_percent) = tally(&state.options, votes, state.result_hidden);
        SurveyResult {
            title: state.question.title.clone(),
            qr_code: self.qr_code.clone(),
            votes,
            options,
            max_percent,
            revision: state.revision,
        }
    }

    /// The question voters should currently be shown.
    pub fn question(&self) -> OpenQuestion {
        let state = self.state.lock();
        OpenQuestion {
            round: state.round,
            survey_id: self.id.clone(),
            question: state.question.clone(),
        }
    }

    pub fn running_question(&self) -> SurveyQuestion {
        self.state.lock().question.clone()
    }

    pub fn is_hidden(&self) -> bool {
        self.state.lock().result_hidden
    }

    pub fn has_voted(&self, voter: &UserId) -> bool {
        self.state.lock().voters.contains(voter)
    }

    pub fn vote_count(&self) -> usize {
        self.state.lock().voters.len()
    }

    pub fn round(&self) -> u32 {
        self.state.lock().round
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn qr_code(&self) -> &str {
        &self.qr_code
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.state.lock().created_at
    }

    /// The gate to wait on for a client that has seen `known_revision`.
    /// A client that is already behind gets a fired gate and returns at once.
    pub fn gate_for(&self, known_revision: u64) -> Arc<Gate> {
        let state = self.state.lock();
        if state.revision > known_revision {
            return Gate::fired();
        }
        state.gate.clone()
    }
}
