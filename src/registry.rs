use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::model::{
    id::{IdSource, RandomIds, SurveyId, UserId},
    question::SurveyQuestion,
    results::{OpenQuestion, SurveyResult},
    survey::Survey,
};
use crate::qr::{self, QrEncoder};
use crate::sweeper::Sweeper;

/// What the creator sees about their survey in the editor.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SurveyStatus {
    /// The caller owns a live survey with this ID.
    pub running: bool,
    /// Its results are still hidden. Only meaningful if `running`.
    pub hidden: bool,
}

/// All live surveys.
///
/// The map itself is guarded by a reader/writer lock that is only held to
/// insert, remove, scan or fetch a survey handle. Each survey has its own lock
/// for its contents, so activity on one survey never blocks another.
pub struct Registry {
    surveys: RwLock<HashMap<SurveyId, Arc<Survey>>>,
    config: Config,
    clock: Arc<dyn Clock>,
    qr: Arc<dyn QrEncoder>,
    ids: Arc<dyn IdSource>,
    sweeper: Option<Sweeper>,
}

/// Assembles a [`Registry`] from its configuration and collaborators.
pub struct RegistryBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    qr: Arc<dyn QrEncoder>,
    ids: Arc<dyn IdSource>,
}

impl RegistryBuilder {
    /// Use this clock instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use this source of survey IDs instead of random ones.
    pub fn ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Build a registry without a sweeper. Nothing expires unless
    /// [`Registry::sweep`] is called by hand.
    pub fn build(self) -> Registry {
        Registry {
            surveys: RwLock::new(HashMap::new()),
            config: self.config,
            clock: self.clock,
            qr: self.qr,
            ids: self.ids,
            sweeper: None,
        }
    }

    /// Build a registry and start its sweeper, which lives exactly as long as
    /// the registry. Must be called from within a Tokio runtime.
    pub fn launch(self) -> Arc<Registry> {
        let period = self.config.sweep_period();
        let timeout = self.config.survey_timeout();
        Arc::new_cyclic(|registry| {
            let mut built = self.build();
            built.sweeper = Some(Sweeper::spawn(registry.clone(), period, timeout));
            built
        })
    }
}

impl Registry {
    pub fn builder(config: Config, qr: Arc<dyn QrEncoder>) -> RegistryBuilder {
        RegistryBuilder {
            config,
            clock: Arc::new(SystemClock),
            qr,
            ids: Arc::new(RandomIds),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The background sweeper, if the registry was launched with one.
    pub fn sweeper(&self) -> Option<&Sweeper> {
        self.sweeper.as_ref()
    }

    /// Number of live surveys.
    pub fn survey_count(&self) -> usize {
        self.surveys.read().len()
    }

    /// Create a survey, or redefine the creator's existing survey `known_id`.
    ///
    /// Redefinition keeps the ID and starts a new round. If `known_id` does not
    /// name a live survey, a new one is created with a fresh ID.
    pub fn create(
        &self,
        creator: &UserId,
        known_id: Option<&SurveyId>,
        question: SurveyQuestion,
    ) -> Result<SurveyId> {
        let question = question.validate()?;
        let option_count = question.options.len();

        if let Some(known_id) = known_id.filter(|id| id.is_well_formed()) {
            if let Some(survey) = self.lookup(known_id) {
                if !survey.is_owned_by(creator) {
                    debug!("Refused to redefine survey {} owned by someone else", known_id.short());
                    return Err(Error::Ownership);
                }
                match survey.redefine(question.clone(), self.clock.now()) {
                    Ok(()) => {
                        info!(
                            "Updated survey with {option_count} options, in total {} surveys",
                            self.survey_count()
                        );
                        return Ok(known_id.clone());
                    }
                    // Deleted under our feet; fall through and create a new one.
                    Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // Encode the QR code before taking any lock.
        let id = self.ids.next_survey_id();
        let qr_code = qr::payload(&*self.qr, &qr::vote_url(self.config.host(), &id))?;
        let survey = Arc::new(Survey::new(
            id.clone(),
            creator.clone(),
            question,
            qr_code,
            self.clock.now(),
        ));

        let mut surveys = self.surveys.write();
        match surveys.entry(id.clone()) {
            Entry::Occupied(_) => {
                error!("Survey with ID {} already exists, this should not happen!", id.short());
                Err(Error::Collision(id))
            }
            Entry::Vacant(entry) => {
                entry.insert(survey);
                info!(
                    "Created survey with {option_count} options, in total {} surveys",
                    surveys.len()
                );
                Ok(id)
            }
        }
    }

    /// Fetch a survey for voting or viewing the question. No ownership check.
    pub fn lookup(&self, id: &SurveyId) -> Option<Arc<Survey>> {
        self.surveys.read().get(id).cloned()
    }

    /// Fetch a survey on behalf of its creator.
    pub fn lookup_owned(&self, creator: &UserId, id: &SurveyId) -> Result<Arc<Survey>> {
        let survey = self.lookup(id).ok_or(Error::NotFound)?;
        if !survey.is_owned_by(creator) {
            return Err(Error::Ownership);
        }
        Ok(survey)
    }

    /// Remove a survey. Anyone waiting on it is woken one last time.
    ///
    /// The survey is closed before the registry lock is released, so a
    /// concurrent redefinition either lands first or sees it closed.
    pub fn delete(&self, creator: &UserId, id: &SurveyId) -> Result<()> {
        let remaining = {
            let mut surveys = self.surveys.write();
            match surveys.get(id) {
                None => return Err(Error::NotFound),
                Some(survey) if !survey.is_owned_by(creator) => return Err(Error::Ownership),
                Some(_) => {}
            }
            let survey = surveys.remove(id).ok_or(Error::NotFound)?;
            survey.close();
            surveys.len()
        };
        info!("Deleted survey, {remaining} surveys remaining");
        Ok(())
    }

    /// Remove every survey (re)defined more than `max_age` ago.
    /// Returns the number of surveys removed and remaining.
    pub fn sweep(&self, max_age: Duration) -> (usize, usize) {
        let now = self.clock.now();
        let (expired, remaining) = {
            let mut surveys = self.surveys.write();
            let mut expired = 0;
            // Closed while still under the registry lock, like `delete`.
            surveys.retain(|_, survey| {
                let keep = now - survey.created_at() <= max_age;
                if !keep {
                    survey.close();
                    expired += 1;
                }
                keep
            });
            (expired, surveys.len())
        };

        if expired == 0 {
            trace!("Sweep found no expired surveys, {remaining} surveys live");
        } else {
            info!("Deleted {expired} old surveys, {remaining} surveys remaining");
        }
        (expired, remaining)
    }

    /// Cast a vote. `round` is the round of the question the voter was shown.
    pub fn vote(&self, id: &SurveyId, voter: &UserId, choices: &[usize], round: u32) -> Result<()> {
        let survey = self.lookup(id).ok_or(Error::NotFound)?;
        survey
            .vote(voter, choices, round, self.config.policy())
            .map_err(|e| {
                debug!("Rejected vote on survey {}: {e}", id.short());
                e
            })
    }

    /// Has `voter` voted in the current round? False for unknown surveys.
    pub fn has_voted(&self, id: &SurveyId, voter: &UserId) -> bool {
        self.lookup(id)
            .map(|survey| survey.has_voted(voter))
            .unwrap_or(false)
    }

    /// The question currently open for voting.
    pub fn question(&self, id: &SurveyId) -> Result<OpenQuestion> {
        Ok(self.lookup(id).ok_or(Error::NotFound)?.question())
    }

    /// Make the results visible to the creator's viewers.
    pub fn reveal(&self, creator: &UserId, id: &SurveyId) -> Result<()> {
        let survey = self.lookup_owned(creator, id)?;
        survey.reveal(creator, self.config.policy()).map_err(|e| {
            debug!("Refused to reveal survey {}: {e}", id.short());
            e
        })
    }

    /// The current results, as shown on the creator's result page.
    pub fn result(&self, creator: &UserId, id: &SurveyId) -> Result<SurveyResult> {
        Ok(self.lookup_owned(creator, id)?.result())
    }

    /// The running question definition, for pre-filling the editor.
    pub fn running_question(&self, creator: &UserId, id: &SurveyId) -> Result<SurveyQuestion> {
        Ok(self.lookup_owned(creator, id)?.running_question())
    }

    pub fn status(&self, creator: &UserId, id: &SurveyId) -> SurveyStatus {
        match self.lookup_owned(creator, id) {
            Ok(survey) => SurveyStatus {
                running: true,
                hidden: survey.is_hidden(),
            },
            Err(_) => SurveyStatus::default(),
        }
    }

    /// A QR code that lets the creator continue on another device.
    pub fn handover_qr(&self, creator: &UserId, id: &SurveyId) -> Result<String> {
        // Only checks that the survey exists and is owned; no survey lock is held while encoding.
        let survey = self.lookup_owned(creator, id)?;
        let url = qr::handover_url(self.config.host(), survey.creator(), survey.id());
        Ok(qr::payload(&*self.qr, &url)?)
    }

    /// The gate a long-polling viewer at `known_revision` should wait on.
    ///
    /// If the survey has moved past `known_revision` the gate has already fired.
    /// Waiting must happen with no lock held, and a wakeup only means that
    /// something changed: the caller re-reads the result and waits again.
    pub fn wait_for_modification(
        &self,
        creator: &UserId,
        id: &SurveyId,
        known_revision: u64,
    ) -> Result<Arc<Gate>> {
        Ok(self.lookup_owned(creator, id)?.gate_for(known_revision))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    use crate::clock::ManualClock;
    use crate::qr::fake::{decode, BrokenEncoder, EchoEncoder};

    use super::*;

    const WAIT: StdDuration = StdDuration::from_secs(10);

    /// A manual clock that can be told to block the next caller until released.
    #[derive(Default)]
    struct PausingClock {
        inner: ManualClock,
        pause: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl Clock for PausingClock {
        fn now(&self) -> DateTime<Utc> {
            let pause = self.pause.lock().take();
            if let Some((paused, resume)) = pause {
                paused.send(()).unwrap();
                resume.recv().unwrap();
            }
            self.inner.now()
        }
    }

    /// Hands out the same ID every time.
    struct FixedIds(SurveyId);

    impl IdSource for FixedIds {
        fn next_survey_id(&self) -> SurveyId {
            self.0.clone()
        }
    }

    fn create(registry: &Registry, creator: &UserId) -> SurveyId {
        registry
            .create(creator, None, SurveyQuestion::example())
            .unwrap()
    }

    fn cast(registry: &Registry, id: &SurveyId, voters: usize, choice: usize) {
        let round = registry.question(id).unwrap().round;
        for _ in 0..voters {
            registry.vote(id, &UserId::random(), &[choice], round).unwrap();
        }
    }

    #[registry_test]
    async fn create_then_fetch_question(registry: Arc<Registry>) {
        let creator = UserId::random();
        let question = SurveyQuestion::example_multiple();
        let id = registry.create(&creator, None, question.clone()).unwrap();
        assert!(id.is_well_formed());

        let open = registry.question(&id).unwrap();
        assert_eq!(open.round, 1);
        assert_eq!(open.survey_id, id);
        assert_eq!(open.question, question);
        assert_eq!(registry.survey_count(), 1);
    }

    #[registry_test]
    async fn create_validates_before_anything_else(registry: Arc<Registry>) {
        let err = registry
            .create(&UserId::random(), None, SurveyQuestion::new("", ["a", "b"], false))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(registry.survey_count(), 0);
    }

    #[registry_test]
    async fn qr_code_points_at_vote_page(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(
            decode(&result.qr_code),
            format!("https://survey.example/vote/?id={id}")
        );

        let handover = registry.handover_qr(&creator, &id).unwrap();
        assert_eq!(
            decode(&handover),
            format!("https://survey.example/?tuid={creator}&tsid={id}")
        );
        let err = registry.handover_qr(&UserId::random(), &id).unwrap_err();
        assert!(matches!(err, Error::Ownership));
    }

    #[test]
    fn qr_failure_creates_nothing() {
        let registry = Registry::builder(Config::example(), Arc::new(BrokenEncoder)).build();
        let err = registry
            .create(&UserId::random(), None, SurveyQuestion::example())
            .unwrap_err();
        assert!(matches!(err, Error::QrEncoding(_)));
        assert_eq!(registry.survey_count(), 0);
    }

    #[test]
    fn id_collision_is_refused() {
        let taken = SurveyId::random();
        let registry = Registry::builder(Config::example(), Arc::new(EchoEncoder))
            .ids(Arc::new(FixedIds(taken.clone())))
            .build();
        let first = UserId::random();
        assert_eq!(create(&registry, &first), taken);

        let err = registry
            .create(&UserId::random(), None, SurveyQuestion::example())
            .unwrap_err();
        assert!(matches!(err, Error::Collision(id) if id == taken));
        // The existing survey is untouched.
        assert!(registry.lookup_owned(&first, &taken).is_ok());
        assert_eq!(registry.survey_count(), 1);
    }

    #[registry_test]
    async fn redefine_keeps_id_and_starts_new_round(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let voter = UserId::random();
        registry.vote(&id, &voter, &[0], 1).unwrap();
        assert!(registry.has_voted(&id, &voter));
        let revision = registry.result(&creator, &id).unwrap().revision;

        let question = SurveyQuestion::new("Again", ["x", "y", "z"], false);
        let same = registry
            .create(&creator, Some(&id), question.clone())
            .unwrap();
        assert_eq!(same, id);
        assert_eq!(registry.survey_count(), 1);

        let open = registry.question(&id).unwrap();
        assert_eq!(open.round, 2);
        assert_eq!(open.question, question);
        assert!(!registry.has_voted(&id, &voter));
        assert_eq!(registry.result(&creator, &id).unwrap().revision, revision + 1);
        assert_eq!(registry.running_question(&creator, &id).unwrap(), question);
    }

    #[registry_test]
    async fn redefine_by_someone_else_is_refused(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let err = registry
            .create(&UserId::random(), Some(&id), SurveyQuestion::example())
            .unwrap_err();
        assert!(matches!(err, Error::Ownership));
        assert_eq!(registry.question(&id).unwrap().round, 1);
    }

    #[registry_test]
    async fn unknown_known_id_creates_new_survey(registry: Arc<Registry>) {
        let creator = UserId::random();
        let gone = SurveyId::random();
        let id = registry
            .create(&creator, Some(&gone), SurveyQuestion::example())
            .unwrap();
        assert_ne!(id, gone);

        // Malformed IDs are not even looked up.
        let id2 = registry
            .create(&creator, Some(&SurveyId::from("short")), SurveyQuestion::example())
            .unwrap();
        assert_ne!(id2, id);
        assert_eq!(registry.survey_count(), 2);
    }

    #[registry_test]
    async fn vote_twice(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let voter = UserId::random();
        registry.vote(&id, &voter, &[1], 1).unwrap();
        let err = registry.vote(&id, &voter, &[0], 1).unwrap_err();
        assert!(matches!(err, Error::DuplicateVote));

        cast(&registry, &id, 2, 1);
        registry.reveal(&creator, &id).unwrap();
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.votes, 3);
        assert_eq!(result.options[0].votes, Some(0));
        assert_eq!(result.options[1].votes, Some(3));
    }

    #[registry_test]
    async fn vote_on_unknown_survey(registry: Arc<Registry>) {
        let err = registry
            .vote(&SurveyId::random(), &UserId::random(), &[0], 1)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
        assert!(!registry.has_voted(&SurveyId::random(), &UserId::random()));
        assert!(matches!(
            registry.question(&SurveyId::random()),
            Err(Error::NotFound)
        ));
    }

    #[registry_test]
    async fn stale_round_leaves_counters_alone(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        registry
            .create(&creator, Some(&id), SurveyQuestion::example())
            .unwrap();

        let err = registry.vote(&id, &UserId::random(), &[0], 1).unwrap_err();
        assert!(matches!(err, Error::StaleRound { expected: 2, actual: 1 }));

        registry.reveal(&creator, &id).unwrap();
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.votes, 0);
        assert!(result.options.iter().all(|o| o.votes == Some(0)));
    }

    #[registry_test]
    async fn results_hidden_until_revealed(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        cast(&registry, &id, 5, 0);

        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.votes, 5);
        assert!(result.options.iter().all(|o| o.votes.is_none()));
        assert!(registry.status(&creator, &id).hidden);

        registry.reveal(&creator, &id).unwrap();
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.options[0].votes, Some(5));
        assert_eq!(
            registry.status(&creator, &id),
            SurveyStatus {
                running: true,
                hidden: false
            }
        );
    }

    #[registry_test]
    async fn reveal_rules(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);

        let err = registry.reveal(&UserId::random(), &id).unwrap_err();
        assert!(matches!(err, Error::Ownership));

        cast(&registry, &id, 1, 0);
        let err = registry.reveal(&creator, &id).unwrap_err();
        assert!(matches!(err, Error::InsufficientVotes(1)));
        cast(&registry, &id, 1, 0);
        let err = registry.reveal(&creator, &id).unwrap_err();
        assert!(matches!(err, Error::InsufficientVotes(2)));
        cast(&registry, &id, 1, 0);
        registry.reveal(&creator, &id).unwrap();

        // Zero votes may always be revealed.
        let empty = create(&registry, &creator);
        registry.reveal(&creator, &empty).unwrap();
    }

    #[registry_test(debug)]
    async fn debug_reveals_single_vote(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        cast(&registry, &id, 1, 1);
        registry.reveal(&creator, &id).unwrap();
        assert!(!registry.status(&creator, &id).hidden);
    }

    #[registry_test]
    async fn no_votes_after_reveal(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        registry.reveal(&creator, &id).unwrap();
        let err = registry.vote(&id, &UserId::random(), &[0], 1).unwrap_err();
        assert!(matches!(err, Error::Visibility));
    }

    #[registry_test(vote_if_result_visible)]
    async fn votes_after_reveal_when_allowed(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        registry.reveal(&creator, &id).unwrap();
        registry.vote(&id, &UserId::random(), &[0], 1).unwrap();
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.options[0].votes, Some(1));
    }

    #[registry_test]
    async fn owner_only_views(registry: Arc<Registry>) {
        let creator = UserId::random();
        let stranger = UserId::random();
        let id = create(&registry, &creator);

        assert!(matches!(registry.result(&stranger, &id), Err(Error::Ownership)));
        assert!(matches!(
            registry.running_question(&stranger, &id),
            Err(Error::Ownership)
        ));
        assert!(matches!(
            registry.wait_for_modification(&stranger, &id, 1),
            Err(Error::Ownership)
        ));
        assert_eq!(registry.status(&stranger, &id), SurveyStatus::default());
        assert!(matches!(
            registry.result(&creator, &SurveyId::random()),
            Err(Error::NotFound)
        ));
    }

    #[registry_test]
    async fn delete(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let handle = registry.lookup(&id).unwrap();
        let gate = registry.wait_for_modification(&creator, &id, 1).unwrap();

        let waiter = tokio::spawn(async move { gate.wait_timeout(WAIT).await });
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let err = registry.delete(&UserId::random(), &id).unwrap_err();
        assert!(matches!(err, Error::Ownership));
        assert!(!waiter.is_finished());

        registry.delete(&creator, &id).unwrap();
        assert!(waiter.await.unwrap());
        assert_eq!(registry.survey_count(), 0);
        assert!(registry.lookup(&id).is_none());

        // Stale handles can no longer be voted on, and never block.
        let err = handle.vote(&UserId::random(), &[0], 1, registry.config().policy());
        assert!(matches!(err, Err(Error::NotFound)));
        assert!(handle.gate_for(handle.revision()).is_fired());

        let err = registry.delete(&creator, &id).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[registry_test]
    async fn wait_for_modification(registry: Arc<Registry>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        let revision = registry.result(&creator, &id).unwrap().revision;

        // Up to date: must wait.
        let gate = registry.wait_for_modification(&creator, &id, revision).unwrap();
        assert!(!gate.is_fired());

        // Behind: returns at once.
        let behind = registry
            .wait_for_modification(&creator, &id, revision - 1)
            .unwrap();
        assert!(behind.is_fired());

        let waiter = tokio::spawn(async move { gate.wait_timeout(WAIT).await });
        registry.vote(&id, &UserId::random(), &[0], 1).unwrap();
        assert!(waiter.await.unwrap());

        let revision = registry.result(&creator, &id).unwrap().revision;
        let gate = registry.wait_for_modification(&creator, &id, revision).unwrap();
        assert!(!gate.is_fired());
        registry.reveal(&creator, &id).unwrap_err();
        // A refused reveal is not a change.
        assert!(!gate.is_fired());
    }

    #[registry_test]
    async fn sweep_removes_only_old_surveys(registry: Arc<Registry>, clock: Arc<ManualClock>) {
        let creator = UserId::random();
        let old = create(&registry, &creator);
        cast(&registry, &old, 1, 0);
        let old_gate = registry.wait_for_modification(&creator, &old, u64::MAX).unwrap();
        let old_waiter = tokio::spawn(async move { old_gate.wait_timeout(WAIT).await });

        clock.advance(Duration::minutes(20));
        let young = create(&registry, &creator);
        cast(&registry, &young, 3, 1);
        let before = registry.result(&creator, &young).unwrap();

        // An old survey that was redefined counts as young again.
        let renewed = create(&registry, &creator);
        clock.advance(Duration::minutes(15));
        registry
            .create(&creator, Some(&renewed), SurveyQuestion::example())
            .unwrap();

        clock.advance(Duration::minutes(11));
        assert!(!old_waiter.is_finished());
        assert_eq!(registry.sweep(Duration::minutes(30)), (1, 2));

        assert!(registry.lookup(&old).is_none());
        assert!(old_waiter.await.unwrap());
        assert_eq!(registry.result(&creator, &young).unwrap(), before);
        assert!(registry.lookup(&renewed).is_some());

        // Exactly at the limit is not yet expired.
        clock.advance(Duration::minutes(4));
        assert_eq!(registry.sweep(Duration::minutes(30)), (0, 2));
        clock.advance(Duration::seconds(1));
        assert_eq!(registry.sweep(Duration::minutes(30)), (1, 1));
        assert!(registry.lookup(&young).is_none());
    }

    #[test]
    fn redefine_racing_eviction_never_reports_a_removed_survey() {
        let clock = Arc::new(PausingClock::default());
        let registry = Arc::new(
            Registry::builder(Config::example(), Arc::new(EchoEncoder))
                .clock(clock.clone())
                .build(),
        );
        let creator = UserId::random();
        let id = create(&registry, &creator);

        // Stop the creator after it has looked the survey up, but before it
        // takes the survey lock to redefine it.
        let (paused_tx, paused_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        *clock.pause.lock() = Some((paused_tx, resume_rx));
        let redefining = {
            let (registry, creator, id) = (registry.clone(), creator.clone(), id.clone());
            thread::spawn(move || {
                registry
                    .create(&creator, Some(&id), SurveyQuestion::example())
                    .unwrap()
            })
        };
        paused_rx.recv().unwrap();

        clock.inner.advance(Duration::minutes(31));
        assert_eq!(registry.sweep(Duration::minutes(30)), (1, 0));
        resume_tx.send(()).unwrap();

        let returned = redefining.join().unwrap();
        assert_ne!(returned, id);
        assert!(registry.lookup(&returned).is_some());
        assert!(registry.lookup(&id).is_none());
    }

    #[registry_test]
    async fn sweeper_runs_in_background(registry: Arc<Registry>, clock: Arc<ManualClock>) {
        let creator = UserId::random();
        let id = create(&registry, &creator);
        clock.advance(registry.config().survey_timeout() + Duration::seconds(1));

        let sweeper = registry.sweeper().unwrap();
        sweeper.trigger_now();
        let swept = tokio::time::timeout(WAIT, async {
            while registry.lookup(&id).is_some() || sweeper.passes() == 0 {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await;
        assert!(swept.is_ok());
        assert!(!sweeper.is_finished());
    }

    #[registry_test]
    async fn cancelled_sweeper_stops(registry: Arc<Registry>) {
        let sweeper = registry.sweeper().unwrap();
        sweeper.cancel();
        let stopped = tokio::time::timeout(WAIT, async {
            while !sweeper.is_finished() {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await;
        assert!(stopped.is_ok());
    }

    #[test]
    fn sweeper_stops_with_registry() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let registry = Registry::builder(Config::example(), Arc::new(EchoEncoder)).launch();
            let weak = Arc::downgrade(&registry);
            drop(registry);
            assert!(weak.upgrade().is_none());
        });
    }

    /// 100 surveys, each voted on by 100 concurrent voters.
    #[registry_test]
    async fn concurrent_voting(registry: Arc<Registry>) {
        const SURVEYS: usize = 100;
        const VOTERS: usize = 100;

        let surveys = (0..SURVEYS)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let creator = UserId::random();
                    let id = create(&registry, &creator);

                    let start = Arc::new(tokio::sync::Barrier::new(VOTERS));
                    let voters = (0..VOTERS)
                        .map(|_| {
                            let (registry, id, start) =
                                (registry.clone(), id.clone(), start.clone());
                            tokio::spawn(async move {
                                let voter = UserId::random();
                                start.wait().await;
                                registry.vote(&id, &voter, &[1], 1).unwrap();
                            })
                        })
                        .collect::<Vec<_>>();
                    for voter in voters {
                        voter.await.unwrap();
                    }

                    registry.reveal(&creator, &id).unwrap();
                    let result = registry.result(&creator, &id).unwrap();
                    assert_eq!(result.votes, VOTERS);
                    assert_eq!(result.options[0].votes, Some(0));
                    assert_eq!(result.options[1].votes, Some(VOTERS as u32));
                    assert!(!result.is_hidden());

                    registry.delete(&creator, &id).unwrap();
                })
            })
            .collect::<Vec<_>>();

        for survey in surveys {
            survey.await.unwrap();
        }
        assert_eq!(registry.survey_count(), 0);
    }

    /// Viewers long-poll while 1000 voters vote; nobody may miss the final state.
    #[registry_test]
    async fn long_poll_under_load(registry: Arc<Registry>) {
        const VOTERS: usize = 1000;
        const VIEWERS: usize = 20;

        let creator = UserId::random();
        let id = create(&registry, &creator);
        let final_revision = 1 + VOTERS as u64;
        let wakeups = Arc::new(AtomicUsize::new(0));

        let viewers = (0..VIEWERS)
            .map(|_| {
                let (registry, creator, id, wakeups) =
                    (registry.clone(), creator.clone(), id.clone(), wakeups.clone());
                tokio::spawn(async move {
                    let mut known = 1;
                    while known < final_revision {
                        let gate = registry.wait_for_modification(&creator, &id, known).unwrap();
                        assert!(gate.wait_timeout(WAIT).await, "missed a wakeup at {known}");
                        wakeups.fetch_add(1, Ordering::Relaxed);
                        known = registry.result(&creator, &id).unwrap().revision;
                    }
                    known
                })
            })
            .collect::<Vec<_>>();

        let voters = (0..VOTERS)
            .map(|i| {
                let (registry, id) = (registry.clone(), id.clone());
                tokio::spawn(async move {
                    registry.vote(&id, &UserId::random(), &[i % 2], 1).unwrap();
                })
            })
            .collect::<Vec<_>>();
        for voter in voters {
            voter.await.unwrap();
        }

        for viewer in viewers {
            assert_eq!(viewer.await.unwrap(), final_revision);
        }
        assert!(wakeups.load(Ordering::Relaxed) >= VIEWERS);

        registry.reveal(&creator, &id).unwrap();
        let result = registry.result(&creator, &id).unwrap();
        assert_eq!(result.votes, VOTERS);
        let total: u32 = result.options.iter().filter_map(|o| o.votes).sum();
        assert_eq!(total, VOTERS as u32);
    }
}
