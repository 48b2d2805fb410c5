use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use flash_survey::{
    model::{
        id::{SurveyId, UserId},
        question::SurveyQuestion,
    },
    qr::{EcLevel, QrEncoder, QrError},
    Config, Registry,
};
use rand::{seq::index, Rng};
use std::ops::{AddAssign, Div};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration as StdDuration, Instant};

#[rustfmt::skip]
const OPTIONS: &[&str] = &[
    "Alice",
    "Bob",
    "Carol",
    "Dave",
    "Eve",
    "Fred",
    "Grace",
    "Henry",
    "Irene",
    "Joe",
];

/// How long a watcher waits for a change before checking whether to stop.
const WATCH_TIMEOUT: StdDuration = StdDuration::from_millis(100);

#[derive(Parser)]
struct Args {
    /// How many voting threads to use. Defaults to the number of logical CPUs.
    #[arg(long, default_value_t = num_cpus::get())]
    threads: usize,

    /// How many votes each thread casts.
    #[arg(long, default_value_t = 1000)]
    voters_per_thread: usize,

    /// How many options each ballot selects.
    #[arg(long, value_enum, default_value_t)]
    mode: BallotMode,

    /// How many long-polling result watchers to run alongside the voters.
    #[arg(long, default_value_t = 0)]
    watchers: usize,

    /// Reveal the result afterwards and check that every ballot was counted.
    #[arg(long)]
    verify: bool,
}

/// How many options each ballot selects.
#[derive(Debug, Copy, Clone, Default, ValueEnum)]
enum BallotMode {
    /// Exactly one option.
    #[default]
    Single,
    /// Every option.
    Multiple,
    /// A random non-empty subset of options.
    Random,
}

impl BallotMode {
    /// Pick the option indices for one ballot.
    fn ballot(&self) -> Vec<usize> {
        let mut rng = rand::thread_rng();
        match self {
            Self::Single => vec![rng.gen_range(0..OPTIONS.len())],
            Self::Multiple => (0..OPTIONS.len()).collect(),
            Self::Random => {
                let amount = rng.gen_range(1..=OPTIONS.len());
                index::sample(&mut rng, OPTIONS.len(), amount).into_vec()
            }
        }
    }
}

/// Skips image rendering; the benchmark measures the registry, not QR codes.
struct PlainEncoder;

impl QrEncoder for PlainEncoder {
    fn encode(&self, content: &str, _: EcLevel, _: u32) -> Result<Vec<u8>, QrError> {
        Ok(content.as_bytes().to_vec())
    }
}

/// Durations of each part of the voting process.
#[derive(Debug, Default)]
struct VoteTimings {
    fetch: StdDuration,
    cast: StdDuration,
    check: StdDuration,
}

impl AddAssign for VoteTimings {
    fn add_assign(&mut self, rhs: Self) {
        self.fetch += rhs.fetch;
        self.cast += rhs.cast;
        self.check += rhs.check;
    }
}

impl Div<u32> for VoteTimings {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        Self {
            fetch: self.fetch / rhs,
            cast: self.cast / rhs,
            check: self.check / rhs,
        }
    }
}

/// Fetch the question, vote on it, and confirm the vote was recorded.
fn cast_vote(registry: &Registry, id: &SurveyId, mode: BallotMode) -> anyhow::Result<VoteTimings> {
    let voter = UserId::random();

    let pre_fetch = Instant::now();
    let question = registry.question(id)?;
    let post_fetch = Instant::now();

    let ballot = mode.ballot();
    let pre_cast = Instant::now();
    registry.vote(id, &voter, &ballot, question.round)?;
    let post_cast = Instant::now();

    let pre_check = Instant::now();
    let voted = registry.has_voted(id, &voter);
    let post_check = Instant::now();
    if !voted {
        return Err(anyhow!("vote was not recorded"));
    }

    Ok(VoteTimings {
        fetch: post_fetch.duration_since(pre_fetch),
        cast: post_cast.duration_since(pre_cast),
        check: post_check.duration_since(pre_check),
    })
}

/// Run the voting threads and print timings. Returns the number of ballots cast.
fn benchmark(
    registry: &Registry,
    id: &SurveyId,
    num_threads: usize,
    voters_per_thread: usize,
    mode: BallotMode,
) -> anyhow::Result<usize> {
    let end_val = num_threads * voters_per_thread;

    let start = Instant::now();
    thread::scope(|s| {
        let threads = (0..num_threads)
            .map(|_| {
                s.spawn(move || {
                    let mut vote_duration = VoteTimings::default();
                    for _ in 0..voters_per_thread {
                        vote_duration += cast_vote(registry, id, mode)?;
                    }
                    Ok::<_, anyhow::Error>(vote_duration / voters_per_thread as u32)
                })
            })
            .collect::<Vec<_>>();

        let mut vote_duration = VoteTimings::default();
        for t in threads {
            vote_duration += t.join().map_err(|_| anyhow!("voting thread panicked"))??;
        }
        let total_duration = start.elapsed();

        let avg_vote_duration = vote_duration / num_threads as u32;
        let avg_total_duration =
            avg_vote_duration.fetch + avg_vote_duration.cast + avg_vote_duration.check;

        // Theoretical votes per sec is 1/avg_duration * num_threads.
        let votes_per_sec = num_threads as f64 / avg_total_duration.as_secs_f64();
        // Actual votes per sec is total_votes / total_time.
        let actual_votes_per_sec = end_val as f64 / total_duration.as_secs_f64();

        println!("fetch: {:?}", avg_vote_duration.fetch);
        println!("cast:  {:?}", avg_vote_duration.cast);
        println!("check: {:?}", avg_vote_duration.check);

        println!("\ntotal: {:?} ({:.2}/s)", avg_total_duration, votes_per_sec);
        println!(
            "actual duration: {} votes in {:?} ({:.2}/s)",
            end_val, total_duration, actual_votes_per_sec
        );

        Ok(end_val)
    })
}

/// Long-poll the result until told to stop, counting wakeups.
async fn watch(
    registry: Arc<Registry>,
    creator: UserId,
    id: SurveyId,
    stop: Arc<AtomicBool>,
    wakeups: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let mut known = registry.result(&creator, &id)?.revision;
    while !stop.load(Ordering::Relaxed) {
        let gate = registry.wait_for_modification(&creator, &id, known)?;
        if gate.wait_timeout(WATCH_TIMEOUT).await {
            wakeups.fetch_add(1, Ordering::Relaxed);
            known = registry.result(&creator, &id)?.revision;
        }
    }
    Ok(())
}

/// Reveal the result and check every ballot made it in.
fn verify(
    registry: &Registry,
    creator: &UserId,
    id: &SurveyId,
    ballots: usize,
) -> anyhow::Result<()> {
    registry.reveal(creator, id)?;
    let result = registry.result(creator, id)?;
    if result.votes != ballots {
        return Err(anyhow!(
            "expected {} votes but the survey has {}",
            ballots,
            result.votes
        ));
    }
    println!("\nverified {} votes", result.votes);
    for option in &result.options {
        println!("  {option}");
    }
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.threads == 0 || args.voters_per_thread == 0 {
        return Err(anyhow!("need at least one thread and one voter per thread"));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("benchmark-watcher")
        .enable_all()
        .build()?;

    // Debug mode so any vote count can be revealed.
    let config = Config::default().with_debug(true);
    let registry =
        runtime.block_on(async { Registry::builder(config, Arc::new(PlainEncoder)).launch() });

    // Create the survey.
    let creator = UserId::random();
    let question = SurveyQuestion::new("Benchmark Question", OPTIONS.iter().copied(), true);
    let id = registry.create(&creator, None, question)?;

    // Start the watchers.
    let stop = Arc::new(AtomicBool::new(false));
    let wakeups = Arc::new(AtomicU64::new(0));
    let watchers = (0..args.watchers)
        .map(|_| {
            runtime.spawn(watch(
                registry.clone(),
                creator.clone(),
                id.clone(),
                stop.clone(),
                wakeups.clone(),
            ))
        })
        .collect::<Vec<_>>();

    // Use a closure to ensure the watchers are stopped below.
    let result = (|| {
        let ballots = benchmark(
            &registry,
            &id,
            args.threads,
            args.voters_per_thread,
            args.mode,
        )?;

        if args.verify {
            verify(&registry, &creator, &id, ballots)?;
        }

        Ok(())
    })();

    // Stop the watchers.
    stop.store(true, Ordering::Relaxed);
    runtime.block_on(async {
        for watcher in watchers {
            watcher.await??;
        }
        Ok::<_, anyhow::Error>(())
    })?;
    if args.watchers > 0 {
        println!(
            "\nwatchers: {} wakeups across {} watchers",
            wakeups.load(Ordering::Relaxed),
            args.watchers
        );
    }

    result
}

fn main() {
    if let Err(e) = run() {
        eprintln!("FATAL: {}", e);
        process::exit(1);
    }
}
