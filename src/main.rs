use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use theta_tutor::models::{AttemptFeedback, DifficultyRating, JsonOutput};
use theta_tutor::{Database, ItemBank, SelectionMode, Store, Tutor, TutorConfig};

const DEFAULT_DB_NAME: &str = "tutor.db";
const CONFIG_ENV: &str = "TUTOR_CONFIG";
const DB_ENV: &str = "TUTOR_DB";
const BANK_ENV: &str = "TUTOR_BANK";

#[derive(Parser)]
#[command(name = "tutor")]
#[command(about = "Adaptive practice: picks the most informative next question and tracks mastery")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the item bank JSON file
    #[arg(long, global = true)]
    bank: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Inspect the item bank
    #[command(subcommand)]
    Bank(BankCommands),

    /// Get the next question to practice
    Next {
        /// User ID
        #[arg(long, short)]
        user: String,

        /// Practice this topic instead, even if already mastered
        #[arg(long)]
        revisit: Option<String>,
    },

    /// Record the outcome of an attempt
    Record {
        /// User ID
        #[arg(long, short)]
        user: String,

        /// Question name
        question: String,

        /// The attempt passed
        #[arg(long, conflicts_with = "failed", required_unless_present = "failed")]
        passed: bool,

        /// The attempt failed
        #[arg(long)]
        failed: bool,

        /// Percentage of tests passed (defaults to 100 or 0)
        #[arg(long)]
        pass_rate: Option<f64>,

        /// How hard it felt: easy/medium/hard
        #[arg(long, short)]
        difficulty: Option<String>,

        /// Confidence from 1 to 5
        #[arg(long, short)]
        confidence: Option<u8>,

        /// Optional notes about the attempt
        #[arg(long, short)]
        notes: Option<String>,
    },

    /// Show per-topic ability and mastery
    Progress {
        /// User ID
        #[arg(long, short)]
        user: String,
    },

    /// Show past attempts
    History {
        /// User ID
        #[arg(long, short)]
        user: String,

        /// Show at most this many attempts
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Rank questions of a topic for a user
    Recommend {
        /// User ID
        #[arg(long, short)]
        user: String,

        /// Topic name
        #[arg(long, short)]
        topic: String,

        /// Number of questions
        #[arg(short, default_value_t = 3)]
        n: usize,
    },

    /// Explain how a question fits a user's ability
    Explain {
        /// User ID
        #[arg(long, short)]
        user: String,

        /// Question name
        question: String,
    },

    /// Replay history and check it against stored ability
    Verify {
        /// User ID
        #[arg(long, short)]
        user: String,
    },

    /// Reset a user's ability (history is kept)
    Reset {
        /// User ID
        #[arg(long, short)]
        user: String,
    },

    /// List known users
    Users,
}

#[derive(Subcommand)]
enum BankCommands {
    /// Validate the item bank
    Validate,

    /// Show topics and question counts
    Show,
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn load_config(flag: Option<&Path>) -> Result<TutorConfig> {
    let path = flag.map(Path::to_path_buf).or_else(|| env_path(CONFIG_ENV));
    Ok(TutorConfig::load_or_default(path.as_deref())?)
}

fn get_db_path(flag: Option<&Path>, env: Option<PathBuf>, config: &TutorConfig) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Some(path) = env.or_else(|| config.storage.database_path.clone()) {
        return path;
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("theta-tutor");

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

fn get_bank_path(flag: Option<&Path>, env: Option<PathBuf>, config: &TutorConfig) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or(env)
        .unwrap_or_else(|| config.bank.path.clone())
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("theta_tutor=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_json<T: serde::Serialize>(output: &JsonOutput<T>) -> Result<()> {
    println!("{}", serde_json::to_string(output)?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let db_path = get_db_path(cli.db.as_deref(), env_path(DB_ENV), &config);
    let bank_path = get_bank_path(cli.bank.as_deref(), env_path(BANK_ENV), &config);

    let db = Database::open(&db_path)
        .with_context(|| format!("cannot open database {}", db_path.display()))?;
    db.init()?;

    let load_bank = || {
        ItemBank::load(&bank_path, &config.engine)
            .with_context(|| format!("loading item bank {}", bank_path.display()))
    };

    match cli.command {
        Commands::Init => {
            if cli.json {
                print_json(&JsonOutput::ok(serde_json::json!({
                    "database": db_path.display().to_string()
                })))?;
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::Bank(bank_cmd) => {
            let bank = load_bank()?;
            match bank_cmd {
                BankCommands::Validate => {
                    if cli.json {
                        print_json(&JsonOutput::ok(serde_json::json!({
                            "version": bank.version(),
                            "topics": bank.topics().len(),
                            "items": bank.items().len()
                        })))?;
                    } else {
                        println!(
                            "Item bank valid: {} topics, {} questions (version {})",
                            bank.topics().len(),
                            bank.items().len(),
                            bank.version()
                        );
                    }
                }
                BankCommands::Show => {
                    let rows: Vec<serde_json::Value> = bank
                        .summary()
                        .into_iter()
                        .map(|(topic, count)| {
                            serde_json::json!({
                                "topic": topic,
                                "questions": count,
                                "level": bank.graph().level(&topic),
                                "prerequisites": bank.graph().prerequisites(&topic),
                                "unlocks": bank.graph().dependents(&topic),
                                "mastery_threshold": bank.mastery_threshold(&topic, &config.engine),
                            })
                        })
                        .collect();
                    if cli.json {
                        print_json(&JsonOutput::ok(&rows))?;
                    } else {
                        println!("{:<32} {:>5} {:>9}  PREREQUISITES", "TOPIC", "QS", "THRESHOLD");
                        println!("{}", "-".repeat(72));
                        for (topic, count) in bank.summary() {
                            let prereqs = bank.graph().prerequisites(&topic);
                            println!(
                                "{:<32} {:>5} {:>9.2}  {}",
                                truncate(&topic, 30),
                                count,
                                bank.mastery_threshold(&topic, &config.engine),
                                if prereqs.is_empty() {
                                    "-".to_string()
                                } else {
                                    prereqs.join(", ")
                                }
                            );
                        }
                    }
                }
            }
        }

        Commands::Users => {
            let users = db.list_users()?;
            if cli.json {
                print_json(&JsonOutput::ok(&users))?;
            } else if users.is_empty() {
                println!("No users yet.");
            } else {
                for user in users {
                    println!("{}", user);
                }
            }
        }

        command => {
            let tutor = Tutor::new(load_bank()?, config.engine.clone(), db)?;
            run_user_command(&tutor, command, cli.json)?;
        }
    }

    Ok(())
}

fn run_user_command(tutor: &Tutor<Database>, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Next { user, revisit } => {
            let mode = revisit.map(SelectionMode::Revisit).unwrap_or_default();
            match tutor.select_with(&user, &mode) {
                Ok(selection) => {
                    if json {
                        print_json(&JsonOutput::ok(&selection))?;
                    } else {
                        println!("=== Next Question ===");
                        println!();
                        println!("Question: {}", selection.item.name);
                        println!("Topic: {}", selection.topic);
                        if !selection.item.description.is_empty() {
                            println!("Description: {}", selection.item.description);
                        }
                        println!(
                            "Tests: {} visible, {} hidden",
                            selection.item.visible_test_count(),
                            selection.item.hidden_test_count()
                        );
                        println!();
                        println!("Your ability: {:.2}", selection.theta);
                        println!("Difficulty: {:.2}", selection.item.difficulty);
                        println!(
                            "Chance of success: {:.0}%",
                            selection.probability_correct * 100.0
                        );
                        println!("Why: {}", selection.reason);
                        if selection.is_fallback {
                            println!("(repeat: every question in this topic was seen recently)");
                        }
                        println!();
                        println!("After attempting, record the outcome with:");
                        println!(
                            "  tutor record --user {} {} --passed|--failed",
                            user, selection.item.name
                        );
                    }
                }
                Err(e) if e.is_recoverable() => {
                    if json {
                        print_json(&JsonOutput::<()>::err(e.to_string()))?;
                    } else {
                        println!("No question available: {}", e);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Record {
            user,
            question,
            passed,
            failed: _,
            pass_rate,
            difficulty,
            confidence,
            notes,
        } => {
            let difficulty_rating = difficulty
                .map(|d| {
                    DifficultyRating::from_str(&d).ok_or_else(|| {
                        anyhow!("Invalid difficulty '{}'. Use: easy, medium, or hard", d)
                    })
                })
                .transpose()?;
            let feedback = AttemptFeedback {
                difficulty_rating,
                confidence_level: confidence,
                notes,
            };
            let rate = pass_rate.unwrap_or(if passed { 100.0 } else { 0.0 });
            let update = tutor.record_attempt_with_feedback(&user, &question, passed, rate, &feedback)?;

            if json {
                print_json(&JsonOutput::ok(&update))?;
            } else {
                println!(
                    "Recorded {} attempt on '{}'.",
                    if update.passed { "passed" } else { "failed" },
                    update.question_name
                );
                println!(
                    "{}: ability {:.2} -> {:.2} ({:.0}% to mastery, {})",
                    update.topic,
                    update.theta_before,
                    update.theta_after,
                    update.progress_percent,
                    update.new_status.label()
                );
                for topic in &update.newly_mastered {
                    println!("Mastered: {}", topic);
                }
                for topic in &update.unlocked_topics {
                    println!("Unlocked: {}", topic);
                }
            }
        }

        Commands::Progress { user } => {
            let report = tutor.get_progress(&user)?;
            if json {
                print_json(&JsonOutput::ok(&report))?;
            } else {
                println!(
                    "{:<32} {:<9} {:>6} {:>9} {:>9}",
                    "TOPIC", "STATUS", "THETA", "PROGRESS", "ATTEMPTS"
                );
                println!("{}", "-".repeat(70));
                for t in &report.topics {
                    println!(
                        "{:<32} {:<9} {:>6.2} {:>8.0}% {:>4}/{:<4}",
                        truncate(&t.topic, 30),
                        t.status.label(),
                        t.theta,
                        t.progress_percent,
                        t.correct_count,
                        t.attempt_count
                    );
                }
                let o = &report.overall;
                println!();
                println!(
                    "Mastered {}/{} topics ({:.0}%), {} opened, {} locked",
                    o.mastered, o.total_topics, o.overall_progress_percent, o.opened, o.locked
                );
                println!("Total attempts: {}", o.total_attempts);
                if o.recent.attempts > 0 {
                    println!(
                        "Recent: {}/{} correct ({:.0}%), mean test pass rate {:.0}%",
                        o.recent.correct,
                        o.recent.attempts,
                        o.recent.accuracy,
                        o.recent.mean_test_pass_rate
                    );
                }
                match &o.current_focus {
                    Some(topic) => println!("Current focus: {}", topic),
                    None if o.mastered == o.total_topics => println!("All topics mastered!"),
                    None => println!("No opened topic with questions."),
                }
            }
        }

        Commands::History { user, limit } => {
            let records = tutor.history(&user, limit)?;
            if json {
                let summary = tutor.history_summary(&user)?;
                print_json(&JsonOutput::ok(serde_json::json!({
                    "records": records,
                    "summary": summary
                })))?;
            } else if records.is_empty() {
                println!("No attempts recorded.");
            } else {
                println!(
                    "{:<5} {:<20} {:<26} {:<6} {:>14}",
                    "ID", "WHEN", "QUESTION", "RESULT", "ABILITY"
                );
                println!("{}", "-".repeat(76));
                for r in &records {
                    println!(
                        "{:<5} {:<20} {:<26} {:<6} {:>6.2} -> {:<5.2}",
                        r.id.unwrap_or_default(),
                        r.timestamp.chars().take(19).collect::<String>(),
                        truncate(&r.question_name, 24),
                        if r.passed { "pass" } else { "fail" },
                        r.theta_before,
                        r.theta_after
                    );
                }
                let summary = tutor.history_summary(&user)?;
                println!();
                println!(
                    "Since last reset: {} attempts, {:.0}% passed",
                    summary.total_attempts, summary.success_rate
                );
                for t in summary.topics.iter().filter(|t| t.attempted > 0) {
                    println!(
                        "  {}: {}/{} ({:.0}%)",
                        t.topic, t.passed, t.attempted, t.success_rate
                    );
                }
            }
        }

        Commands::Recommend { user, topic, n } => {
            let recs = tutor.recommend(&user, &topic, n)?;
            if json {
                print_json(&JsonOutput::ok(&recs))?;
            } else if recs.is_empty() {
                println!("No questions in '{}'.", topic);
            } else {
                println!(
                    "{:<28} {:>6} {:<7} {:>7} {:>6}",
                    "QUESTION", "DIFF", "BAND", "P(OK)", "INFO"
                );
                println!("{}", "-".repeat(60));
                for r in recs {
                    println!(
                        "{:<28} {:>6.2} {:<7} {:>6.0}% {:>6.3}{}",
                        truncate(&r.name, 26),
                        r.difficulty,
                        r.band.as_str(),
                        r.probability_correct * 100.0,
                        r.information,
                        if r.recently_attempted { "  (recent)" } else { "" }
                    );
                }
            }
        }

        Commands::Explain { user, question } => {
            let e = tutor.explain(&user, &question)?;
            if json {
                print_json(&JsonOutput::ok(&e))?;
            } else {
                println!("Question: {} ({})", e.question_name, e.topic);
                println!("Your ability: {:.2}", e.theta);
                println!("Difficulty: {:.2} ({})", e.difficulty, e.band.as_str());
                println!("Chance of success: {:.0}%", e.probability_correct * 100.0);
                println!("Information: {:.3}", e.information);
                println!("{}", e.reason);
            }
        }

        Commands::Verify { user } => {
            let report = tutor.verify_history(&user)?;
            if json {
                print_json(&JsonOutput::ok(&report))?;
            } else {
                println!(
                    "Replayed {} attempts (epoch {}).",
                    report.replayed_attempts, report.epoch
                );
                for m in &report.mismatches {
                    println!(
                        "  record {} ({}): recorded ability {:.4}, replayed {:.4}",
                        m.record_id.unwrap_or_default(),
                        m.question_name,
                        m.recorded_theta_before,
                        m.replayed_theta_before
                    );
                }
                if report.is_consistent() {
                    println!("History is consistent with stored ability.");
                } else if !report.matches_stored {
                    println!("Stored ability differs from replayed history.");
                }
            }
            if !report.is_consistent() {
                return Err(anyhow!("history verification failed for '{}'", user));
            }
        }

        Commands::Reset { user } => {
            let state = tutor.reset_user(&user)?;
            if json {
                print_json(&JsonOutput::ok(&state))?;
            } else {
                println!(
                    "Reset '{}'. Starting epoch {}; history kept.",
                    user, state.epoch
                );
            }
        }

        Commands::Init | Commands::Bank(_) | Commands::Users => {}
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    mod truncate_tests {
        use super::*;

        #[test]
        fn truncate_short_string() {
            assert_eq!(truncate("hello", 10), "hello");
        }

        #[test]
        fn truncate_exact_length() {
            assert_eq!(truncate("hello", 5), "hello");
        }

        #[test]
        fn truncate_long_string() {
            assert_eq!(truncate("hello world", 8), "hello...");
        }

        #[test]
        fn truncate_multibyte_safe() {
            assert_eq!(truncate("θθθθθθ", 5), "θθ...");
        }
    }

    mod cli_parsing_tests {
        use super::*;

        #[test]
        fn cli_definition_is_valid() {
            Cli::command().debug_assert();
        }

        #[test]
        fn parse_init_with_json() {
            let cli = Cli::try_parse_from(["tutor", "--json", "init"]).unwrap();
            assert!(cli.json);
            assert!(matches!(cli.command, Commands::Init));
        }

        #[test]
        fn parse_bank_validate() {
            let cli =
                Cli::try_parse_from(["tutor", "bank", "validate", "--bank", "b.json"]).unwrap();
            assert!(matches!(cli.command, Commands::Bank(BankCommands::Validate)));
            assert_eq!(cli.bank, Some(PathBuf::from("b.json")));
        }

        #[test]
        fn parse_next_with_revisit() {
            let cli =
                Cli::try_parse_from(["tutor", "next", "-u", "ada", "--revisit", "Recursion"])
                    .unwrap();
            match cli.command {
                Commands::Next { user, revisit } => {
                    assert_eq!(user, "ada");
                    assert_eq!(revisit.as_deref(), Some("Recursion"));
                }
                _ => panic!("Expected Next command"),
            }
        }

        #[test]
        fn parse_record_full() {
            let cli = Cli::try_parse_from([
                "tutor",
                "record",
                "--user",
                "ada",
                "fibonacci",
                "--failed",
                "--pass-rate",
                "40",
                "-d",
                "hard",
                "-c",
                "2",
                "-n",
                "forgot base case",
            ])
            .unwrap();
            match cli.command {
                Commands::Record {
                    user,
                    question,
                    passed,
                    failed,
                    pass_rate,
                    difficulty,
                    confidence,
                    notes,
                } => {
                    assert_eq!(user, "ada");
                    assert_eq!(question, "fibonacci");
                    assert!(!passed);
                    assert!(failed);
                    assert_eq!(pass_rate, Some(40.0));
                    assert_eq!(difficulty.as_deref(), Some("hard"));
                    assert_eq!(confidence, Some(2));
                    assert_eq!(notes.as_deref(), Some("forgot base case"));
                }
                _ => panic!("Expected Record command"),
            }
        }

        #[test]
        fn parse_record_requires_outcome() {
            let result = Cli::try_parse_from(["tutor", "record", "-u", "ada", "fibonacci"]);
            assert!(result.is_err());
        }

        #[test]
        fn parse_record_rejects_both_outcomes() {
            let result = Cli::try_parse_from([
                "tutor", "record", "-u", "ada", "fibonacci", "--passed", "--failed",
            ]);
            assert!(result.is_err());
        }

        #[test]
        fn parse_recommend_default_count() {
            let cli =
                Cli::try_parse_from(["tutor", "recommend", "-u", "ada", "-t", "Backtracking"])
                    .unwrap();
            match cli.command {
                Commands::Recommend { n, topic, .. } => {
                    assert_eq!(n, 3);
                    assert_eq!(topic, "Backtracking");
                }
                _ => panic!("Expected Recommend command"),
            }
        }

        #[test]
        fn parse_missing_user_fails() {
            assert!(Cli::try_parse_from(["tutor", "progress"]).is_err());
        }

        #[test]
        fn parse_invalid_command_fails() {
            assert!(Cli::try_parse_from(["tutor", "invalid"]).is_err());
        }
    }

    mod path_tests {
        use super::*;

        #[test]
        fn flag_wins_over_env_and_config() {
            let mut config = TutorConfig::default();
            config.storage.database_path = Some(PathBuf::from("/cfg/tutor.db"));
            let path = get_db_path(
                Some(Path::new("/flag/tutor.db")),
                Some(PathBuf::from("/env/tutor.db")),
                &config,
            );
            assert_eq!(path, PathBuf::from("/flag/tutor.db"));
        }

        #[test]
        fn env_wins_over_config() {
            let mut config = TutorConfig::default();
            config.storage.database_path = Some(PathBuf::from("/cfg/tutor.db"));
            let path = get_db_path(None, Some(PathBuf::from("/env/tutor.db")), &config);
            assert_eq!(path, PathBuf::from("/env/tutor.db"));
            let path = get_db_path(None, None, &config);
            assert_eq!(path, PathBuf::from("/cfg/tutor.db"));
        }

        #[test]
        fn default_db_path_ends_with_db_name() {
            let path = get_db_path(None, None, &TutorConfig::default());
            assert!(path.ends_with("theta-tutor/tutor.db"));
        }

        #[test]
        fn bank_path_precedence() {
            let config = TutorConfig::default();
            assert_eq!(
                get_bank_path(None, None, &config),
                PathBuf::from("bank.json")
            );
            assert_eq!(
                get_bank_path(None, Some(PathBuf::from("env.json")), &config),
                PathBuf::from("env.json")
            );
            assert_eq!(
                get_bank_path(
                    Some(Path::new("flag.json")),
                    Some(PathBuf::from("env.json")),
                    &config
                ),
                PathBuf::from("flag.json")
            );
        }
    }
}
