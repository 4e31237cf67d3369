//! Wellness CLI - Command-line interface for Wellness Sync
//!
//! Commands:
//! - sync: Merge a health data export into the stored profile
//! - show: Print the stored profile
//! - edit: Change one profile field
//! - predict: Request a stress prediction for the stored profile
//! - doctor: Diagnose configuration and store health

use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use wellness_sync::store::to_pretty_json;
use wellness_sync::{
    submit_prediction, HealthDataReader, HttpPredictionClient, JsonExportProvider, PreferenceStore,
    ProfileField, ReconciliationEngine, StartOutcome, StressPredictionRequest, SyncConfig,
    SyncError, TimeWindow, UserProfile, PRODUCER_NAME, VERSION,
};

/// Wellness - On-device reconciliation of health data with a wellness profile
#[derive(Parser)]
#[command(name = "wellness")]
#[command(author = "Synheart AI Inc")]
#[command(version = VERSION)]
#[command(about = "Sync health data into a wellness profile and request stress predictions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preference store file (overrides config and WELLNESS_STORE)
    #[arg(short, long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a health data export into the stored profile
    Sync {
        /// Health Connect style JSON export
        #[arg(short, long)]
        export: PathBuf,

        /// Treat the sync as user-requested (prompts for access, resets manual edits)
        #[arg(long)]
        user: bool,

        /// Reference instant for "today" (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Print the stored profile
    Show {
        /// Output the persisted entries as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Change one profile field
    Edit {
        /// Field key (e.g. daily_steps, bmi_category)
        field: String,

        /// New value (empty string clears the field)
        value: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Request a stress prediction for the stored profile
    Predict {
        /// Print the request body instead of sending it
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Diagnose configuration and store health
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        store: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), WellnessCliError> {
    match cli.command {
        Commands::Sync {
            export,
            user,
            at,
            json,
            store,
        } => cmd_sync(&export, user, at.as_deref(), json, &store).await,

        Commands::Show { json, store } => cmd_show(json, &store),

        Commands::Edit { field, value, store } => cmd_edit(&field, value, &store).await,

        Commands::Predict { dry_run, store } => cmd_predict(dry_run, &store).await,

        Commands::Doctor { json, store } => cmd_doctor(json, &store),
    }
}

fn load_config(args: &StoreArgs) -> Result<SyncConfig, WellnessCliError> {
    let mut config = SyncConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.store {
        config.store_path = path.clone();
    }
    Ok(config)
}

fn open_store(config: &SyncConfig) -> Result<Arc<PreferenceStore>, WellnessCliError> {
    Ok(Arc::new(PreferenceStore::json_file(&config.store_path)?))
}

async fn cmd_sync(
    export: &Path,
    user: bool,
    at: Option<&str>,
    json: bool,
    args: &StoreArgs,
) -> Result<(), WellnessCliError> {
    let config = load_config(args)?;
    let store = open_store(&config)?;

    let now = match at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| WellnessCliError::BadArgument(format!("--at: {}", e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let provider = JsonExportProvider::from_path(export)?;
    let reader = HealthDataReader::with_timeout(Arc::new(provider), config.fetch_timeout());
    let engine = ReconciliationEngine::new(reader, store)
        .with_window_source(move || TimeWindow::day_to_date(now, &Local));

    let profile = if user {
        engine.authorize_and_sync().await?
    } else {
        match engine.start().await? {
            StartOutcome::Synced(profile) => profile,
            StartOutcome::NeedsAuthorization => return Err(WellnessCliError::NeedsAuthorization),
        }
    };

    if json {
        println!("{}", to_pretty_json(&profile.to_entries())?);
    } else {
        println!("Synced health data");
        println!("  Daily steps:    {}", profile.display_value(ProfileField::DailySteps));
        println!("  Sleep duration: {}", profile.display_value(ProfileField::SleepDuration));
        println!("  Heart rate:     {}", profile.display_value(ProfileField::HeartRate));
    }
    Ok(())
}

fn cmd_show(json: bool, args: &StoreArgs) -> Result<(), WellnessCliError> {
    let config = load_config(args)?;
    let profile = open_store(&config)?.load_profile();

    if json {
        println!("{}", to_pretty_json(&profile.to_entries())?);
    } else {
        println!("Wellness Profile");
        println!("================");
        for field in ProfileField::ALL {
            println!("  {:<16} {}", field.key(), profile.display_value(field));
        }
    }
    Ok(())
}

async fn cmd_edit(field: &str, value: String, args: &StoreArgs) -> Result<(), WellnessCliError> {
    let field: ProfileField = field
        .parse()
        .map_err(|_| SyncError::UnknownField(field.to_string()))?;
    if !field.is_valid_choice(&value) {
        return Err(SyncError::InvalidChoice { field, value }.into());
    }

    let config = load_config(args)?;
    let store = open_store(&config)?;
    let saved = store.update(|profile| profile.set(field, value)).await?;
    println!("{} = {}", field, saved.display_value(field));
    Ok(())
}

async fn cmd_predict(dry_run: bool, args: &StoreArgs) -> Result<(), WellnessCliError> {
    let config = load_config(args)?;
    let profile = open_store(&config)?.load_profile();

    if dry_run {
        let request = StressPredictionRequest::from_profile(&profile)?;
        println!("{}", to_pretty_json(&request)?);
        return Ok(());
    }

    let client = HttpPredictionClient::from_config(&config);
    let response = submit_prediction(&client, &profile).await?;
    println!("Predicted stress level: {}", response.predicted_stress_level);
    Ok(())
}

fn cmd_doctor(json: bool, args: &StoreArgs) -> Result<(), WellnessCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    let config = match load_config(args) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!("Prediction service at {}", config.prediction_base_url),
            });
            Some(config)
        }
        Err(e) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: CliError::from(e).message,
            });
            None
        }
    };

    if let Some(config) = &config {
        if !config.store_path.exists() {
            checks.push(DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Warning,
                message: format!("{} does not exist yet", config.store_path.display()),
            });
        } else {
            match PreferenceStore::json_file(&config.store_path) {
                Ok(store) => {
                    let profile = store.load_profile();
                    checks.push(DoctorCheck {
                        name: "store".to_string(),
                        status: CheckStatus::Ok,
                        message: format!("Readable at {}", config.store_path.display()),
                    });
                    checks.push(prediction_readiness(&profile));
                }
                Err(e) => checks.push(DoctorCheck {
                    name: "store".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot read store: {}", e),
                }),
            }
        }
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (scripted mode)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", to_pretty_json(&report)?);
    } else {
        println!("Wellness Doctor Report");
        println!("======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(WellnessCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn prediction_readiness(profile: &UserProfile) -> DoctorCheck {
    match StressPredictionRequest::from_profile(profile) {
        Ok(_) => DoctorCheck {
            name: "prediction_input".to_string(),
            status: CheckStatus::Ok,
            message: "Profile is complete".to_string(),
        },
        Err(e) => DoctorCheck {
            name: "prediction_input".to_string(),
            status: CheckStatus::Warning,
            message: e.to_string(),
        },
    }
}

// Error types

#[derive(Debug)]
enum WellnessCliError {
    Sync(SyncError),
    BadArgument(String),
    NeedsAuthorization,
    DoctorFailed,
}

impl From<SyncError> for WellnessCliError {
    fn from(e: SyncError) -> Self {
        WellnessCliError::Sync(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<WellnessCliError> for CliError {
    fn from(e: WellnessCliError) -> Self {
        match e {
            WellnessCliError::Sync(e) => {
                let (code, hint) = match &e {
                    SyncError::AuthorizationDenied => ("PERMISSION_DENIED", Some("Export all of steps, sleep and heart rate")),
                    SyncError::MissingField(_) | SyncError::InvalidNumber(_) => {
                        ("VALIDATION_ERROR", Some("Fill in the profile with 'wellness edit'"))
                    }
                    SyncError::InvalidChoice { .. } | SyncError::UnknownField(_) => {
                        ("VALIDATION_ERROR", Some("Run 'wellness show' to list fields"))
                    }
                    SyncError::PredictionStatus { .. } | SyncError::PredictionTransport(_) => {
                        ("PREDICTION_ERROR", Some("Check prediction_base_url and network access"))
                    }
                    SyncError::Config(_) => ("CONFIG_ERROR", Some("Check the config file and WELLNESS_* variables")),
                    SyncError::Io(_) | SyncError::Storage(_) => ("IO_ERROR", Some("Check file paths and permissions")),
                    SyncError::JsonError(_) => ("JSON_ERROR", Some("Check JSON syntax")),
                    _ => ("SYNC_ERROR", None),
                };
                CliError {
                    code: code.to_string(),
                    message: e.user_message(),
                    hint: hint.map(str::to_string),
                }
            }
            WellnessCliError::BadArgument(msg) => CliError {
                code: "BAD_ARGUMENT".to_string(),
                message: msg,
                hint: Some("Run with --help for usage".to_string()),
            },
            WellnessCliError::NeedsAuthorization => CliError {
                code: "NEEDS_AUTHORIZATION".to_string(),
                message: "Health data access not granted".to_string(),
                hint: Some("Re-run with --user to request access".to_string()),
            },
            WellnessCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
