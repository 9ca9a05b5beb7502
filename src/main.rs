use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use subscout::config::Config;
use subscout::crypto::TokenCipher;
use subscout::db::Database;
use subscout::extract::SignalExtractor;
use subscout::gmail::GmailClient;
use subscout::ingest::CandidateStore;
use subscout::oauth::{GoogleOAuth, OAuthClient};
use subscout::pipeline::{IngestionOptions, IngestionPipeline, cancellation};
use subscout::token::TokenManager;
use subscout::vendor::{VendorCatalog, VendorResolver};
use subscout::{BatchSummary, PipelineError, ReviewStatus, SubscriptionCandidate};

#[derive(Parser)]
#[command(name = "subscout", version, about = "Find subscriptions in your mailbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to ./settings.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// User the mailbox credential belongs to
    #[arg(long, global = true, env = "SUBSCOUT_USER", default_value = "default")]
    user: String,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize mailbox access
    Connect {
        /// Authorization code; prompted for when omitted
        #[arg(long)]
        code: Option<String>,
    },
    /// Forget the stored mailbox credential
    Disconnect,
    /// Search the mailbox and store new candidates
    Scan {
        #[arg(long)]
        max: Option<u32>,
        /// Search keyword (repeatable); replaces the configured set
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Resume token printed by an interrupted scan
        #[arg(long)]
        resume: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List stored candidates
    Candidates {
        #[arg(long, value_parser = parse_status)]
        status: Option<ReviewStatus>,
        #[arg(long)]
        json: bool,
    },
    /// Approve, reject, or merge a pending candidate
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
}

#[derive(Subcommand)]
enum ReviewAction {
    Approve { id: String },
    Reject { id: String },
    /// Link the candidate to an existing subscription
    Merge { id: String, subscription: String },
}

fn parse_status(value: &str) -> std::result::Result<ReviewStatus, String> {
    ReviewStatus::parse(value)
        .ok_or_else(|| format!("unknown status '{}' (pending, approved, rejected, merged)", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?
            .with_context(|| format!("Settings file {} not found", path.display()))?,
        None => Config::load(),
    };

    let db = Database::new(&config.database_url)
        .await
        .context("Failed to open database")?;
    db.run_migrations().await.context("Failed to run migrations")?;

    match cli.command {
        Commands::Connect { code } => cmd_connect(&config, db, &cli.user, code).await,
        Commands::Disconnect => cmd_disconnect(db, &cli.user).await,
        Commands::Scan {
            max,
            keywords,
            resume,
            json,
        } => {
            let options = IngestionOptions {
                max_results: max,
                keywords: (!keywords.is_empty()).then_some(keywords),
                page_token: resume,
            };
            cmd_scan(&config, db, &cli.user, options, json).await
        }
        Commands::Candidates { status, json } => {
            let store = CandidateStore::new(db, config.scan.min_confidence);
            let candidates = store.get_candidates(&cli.user, status).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                print_candidates(&candidates);
            }
            Ok(())
        }
        Commands::Review { action } => {
            let store = CandidateStore::new(db, config.scan.min_confidence);
            let candidate = match action {
                ReviewAction::Approve { id } => store.approve(&cli.user, &id).await?,
                ReviewAction::Reject { id } => store.reject(&cli.user, &id).await?,
                ReviewAction::Merge { id, subscription } => {
                    store.merge(&cli.user, &id, &subscription).await?
                }
            };
            println!(
                "{} ({}) is now {}",
                candidate.vendor_name,
                candidate.id,
                candidate.status.as_str()
            );
            Ok(())
        }
    }
}

fn setup_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn google_oauth(config: &Config) -> Result<Arc<GoogleOAuth>> {
    let secret = GoogleOAuth::load_secret(&config.client_secret_path).await?;
    let oauth = GoogleOAuth::new(secret, config.redirect_uri.clone())?
        .with_timeout(config.scan.request_timeout());
    Ok(Arc::new(oauth))
}

fn token_manager(config: &Config, db: Database, oauth: Arc<dyn OAuthClient>) -> Result<TokenManager> {
    let cipher = TokenCipher::from_config(&config.encryption)?;
    Ok(TokenManager::new(
        db,
        cipher,
        oauth,
        config.tokens.refresh_buffer_secs,
    ))
}

async fn cmd_connect(config: &Config, db: Database, user: &str, code: Option<String>) -> Result<()> {
    let oauth = google_oauth(config).await?;

    let code = match code {
        Some(code) => code,
        None => {
            let url = oauth.authorize_url(user)?;
            println!("Open this URL to grant read-only mailbox access:\n\n{}\n", url);
            if let Err(e) = open::that(url.as_str()) {
                tracing::debug!("Could not open browser: {}", e);
            }
            println!("Paste the authorization code:");
            let mut line = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .context("Failed to read authorization code")?;
            line.trim().to_string()
        }
    };
    anyhow::ensure!(!code.is_empty(), "No authorization code given");

    let tokens = token_manager(config, db, oauth)?;
    let gmail = GmailClient::new()?;
    let credential = tokens.connect(user, &code, &gmail).await?;
    println!("Connected {}", credential.email);
    Ok(())
}

async fn cmd_disconnect(db: Database, user: &str) -> Result<()> {
    let removed = db.delete_credential(user).await?;
    if removed {
        println!("Disconnected mailbox for {}", user);
    } else {
        println!("No mailbox connected for {}", user);
    }
    Ok(())
}

async fn cmd_scan(
    config: &Config,
    db: Database,
    user: &str,
    options: IngestionOptions,
    json: bool,
) -> Result<()> {
    let oauth = google_oauth(config).await?;
    let tokens = Arc::new(token_manager(config, db.clone(), oauth)?);
    let catalog = VendorCatalog::with_definitions(&config.vendors)?;
    let pipeline = IngestionPipeline::new(
        tokens,
        Arc::new(GmailClient::new()?),
        SignalExtractor::new(VendorResolver::new(catalog)),
        CandidateStore::new(db, config.scan.min_confidence),
        config.scan.clone(),
    );

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing current message");
            handle.cancel();
        }
    });

    let summary = match pipeline.run_ingestion(user, options, &cancel).await {
        Ok(summary) => summary,
        Err(e @ (PipelineError::NotConnected(_) | PipelineError::AuthExpired)) => {
            anyhow::bail!("{}. Run `subscout connect` to authorize the mailbox.", e)
        }
        Err(e) => return Err(e).context("Scan failed"),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "Scanned {}: {} saved, {} skipped, {} low confidence, {} errors",
        summary.total, summary.saved, summary.skipped, summary.low_confidence, summary.errors
    );
    if let Some(reason) = summary.stopped {
        println!("Stopped early ({:?}).", reason);
        if let Some(token) = &summary.resume_page_token {
            println!("Resume with: subscout scan --resume {}", token);
        }
    }
}

fn print_candidates(candidates: &[SubscriptionCandidate]) {
    if candidates.is_empty() {
        println!("No candidates.");
        return;
    }
    for c in candidates {
        let amount = match (c.data.amount, &c.data.currency) {
            (Some(amount), Some(currency)) => format!("{:.2} {}", amount, currency),
            (Some(amount), None) => format!("{:.2}", amount),
            _ => "-".to_string(),
        };
        println!(
            "{}  {:<8}  {:<20}  {:>12}  {:<7}  {:>3}%  {}",
            c.id,
            c.status.as_str(),
            c.vendor_name,
            amount,
            c.data.billing_cycle.as_str(),
            c.confidence,
            c.metadata.subject
        );
    }
}
