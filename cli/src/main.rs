use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use engage::config::EngageConfig;
use engage::feed::pager::{FeedPager, LoadOutcome};
use engage::feed::visibility::Intersection;
use engage::net::api::{ApiError, AuthProvider, FeedApi, HttpFeedApi, TokenAuth};
use engage::net::channel::ChannelError;
use engage::net::types::SessionIdentity;
use engage::net::ws::WsDialer;
use engage::realtime::audio::{AudioError, AudioSink, Cue, NullAudio};
use engage::realtime::presenter::{Navigator, Toast};
use engage::realtime::session::RealtimeSession;
use engage::realtime::signal::SignalFamily;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("event channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("feed request failed: {0}")]
    Api(#[from] ApiError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("notification board shut down")]
    BoardGone,
}

#[derive(Parser, Debug)]
#[command(name = "engage", about = "Notification and feed client for the engagement backend")]
struct Cli {
    #[arg(long, env = "ENGAGE_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "ENGAGE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "ENGAGE_REFRESH_TOKEN")]
    refresh_token: Option<String>,

    #[arg(long, env = "ENGAGE_IDENTITY", default_value = "cli")]
    identity: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream notifications as toasts until interrupted.
    Watch(WatchArgs),
    /// Page through the content feed.
    Feed(FeedArgs),
    /// Toggle the like on one feed item.
    Like { item_id: String },
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long, default_value_t = false, help = "Do not ring the terminal bell")]
    quiet: bool,

    #[arg(long, default_value_t = false, help = "Run each toast's action as soon as it shows")]
    open: bool,
}

#[derive(Args, Debug)]
struct FeedArgs {
    #[arg(long, default_value_t = 1)]
    pages: u32,

    #[arg(long, default_value_t = false, help = "Report every printed item as viewed")]
    impressions: bool,
}

struct CliContext {
    config: EngageConfig,
    auth: Arc<TokenAuth>,
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = EngageConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let mut auth = TokenAuth::new(&config.base_url, SessionIdentity::new(cli.identity), cli.token.clone());
    if let Some(refresh_token) = cli.refresh_token {
        auth = auth.with_refresh_token(refresh_token);
    }
    let ctx = CliContext { config, auth: Arc::new(auth), token: cli.token };

    match cli.command {
        Command::Watch(args) => run_watch(&ctx, args).await,
        Command::Feed(args) => run_feed(&ctx, args).await,
        Command::Like { item_id } => run_like(&ctx, &item_id).await,
    }
}

// =============================================================================
// WATCH
// =============================================================================

/// Rings the terminal bell once per cue.
struct TerminalBell;

impl AudioSink for TerminalBell {
    fn play(&self, _slot: SignalFamily, _cue: &Cue) -> Result<(), AudioError> {
        let mut stderr = std::io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|e| AudioError::Playback(e.to_string()))
    }
}

/// Prints deep links instead of navigating.
struct PrintNavigator;

impl Navigator for PrintNavigator {
    fn navigate(&self, path: &str) {
        println!("  -> {path}");
    }
}

async fn run_watch(ctx: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let dialer = WsDialer::new(&ctx.config.base_url, &ctx.config.ws_path, ctx.token.as_deref())?;
    tracing::info!(url = dialer.url(), "watching notifications");

    let audio: Arc<dyn AudioSink> = if args.quiet { Arc::new(NullAudio) } else { Arc::new(TerminalBell) };
    let session = RealtimeSession::new(&ctx.config, Arc::new(dialer), audio, Arc::new(PrintNavigator));
    session.start(ctx.auth.as_ref());

    let mut revisions = session.board().subscribe();
    let mut shown: HashSet<String> = HashSet::new();
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            changed = revisions.changed() => {
                if changed.is_err() {
                    break Err(CliError::BoardGone);
                }
                let toasts = session.toasts();
                for toast in &toasts {
                    if shown.insert(toast.signal_id.clone()) {
                        print_toast(toast);
                        if args.open {
                            session.activate(toast.family);
                        }
                    }
                }
                shown.retain(|id| toasts.iter().any(|toast| &toast.signal_id == id));
            }
        }
    };

    session.stop();
    result
}

fn print_toast(toast: &Toast) {
    let family = match toast.family {
        SignalFamily::DirectMessage => "message",
        SignalFamily::Generic => "notice",
    };
    if toast.body.is_empty() {
        println!("[{family}] {}", toast.title);
    } else {
        println!("[{family}] {}: {}", toast.title, toast.body);
    }
    if let Some(action) = &toast.action {
        println!("  {} {}", action.label, action.link);
    }
}

// =============================================================================
// FEED
// =============================================================================

fn feed_api(ctx: &CliContext) -> Arc<HttpFeedApi> {
    let auth: Arc<dyn AuthProvider> = ctx.auth.clone();
    Arc::new(HttpFeedApi::new(&ctx.config.base_url, auth))
}

async fn run_feed(ctx: &CliContext, args: FeedArgs) -> Result<(), CliError> {
    let pager = FeedPager::new(feed_api(ctx), ctx.config.pager_settings());

    let mut outcome = pager.load_initial().await;
    let mut printed = 0;
    let mut pages = 1;
    loop {
        let snapshot = pager.snapshot();
        for item in &snapshot.items[printed..] {
            println!("{}", serde_json::to_string(item)?);
        }
        let fresh = &snapshot.items[printed..];
        printed = snapshot.items.len();

        if pages >= args.pages || !snapshot.has_more {
            break;
        }
        pages += 1;
        outcome = if args.impressions {
            // Scrolling past a page shows every item, sentinel last.
            let reports: Vec<Intersection> = fresh.iter().map(|item| Intersection::new(item.id.clone(), 1.0)).collect();
            pager.handle_intersections(&reports).await.unwrap_or(LoadOutcome::Skipped)
        } else {
            pager.load_more().await
        };
        if outcome == LoadOutcome::Skipped {
            break;
        }
    }

    tracing::info!(items = printed, viewed = pager.viewed_count(), ?outcome, "feed done");
    Ok(())
}

async fn run_like(ctx: &CliContext, item_id: &str) -> Result<(), CliError> {
    let state = feed_api(ctx).toggle_like(item_id).await?;
    println!("{}", serde_json::to_string(&state)?);
    Ok(())
}
