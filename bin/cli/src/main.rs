mod commands;
mod config;

use commands::{Command, CommandError, HELP, Listing};
use config::CliConfig;
use counsel_conversation::{
    ChatService, Context, FileCache, Message, MessageRole, ReconcileOutcome, SessionSummary,
};
use counsel_http::HttpBackend;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration from environment
    let config = CliConfig::from_env().expect("failed to load configuration");
    let backend =
        Arc::new(HttpBackend::new(&config.backend).expect("invalid backend configuration"));
    let cache = Arc::new(FileCache::new(config.cache_path));
    tracing::info!(cache = %cache.dir().display(), "loaded configuration");

    let service = ChatService::new(
        config.conversation,
        config.user_id,
        backend.clone(),
        backend.clone(),
        backend,
        cache,
    );

    // Cached sessions are shown before the first network call completes
    let mut listing = Listing::default();
    print_sessions(listing.show(service.list_sessions().await));
    let sync = service.start_sync();
    tokio::spawn(async move {
        match sync.await {
            Ok(outcome) => tracing::info!(?outcome, "initial sync finished"),
            Err(e) => tracing::warn!(error = %e, "initial sync task failed"),
        }
    });

    let mut app = App {
        service,
        listing,
        last_failed: None,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        match line {
            Ok(Some(line)) => {
                if !app.handle(&line).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read input");
                break;
            }
        }
    }

    app.service.shutdown();
}

struct App {
    service: ChatService,
    listing: Listing,
    last_failed: Option<String>,
}

impl App {
    /// Runs one command; returns false to exit.
    async fn handle(&mut self, line: &str) -> bool {
        let command = match commands::parse(line) {
            Ok(command) => command,
            Err(CommandError::Empty) => return true,
            Err(e) => {
                println!("{e}");
                return true;
            }
        };

        match command {
            Command::New => {
                self.service.create_session(Context::None, None).await;
                println!("started a new conversation");
            }
            Command::List => {
                print_sessions(self.listing.show(self.service.list_sessions().await));
            }
            Command::Select(position) => match self.listing.at(position).cloned() {
                Some(session) => {
                    let messages = self.service.select_session(session.local_id).await;
                    println!("== {} ==", session.title);
                    for message in &messages {
                        print_message(message);
                    }
                    print_context(&self.service.context().await);
                }
                None => println!("no conversation at position {position}"),
            },
            Command::Delete(position) => match self.listing.at(position).cloned() {
                Some(session) => match self.service.delete_session(session.local_id).await {
                    Ok(()) => println!("deleted \"{}\"", session.title),
                    Err(report) => println!("! {}", report.current_context()),
                },
                None => println!("no conversation at position {position}"),
            },
            Command::Situation { id, label } => {
                self.service.select_situation(id, label).await;
                print_context(&self.service.context().await);
            }
            Command::Contract { id, label } => {
                self.service.select_contract(id, label).await;
                print_context(&self.service.context().await);
            }
            Command::Clear => {
                self.service.clear_context().await;
                print_context(&Context::None);
            }
            Command::Sync => match self.service.reconcile().await {
                ReconcileOutcome::Merged { sessions } => {
                    println!("synced, {sessions} conversations");
                }
                ReconcileOutcome::Unchanged => println!("already up to date"),
                ReconcileOutcome::RemoteUnavailable => {
                    println!("server unreachable, showing cached conversations");
                }
                ReconcileOutcome::Cancelled | ReconcileOutcome::Skipped => {}
            },
            Command::Retry => match self.last_failed.take() {
                Some(query) => self.send(&query).await,
                None => println!("nothing to retry"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
            Command::Send(query) => self.send(&query).await,
        }
        true
    }

    async fn send(&mut self, query: &str) {
        match self.service.send(query).await {
            Ok(outcome) => print_message(&outcome.assistant),
            Err(report) => {
                let error = report.current_context();
                match error.retry_query() {
                    Some(query) => {
                        self.last_failed = Some(query.to_string());
                        println!("! {error} (type /retry to resend)");
                    }
                    None => println!("! {error}"),
                }
            }
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("no conversations yet, type a question to start one");
        return;
    }
    for (i, session) in sessions.iter().enumerate() {
        let marker = if session.active { '*' } else { ' ' };
        println!(
            "{:>3}.{marker} {} ({} messages)",
            i + 1,
            session.title,
            session.message_count
        );
    }
}

fn print_message(message: &Message) {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "counsel",
    };
    match &message.context.context_id {
        Some(id) => println!("{speaker} [{} {id}]: {}", message.context.context_type, message.content),
        None => println!("{speaker}: {}", message.content),
    }
}

fn print_context(context: &Context) {
    match (context.id(), context.label()) {
        (Some(id), Some(label)) => {
            println!("context: {} {id} ({label})", context.context_type());
        }
        (Some(id), None) => println!("context: {} {id}", context.context_type()),
        _ => println!("context: none"),
    }
}
