use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use socialite_presence::{MembershipStatus, PartyId, PresenceEngine, UserId};
use socialite_server::config::ServerConfig;
use socialite_server::{serve, AppState};
use socialite_store::{FriendshipStatus, SqliteRelationshipStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the presence server (default)
    Run,
    /// Manage the relationship database
    Db {
        /// Path to the relationship database
        #[arg(long, default_value = "data/socialite.db")]
        path: PathBuf,
        #[command(subcommand)]
        action: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create the schema if missing
    Init,
    /// Record a friendship (confirmed unless --pending)
    AddFriend {
        user: String,
        friend: String,
        #[arg(long)]
        pending: bool,
    },
    /// Remove a friendship
    RemoveFriend { user: String, friend: String },
    /// Record a party membership (active unless --invited)
    AddMember {
        party: String,
        user: String,
        #[arg(long)]
        invited: bool,
    },
    /// Remove a party membership
    RemoveMember { party: String, user: String },
    /// Print every friendship and membership
    Dump,
}

#[derive(Debug)]
enum DbOutcome {
    Done,
    Missing,
}

fn user_arg(name: &str) -> Result<UserId, String> {
    UserId::parse(name).ok_or_else(|| format!("invalid user name {name:?}"))
}

fn party_arg(name: &str) -> Result<PartyId, String> {
    PartyId::parse(name).ok_or_else(|| format!("invalid party name {name:?}"))
}

fn run_db_command(path: &Path, action: &DbCommands) -> Result<DbOutcome, String> {
    let store = SqliteRelationshipStore::open(path).map_err(|e| e.to_string())?;
    let db = |e: StoreError| e.to_string();
    match action {
        DbCommands::Init => {}
        DbCommands::AddFriend {
            user,
            friend,
            pending,
        } => {
            let status = if *pending {
                FriendshipStatus::Sent
            } else {
                FriendshipStatus::Confirmed
            };
            store
                .put_friendship(&user_arg(user)?, &user_arg(friend)?, status)
                .map_err(db)?;
        }
        DbCommands::RemoveFriend { user, friend } => {
            if !store
                .delete_friendship(&user_arg(user)?, &user_arg(friend)?)
                .map_err(db)?
            {
                return Ok(DbOutcome::Missing);
            }
        }
        DbCommands::AddMember {
            party,
            user,
            invited,
        } => {
            let status = if *invited {
                MembershipStatus::Invited
            } else {
                MembershipStatus::Active
            };
            store
                .put_party_membership(&party_arg(party)?, &user_arg(user)?, status)
                .map_err(db)?;
        }
        DbCommands::RemoveMember { party, user } => {
            if !store
                .delete_party_membership(&party_arg(party)?, &user_arg(user)?)
                .map_err(db)?
            {
                return Ok(DbOutcome::Missing);
            }
        }
        DbCommands::Dump => {
            for friendship in store.friendships().map_err(db)? {
                println!(
                    "friendship {} {} {}",
                    friendship.user1,
                    friendship.user2,
                    friendship.status.as_str()
                );
            }
            for membership in store.party_memberships().map_err(db)? {
                println!(
                    "member {} {} {:?}",
                    membership.party, membership.user, membership.status
                );
            }
        }
    }
    Ok(DbOutcome::Done)
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
    info!("shutdown requested");
    token.cancel();
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("SOCIALITE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Db { path, action }) = &cli.command {
        match run_db_command(path, action) {
            Ok(DbOutcome::Done) => println!("ok"),
            Ok(DbOutcome::Missing) => std::process::exit(3),
            Err(err) => {
                error!("{err}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match ServerConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = config.verify() {
        error!("invalid config: {err}");
        std::process::exit(1);
    }

    let store = match SqliteRelationshipStore::open(&config.database_path) {
        Ok(store) => store,
        Err(err) => {
            error!(
                "relationship db unavailable at {}: {err}",
                config.database_path.display()
            );
            std::process::exit(1);
        }
    };

    let engine = match PresenceEngine::start(config.presence(), Arc::new(store)) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!("failed to start presence engine: {err}");
            std::process::exit(1);
        }
    };

    let listen_addr = config.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {listen_addr}: {err}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        engine: Arc::clone(&engine),
        service_name: config.service_name.clone(),
    };
    let shutdown = CancellationToken::new();
    if let Err(err) = serve(listener, state, shutdown_signal(shutdown.clone())).await {
        error!("http server failed: {err}");
    }

    engine.shutdown().await;
    info!("socialite stopped");
}
