use std::{
    env, fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context;
use clap::Parser;
use creditgate::auth::Role;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Serve the HTTP API.
    Server,

    /// Mint a JWT for the given user.
    Jwt {
        uid: String,

        /// Seconds until expiry.
        ttl: f64,

        #[clap(long, value_enum, default_value = "user")]
        role: Role,
    },

    /// Refund reservations left pending past their TTL, then exit.
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    creditgate::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    let conf = creditgate::conf::global();
    match &cli.cmd {
        Cmd::Server => creditgate::server::run(conf).await,
        Cmd::Jwt { uid, ttl, role } => {
            let claims = creditgate::auth::Claims::new(
                uid,
                *role,
                Duration::from_secs_f64(*ttl),
                &conf.jwt,
            )?;
            let encoded: String = claims.to_str(&conf.jwt)?;
            println!("{encoded}");
            Ok(())
        }
        Cmd::Reconcile => {
            let storage = creditgate::data::Storage::connect(&conf).await?;
            let cutoff = SystemTime::now()
                .checked_sub(conf.ledger.reservation_ttl())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let refunded = storage.recover_stale(cutoff).await?;
            for reservation in &refunded {
                let created = chrono::DateTime::from_timestamp(
                    reservation.created_at,
                    0,
                )
                .map_or_else(
                    || reservation.created_at.to_string(),
                    |t| t.to_rfc3339(),
                );
                println!(
                    "{}\t{}\t{}\t{created}",
                    reservation.id, reservation.uid, reservation.amount
                );
            }
            tracing::info!(count = refunded.len(), "Reconciled.");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
