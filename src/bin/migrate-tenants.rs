/// Operator tool for the tenant schema fleet.
///
/// Usage:
///   migrate-tenants migrations [--concurrency N]
///   migrate-tenants patches    [--concurrency N]
///   migrate-tenants provision --slug SLUG --email EMAIL --password PW --company NAME
///
/// Prints the BatchReport as JSON; exits non-zero if any tenant failed so CI
/// and cron alerting can pick it up.

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use parceldesk_api::db::directory::TenantDirectory;
use parceldesk_api::db::migrations::MigrationOrchestrator;
use parceldesk_api::db::patches::SchemaPatchApplier;
use parceldesk_api::db::provision::TenantProvisioner;
use parceldesk_api::db::router::SchemaRouter;

#[derive(Parser)]
#[command(name = "migrate-tenants", about = "Run migrations and patches across all tenant schemas")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the shared migration set to every eligible tenant schema
    Migrations {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Apply the idempotent patch set to every eligible tenant schema
    Patches {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Provision (or re-run provisioning for) one tenant
    Provision {
        #[arg(long)]
        slug: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        company: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    let router = SchemaRouter::new(pool.clone());
    let directory = TenantDirectory::new(pool);
    let cancel = CancellationToken::new();

    match args.command {
        Command::Migrations { concurrency } => {
            let orchestrator = MigrationOrchestrator::new(router, directory, concurrency);
            let report = orchestrator.run_all(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_succeeded() {
                std::process::exit(1);
            }
        }
        Command::Patches { concurrency } => {
            let applier = SchemaPatchApplier::new(router, directory, concurrency);
            let report = applier.run_all(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_succeeded() {
                std::process::exit(1);
            }
        }
        Command::Provision {
            slug,
            email,
            password,
            company,
        } => {
            let tenant = directory.resolve(&slug).await?;
            let password_hash = bcrypt::hash(&password, 12)?;
            let provisioner = TenantProvisioner::new(router);
            provisioner
                .provision(tenant.id, &tenant.slug, &email, &password_hash, &company)
                .await?;
            println!("{}", serde_json::json!({ "provisioned": tenant.slug }));
        }
    }

    Ok(())
}
