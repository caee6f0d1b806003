//! Administrative tool for direct store maintenance.
//!
//! Needs exclusive access to the store: stop `folio-server` first. Every
//! write still produces change rows, which a relay picks up once the server
//! is back.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use folio_live::config::Config;
use folio_live::gate::{CallerMeta, Revocation};
use folio_live::services::Services;
use folio_store::AuditFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "folio-admin")]
#[command(about = "Folio store administration")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "PATH", default_value = "folio.toml")]
    config: PathBuf,

    /// Administrator recorded in the audit log
    #[arg(long, default_value_t = Uuid::nil())]
    admin: Uuid,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the revisions of a document
    Revisions { doc: Uuid },
    /// Set or clear the current flag of one revision (no policy checks)
    SetCurrent {
        doc: Uuid,
        number: u64,
        #[arg(long)]
        clear: bool,
    },
    /// Delete a document and its revisions
    DeleteDocument { doc: Uuid },
    /// Revoke a user, globally or on one document
    Revoke {
        user: Uuid,
        #[arg(long)]
        resource: Option<Uuid>,
        #[arg(long)]
        reason: String,
        /// Expiry in epoch milliseconds
        #[arg(long)]
        expires_at: Option<u64>,
    },
    /// Restore a revoked user
    Restore {
        user: Uuid,
        #[arg(long)]
        resource: Option<Uuid>,
        #[arg(long)]
        reason: String,
    },
    /// Print recent audit entries
    Audit {
        #[arg(long)]
        subject: Option<Uuid>,
        #[arg(long)]
        resource: Option<Uuid>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    let services = Services::open(&config)?;
    let caller = CallerMeta {
        ip: None,
        agent: Some("folio-admin".to_string()),
    };

    match args.command {
        Command::Revisions { doc } => {
            for rev in services.store.list_revisions(doc)? {
                println!(
                    "#{:<4} {:<11} current={:<5} archived={:<5} chars={:<7} updated_at={}",
                    rev.number,
                    rev.reason.as_str(),
                    rev.is_current,
                    rev.is_archived,
                    rev.metrics.chars,
                    rev.updated_at
                );
            }
        }
        Command::SetCurrent { doc, number, clear } => {
            services.store.set_current_flag(doc, number, !clear)?;
            println!("{doc}#{number} current={}", !clear);
        }
        Command::DeleteDocument { doc } => {
            services.store.delete_document(doc)?;
            println!("deleted {doc}");
        }
        Command::Revoke {
            user,
            resource,
            reason,
            expires_at,
        } => {
            let record = services.gate.revoke(
                Revocation {
                    admin_id: args.admin,
                    user_id: user,
                    resource_id: resource,
                    reason,
                    expires_at,
                },
                &caller,
            )?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Restore {
            user,
            resource,
            reason,
        } => {
            let record = services
                .gate
                .restore(args.admin, user, resource, &reason, &caller)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Audit {
            subject,
            resource,
            limit,
        } => {
            let entries = services.store.audit_entries(&AuditFilter {
                subject_id: subject,
                resource_id: resource,
                limit,
            })?;
            for entry in entries {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }
    Ok(())
}
