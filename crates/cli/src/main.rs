//! repoiter - administer persistent repo iterators stored in Postgres.

use anyhow::{Context, Result};
use clap::Parser;

use repoiter_infra::iterator::PostgresIteratorStore;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    repoiter_observability::init();

    let cli = Cli::parse();
    let store = PostgresIteratorStore::connect(&cli.database_url)
        .await
        .context("failed to connect to the database")?;

    let output = match cli.command {
        Command::Migrate => {
            store
                .ensure_schema()
                .await
                .context("failed to apply the iterator schema")?;
            tracing::info!("iterator schema applied");
            serde_json::json!({ "migrated": true })
        }
        command => commands::run(command, store, cli.max_failures).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
