//! Developer task runner (`cargo xtask <task>`). Keeps one-off maintenance
//! commands out of shell scripts and in version control.

use anyhow::{bail, Context, Result};
use std::process::Command;

fn main() -> Result<()> {
    let task = std::env::args().nth(1).unwrap_or_default();
    match task.as_str() {
        "migrate" => migrate(),
        "bootstrap" => bootstrap(),
        _ => {
            eprintln!("Usage: cargo xtask <migrate|bootstrap>");
            eprintln!();
            eprintln!("  migrate    run choreo-core's artifact-store Postgres migrations");
            eprintln!("  bootstrap  create a local dev database and apply migrations");
            Ok(())
        }
    }
}

fn migrate() -> Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set to run migrations")?;
    let status = Command::new("sqlx")
        .args(["migrate", "run", "--source", "choreo-core/migrations"])
        .env("DATABASE_URL", database_url)
        .status()
        .context("failed to invoke sqlx-cli — install with `cargo install sqlx-cli`")?;
    if !status.success() {
        bail!("sqlx migrate run exited with {status}");
    }
    Ok(())
}

fn bootstrap() -> Result<()> {
    let status = Command::new("sqlx")
        .args(["database", "create"])
        .status()
        .context("failed to invoke sqlx-cli — install with `cargo install sqlx-cli`")?;
    if !status.success() {
        bail!("sqlx database create exited with {status}");
    }
    migrate()
}
