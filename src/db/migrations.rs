use anyhow::{bail, Context, Result};
use log::info;
use rusqlite::Connection;

/// Schema scripts in order; entry `n` upgrades `user_version` `n` to `n + 1`.
/// Scripts must tolerate stores that already hold their tables, since
/// unversioned telemetry databases start at version 0.
const MIGRATIONS: &[&str] = &[include_str!("schemas/schema_v1.sql")];

pub const CURRENT_SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Brings the store up to [`CURRENT_SCHEMA_VERSION`] in one transaction and
/// returns the version it started from.
pub fn run_migrations(conn: &mut Connection) -> Result<i32> {
    let found: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    let pending = match usize::try_from(found) {
        Ok(applied) if applied <= MIGRATIONS.len() => &MIGRATIONS[applied..],
        _ => bail!(
            "session store schema version {found} is not supported (expected 0..={CURRENT_SCHEMA_VERSION})"
        ),
    };
    if pending.is_empty() {
        return Ok(found);
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    for (offset, script) in pending.iter().enumerate() {
        let target = found + offset as i32 + 1;
        tx.execute_batch(script)
            .with_context(|| format!("migration to schema version {target} failed"))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    info!("Session store schema upgraded from v{found} to v{CURRENT_SCHEMA_VERSION}");
    Ok(found)
}
