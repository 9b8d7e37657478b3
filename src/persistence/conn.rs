use std::path::Path;

use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema,
    sea_query::{IndexCreateStatement, TableCreateStatement},
};

use crate::error::PolygateError;

/// Opens (creating if necessary) a SQLite database at `path` with the
/// standard pragmas. The parent directory is created owner-only.
pub async fn open_sqlite(path: &Path) -> Result<DatabaseConnection, PolygateError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        create_private_dir(parent)?;
    }
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let db = Database::connect(&url).await?;
    apply_pragmas(&db).await?;
    Ok(db)
}

/// In-memory database for tests.
pub async fn open_sqlite_memory() -> Result<DatabaseConnection, PolygateError> {
    let db = Database::connect("sqlite::memory:").await?;
    apply_pragmas(&db).await?;
    Ok(db)
}

async fn apply_pragmas(db: &DatabaseConnection) -> Result<(), PolygateError> {
    db.execute_unprepared("PRAGMA busy_timeout = 5000").await?;
    db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
    db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<(), PolygateError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Creates the table for an entity when it does not exist yet.
pub async fn ensure_table<E: EntityTrait>(
    db: &DatabaseConnection,
    entity: E,
) -> Result<(), PolygateError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut stmt: TableCreateStatement = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

/// Creates a secondary index when it does not exist yet.
pub async fn ensure_index(
    db: &DatabaseConnection,
    mut stmt: IndexCreateStatement,
) -> Result<(), PolygateError> {
    let backend = db.get_database_backend();
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}
