use sqlx::{Pool, Postgres};

pub async fn run_inline_migrations(pool: &Pool<Postgres>) -> anyhow::Result<()> {
    tracing::info!("📦 Running Migrations (Inline Schema)...");

    let schema_sql = r#"
        CREATE TABLE IF NOT EXISTS records (
            entity TEXT NOT NULL,
            network TEXT NOT NULL,
            id TEXT NOT NULL,
            doc JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (entity, network, id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_entity ON records (entity);
        CREATE INDEX IF NOT EXISTS idx_records_instance_state
            ON records ((doc->>'state')) WHERE entity = 'instance'
    "#;

    for statement in schema_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt).execute(pool).await?;
        }
    }

    tracing::info!("✅ Migrations applied");
    Ok(())
}
