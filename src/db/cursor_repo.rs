use sqlx::PgPool;

use super::{to_i64, to_u64, StoreError};
use crate::models::Cursor;

/// Read the persisted cursor, if the pipeline has ever completed a batch.
pub async fn load_cursor(pool: &PgPool) -> Result<Option<Cursor>, StoreError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT last_processed_block FROM pipeline_cursor WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    row.map(|(block,)| to_u64(block, "cursor block").map(Cursor::new))
        .transpose()
}

pub async fn save_cursor(pool: &PgPool, cursor: Cursor) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_cursor (id, last_processed_block, updated_at)
        VALUES (1, $1, NOW())
        ON CONFLICT (id) DO UPDATE
        SET last_processed_block = EXCLUDED.last_processed_block, updated_at = NOW()
        "#,
    )
    .bind(to_i64(cursor.last_processed_block, "cursor block")?)
    .execute(pool)
    .await?;

    Ok(())
}
