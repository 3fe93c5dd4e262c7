//! `mesh db` — relational backend administration.

use anyhow::Result;

use mesh_bus::relational;

pub async fn status() -> Result<()> {
    let pool = relational::connect_from_env().await?;
    let s = relational::status(&pool).await?;
    println!("db_ok={} has_ingest_queue={}", s.ok, s.has_ingest_queue);
    Ok(())
}

pub async fn migrate() -> Result<()> {
    let pool = relational::connect_from_env().await?;
    relational::migrate(&pool).await?;
    println!("migrations_applied=true");
    Ok(())
}
