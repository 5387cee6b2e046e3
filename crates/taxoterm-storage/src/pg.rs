//! Postgres/JSONB implementation of the [`Store`] contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use taxoterm_core::{Portal, RawRecord, Taxon, TermDocument};

use crate::{PortalDeleteReport, Store, StoreError, TaxonDeleteReport};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn taxon_from_row(row: &PgRow) -> Result<Taxon, StoreError> {
    Ok(Taxon {
        taxon_id: row.try_get("taxon_id")?,
        ncbi_taxon_id: row.try_get("ncbi_taxon_id")?,
        species: row.try_get("species")?,
    })
}

fn portal_from_row(row: &PgRow) -> Result<Portal, StoreError> {
    let webs: Value = row.try_get("webs")?;
    let webs: Vec<String> = serde_json::from_value(webs)
        .map_err(|err| StoreError::Malformed(format!("portal webs column: {err}")))?;
    Ok(Portal {
        portal_id: row.try_get("portal_id")?,
        taxon_id: row.try_get("taxon_id")?,
        webs,
    })
}

fn raw_from_row(row: &PgRow) -> Result<RawRecord, StoreError> {
    Ok(RawRecord {
        portal_id: row.try_get("portal_id")?,
        taxon_id: row.try_get("taxon_id")?,
        web: row.try_get("web")?,
        species: row.try_get("species")?,
        data: row.try_get("data")?,
        fetched_at: row.try_get::<DateTime<Utc>, _>("fetched_at")?,
    })
}

fn term_from_row(row: &PgRow) -> Result<TermDocument, StoreError> {
    let data: Value = row.try_get("data")?;
    let data = match data {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Malformed(format!(
                "term data column is not an object: {other}"
            )))
        }
    };
    Ok(TermDocument {
        taxon_id: row.try_get("taxon_id")?,
        species: row.try_get("species")?,
        data,
        merged_at: row.try_get::<DateTime<Utc>, _>("merged_at")?,
    })
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_taxa(&self, taxa: &[Taxon]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for taxon in taxa {
            sqlx::query(
                r#"
                INSERT INTO taxa (taxon_id, ncbi_taxon_id, species)
                VALUES ($1, $2, $3)
                ON CONFLICT (taxon_id)
                DO UPDATE SET ncbi_taxon_id = EXCLUDED.ncbi_taxon_id,
                              species = EXCLUDED.species
                "#,
            )
            .bind(taxon.taxon_id)
            .bind(&taxon.ncbi_taxon_id)
            .bind(&taxon.species)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_taxa(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<Taxon>, StoreError> {
        let rows = match taxon_ids {
            Some(ids) => {
                sqlx::query("SELECT taxon_id, ncbi_taxon_id, species FROM taxa WHERE taxon_id = ANY($1)")
                    .bind(ids)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT taxon_id, ncbi_taxon_id, species FROM taxa ORDER BY taxon_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(taxon_from_row).collect()
    }

    async fn delete_taxa(&self, taxon_ids: &[i64]) -> Result<TaxonDeleteReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT taxon_id, ncbi_taxon_id, species FROM taxa WHERE taxon_id = ANY($1)")
            .bind(taxon_ids)
            .fetch_all(&mut *tx)
            .await?;
        let found: Vec<Taxon> = rows.iter().map(taxon_from_row).collect::<Result<_, _>>()?;

        let used_rows =
            sqlx::query("SELECT DISTINCT taxon_id FROM portals WHERE taxon_id = ANY($1)")
                .bind(taxon_ids)
                .fetch_all(&mut *tx)
                .await?;
        let mut used_ids = Vec::with_capacity(used_rows.len());
        for row in &used_rows {
            used_ids.push(row.try_get::<i64, _>("taxon_id")?);
        }

        let mut report = TaxonDeleteReport::default();
        for taxon in found {
            if used_ids.contains(&taxon.taxon_id) {
                report.used.push(taxon);
            } else {
                report.deleted.push(taxon);
            }
        }
        report.missing = taxon_ids
            .iter()
            .copied()
            .filter(|id| {
                !report.used.iter().any(|t| t.taxon_id == *id)
                    && !report.deleted.iter().any(|t| t.taxon_id == *id)
            })
            .collect();

        let deletable: Vec<i64> = report.deleted.iter().map(|t| t.taxon_id).collect();
        sqlx::query("DELETE FROM taxa WHERE taxon_id = ANY($1)")
            .bind(&deletable)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn upsert_portals(&self, portals: &[Portal]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for portal in portals {
            let webs = serde_json::to_value(&portal.webs)
                .map_err(|err| StoreError::Malformed(err.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO portals (portal_id, taxon_id, webs)
                VALUES ($1, $2, $3)
                ON CONFLICT (portal_id)
                DO UPDATE SET taxon_id = EXCLUDED.taxon_id,
                              webs = EXCLUDED.webs
                "#,
            )
            .bind(portal.portal_id)
            .bind(portal.taxon_id)
            .bind(webs)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_portals(&self, portal_ids: Option<&[i64]>) -> Result<Vec<Portal>, StoreError> {
        let rows = match portal_ids {
            Some(ids) => {
                sqlx::query("SELECT portal_id, taxon_id, webs FROM portals WHERE portal_id = ANY($1)")
                    .bind(ids)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT portal_id, taxon_id, webs FROM portals ORDER BY portal_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(portal_from_row).collect()
    }

    async fn find_portal_by_taxon(&self, taxon_id: i64) -> Result<Option<Portal>, StoreError> {
        let row = sqlx::query(
            "SELECT portal_id, taxon_id, webs FROM portals WHERE taxon_id = $1 ORDER BY portal_id LIMIT 1",
        )
        .bind(taxon_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(portal_from_row).transpose()
    }

    async fn delete_portals(&self, portal_ids: &[i64]) -> Result<PortalDeleteReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT portal_id, taxon_id, webs FROM portals WHERE portal_id = ANY($1)")
            .bind(portal_ids)
            .fetch_all(&mut *tx)
            .await?;
        let found: Vec<Portal> = rows.iter().map(portal_from_row).collect::<Result<_, _>>()?;

        let used_rows =
            sqlx::query("SELECT DISTINCT portal_id FROM raw_records WHERE portal_id = ANY($1)")
                .bind(portal_ids)
                .fetch_all(&mut *tx)
                .await?;
        let mut used_ids = Vec::with_capacity(used_rows.len());
        for row in &used_rows {
            used_ids.push(row.try_get::<i64, _>("portal_id")?);
        }

        let mut report = PortalDeleteReport::default();
        for portal in found {
            if used_ids.contains(&portal.portal_id) {
                report.used.push(portal);
            } else {
                report.deleted.push(portal);
            }
        }
        report.missing = portal_ids
            .iter()
            .copied()
            .filter(|id| {
                !report.used.iter().any(|p| p.portal_id == *id)
                    && !report.deleted.iter().any(|p| p.portal_id == *id)
            })
            .collect();

        let deletable: Vec<i64> = report.deleted.iter().map(|p| p.portal_id).collect();
        sqlx::query("DELETE FROM portals WHERE portal_id = ANY($1)")
            .bind(&deletable)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn portal_taxon_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT taxon_id FROM portals ORDER BY taxon_id")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(row.try_get::<i64, _>("taxon_id")?);
        }
        Ok(ids)
    }

    async fn upsert_raw_records(&self, records: &[RawRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO raw_records (portal_id, web, taxon_id, species, data, fetched_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (portal_id, web)
                DO UPDATE SET taxon_id = EXCLUDED.taxon_id,
                              species = EXCLUDED.species,
                              data = EXCLUDED.data,
                              fetched_at = EXCLUDED.fetched_at
                "#,
            )
            .bind(record.portal_id)
            .bind(&record.web)
            .bind(record.taxon_id)
            .bind(&record.species)
            .bind(&record.data)
            .bind(record.fetched_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_raw_records(
        &self,
        taxon_ids: Option<&[i64]>,
        webs: Option<&[String]>,
    ) -> Result<Vec<RawRecord>, StoreError> {
        const COLUMNS: &str = "portal_id, web, taxon_id, species, data, fetched_at";
        let rows = match (taxon_ids, webs) {
            (None, None) => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM raw_records ORDER BY portal_id, web"))
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(webs)) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM raw_records WHERE web = ANY($1) ORDER BY portal_id, web"
                ))
                .bind(webs)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(ids), None) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM raw_records WHERE taxon_id = ANY($1) ORDER BY portal_id, web"
                ))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(ids), Some(webs)) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM raw_records WHERE taxon_id = ANY($1) AND web = ANY($2) ORDER BY portal_id, web"
                ))
                .bind(ids)
                .bind(webs)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(raw_from_row).collect()
    }

    async fn find_raws_by_portal(&self, portal_id: i64) -> Result<Vec<RawRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT portal_id, web, taxon_id, species, data, fetched_at FROM raw_records WHERE portal_id = $1 ORDER BY web",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_from_row).collect()
    }

    async fn delete_raw_records(
        &self,
        taxon_ids: &[i64],
        webs: &[String],
    ) -> Result<Vec<RawRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT portal_id, web, taxon_id, species, data, fetched_at
              FROM raw_records
             WHERE taxon_id = ANY($1) AND web = ANY($2)
            "#,
        )
        .bind(taxon_ids)
        .bind(webs)
        .fetch_all(&mut *tx)
        .await?;
        let deleted: Vec<RawRecord> = rows.iter().map(raw_from_row).collect::<Result<_, _>>()?;

        sqlx::query("DELETE FROM raw_records WHERE taxon_id = ANY($1) AND web = ANY($2)")
            .bind(taxon_ids)
            .bind(webs)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn upsert_terms(&self, terms: &[TermDocument]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for term in terms {
            sqlx::query(
                r#"
                INSERT INTO term_documents (taxon_id, species, data, merged_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (taxon_id)
                DO UPDATE SET species = EXCLUDED.species,
                              data = EXCLUDED.data,
                              merged_at = EXCLUDED.merged_at
                "#,
            )
            .bind(term.taxon_id)
            .bind(&term.species)
            .bind(Value::Object(term.data.clone()))
            .bind(term.merged_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_terms(&self, taxon_ids: Option<&[i64]>) -> Result<Vec<TermDocument>, StoreError> {
        let rows = match taxon_ids {
            Some(ids) => {
                sqlx::query(
                    "SELECT taxon_id, species, data, merged_at FROM term_documents WHERE taxon_id = ANY($1)",
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT taxon_id, species, data, merged_at FROM term_documents ORDER BY taxon_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(term_from_row).collect()
    }

    async fn delete_terms(&self, taxon_ids: &[i64]) -> Result<Vec<TermDocument>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT taxon_id, species, data, merged_at FROM term_documents WHERE taxon_id = ANY($1)",
        )
        .bind(taxon_ids)
        .fetch_all(&mut *tx)
        .await?;
        let deleted: Vec<TermDocument> = rows.iter().map(term_from_row).collect::<Result<_, _>>()?;

        sqlx::query("DELETE FROM term_documents WHERE taxon_id = ANY($1)")
            .bind(taxon_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn search_terms(&self, needle: &str) -> Result<Vec<TermDocument>, StoreError> {
        let pattern = like_pattern(needle);
        let rows = sqlx::query(
            r#"
            SELECT taxon_id, species, data, merged_at
              FROM term_documents
             WHERE species ILIKE $1 ESCAPE '\'
                OR data::text ILIKE $1 ESCAPE '\'
             ORDER BY taxon_id
            "#,
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(term_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("rod"), "%rod%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
        assert_eq!(like_pattern(r"a\b"), r"%a\\b%");
    }
}
