//! Postgres-backed persistence over a deadpool connection pool.
//!
//! Entity tables are one row per id with the typed fields in a JSONB
//! column; column-per-field layouts belong to the schema generator, not the
//! indexing core. Framework tables (raw events, dynamic contract registry,
//! checkpoints) are created by the startup migrations.

use std::collections::BTreeMap;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::store::entity::{EntityRow, FieldValue};
use crate::types::config::entity::EntityConfig;
use crate::types::event::DynamicContractRow;

use super::{CommitBatch, Persistence, StorageError};

const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS raw_events (
    chain_id BIGINT NOT NULL,
    event_id BIGINT NOT NULL,
    block_number BIGINT NOT NULL,
    block_timestamp BIGINT NOT NULL,
    block_hash BYTEA NOT NULL,
    transaction_hash BYTEA NOT NULL,
    transaction_index BIGINT NOT NULL,
    log_index BIGINT NOT NULL,
    contract_address BYTEA NOT NULL,
    event_name TEXT NOT NULL,
    params JSONB NOT NULL,
    PRIMARY KEY (chain_id, event_id)
);

CREATE TABLE IF NOT EXISTS dynamic_contract_registry (
    chain_id BIGINT NOT NULL,
    contract_address BYTEA NOT NULL,
    contract_type TEXT NOT NULL,
    registering_event_id BIGINT NOT NULL,
    PRIMARY KEY (chain_id, contract_address)
);

CREATE TABLE IF NOT EXISTS chain_checkpoints (
    chain_id BIGINT PRIMARY KEY,
    latest_processed_block BIGINT NOT NULL
);
";

pub struct PostgresStorage {
    pool: Pool,
    entity_tables: BTreeMap<String, String>,
}

impl PostgresStorage {
    pub async fn connect(
        database_url: &str,
        entities: &[EntityConfig],
    ) -> Result<Self, StorageError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| StorageError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(16)
            .runtime(Runtime::Tokio1)
            .build()?;

        let _conn = pool.get().await?;
        tracing::info!("database connection pool created");

        let entity_tables = entities
            .iter()
            .map(|entity| (entity.name.clone(), entity_table_name(&entity.name)))
            .collect();

        let storage = Self {
            pool,
            entity_tables,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(MIGRATIONS)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        for (entity_type, table) in &self.entity_tables {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, data JSONB NOT NULL)"
            );
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| StorageError::Migration(format!("{entity_type}: {e}")))?;
            tracing::debug!(entity_type, table, "entity table ready");
        }
        Ok(())
    }

    fn entity_table(&self, entity_type: &str) -> Result<&str, StorageError> {
        self.entity_tables
            .get(entity_type)
            .map(String::as_str)
            .ok_or_else(|| StorageError::UnknownEntityType(entity_type.to_string()))
    }
}

fn entity_table_name(entity_type: &str) -> String {
    format!("entity_{}", entity_type.to_lowercase())
}

fn decode_entity_row(
    entity_type: &str,
    id: String,
    data: serde_json::Value,
) -> Result<EntityRow, StorageError> {
    let fields: BTreeMap<String, FieldValue> =
        serde_json::from_value(data).map_err(|e| StorageError::RowDecode {
            entity_type: entity_type.to_string(),
            id: id.clone(),
            reason: e.to_string(),
        })?;
    Ok(EntityRow { id, fields })
}

#[async_trait]
impl Persistence for PostgresStorage {
    async fn batch_read(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRow>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.entity_table(entity_type)?;
        let client = self.pool.get().await?;
        let sql = format!("SELECT id, data FROM {table} WHERE id = ANY($1) ORDER BY id");
        let rows = client.query(&sql, &[&ids.to_vec()]).await?;

        rows.into_iter()
            .map(|row| decode_entity_row(entity_type, row.get(0), row.get(1)))
            .collect()
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StorageError> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        for (entity_type, ids) in &batch.entity_deletes {
            let table = self.entity_table(entity_type)?;
            let sql = format!("DELETE FROM {table} WHERE id = ANY($1)");
            transaction.execute(&sql, &[ids]).await?;
        }

        for (entity_type, rows) in &batch.entity_upserts {
            let table = self.entity_table(entity_type)?;
            let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
            let data: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| serde_json::to_value(&row.fields))
                .collect::<Result<_, _>>()
                .map_err(|e| StorageError::RowDecode {
                    entity_type: entity_type.clone(),
                    id: String::new(),
                    reason: e.to_string(),
                })?;
            let sql = format!(
                "INSERT INTO {table} (id, data) \
                 SELECT * FROM UNNEST($1::text[], $2::jsonb[]) \
                 ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data"
            );
            transaction.execute(&sql, &[&ids, &data]).await?;
        }

        if !batch.raw_event_deletes.is_empty() {
            let chain_ids: Vec<i64> = batch
                .raw_event_deletes
                .iter()
                .map(|(chain, _)| *chain as i64)
                .collect();
            let event_ids: Vec<i64> = batch
                .raw_event_deletes
                .iter()
                .map(|(_, event)| *event as i64)
                .collect();
            transaction
                .execute(
                    "DELETE FROM raw_events WHERE (chain_id, event_id) IN \
                     (SELECT * FROM UNNEST($1::bigint[], $2::bigint[]))",
                    &[&chain_ids, &event_ids],
                )
                .await?;
        }

        if !batch.raw_events.is_empty() {
            let rows = &batch.raw_events;
            let chain_ids: Vec<i64> = rows.iter().map(|r| r.chain_id as i64).collect();
            let event_ids: Vec<i64> = rows.iter().map(|r| r.event_id as i64).collect();
            let block_numbers: Vec<i64> = rows.iter().map(|r| r.block_number as i64).collect();
            let block_timestamps: Vec<i64> =
                rows.iter().map(|r| r.block_timestamp as i64).collect();
            let block_hashes: Vec<Vec<u8>> =
                rows.iter().map(|r| r.block_hash.to_vec()).collect();
            let tx_hashes: Vec<Vec<u8>> =
                rows.iter().map(|r| r.transaction_hash.to_vec()).collect();
            let tx_indexes: Vec<i64> = rows.iter().map(|r| r.transaction_index as i64).collect();
            let log_indexes: Vec<i64> = rows.iter().map(|r| r.log_index as i64).collect();
            let addresses: Vec<Vec<u8>> =
                rows.iter().map(|r| r.contract_address.to_vec()).collect();
            let event_names: Vec<&str> =
                rows.iter().map(|r| r.event_name.as_str()).collect();
            let params: Vec<&serde_json::Value> = rows.iter().map(|r| &r.params).collect();

            transaction
                .execute(
                    "INSERT INTO raw_events (chain_id, event_id, block_number, block_timestamp, \
                     block_hash, transaction_hash, transaction_index, log_index, \
                     contract_address, event_name, params) \
                     SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[], $4::bigint[], \
                     $5::bytea[], $6::bytea[], $7::bigint[], $8::bigint[], $9::bytea[], \
                     $10::text[], $11::jsonb[]) \
                     ON CONFLICT (chain_id, event_id) DO UPDATE SET \
                     block_number = EXCLUDED.block_number, \
                     block_timestamp = EXCLUDED.block_timestamp, \
                     block_hash = EXCLUDED.block_hash, \
                     transaction_hash = EXCLUDED.transaction_hash, \
                     transaction_index = EXCLUDED.transaction_index, \
                     log_index = EXCLUDED.log_index, \
                     contract_address = EXCLUDED.contract_address, \
                     event_name = EXCLUDED.event_name, \
                     params = EXCLUDED.params",
                    &[
                        &chain_ids,
                        &event_ids,
                        &block_numbers,
                        &block_timestamps,
                        &block_hashes,
                        &tx_hashes,
                        &tx_indexes,
                        &log_indexes,
                        &addresses,
                        &event_names,
                        &params,
                    ],
                )
                .await?;
        }

        if !batch.contract_deletes.is_empty() {
            let chain_ids: Vec<i64> = batch
                .contract_deletes
                .iter()
                .map(|(chain, _)| *chain as i64)
                .collect();
            let addresses: Vec<Vec<u8>> = batch
                .contract_deletes
                .iter()
                .map(|(_, address)| address.to_vec())
                .collect();
            transaction
                .execute(
                    "DELETE FROM dynamic_contract_registry WHERE (chain_id, contract_address) IN \
                     (SELECT * FROM UNNEST($1::bigint[], $2::bytea[]))",
                    &[&chain_ids, &addresses],
                )
                .await?;
        }

        if !batch.contract_upserts.is_empty() {
            let rows = &batch.contract_upserts;
            let chain_ids: Vec<i64> = rows.iter().map(|r| r.chain_id as i64).collect();
            let addresses: Vec<Vec<u8>> =
                rows.iter().map(|r| r.contract_address.to_vec()).collect();
            let contract_types: Vec<&str> =
                rows.iter().map(|r| r.contract_type.as_str()).collect();
            let registering: Vec<i64> =
                rows.iter().map(|r| r.registering_event_id as i64).collect();
            transaction
                .execute(
                    "INSERT INTO dynamic_contract_registry \
                     (chain_id, contract_address, contract_type, registering_event_id) \
                     SELECT * FROM UNNEST($1::bigint[], $2::bytea[], $3::text[], $4::bigint[]) \
                     ON CONFLICT (chain_id, contract_address) DO UPDATE SET \
                     contract_type = EXCLUDED.contract_type, \
                     registering_event_id = EXCLUDED.registering_event_id",
                    &[&chain_ids, &addresses, &contract_types, &registering],
                )
                .await?;
        }

        for (chain_id, block) in &batch.checkpoints {
            transaction
                .execute(
                    "INSERT INTO chain_checkpoints (chain_id, latest_processed_block) \
                     VALUES ($1, $2) \
                     ON CONFLICT (chain_id) DO UPDATE SET \
                     latest_processed_block = EXCLUDED.latest_processed_block",
                    &[&(*chain_id as i64), &(*block as i64)],
                )
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn latest_processed_block(&self, chain_id: u64) -> Result<Option<u64>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT latest_processed_block FROM chain_checkpoints WHERE chain_id = $1",
                &[&(chain_id as i64)],
            )
            .await?;
        Ok(rows.first().map(|row| row.get::<_, i64>(0) as u64))
    }

    async fn dynamic_contracts(&self) -> Result<Vec<DynamicContractRow>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT chain_id, contract_address, contract_type, registering_event_id \
                 FROM dynamic_contract_registry ORDER BY chain_id, contract_address",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let address_bytes: Vec<u8> = row.get(1);
                let contract_address = Address::try_from(address_bytes.as_slice()).map_err(|e| {
                    StorageError::RowDecode {
                        entity_type: "dynamic_contract_registry".to_string(),
                        id: format!("{:?}", row.get::<_, i64>(0)),
                        reason: e.to_string(),
                    }
                })?;
                Ok(DynamicContractRow {
                    chain_id: row.get::<_, i64>(0) as u64,
                    contract_address,
                    contract_type: row.get(2),
                    registering_event_id: row.get::<_, i64>(3) as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_table_names() {
        assert_eq!(entity_table_name("Gravatar"), "entity_gravatar");
        assert_eq!(entity_table_name("NftCollection"), "entity_nftcollection");
    }

    #[test]
    fn test_decode_entity_row_round_trip() {
        let row = EntityRow::new("a")
            .with_field("balance", FieldValue::Int(5))
            .with_field("owner", FieldValue::Text("0x1".to_string()));
        let data = serde_json::to_value(&row.fields).unwrap();
        let decoded = decode_entity_row("Account", "a".to_string(), data).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_decode_entity_row_rejects_garbage() {
        let err = decode_entity_row("Account", "a".to_string(), serde_json::json!([1, 2]));
        assert!(matches!(err, Err(StorageError::RowDecode { .. })));
    }
}
