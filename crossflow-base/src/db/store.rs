use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseTransaction,
    DbConn, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, TransactionTrait,
};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crossflow_core::{
    ChainKey, ChainProgress, ChainStatus, CreateOutcome, ErrorState, Flow, FlowStatus, FlowStore,
    FlowType, NewFlow, NewStatusLog, Stage, StatusLogRow, StatusWrite, StoreError, StoreResult,
};

use super::{flow, status_log};

/// Relational [`FlowStore`] on top of sea-orm.
///
/// Flow rows are the unit of serializable progress: every read-modify-write
/// of `chain_progress` runs in a row-locked transaction. The status log is
/// append-only and never contended.
#[derive(Clone, Debug)]
pub struct FlowDb(DbConn);

impl FlowDb {
    /// Connect to the database.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, DbErr> {
        let conn = Database::connect(url).await?;
        Ok(Self(conn))
    }

    /// Wrap an existing connection (tests).
    pub fn from_conn(conn: DbConn) -> Self {
        Self(conn)
    }

    /// Create the `flow` and `status_log` tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), DbErr> {
        let backend = self.0.get_database_backend();
        let schema = Schema::new(backend);

        let mut flows = schema.create_table_from_entity(flow::Entity);
        self.0.execute(backend.build(flows.if_not_exists())).await?;

        let mut logs = schema.create_table_from_entity(status_log::Entity);
        self.0.execute(backend.build(logs.if_not_exists())).await?;
        Ok(())
    }

    async fn load_for_update(
        &self,
        txn: &DatabaseTransaction,
        id: Uuid,
    ) -> StoreResult<flow::Model> {
        flow::Entity::find_by_id(id)
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)
    }

    /// Run a row-locked read-modify-write of one flow's progress.
    async fn update_progress<F>(&self, id: Uuid, mutate: F) -> StoreResult<Flow>
    where
        F: FnOnce(&mut ChainProgress) + Send,
    {
        let txn = self.0.begin().await.map_err(backend)?;
        let model = self.load_for_update(&txn, id).await?;
        let mut progress = decode_progress(&model)?;
        mutate(&mut progress);

        let update = flow::ActiveModel {
            id: ActiveValue::Unchanged(id),
            chain_progress: ActiveValue::Set(encode(&progress)?),
            updated_at: ActiveValue::Set(Utc::now()),
            ..Default::default()
        };
        let updated = update.update(&txn).await.map_err(backend)?;
        txn.commit().await.map_err(backend)?;
        model_to_flow(updated)
    }
}

#[async_trait]
impl FlowStore for FlowDb {
    #[instrument(skip(self, new), fields(tx_hash = ?new.tx_hash))]
    async fn create_flow(&self, new: NewFlow) -> StoreResult<CreateOutcome> {
        if let Some(hash) = &new.tx_hash {
            if let Some(existing) = self.flow_by_tx_hash(hash).await? {
                return Ok(CreateOutcome::Existing(existing));
            }
        }

        let now = Utc::now();
        let progress = new
            .chain_progress
            .clone()
            .unwrap_or_else(|| ChainProgress::initial(new.flow_type));
        let model = flow::ActiveModel {
            id: ActiveValue::Set(Uuid::new_v4()),
            tx_hash: ActiveValue::Set(new.tx_hash.clone()),
            flow_type: ActiveValue::Set(new.flow_type.as_str().to_owned()),
            initial_chain: ActiveValue::Set(new.initial_chain.clone()),
            destination_chain: ActiveValue::Set(new.destination_chain.clone()),
            status: ActiveValue::Set(FlowStatus::Pending.as_str().to_owned()),
            chain_progress: ActiveValue::Set(encode(&progress)?),
            metadata: ActiveValue::Set(Value::Object(new.metadata.clone())),
            error_state: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };

        match model.insert(&self.0).await {
            Ok(inserted) => Ok(CreateOutcome::Created(model_to_flow(inserted)?)),
            Err(err) => {
                // A racing insert on the unique tx hash resolves by re-lookup.
                if let Some(hash) = &new.tx_hash {
                    if let Some(existing) = self.flow_by_tx_hash(hash).await? {
                        debug!(tx_hash = %hash, "duplicate registration resolved to existing flow");
                        return Ok(CreateOutcome::Existing(existing));
                    }
                }
                Err(backend(err))
            }
        }
    }

    async fn flow(&self, id: Uuid) -> StoreResult<Option<Flow>> {
        flow::Entity::find_by_id(id)
            .one(&self.0)
            .await
            .map_err(backend)?
            .map(model_to_flow)
            .transpose()
    }

    async fn flow_by_tx_hash(&self, tx_hash: &str) -> StoreResult<Option<Flow>> {
        flow::Entity::find()
            .filter(flow::Column::TxHash.eq(tx_hash))
            .one(&self.0)
            .await
            .map_err(backend)?
            .map(model_to_flow)
            .transpose()
    }

    async fn flow_by_any_hash(&self, chain: ChainKey, tx_hash: &str) -> StoreResult<Option<Flow>> {
        if let Some(by_initiating) = self.flow_by_tx_hash(tx_hash).await? {
            return Ok(Some(by_initiating));
        }
        // Hashes inside chain progress live in JSON; match them in SQL by
        // containment and verify on the decoded flow.
        let candidates = flow::Entity::find()
            .filter(Expr::cust_with_values(
                "chain_progress::text LIKE $1",
                [format!("%{}%", tx_hash.replace('%', ""))],
            ))
            .all(&self.0)
            .await
            .map_err(backend)?;
        for candidate in candidates {
            let decoded = model_to_flow(candidate)?;
            let matched = decoded.chain_progress.get(chain).is_some_and(|entry| {
                entry.tx_hash.as_deref() == Some(tx_hash)
                    || entry
                        .stages
                        .iter()
                        .chain(entry.gasless_stages.iter())
                        .any(|s| s.tx_hash.as_deref() == Some(tx_hash))
            });
            if matched {
                return Ok(Some(decoded));
            }
        }
        Ok(None)
    }

    async fn list_unfinished(&self) -> StoreResult<Vec<Flow>> {
        flow::Entity::find()
            .filter(flow::Column::Status.eq(FlowStatus::Pending.as_str()))
            .order_by_asc(flow::Column::CreatedAt)
            .all(&self.0)
            .await
            .map_err(backend)?
            .into_iter()
            .map(model_to_flow)
            .collect()
    }

    #[instrument(skip(self))]
    async fn ensure_start_block(
        &self,
        id: Uuid,
        chain: ChainKey,
        computed: u64,
    ) -> StoreResult<u64> {
        let txn = self.0.begin().await.map_err(backend)?;
        let model = self.load_for_update(&txn, id).await?;
        let mut progress = decode_progress(&model)?;

        let entry = progress.entry_mut(chain);
        if let Some(existing) = entry.start_block {
            txn.commit().await.map_err(backend)?;
            return Ok(existing);
        }
        entry.start_block = Some(computed);

        let update = flow::ActiveModel {
            id: ActiveValue::Unchanged(id),
            chain_progress: ActiveValue::Set(encode(&progress)?),
            updated_at: ActiveValue::Set(Utc::now()),
            ..Default::default()
        };
        update.update(&txn).await.map_err(backend)?;
        txn.commit().await.map_err(backend)?;
        Ok(computed)
    }

    async fn append_stage(&self, id: Uuid, chain: ChainKey, stage: Stage) -> StoreResult<Flow> {
        self.update_progress(id, |progress| {
            progress.entry_mut(chain).stages.push(stage);
        })
        .await
    }

    async fn append_client_stage(
        &self,
        id: Uuid,
        chain: ChainKey,
        stage: Stage,
        gasless: bool,
    ) -> StoreResult<Flow> {
        self.update_progress(id, |progress| {
            let entry = progress.entry_mut(chain);
            if gasless {
                entry.gasless_stages.push(stage);
            } else {
                entry.stages.push(stage);
            }
        })
        .await
    }

    async fn set_chain_status(
        &self,
        id: Uuid,
        chain: ChainKey,
        status: ChainStatus,
        tx_hash: Option<String>,
    ) -> StoreResult<Flow> {
        self.update_progress(id, |progress| {
            let entry = progress.entry_mut(chain);
            entry.status = status;
            entry.last_checked_at = Some(Utc::now());
            if tx_hash.is_some() {
                entry.tx_hash = tx_hash;
            }
        })
        .await
    }

    #[instrument(skip(self, error))]
    async fn set_status_if_pending(
        &self,
        id: Uuid,
        status: FlowStatus,
        error: Option<ErrorState>,
    ) -> StoreResult<StatusWrite> {
        let txn = self.0.begin().await.map_err(backend)?;
        let model = self.load_for_update(&txn, id).await?;
        let current = decode_status(&model.status)?;
        if current.is_terminal() {
            txn.commit().await.map_err(backend)?;
            return Ok(StatusWrite::AlreadyTerminal(current));
        }

        let mut update = flow::ActiveModel {
            id: ActiveValue::Unchanged(id),
            status: ActiveValue::Set(status.as_str().to_owned()),
            updated_at: ActiveValue::Set(Utc::now()),
            ..Default::default()
        };
        if let Some(error) = &error {
            update.error_state = ActiveValue::Set(Some(encode(error)?));
        }
        let updated = update.update(&txn).await.map_err(backend)?;
        txn.commit().await.map_err(backend)?;
        Ok(StatusWrite::Applied(model_to_flow(updated)?))
    }

    async fn append_status_log(&self, row: NewStatusLog) -> StoreResult<()> {
        let model = status_log::ActiveModel {
            flow_id: ActiveValue::Set(row.flow_id),
            stage: ActiveValue::Set(row.stage),
            chain: ActiveValue::Set(row.chain.as_str().to_owned()),
            source: ActiveValue::Set(row.source.as_str().to_owned()),
            detail: ActiveValue::Set(row.detail),
            created_at: ActiveValue::Set(Utc::now()),
            ..Default::default()
        };
        model.insert(&self.0).await.map_err(backend)?;
        Ok(())
    }

    async fn status_logs(&self, id: Uuid) -> StoreResult<Vec<StatusLogRow>> {
        status_log::Entity::find()
            .filter(status_log::Column::FlowId.eq(id))
            .order_by_asc(status_log::Column::CreatedAt)
            .order_by_asc(status_log::Column::Id)
            .all(&self.0)
            .await
            .map_err(backend)?
            .into_iter()
            .map(log_to_row)
            .collect()
    }
}

fn backend(err: DbErr) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode_progress(model: &flow::Model) -> StoreResult<ChainProgress> {
    serde_json::from_value(model.chain_progress.clone())
        .map_err(|e| StoreError::Backend(format!("corrupt chain_progress: {e}")))
}

fn decode_status(raw: &str) -> StoreResult<FlowStatus> {
    match raw {
        "pending" => Ok(FlowStatus::Pending),
        "completed" => Ok(FlowStatus::Completed),
        "failed" => Ok(FlowStatus::Failed),
        "undetermined" => Ok(FlowStatus::Undetermined),
        other => Err(StoreError::Backend(format!("corrupt status: {other}"))),
    }
}

fn decode_flow_type(raw: &str) -> StoreResult<FlowType> {
    match raw {
        "deposit" => Ok(FlowType::Deposit),
        "payment" => Ok(FlowType::Payment),
        other => Err(StoreError::Backend(format!("corrupt flow_type: {other}"))),
    }
}

fn model_to_flow(model: flow::Model) -> StoreResult<Flow> {
    let metadata = match model.metadata {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    let error_state = model
        .error_state
        .map(serde_json::from_value::<ErrorState>)
        .transpose()
        .map_err(|e| StoreError::Backend(format!("corrupt error_state: {e}")))?;
    Ok(Flow {
        id: model.id,
        tx_hash: model.tx_hash,
        flow_type: decode_flow_type(&model.flow_type)?,
        initial_chain: model.initial_chain,
        destination_chain: model.destination_chain,
        status: decode_status(&model.status)?,
        chain_progress: serde_json::from_value(model.chain_progress)
            .map_err(|e| StoreError::Backend(format!("corrupt chain_progress: {e}")))?,
        metadata,
        error_state,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn log_to_row(model: status_log::Model) -> StoreResult<StatusLogRow> {
    Ok(StatusLogRow {
        id: model.id,
        flow_id: model.flow_id,
        stage: model.stage,
        chain: model
            .chain
            .parse()
            .map_err(|_| StoreError::Backend(format!("corrupt chain key: {}", model.chain)))?,
        source: match model.source.as_str() {
            "client" => crossflow_core::StageSource::Client,
            _ => crossflow_core::StageSource::Poller,
        },
        detail: model.detail,
        created_at: model.created_at,
    })
}
