use sea_orm::entity::prelude::*;

/// Append-only audit row for one stage change.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "status_log")]
pub struct Model {
    /// Row id, ascending with insertion order.
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Flow the row belongs to.
    pub flow_id: Uuid,
    /// Stage symbol.
    pub stage: String,
    /// Chain key (`evm`/`noble`/`namada`).
    pub chain: String,
    /// `poller` or `client`.
    pub source: String,
    /// Structured detail.
    pub detail: Json,
    /// Insertion time.
    pub created_at: DateTimeUtc,
}

/// No relations; rows reference flows by id only.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
