use sea_orm::entity::prelude::*;

/// One tracked flow, with per-chain progress and metadata stored as JSON.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "flow")]
pub struct Model {
    /// Flow id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Initiating tx hash, globally unique when present.
    #[sea_orm(unique)]
    pub tx_hash: Option<String>,
    /// `deposit` or `payment`.
    pub flow_type: String,
    /// Chain id the flow starts on.
    pub initial_chain: String,
    /// Chain id the flow ends on.
    pub destination_chain: String,
    /// Overall status.
    pub status: String,
    /// Serialized [`crossflow_core::ChainProgress`].
    pub chain_progress: Json,
    /// Free-form metadata object.
    pub metadata: Json,
    /// Serialized [`crossflow_core::ErrorState`], when any.
    pub error_state: Option<Json>,
    /// Creation time.
    pub created_at: DateTimeUtc,
    /// Last mutation time.
    pub updated_at: DateTimeUtc,
}

/// No relations; status logs reference flows by id only.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
