//! Paper entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "papers")]
pub struct Model {
    /// External identifier as returned by the bibliographic API
    #[sea_orm(primary_key, auto_increment = false)]
    pub paper_id: String,

    /// Immutable once set
    #[sea_orm(column_type = "Text", nullable)]
    pub title: Option<String>,

    /// Immutable once set
    pub year: Option<i32>,

    #[sea_orm(column_type = "Text", nullable)]
    pub abstract_text: Option<String>,

    /// Refreshed on every fetch (last write wins)
    pub citation_count: Option<i64>,

    /// Refreshed on every fetch (last write wins)
    pub reference_count: Option<i64>,

    #[sea_orm(column_type = "Text", nullable)]
    pub pdf_url: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
