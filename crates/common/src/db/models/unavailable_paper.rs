//! Papers the bibliographic API reported as absent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "unavailable_papers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub paper_id: String,

    #[sea_orm(column_type = "Text")]
    pub reason: String,

    pub recorded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
