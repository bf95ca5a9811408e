//! Citation edge entity for graph relationships

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of an edge, seen from the source paper
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    /// Source lists target among its references
    Cites,
    /// Target lists source among its references
    CitedBy,
}

impl EdgeRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeRelation::Cites => "cites",
            EdgeRelation::CitedBy => "cited_by",
        }
    }
}

impl fmt::Display for EdgeRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for EdgeRelation {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "cites" => Ok(EdgeRelation::Cites),
            "cited_by" => Ok(EdgeRelation::CitedBy),
            other => Err(format!("unknown edge relation: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "citation_edges")]
pub struct Model {
    /// Paper whose fetch produced the edge
    #[sea_orm(primary_key, auto_increment = false)]
    pub source_id: String,

    /// Neighbor paper (may not have been fetched yet)
    #[sea_orm(primary_key, auto_increment = false)]
    pub target_id: String,

    /// `cites` or `cited_by`
    #[sea_orm(primary_key, auto_increment = false)]
    pub kind: String,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn edge_relation(&self) -> Option<EdgeRelation> {
        EdgeRelation::try_from(self.kind.as_str()).ok()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
