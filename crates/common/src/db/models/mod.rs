//! SeaORM entity models
//!
//! Database entities for the discovery engine

mod citation;
mod paper;
mod queue_entry;
mod unavailable_paper;

pub use paper::{
    Entity as PaperEntity,
    Model as Paper,
    ActiveModel as PaperActiveModel,
    Column as PaperColumn,
};

pub use citation::{
    Entity as CitationEdgeEntity,
    Model as CitationEdge,
    ActiveModel as CitationEdgeActiveModel,
    Column as CitationEdgeColumn,
    EdgeRelation,
};

pub use queue_entry::{
    Entity as QueueEntryEntity,
    Model as QueueEntry,
    ActiveModel as QueueEntryActiveModel,
    Column as QueueEntryColumn,
    QueueStatus,
};

pub use unavailable_paper::{
    Entity as UnavailablePaperEntity,
    Model as UnavailablePaper,
    ActiveModel as UnavailablePaperActiveModel,
    Column as UnavailablePaperColumn,
};
