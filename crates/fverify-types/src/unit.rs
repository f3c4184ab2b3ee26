//! Units of verification work.

use std::fmt;

use serde::Serialize;

use crate::schema::TableSchema;

/// Which cross-check a unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Records → indexes and blobs.
    Data,
    /// Index entries → records.
    Index,
    /// Blob rows → records.
    Blob,
}

/// One independently schedulable piece of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProcessingUnit {
    Data { stripe: u32 },
    Index { index: usize },
    Blob { column: usize, stripe: u32 },
}

impl ProcessingUnit {
    #[must_use]
    pub const fn pass(&self) -> PassKind {
        match self {
            Self::Data { .. } => PassKind::Data,
            Self::Index { .. } => PassKind::Index,
            Self::Blob { .. } => PassKind::Blob,
        }
    }

    /// All units of a run in pass order: data stripes, then indexes, then
    /// blob column × blob stripe.
    #[must_use]
    pub fn enumerate(schema: &TableSchema) -> Vec<Self> {
        let layout = &schema.layout;
        let mut units = Vec::with_capacity(
            layout.data_stripes as usize
                + schema.indexes.len()
                + schema.blob_columns * layout.blob_stripes as usize,
        );
        units.extend((0..layout.data_stripes).map(|stripe| Self::Data { stripe }));
        units.extend((0..schema.indexes.len()).map(|index| Self::Index { index }));
        for column in 0..schema.blob_columns {
            units.extend((0..layout.blob_stripes).map(|stripe| Self::Blob { column, stripe }));
        }
        units
    }
}

impl fmt::Display for ProcessingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { stripe } => write!(f, "dtastripe {stripe}"),
            Self::Index { index } => write!(f, "index {index}"),
            Self::Blob { column, stripe } => write!(f, "blob {column} stripe {stripe}"),
        }
    }
}
