use std::fmt;

use parse_display::Display;
use serde::{Deserialize, Serialize};

pub(crate) mod flight;
pub(crate) mod graph;

/// Validity of a cached result, ordered from freshest to stalest.
#[derive(Debug, Display, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Validity {
    /// The result is current.
    Valid,
    /// The previous result is stale and a recomputation is in flight.
    Invalidating,
    /// The result is stale and nothing is recomputing it yet.
    #[default]
    Invalidated,
}
impl Validity {
    pub fn is_valid(self) -> bool {
        self == Validity::Valid
    }
}

/// Index of a cell in the registry arena.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct CellId(pub usize);

/// Version stamp of a stored result.
///
/// Drawn from one counter per registry, so every committed result gets a
/// strictly larger generation than any result committed before it.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
