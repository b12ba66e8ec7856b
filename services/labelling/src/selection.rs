//! Core selection types: ranks, keys and the rank→frame mapping.

use crate::selection_store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by the ranked selection engine
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Invalid rank {0}: expected 1, 2 or 3")]
    InvalidRank(i64),

    #[error("Selection for {key} kept conflicting after {attempts} attempts")]
    StorageConflict { key: SelectionKey, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Preference order of a picked frame, always 1, 2 or 3
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rank(u8);

impl Rank {
    pub const FIRST: Rank = Rank(1);
    pub const SECOND: Rank = Rank(2);
    pub const THIRD: Rank = Rank(3);

    /// Every valid rank, ascending
    pub const ALL: [Rank; 3] = [Rank::FIRST, Rank::SECOND, Rank::THIRD];

    /// Validate a raw rank value
    pub fn new(value: i64) -> Result<Self, SelectionError> {
        match value {
            1..=3 => Ok(Rank(value as u8)),
            other => Err(SelectionError::InvalidRank(other)),
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rank {
    type Error = SelectionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Rank::new(value)
    }
}

impl From<Rank> for i64 {
    fn from(rank: Rank) -> Self {
        rank.0 as i64
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One labelling unit: a single labeller's picks for a single video
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SelectionKey {
    /// Authenticated labeller, opaque to the engine
    pub actor: String,
    pub category: String,
    pub video: String,
}

impl SelectionKey {
    pub fn new(
        actor: impl Into<String>,
        category: impl Into<String>,
        video: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            category: category.into(),
            video: video.into(),
        }
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.actor, self.category, self.video)
    }
}

/// Current rank→frame picks for one key.
///
/// Iteration is rank ascending. The mapping holds at most three entries and,
/// once written through [`crate::RankAssignmentService`], no frame appears
/// under two ranks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankMapping(BTreeMap<Rank, String>);

impl RankMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rank: Rank) -> Option<&str> {
        self.0.get(&rank).map(String::as_str)
    }

    pub fn insert(&mut self, rank: Rank, frame: impl Into<String>) -> Option<String> {
        self.0.insert(rank, frame.into())
    }

    pub fn remove(&mut self, rank: Rank) -> Option<String> {
        self.0.remove(&rank)
    }

    /// Rank currently holding `frame`, if any
    pub fn rank_of(&self, frame: &str) -> Option<Rank> {
        self.0
            .iter()
            .find(|(_, f)| f.as_str() == frame)
            .map(|(rank, _)| *rank)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All three ranks are filled
    pub fn is_complete(&self) -> bool {
        self.0.len() == Rank::ALL.len()
    }

    /// Ranks with no frame yet, ascending
    pub fn missing_ranks(&self) -> Vec<Rank> {
        Rank::ALL
            .into_iter()
            .filter(|rank| !self.0.contains_key(rank))
            .collect()
    }

    /// No frame is held by more than one rank
    pub fn is_injective(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.0.len());
        self.0.values().all(|frame| seen.insert(frame.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rank, &str)> {
        self.0.iter().map(|(rank, frame)| (*rank, frame.as_str()))
    }
}

impl FromIterator<(Rank, String)> for RankMapping {
    fn from_iter<I: IntoIterator<Item = (Rank, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
