//! Blind/reveal control.
//!
//! A blinded run computes everything but discloses only identifiers. The
//! state lives in the ledger: a `run_complete_blinded` entry puts the output
//! directory in [`BlindState::Blinded`]; a later `revealed` entry for the
//! same AEQ moves it to [`BlindState::Revealed`], which is terminal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::CONDITIONS;
use crate::digest::sha256_hex;
use crate::error::{PipelineError, Result};
use crate::ledger::{EventType, LedgerEntry};

pub const BLIND_MAP_FILE: &str = "blind_map.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlindState {
    Blinded,
    Revealed,
}

/// What a reveal request should do given the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum RevealAction<'a> {
    /// Disclose the blinded run completed by this ledger entry.
    Disclose(&'a LedgerEntry),
    /// Already revealed; re-disclose from the `revealed` entry without
    /// touching the ledger.
    AlreadyRevealed {
        completed: &'a LedgerEntry,
        revealed: &'a LedgerEntry,
    },
}

impl<'a> RevealAction<'a> {
    /// The `run_complete_blinded` entry the action applies to.
    pub fn completed(&self) -> &'a LedgerEntry {
        match *self {
            RevealAction::Disclose(completed) => completed,
            RevealAction::AlreadyRevealed { completed, .. } => completed,
        }
    }
}

/// Latest blinded completion and the `revealed` entry that follows it, if any.
fn latest_blinded(entries: &[LedgerEntry]) -> Option<(&LedgerEntry, Option<&LedgerEntry>)> {
    let (idx, completed) = entries
        .iter()
        .enumerate()
        .rev()
        .find(|(_, e)| e.event_type == EventType::RunCompleteBlinded)?;
    let revealed = entries[idx + 1..]
        .iter()
        .find(|e| e.event_type == EventType::Revealed && e.aeq == completed.aeq);
    Some((completed, revealed))
}

/// Current blind state of an output directory, from its ledger.
///
/// Returns `None` when no blinded run ever completed there.
pub fn blind_state(entries: &[LedgerEntry]) -> Option<(BlindState, &LedgerEntry)> {
    let (completed, revealed) = latest_blinded(entries)?;
    let state = match revealed {
        Some(_) => BlindState::Revealed,
        None => BlindState::Blinded,
    };
    Some((state, completed))
}

/// Decide how to handle a reveal request. Fails when there is nothing to
/// reveal.
pub fn plan_reveal(entries: &[LedgerEntry]) -> Result<RevealAction<'_>> {
    match latest_blinded(entries) {
        None => Err(PipelineError::config(
            "reveal requested but no blinded run has completed in this output directory",
        )),
        Some((completed, None)) => Ok(RevealAction::Disclose(completed)),
        Some((completed, Some(revealed))) => Ok(RevealAction::AlreadyRevealed {
            completed,
            revealed,
        }),
    }
}

/// Mapping from real condition names to opaque labels (`C1`, `C2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindMap {
    pub seed: u64,
    pub map_real_to_blind: BTreeMap<String, String>,
}

impl BlindMap {
    /// Labels are assigned in order of `sha256("{seed}:{condition}")`, so the
    /// shuffle depends only on the seed and is identical on every machine.
    pub fn derive(seed: u64) -> Self {
        let mut keyed: Vec<(String, &str)> = CONDITIONS
            .iter()
            .map(|c| (sha256_hex(format!("{seed}:{c}").as_bytes()), *c))
            .collect();
        keyed.sort();
        let map_real_to_blind = keyed
            .into_iter()
            .enumerate()
            .map(|(i, (_, c))| (c.to_string(), format!("C{}", i + 1)))
            .collect();
        Self {
            seed,
            map_real_to_blind,
        }
    }

    /// Identity labels for unblinded runs.
    pub fn identity(seed: u64) -> Self {
        Self {
            seed,
            map_real_to_blind: CONDITIONS
                .iter()
                .map(|c| (c.to_string(), c.to_string()))
                .collect(),
        }
    }

    pub fn label<'a>(&'a self, condition: &'a str) -> &'a str {
        self.map_real_to_blind
            .get(condition)
            .map(String::as_str)
            .unwrap_or(condition)
    }

    /// Blinded labels in sorted order, as disclosed before reveal.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.map_real_to_blind.values().cloned().collect();
        labels.sort();
        labels
    }
}
