//! Domain projections derived from confirmed chain events.
//!
//! Each confirmed event decodes into a [`DomainEvent`], which names the
//! records it touches ([`DomainEvent::targets`]) and computes their next state
//! ([`DomainEvent::reduce`]). Records are stored as JSON with a
//! `last_applied_sequence_id` guard.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ReactorError;

// ─── Records ──────────────────────────────────────────────────────────────────

/// The projection tables owned by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    /// Keyed by token id.
    NftOwnership,
    /// Keyed by listing id.
    Listing,
    /// Keyed by `proposal/voter`.
    Vote,
    /// Keyed by proposal id.
    ProposalTally,
}

impl ProjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NftOwnership => "nft_ownership",
            Self::Listing => "listing",
            Self::Vote => "vote",
            Self::ProposalTally => "proposal_tally",
        }
    }
}

impl std::fmt::Display for ProjectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProjectionKind {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nft_ownership" => Ok(Self::NftOwnership),
            "listing" => Ok(Self::Listing),
            "vote" => Ok(Self::Vote),
            "proposal_tally" => Ok(Self::ProposalTally),
            other => Err(ReactorError::Decode(format!("unknown projection kind '{other}'"))),
        }
    }
}

/// Identifies one projection record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: ProjectionKind,
    pub key: String,
}

impl RecordRef {
    pub fn new(kind: ProjectionKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }
}

/// Derived state, mutated only by the projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub kind: ProjectionKind,
    pub key: String,
    pub state: serde_json::Value,
    pub last_applied_sequence_id: u64,
    pub updated_at: i64,
}

impl ProjectionRecord {
    /// Deserialize the record's state into its typed form.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ReactorError> {
        serde_json::from_value(self.state.clone()).map_err(ReactorError::from)
    }
}

/// A compare-and-set write of one record.
///
/// The store applies a batch of writes atomically, and only if every record's
/// current `last_applied_sequence_id` still equals `expected_sequence_id`
/// (`None` meaning "record absent").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordWrite {
    pub target: RecordRef,
    pub expected_sequence_id: Option<u64>,
    pub state: serde_json::Value,
    pub sequence_id: u64,
    pub updated_at: i64,
}

// ─── Typed states ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftOwnership {
    pub token_id: String,
    /// `None` once burned.
    pub owner: Option<String>,
    pub transfer_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Cancelled,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    pub token_id: String,
    pub seller: String,
    /// Price in the chain's smallest unit, as a decimal string.
    pub price: String,
    pub status: ListingStatus,
    pub buyer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    For,
    Against,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: String,
    pub voter: String,
    pub choice: VoteChoice,
    pub weight: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTally {
    pub proposal_id: String,
    pub for_weight: u64,
    pub against_weight: u64,
    pub abstain_weight: u64,
    pub voters: u64,
}

impl ProposalTally {
    fn add(&mut self, choice: VoteChoice, weight: u64) {
        match choice {
            VoteChoice::For => self.for_weight = self.for_weight.saturating_add(weight),
            VoteChoice::Against => self.against_weight = self.against_weight.saturating_add(weight),
            VoteChoice::Abstain => self.abstain_weight = self.abstain_weight.saturating_add(weight),
        }
    }

    fn remove(&mut self, choice: VoteChoice, weight: u64) {
        match choice {
            VoteChoice::For => self.for_weight = self.for_weight.saturating_sub(weight),
            VoteChoice::Against => self.against_weight = self.against_weight.saturating_sub(weight),
            VoteChoice::Abstain => self.abstain_weight = self.abstain_weight.saturating_sub(weight),
        }
    }
}

// ─── Domain events ────────────────────────────────────────────────────────────

/// The event kinds the projector understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    NftMinted {
        token_id: String,
        owner: String,
    },
    NftTransferred {
        token_id: String,
        from: String,
        to: String,
    },
    NftBurned {
        token_id: String,
    },
    ListingCreated {
        listing_id: String,
        token_id: String,
        seller: String,
        price: String,
    },
    ListingCancelled {
        listing_id: String,
    },
    ListingFilled {
        listing_id: String,
        buyer: String,
    },
    VoteCast {
        proposal_id: String,
        voter: String,
        choice: VoteChoice,
        #[serde(default = "default_weight")]
        weight: u64,
    },
}

fn default_weight() -> u64 {
    1
}

impl DomainEvent {
    /// Decode an event's `(kind, payload)`; unknown kinds and malformed
    /// payloads are reported as a reason string.
    pub fn decode(kind: &str, payload: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(json!({ "kind": kind, "payload": payload }))
            .map_err(|e| format!("cannot decode '{kind}': {e}"))
    }

    /// The records this event mutates, in a fixed order.
    pub fn targets(&self) -> Vec<RecordRef> {
        match self {
            Self::NftMinted { token_id, .. }
            | Self::NftTransferred { token_id, .. }
            | Self::NftBurned { token_id } => {
                vec![RecordRef::new(ProjectionKind::NftOwnership, token_id.clone())]
            }
            Self::ListingCreated { listing_id, .. }
            | Self::ListingCancelled { listing_id }
            | Self::ListingFilled { listing_id, .. } => {
                vec![RecordRef::new(ProjectionKind::Listing, listing_id.clone())]
            }
            Self::VoteCast { proposal_id, voter, .. } => vec![
                RecordRef::new(ProjectionKind::Vote, format!("{proposal_id}/{voter}")),
                RecordRef::new(ProjectionKind::ProposalTally, proposal_id.clone()),
            ],
        }
    }

    /// Compute the writes that apply this event.
    ///
    /// `current` holds the present record for each entry of [`targets`](Self::targets),
    /// in the same order. Records already at or beyond `sequence_id` are left
    /// untouched. Returns an error reason when the event cannot apply to the
    /// current state (e.g. a fill for an unknown listing), or when only some
    /// of its records already reflect it.
    pub fn reduce(
        &self,
        current: &[Option<ProjectionRecord>],
        sequence_id: u64,
        now: i64,
    ) -> Result<Vec<RecordWrite>, String> {
        let targets = self.targets();
        if current.len() != targets.len() {
            return Err(format!(
                "expected {} records, got {}",
                targets.len(),
                current.len()
            ));
        }
        let pending = |i: usize| {
            current[i]
                .as_ref()
                .map_or(true, |r| r.last_applied_sequence_id < sequence_id)
        };
        // Records of one event move together; a mix means state diverged.
        let behind = (0..targets.len()).filter(|&i| pending(i)).count();
        if behind != 0 && behind != targets.len() {
            return Err(format!(
                "event {sequence_id} is reflected in only {} of {} records",
                targets.len() - behind,
                targets.len()
            ));
        }
        let write = |i: usize, state: serde_json::Value| RecordWrite {
            target: targets[i].clone(),
            expected_sequence_id: current[i].as_ref().map(|r| r.last_applied_sequence_id),
            state,
            sequence_id,
            updated_at: now,
        };
        let typed = |i: usize| current[i].as_ref().map(|r| r.state.clone());

        let mut writes = Vec::new();
        match self {
            Self::NftMinted { token_id, owner } => {
                if pending(0) {
                    let state = NftOwnership {
                        token_id: token_id.clone(),
                        owner: Some(owner.clone()),
                        transfer_count: 0,
                    };
                    writes.push(write(0, to_value(&state)?));
                }
            }
            Self::NftTransferred { token_id, from, to } => {
                if pending(0) {
                    let mut state = match typed(0) {
                        Some(v) => from_value::<NftOwnership>(v)?,
                        None => NftOwnership {
                            token_id: token_id.clone(),
                            owner: None,
                            transfer_count: 0,
                        },
                    };
                    if state.owner.as_deref().is_some_and(|o| o != from) {
                        tracing::warn!(
                            token_id,
                            expected = ?state.owner,
                            from,
                            "transfer sender differs from projected owner"
                        );
                    }
                    state.owner = Some(to.clone());
                    state.transfer_count += 1;
                    writes.push(write(0, to_value(&state)?));
                }
            }
            Self::NftBurned { token_id } => {
                if pending(0) {
                    let mut state = match typed(0) {
                        Some(v) => from_value::<NftOwnership>(v)?,
                        None => return Err(format!("burn of unknown token '{token_id}'")),
                    };
                    state.owner = None;
                    writes.push(write(0, to_value(&state)?));
                }
            }
            Self::ListingCreated {
                listing_id,
                token_id,
                seller,
                price,
            } => {
                if pending(0) {
                    let state = Listing {
                        listing_id: listing_id.clone(),
                        token_id: token_id.clone(),
                        seller: seller.clone(),
                        price: price.clone(),
                        status: ListingStatus::Active,
                        buyer: None,
                    };
                    writes.push(write(0, to_value(&state)?));
                }
            }
            Self::ListingCancelled { listing_id } | Self::ListingFilled { listing_id, .. } => {
                if pending(0) {
                    let mut state = match typed(0) {
                        Some(v) => from_value::<Listing>(v)?,
                        None => return Err(format!("unknown listing '{listing_id}'")),
                    };
                    if state.status != ListingStatus::Active {
                        return Err(format!("listing '{listing_id}' is not active"));
                    }
                    if let Self::ListingFilled { buyer, .. } = self {
                        state.status = ListingStatus::Sold;
                        state.buyer = Some(buyer.clone());
                    } else {
                        state.status = ListingStatus::Cancelled;
                    }
                    writes.push(write(0, to_value(&state)?));
                }
            }
            Self::VoteCast {
                proposal_id,
                voter,
                choice,
                weight,
            } => {
                // A re-vote replaces the voter's previous weight in the tally.
                let previous = if pending(0) {
                    typed(0).map(from_value::<Vote>).transpose()?
                } else {
                    None
                };
                if pending(0) {
                    let vote = Vote {
                        proposal_id: proposal_id.clone(),
                        voter: voter.clone(),
                        choice: *choice,
                        weight: *weight,
                    };
                    writes.push(write(0, to_value(&vote)?));
                }
                if pending(1) {
                    let mut tally = match typed(1) {
                        Some(v) => from_value::<ProposalTally>(v)?,
                        None => ProposalTally {
                            proposal_id: proposal_id.clone(),
                            ..Default::default()
                        },
                    };
                    match &previous {
                        Some(prev) => tally.remove(prev.choice, prev.weight),
                        None => tally.voters += 1,
                    }
                    tally.add(*choice, *weight);
                    writes.push(write(1, to_value(&tally)?));
                }
            }
        }
        Ok(writes)
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(v).map_err(|e| e.to_string())
}

fn from_value<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(v).map_err(|e| format!("corrupt projection state: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: &RecordRef, state: serde_json::Value, seq: u64) -> ProjectionRecord {
        ProjectionRecord {
            kind: target.kind,
            key: target.key.clone(),
            state,
            last_applied_sequence_id: seq,
            updated_at: 0,
        }
    }

    #[test]
    fn decode_known_and_unknown_kinds() {
        let ev = DomainEvent::decode("nft_minted", &json!({"token_id": "7", "owner": "alice"}));
        assert_eq!(
            ev.unwrap(),
            DomainEvent::NftMinted { token_id: "7".into(), owner: "alice".into() }
        );
        assert!(DomainEvent::decode("studio_created", &json!({})).is_err());
        assert!(DomainEvent::decode("nft_minted", &json!({"token_id": 7})).is_err());
    }

    #[test]
    fn transfer_updates_owner() {
        let ev = DomainEvent::NftTransferred {
            token_id: "7".into(),
            from: "alice".into(),
            to: "bob".into(),
        };
        let target = &ev.targets()[0];
        let current = record(
            target,
            json!({"token_id": "7", "owner": "alice", "transfer_count": 0}),
            3,
        );
        let writes = ev.reduce(&[Some(current)], 5, 100).unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].expected_sequence_id, Some(3));
        let state: NftOwnership = serde_json::from_value(writes[0].state.clone()).unwrap();
        assert_eq!(state.owner.as_deref(), Some("bob"));
        assert_eq!(state.transfer_count, 1);
    }

    #[test]
    fn already_applied_record_produces_no_write() {
        let ev = DomainEvent::NftMinted { token_id: "7".into(), owner: "alice".into() };
        let target = &ev.targets()[0];
        let current = record(target, json!({"token_id": "7", "owner": "alice", "transfer_count": 0}), 9);
        assert!(ev.reduce(&[Some(current)], 9, 0).unwrap().is_empty());
    }

    #[test]
    fn fill_of_unknown_listing_is_rejected() {
        let ev = DomainEvent::ListingFilled { listing_id: "L1".into(), buyer: "bob".into() };
        assert!(ev.reduce(&[None], 1, 0).is_err());
    }

    #[test]
    fn revote_moves_weight() {
        let first = DomainEvent::VoteCast {
            proposal_id: "P1".into(),
            voter: "alice".into(),
            choice: VoteChoice::For,
            weight: 10,
        };
        let writes = first.reduce(&[None, None], 1, 0).unwrap();
        assert_eq!(writes.len(), 2);
        let vote_rec = record(&writes[0].target, writes[0].state.clone(), 1);
        let tally_rec = record(&writes[1].target, writes[1].state.clone(), 1);

        let second = DomainEvent::VoteCast {
            proposal_id: "P1".into(),
            voter: "alice".into(),
            choice: VoteChoice::Against,
            weight: 4,
        };
        let writes = second.reduce(&[Some(vote_rec), Some(tally_rec)], 2, 0).unwrap();
        let tally: ProposalTally = serde_json::from_value(writes[1].state.clone()).unwrap();
        assert_eq!(tally.for_weight, 0);
        assert_eq!(tally.against_weight, 4);
        assert_eq!(tally.voters, 1);
    }

    #[test]
    fn vote_behind_an_advanced_tally_is_rejected() {
        let ev = DomainEvent::VoteCast {
            proposal_id: "P1".into(),
            voter: "alice".into(),
            choice: VoteChoice::For,
            weight: 10,
        };
        let targets = ev.targets();
        let tally = record(&targets[1], json!({"proposal_id": "P1", "for_weight": 3}), 9);
        let err = ev.reduce(&[None, Some(tally)], 4, 0).unwrap_err();
        assert!(err.contains("1 of 2"), "{err}");
    }
}
