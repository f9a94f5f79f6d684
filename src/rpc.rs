// Copyright 2017-2021 Parity Technologies (UK) Ltd.
// This file is part of tezos-archive.

// tezos-archive is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// tezos-archive is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// You should have received a copy of the GNU General Public License
// along with tezos-archive.  If not, see <http://www.gnu.org/licenses/>.

//! Raw node data as delivered over JSON-RPC, and the `RpcSource` seam the
//! crawler pulls blocks through. Fetching is idempotent per height; any
//! parent-hash disagreement is reported as `ReorgDetected` by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	error::Result,
	types::{BallotVote, BigmapAction, VotingPeriodKind},
};

/// Current chain head as reported by the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadInfo {
	pub height: i64,
	pub hash: String,
}

/// A baking right delivered alongside a block that introduces a new cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BakingRight {
	pub level: i64,
	pub delegate: String,
	pub priority: i64,
}

/// An endorsing right; one entry covers all slots of a delegate at a level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndorsingRight {
	pub level: i64,
	pub delegate: String,
	pub slots: Vec<i64>,
}

/// Which roll snapshot the node chose to seed rights for a future cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
	pub cycle: i64,
	pub index: i64,
}

/// A single big map mutation attached to a transaction or origination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawBigmapDiff {
	pub bigmap_id: i64,
	pub action: BigmapAction,
	pub key_hash: String,
	pub key: Option<serde_json::Value>,
	pub value: Option<serde_json::Value>,
}

/// Operation contents, one variant per protocol operation kind the core
/// classifies. Monetary amounts are resolved by the node's metadata, so the
/// builder never re-derives them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawOperation {
	Activation {
		account: String,
		amount: i64,
	},
	Endorsement {
		delegate: String,
		slots: Vec<i64>,
	},
	SeedNonceRevelation {
		/// commitment block whose nonce is revealed
		level: i64,
		nonce: String,
	},
	DoubleBakingEvidence {
		offender: String,
		lost_deposits: i64,
		lost_rewards: i64,
		lost_fees: i64,
		reward: i64,
	},
	DoubleEndorsementEvidence {
		offender: String,
		lost_deposits: i64,
		lost_rewards: i64,
		lost_fees: i64,
		reward: i64,
	},
	Proposals {
		source: String,
		period: i64,
		proposals: Vec<String>,
	},
	Ballot {
		source: String,
		period: i64,
		proposal: String,
		ballot: BallotVote,
	},
	Reveal {
		source: String,
		fee: i64,
	},
	Transaction {
		source: String,
		destination: String,
		amount: i64,
		fee: i64,
		gas_limit: i64,
		gas_used: i64,
		big_map_diff: Vec<RawBigmapDiff>,
	},
	Origination {
		source: String,
		originated: String,
		balance: i64,
		fee: i64,
		storage_size: i64,
		script: Option<serde_json::Value>,
		big_map_diff: Vec<RawBigmapDiff>,
	},
	Delegation {
		source: String,
		delegate: Option<String>,
		fee: i64,
	},
}

impl RawOperation {
	/// Fee paid to the baker, zero for anonymous/consensus operations.
	pub fn fee(&self) -> i64 {
		match self {
			RawOperation::Reveal { fee, .. }
			| RawOperation::Transaction { fee, .. }
			| RawOperation::Origination { fee, .. }
			| RawOperation::Delegation { fee, .. } => *fee,
			_ => 0,
		}
	}
}

/// One block as fetched from the node: header metadata, grouped operation
/// lists (list and list position derive `(op_n, op_c)`), and, when the node
/// announces a new cycle, the full rights and snapshot descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
	pub hash: String,
	pub predecessor: String,
	pub height: i64,
	pub time: DateTime<Utc>,
	pub cycle: i64,
	pub voting_period: i64,
	pub voting_period_kind: VotingPeriodKind,
	pub priority: i64,
	pub baker: String,
	pub operations: Vec<Vec<RawOperation>>,
	pub baking_rights: Vec<BakingRight>,
	pub endorsing_rights: Vec<EndorsingRight>,
	pub snapshot: Option<SnapshotInfo>,
}

impl RawBlock {
	/// Whether this block delivers rights for a future cycle.
	pub fn has_rights(&self) -> bool {
		!self.baking_rights.is_empty() && !self.endorsing_rights.is_empty()
	}
}

/// Interface of the JSON-RPC block source. Implementations live outside the
/// core; tests use a scripted source.
#[async_trait::async_trait]
pub trait RpcSource: Send + Sync {
	async fn head(&self) -> Result<HeadInfo>;

	async fn block(&self, height: i64) -> Result<RawBlock>;

	async fn block_hash(&self, height: i64) -> Result<String>;
}
