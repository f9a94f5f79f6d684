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

//! Entity rows persisted by the sub-indexes, plus the in-flight block value
//! that carries a block through the connect/disconnect pipeline.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	params::Params,
	rpc::{RawBlock, RawOperation},
};

macro_rules! id_type {
	($($name:ident),+ $(,)?) => {$(
		/// Opaque 64-bit row id. Zero means "not yet assigned".
		#[derive(
			Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
		)]
		pub struct $name(pub u64);

		impl $name {
			pub fn value(self) -> u64 {
				self.0
			}

			pub fn is_zero(self) -> bool {
				self.0 == 0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}
	)+};
}

id_type!(
	AccountId, BlockId, FlowId, OpId, ContractId, BigmapItemId, ElectionId, ProposalId, VoteId, BallotId, RightId,
	SnapshotId, IncomeId, SupplyId, ChainId,
);

/// The four phases of one amendment cycle, in protocol order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotingPeriodKind {
	Proposal,
	Exploration,
	Testing,
	Promotion,
}

impl VotingPeriodKind {
	/// Position of this phase within an election, 1-based.
	pub fn period_index(self) -> i64 {
		match self {
			VotingPeriodKind::Proposal => 1,
			VotingPeriodKind::Exploration => 2,
			VotingPeriodKind::Testing => 3,
			VotingPeriodKind::Promotion => 4,
		}
	}
}

impl fmt::Display for VotingPeriodKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let s = match self {
			VotingPeriodKind::Proposal => "proposal",
			VotingPeriodKind::Exploration => "exploration",
			VotingPeriodKind::Testing => "testing",
			VotingPeriodKind::Promotion => "promotion",
		};
		write!(f, "{}", s)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BallotVote {
	Yay,
	Nay,
	Pass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RightKind {
	Baking,
	Endorsing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
	Baking,
	Endorsement,
	NonceRevelation,
	Denunciation,
	Activation,
	Transaction,
	Origination,
	Delegation,
	Reveal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowCategory {
	Deposits,
	Rewards,
	Fees,
	Balance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
	Endorsement,
	SeedNonceRevelation,
	DoubleBakingEvidence,
	DoubleEndorsementEvidence,
	Activation,
	Proposals,
	Ballot,
	Reveal,
	Transaction,
	Origination,
	Delegation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BigmapAction {
	Alloc,
	Update,
	Remove,
	Copy,
}

/// One row per address ever seen on chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
	pub row_id: AccountId,
	pub address: String,
	pub first_seen: i64,
	pub spendable_balance: i64,
	pub frozen_deposits: i64,
	pub frozen_rewards: i64,
	pub frozen_fees: i64,
	pub delegated_balance: i64,
	/// amount this account moved to its delegate at the last delegation op
	pub delegated_amount: i64,
	pub active_delegations: i64,
	pub delegate_id: AccountId,
	pub is_delegate: bool,
	pub is_active_delegate: bool,
	pub is_contract: bool,
	// write-back markers, reset once the account index has persisted the row
	pub is_dirty: bool,
	pub must_delete: bool,
}

impl Account {
	pub fn new(address: impl Into<String>, first_seen: i64) -> Self {
		Account { address: address.into(), first_seen, ..Default::default() }
	}

	pub fn balance(&self) -> i64 {
		self.spendable_balance
	}

	/// Own funds at stake plus what others delegated here.
	pub fn staking_balance(&self) -> i64 {
		self.spendable_balance + self.frozen_deposits + self.frozen_fees + self.delegated_balance
	}

	pub fn rolls(&self, p: &Params) -> i64 {
		if p.tokens_per_roll == 0 {
			return 0;
		}
		self.staking_balance() / p.tokens_per_roll
	}
}

/// Persistent block row. The in-flight value wrapping it is [`BlockData`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
	pub row_id: BlockId,
	pub hash: String,
	pub parent_hash: String,
	pub height: i64,
	pub cycle: i64,
	pub time: DateTime<Utc>,
	pub priority: i64,
	pub baker_id: AccountId,
	pub voting_period: i64,
	pub voting_period_kind: VotingPeriodKind,
	/// bitmap of parent slots endorsed by operations in this block's child
	pub slots_endorsed: u32,
	pub fee: i64,
	pub reward: i64,
	pub deposit: i64,
	pub n_ops: i64,
	pub n_proposal: i64,
	pub n_ballot: i64,
	pub is_cycle_snapshot: bool,
}

impl Block {
	pub fn new(height: i64, time: DateTime<Utc>) -> Self {
		Block {
			row_id: BlockId::default(),
			hash: String::new(),
			parent_hash: String::new(),
			height,
			cycle: 0,
			time,
			priority: 0,
			baker_id: AccountId::default(),
			voting_period: 0,
			voting_period_kind: VotingPeriodKind::Proposal,
			slots_endorsed: 0,
			fee: 0,
			reward: 0,
			deposit: 0,
			n_ops: 0,
			n_proposal: 0,
			n_ballot: 0,
			is_cycle_snapshot: false,
		}
	}
}

/// Per-height chain aggregate over all accounts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chain {
	pub row_id: ChainId,
	pub height: i64,
	pub cycle: i64,
	pub total_accounts: i64,
	pub total_delegates: i64,
	pub rolls: i64,
	pub roll_owners: i64,
}

/// Per-height monetary aggregate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Supply {
	pub row_id: SupplyId,
	pub height: i64,
	pub cycle: i64,
	pub total: i64,
	pub activated: i64,
	pub circulating: i64,
	pub frozen_deposits: i64,
	pub frozen_rewards: i64,
	pub frozen_fees: i64,
	pub burned: i64,
}

/// A single directional balance delta.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Flow {
	pub row_id: FlowId,
	pub height: i64,
	pub cycle: i64,
	pub account_id: AccountId,
	pub kind: FlowKind,
	pub category: FlowCategory,
	pub amount_in: i64,
	pub amount_out: i64,
	pub is_frozen: bool,
	pub is_burned: bool,
}

impl Default for FlowKind {
	fn default() -> Self {
		FlowKind::Transaction
	}
}

impl Default for FlowCategory {
	fn default() -> Self {
		FlowCategory::Balance
	}
}

impl Flow {
	pub fn new(height: i64, cycle: i64, account_id: AccountId, kind: FlowKind, category: FlowCategory) -> Self {
		Flow { height, cycle, account_id, kind, category, ..Default::default() }
	}

	pub fn frozen(mut self) -> Self {
		self.is_frozen = true;
		self
	}

	pub fn burned(mut self) -> Self {
		self.is_burned = true;
		self
	}

	pub fn in_amount(mut self, amount: i64) -> Self {
		self.amount_in = amount;
		self
	}

	pub fn out_amount(mut self, amount: i64) -> Self {
		self.amount_out = amount;
		self
	}
}

/// A chain operation at position `(op_n, op_c)` within its block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
	pub row_id: OpId,
	pub hash: String,
	pub height: i64,
	pub cycle: i64,
	pub op_n: i64,
	pub op_c: i64,
	pub kind: OpKind,
	pub sender_id: AccountId,
	pub receiver_id: AccountId,
	pub volume: i64,
	pub fee: i64,
	pub gas_limit: i64,
	pub gas_used: i64,
	pub storage_size: i64,
	pub reward: i64,
	pub deposit: i64,
	pub burned: i64,
	/// kind-specific payload, e.g. the endorsed-slot mask as decimal string
	pub data: String,
	pub is_success: bool,
}

impl Op {
	pub fn new(height: i64, cycle: i64, op_n: i64, op_c: i64, kind: OpKind) -> Self {
		Op {
			row_id: OpId::default(),
			hash: String::new(),
			height,
			cycle,
			op_n,
			op_c,
			kind,
			sender_id: AccountId::default(),
			receiver_id: AccountId::default(),
			volume: 0,
			fee: 0,
			gas_limit: 0,
			gas_used: 0,
			storage_size: 0,
			reward: 0,
			deposit: 0,
			burned: 0,
			data: String::new(),
			is_success: true,
		}
	}
}

/// Baking or endorsing entitlement of a delegate at one height.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Right {
	pub row_id: RightId,
	pub kind: RightKind,
	pub height: i64,
	pub cycle: i64,
	/// baking priority, or the endorsement slot
	pub priority: i64,
	pub account_id: AccountId,
	pub is_lost: bool,
	pub is_stolen: bool,
	pub is_missed: bool,
	pub is_seed_required: bool,
	pub is_seed_revealed: bool,
}

impl Right {
	pub fn new(kind: RightKind, height: i64, cycle: i64, priority: i64, account_id: AccountId) -> Self {
		Right {
			row_id: RightId::default(),
			kind,
			height,
			cycle,
			priority,
			account_id,
			is_lost: false,
			is_stolen: false,
			is_missed: false,
			is_seed_required: false,
			is_seed_revealed: false,
		}
	}
}

/// Roll snapshot row at (cycle, index, account).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
	pub row_id: SnapshotId,
	pub height: i64,
	pub cycle: i64,
	pub index: i64,
	pub account_id: AccountId,
	pub rolls: i64,
	pub balance: i64,
	pub delegated: i64,
	pub n_delegations: i64,
	pub is_active: bool,
}

/// One amendment cycle of up to four voting periods.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Election {
	pub row_id: ElectionId,
	/// winning proposal, set when the proposal period closes with a winner
	pub proposal_id: ProposalId,
	pub voting_period: i64,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub start_height: i64,
	pub end_height: i64,
	pub num_periods: i64,
	pub num_proposals: i64,
	pub is_empty: bool,
	pub is_open: bool,
	pub is_failed: bool,
	pub no_quorum: bool,
	pub no_majority: bool,
}

/// One voting period within an election.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
	pub row_id: VoteId,
	pub election_id: ElectionId,
	pub proposal_id: ProposalId,
	pub voting_period: i64,
	pub voting_period_kind: VotingPeriodKind,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub start_height: i64,
	pub end_height: i64,
	pub eligible_rolls: i64,
	pub eligible_voters: i64,
	pub quorum_pct: i64,
	pub quorum_rolls: i64,
	pub turnout_rolls: i64,
	pub turnout_voters: i64,
	pub turnout_pct: i64,
	pub turnout_ema: i64,
	pub yay_rolls: i64,
	pub yay_voters: i64,
	pub nay_rolls: i64,
	pub nay_voters: i64,
	pub pass_rolls: i64,
	pub pass_voters: i64,
	pub is_open: bool,
	pub is_failed: bool,
	pub is_draw: bool,
	pub no_proposal: bool,
	pub no_quorum: bool,
	pub no_majority: bool,
}

/// A protocol upgrade proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
	pub row_id: ProposalId,
	pub hash: String,
	pub height: i64,
	pub time: DateTime<Utc>,
	pub source_id: AccountId,
	pub op_id: OpId,
	pub election_id: ElectionId,
	pub voting_period: i64,
	pub rolls: i64,
	pub voters: i64,
}

/// One (voter, period, proposal) voting record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
	pub row_id: BallotId,
	pub election_id: ElectionId,
	pub proposal_id: ProposalId,
	pub voting_period: i64,
	pub voting_period_kind: VotingPeriodKind,
	pub height: i64,
	pub time: DateTime<Utc>,
	pub source_id: AccountId,
	pub op_id: OpId,
	pub rolls: i64,
	pub ballot: BallotVote,
}

/// Per (cycle, account) reward accounting row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Income {
	pub row_id: IncomeId,
	pub cycle: i64,
	pub account_id: AccountId,
	pub rolls: i64,
	pub balance: i64,
	pub delegated: i64,
	pub n_delegations: i64,
	pub luck_pct: i64,
	pub expected_income: i64,
	pub expected_bonds: i64,
	pub total_income: i64,
	pub total_bonds: i64,
	pub total_lost: i64,
	pub baking_income: i64,
	pub endorsing_income: i64,
	pub seed_income: i64,
	pub fees_income: i64,
	pub stolen_baking_income: i64,
	pub missed_baking_income: i64,
	pub missed_endorsing_income: i64,
	pub lost_accusation_deposits: i64,
	pub lost_accusation_rewards: i64,
	pub lost_accusation_fees: i64,
	pub lost_revelation_rewards: i64,
	pub lost_revelation_fees: i64,
	pub double_baking_income: i64,
	pub double_endorsing_income: i64,
	pub n_baking_rights: i64,
	pub n_endorsing_rights: i64,
	pub n_blocks_baked: i64,
	pub n_blocks_stolen: i64,
	pub n_blocks_lost: i64,
	pub n_slots_endorsed: i64,
	pub n_slots_missed: i64,
	pub n_seeds_revealed: i64,
	pub performance_pct: i64,
	pub contribution_pct: i64,
}

impl Income {
	/// Luck relates the income a delegate can expect from its rights to the
	/// rolls-proportional share of one cycle's full reward budget. 10000 is
	/// a perfectly fair draw.
	pub fn update_luck(&mut self, total_rolls: i64, p: &Params) {
		self.luck_pct = 10000;
		if total_rolls <= 0 || self.rolls <= 0 {
			return;
		}
		let budget = p.block_reward * p.blocks_per_cycle + p.endorsement_reward * p.blocks_per_cycle * p.endorsers_per_block;
		let fair = budget * self.rolls / total_rolls;
		if fair > 0 {
			self.luck_pct = self.expected_income * 10000 / fair;
		}
	}

	/// Recompute performance (income vs expectation) and contribution (work
	/// vs rights), both anchored at 10000.
	pub fn update_performance(&mut self) {
		if self.expected_income > 0 {
			let total_gain = self.total_income - self.total_lost - self.expected_income;
			self.performance_pct = 10000 + total_gain * 10000 / self.expected_income;
		}
		let total_rights = self.n_baking_rights + self.n_endorsing_rights;
		if total_rights > 0 {
			let total_work = self.n_blocks_baked + self.n_slots_endorsed;
			self.contribution_pct = 10000 + (total_work - total_rights) * 10000 / total_rights;
		}
	}
}

/// Originated smart contract row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contract {
	pub row_id: ContractId,
	pub account_id: AccountId,
	pub creator_id: AccountId,
	pub height: i64,
	pub cycle: i64,
	pub storage_size: i64,
	pub script: Option<serde_json::Value>,
}

/// Big map binding owned by a contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BigmapItem {
	pub row_id: BigmapItemId,
	pub bigmap_id: i64,
	pub account_id: AccountId,
	pub height: i64,
	pub cycle: i64,
	pub action: BigmapAction,
	pub key_hash: String,
	pub key: Option<serde_json::Value>,
	pub value: Option<serde_json::Value>,
	pub is_replaced: bool,
	pub is_deleted: bool,
}

/// One delegation switch, with enough detail to reverse it exactly.
#[derive(Clone, Copy, Debug, Default)]
pub struct DelegationUndo {
	pub account_id: AccountId,
	pub old_delegate: AccountId,
	pub new_delegate: AccountId,
	/// amount delegated before the switch
	pub prev_amount: i64,
	/// amount moved to the new delegate
	pub amount: i64,
}

/// Reversal data the builder records while connecting a block, for effects
/// that cannot be reconstructed from flows alone.
#[derive(Clone, Debug, Default)]
pub struct UndoLog {
	/// accounts that registered as delegates at this height
	pub new_delegates: Vec<AccountId>,
	pub delegations: Vec<DelegationUndo>,
	/// parent endorsement bitmap before this block filled it
	pub parent_slots_endorsed: u32,
}

/// A block on its way through the pipeline: the persistent row plus
/// everything the builder derived from the raw RPC data. Sub-indexes read
/// from this value and write rows through the open store transaction.
#[derive(Clone, Debug)]
pub struct BlockData {
	pub block: Block,
	pub params: Arc<Params>,
	pub raw: RawBlock,
	/// parent row as loaded at build time; bitmap updates go through here
	pub parent: Option<Block>,
	pub chain: Chain,
	pub supply: Supply,
	pub flows: Vec<Flow>,
	pub ops: Vec<Op>,
	pub snapshots: Vec<Snapshot>,
	pub contracts: Vec<Contract>,
	pub bigmap_items: Vec<BigmapItem>,
	/// baking rights of this height plus endorsing rights of the parent
	/// height, with stolen/missed/lost flags already resolved
	pub rights: Vec<Right>,
	pub undo: UndoLog,
}

impl BlockData {
	pub fn height(&self) -> i64 {
		self.block.height
	}

	pub fn cycle(&self) -> i64 {
		self.block.cycle
	}

	/// Reward the priority-0 holder would have earned for this block.
	pub fn block_reward(&self) -> i64 {
		if self.block.cycle < self.params.no_reward_cycles {
			0
		} else {
			self.params.block_reward
		}
	}

	/// Operation contents as delivered by the node, addressed by list and
	/// position within the list.
	pub fn get_rpc_op(&self, op_n: i64, op_c: i64) -> Option<&RawOperation> {
		self.raw.operations.get(op_n as usize).and_then(|l| l.get(op_c as usize))
	}

	pub fn rights(&self, kind: RightKind) -> impl Iterator<Item = &Right> {
		self.rights.iter().filter(move |r| r.kind == kind)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn staking_balance_and_rolls() {
		let p = Params::test(6);
		let mut acc = Account::new("tz1aaa", 1);
		acc.spendable_balance = 10_000;
		acc.frozen_deposits = 5_000;
		acc.delegated_balance = 1_500;
		assert_eq!(acc.staking_balance(), 16_500);
		assert_eq!(acc.rolls(&p), 2);
	}

	#[test]
	fn performance_matches_definition() {
		let mut income = Income { expected_income: 200, total_income: 260, total_lost: 10, ..Default::default() };
		income.update_performance();
		assert_eq!(income.performance_pct, 10000 + 50 * 10000 / 200);
	}

	#[test]
	fn luck_is_neutral_without_rolls() {
		let p = Params::test(6);
		let mut income = Income { expected_income: 100, ..Default::default() };
		income.update_luck(0, &p);
		assert_eq!(income.luck_pct, 10000);
	}
}
