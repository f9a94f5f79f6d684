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

//! Abstract tabular store consumed by the indexing core. Creates assign
//! dense, monotone row ids; updates address rows by primary key; finders and
//! deletes take the typed key arguments that stand for column predicates.
//! All writes of one block happen inside a single [`StoreTx`]; dropping an
//! uncommitted transaction publishes nothing.

pub mod mem;

use crate::{
	error::Result,
	types::{
		Account, AccountId, Ballot, BigmapItem, Block, Chain, Contract, Election, ElectionId, Flow, Income, Op,
		Proposal, ProposalId, Right, RightKind, Snapshot, Supply, Vote,
	},
};

/// Row counts of every table the core owns; used for progress logging and
/// by the round-trip tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableCounts {
	pub accounts: u64,
	pub blocks: u64,
	pub chains: u64,
	pub supplies: u64,
	pub flows: u64,
	pub ops: u64,
	pub contracts: u64,
	pub bigmap_items: u64,
	pub rights: u64,
	pub snapshots: u64,
	pub elections: u64,
	pub votes: u64,
	pub proposals: u64,
	pub ballots: u64,
	pub incomes: u64,
}

/// Durable store handing out scoped transactions.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// One transaction over all tables. Reads observe earlier writes of the
/// same transaction plus all previously committed state.
#[async_trait::async_trait]
pub trait StoreTx: Send {
	async fn commit(self: Box<Self>) -> Result<()>;
	async fn rollback(self: Box<Self>) -> Result<()>;

	// accounts
	async fn create_account(&mut self, row: &mut Account) -> Result<()>;
	async fn update_account(&mut self, row: &Account) -> Result<()>;
	async fn delete_accounts(&mut self, ids: &[AccountId]) -> Result<u64>;
	async fn delete_accounts_by_first_seen(&mut self, height: i64) -> Result<u64>;
	async fn account_by_id(&mut self, id: AccountId) -> Result<Option<Account>>;
	async fn account_by_address(&mut self, address: &str) -> Result<Option<Account>>;
	/// all registered delegate accounts, ordered by row id
	async fn delegate_accounts(&mut self) -> Result<Vec<Account>>;

	// blocks
	async fn create_block(&mut self, row: &mut Block) -> Result<()>;
	async fn update_block(&mut self, row: &Block) -> Result<()>;
	async fn block_by_height(&mut self, height: i64) -> Result<Option<Block>>;
	async fn latest_block(&mut self) -> Result<Option<Block>>;
	async fn delete_blocks_by_height(&mut self, height: i64) -> Result<u64>;

	// chain & supply aggregates
	async fn create_chain(&mut self, row: &mut Chain) -> Result<()>;
	async fn delete_chains_by_height(&mut self, height: i64) -> Result<u64>;
	async fn create_supply(&mut self, row: &mut Supply) -> Result<()>;
	async fn supply_by_height(&mut self, height: i64) -> Result<Option<Supply>>;
	async fn delete_supplies_by_height(&mut self, height: i64) -> Result<u64>;

	// flows & ops
	async fn create_flows(&mut self, rows: &mut [Flow]) -> Result<()>;
	async fn delete_flows_by_height(&mut self, height: i64) -> Result<u64>;
	async fn create_ops(&mut self, rows: &mut [Op]) -> Result<()>;
	async fn delete_ops_by_height(&mut self, height: i64) -> Result<u64>;

	// contracts & big maps
	async fn create_contracts(&mut self, rows: &mut [Contract]) -> Result<()>;
	async fn delete_contracts_by_height(&mut self, height: i64) -> Result<u64>;
	async fn create_bigmap_items(&mut self, rows: &mut [BigmapItem]) -> Result<()>;
	async fn delete_bigmap_items_by_height(&mut self, height: i64) -> Result<u64>;

	// rights
	async fn create_rights(&mut self, rows: &mut [Right]) -> Result<()>;
	async fn update_right(&mut self, row: &Right) -> Result<()>;
	async fn rights_by_height(&mut self, height: i64, kind: RightKind) -> Result<Vec<Right>>;
	/// baking rights of `cycle` whose required seed nonce was never revealed
	async fn unrevealed_seed_rights(&mut self, cycle: i64) -> Result<Vec<Right>>;
	async fn delete_rights_by_cycle(&mut self, cycle: i64) -> Result<u64>;
	async fn delete_rights_by_height(&mut self, height: i64) -> Result<u64>;

	// roll snapshots
	async fn create_snapshots(&mut self, rows: &mut [Snapshot]) -> Result<()>;
	async fn delete_snapshots_by_height(&mut self, height: i64) -> Result<u64>;
	/// rolls of `account` in the snapshot taken at exactly `height`
	async fn snapshot_rolls(&mut self, height: i64, account: AccountId) -> Result<Option<i64>>;
	/// active rows of snapshot `index` in `cycle`
	async fn snapshots_by_cycle_index(&mut self, cycle: i64, index: i64) -> Result<Vec<Snapshot>>;

	// governance
	async fn create_election(&mut self, row: &mut Election) -> Result<()>;
	async fn update_election(&mut self, row: &Election) -> Result<()>;
	/// latest election with `start_height <= height`
	async fn election_by_height(&mut self, height: i64) -> Result<Option<Election>>;
	async fn delete_elections_by_start_height(&mut self, height: i64) -> Result<u64>;

	async fn create_vote(&mut self, row: &mut Vote) -> Result<()>;
	async fn update_vote(&mut self, row: &Vote) -> Result<()>;
	/// latest vote with `start_height <= height`
	async fn vote_by_height(&mut self, height: i64) -> Result<Option<Vote>>;
	/// votes with `start_height < height`, newest row first
	async fn votes_before(&mut self, height: i64) -> Result<Vec<Vote>>;
	async fn delete_votes_by_start_height(&mut self, height: i64) -> Result<u64>;

	async fn create_proposals(&mut self, rows: &mut [Proposal]) -> Result<()>;
	async fn update_proposal(&mut self, row: &Proposal) -> Result<()>;
	async fn proposals_by_election(&mut self, election: ElectionId) -> Result<Vec<Proposal>>;
	async fn proposals_by_height(&mut self, height: i64) -> Result<Vec<Proposal>>;
	async fn delete_proposals_by_height(&mut self, height: i64) -> Result<u64>;

	async fn create_ballots(&mut self, rows: &mut [Ballot]) -> Result<()>;
	async fn ballots_by_height(&mut self, height: i64) -> Result<Vec<Ballot>>;
	async fn ballots_by_period(&mut self, period: i64) -> Result<Vec<Ballot>>;
	async fn count_ballots(&mut self, source: AccountId, period: i64) -> Result<i64>;
	async fn count_ballots_for_proposal(&mut self, source: AccountId, period: i64, proposal: ProposalId)
		-> Result<i64>;
	async fn delete_ballots_by_height(&mut self, height: i64) -> Result<u64>;

	// income
	async fn create_incomes(&mut self, rows: &mut [Income]) -> Result<()>;
	async fn update_income(&mut self, row: &Income) -> Result<()>;
	async fn income_by_cycle_account(&mut self, cycle: i64, account: AccountId) -> Result<Option<Income>>;
	async fn incomes_by_cycle(&mut self, cycle: i64) -> Result<Vec<Income>>;
	async fn delete_incomes_by_cycle(&mut self, cycle: i64) -> Result<u64>;

	async fn row_counts(&mut self) -> Result<TableCounts>;
}
