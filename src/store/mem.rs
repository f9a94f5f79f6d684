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

//! In-memory store. A transaction clones the table state and publishes it
//! atomically on commit, which gives the reference semantics for invariant
//! (ii): readers only ever observe fully committed heights.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use super::{Store, StoreTx, TableCounts};
use crate::{
	error::{ArchiveError, Result},
	types::{
		Account, AccountId, Ballot, BigmapItem, Block, Chain, Contract, Election, ElectionId, Flow, Income, Op,
		Proposal, ProposalId, Right, RightKind, Snapshot, Supply, Vote,
	},
};

/// All table rows keyed by row id. Extracted from the id counters so tests
/// can compare complete storage states across connect/disconnect cycles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
	pub accounts: BTreeMap<u64, Account>,
	pub blocks: BTreeMap<u64, Block>,
	pub chains: BTreeMap<u64, Chain>,
	pub supplies: BTreeMap<u64, Supply>,
	pub flows: BTreeMap<u64, Flow>,
	pub ops: BTreeMap<u64, Op>,
	pub contracts: BTreeMap<u64, Contract>,
	pub bigmap_items: BTreeMap<u64, BigmapItem>,
	pub rights: BTreeMap<u64, Right>,
	pub snapshots: BTreeMap<u64, Snapshot>,
	pub elections: BTreeMap<u64, Election>,
	pub votes: BTreeMap<u64, Vote>,
	pub proposals: BTreeMap<u64, Proposal>,
	pub ballots: BTreeMap<u64, Ballot>,
	pub incomes: BTreeMap<u64, Income>,
}

/// Per-table id sequences; dense, monotone, never reused.
#[derive(Clone, Copy, Debug, Default)]
struct NextIds {
	account: u64,
	block: u64,
	chain: u64,
	supply: u64,
	flow: u64,
	op: u64,
	contract: u64,
	bigmap_item: u64,
	right: u64,
	snapshot: u64,
	election: u64,
	vote: u64,
	proposal: u64,
	ballot: u64,
	income: u64,
}

fn next(seq: &mut u64) -> u64 {
	*seq += 1;
	*seq
}

#[derive(Clone, Debug, Default)]
struct Tables {
	rows: Rows,
	ids: NextIds,
}

/// Shared in-memory store.
#[derive(Clone, Default)]
pub struct MemStore {
	inner: Arc<Mutex<Tables>>,
}

impl MemStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of all committed rows, for tests.
	pub fn rows(&self) -> Rows {
		self.inner.lock().rows.clone()
	}

	pub fn counts(&self) -> TableCounts {
		count_tables(&self.inner.lock().rows)
	}
}

#[async_trait::async_trait]
impl Store for MemStore {
	async fn begin(&self) -> Result<Box<dyn StoreTx>> {
		let work = self.inner.lock().clone();
		Ok(Box::new(MemTx { shared: self.inner.clone(), work }))
	}
}

struct MemTx {
	shared: Arc<Mutex<Tables>>,
	work: Tables,
}

fn count_tables(rows: &Rows) -> TableCounts {
	TableCounts {
		accounts: rows.accounts.len() as u64,
		blocks: rows.blocks.len() as u64,
		chains: rows.chains.len() as u64,
		supplies: rows.supplies.len() as u64,
		flows: rows.flows.len() as u64,
		ops: rows.ops.len() as u64,
		contracts: rows.contracts.len() as u64,
		bigmap_items: rows.bigmap_items.len() as u64,
		rights: rows.rights.len() as u64,
		snapshots: rows.snapshots.len() as u64,
		elections: rows.elections.len() as u64,
		votes: rows.votes.len() as u64,
		proposals: rows.proposals.len() as u64,
		ballots: rows.ballots.len() as u64,
		incomes: rows.incomes.len() as u64,
	}
}

fn drain_where<T>(map: &mut BTreeMap<u64, T>, pred: impl Fn(&T) -> bool) -> u64 {
	let keys: Vec<u64> = map.iter().filter(|(_, v)| pred(v)).map(|(k, _)| *k).collect();
	let n = keys.len() as u64;
	for k in keys {
		map.remove(&k);
	}
	n
}

fn missing(table: &'static str) -> ArchiveError {
	ArchiveError::NoEntry(table)
}

#[async_trait::async_trait]
impl StoreTx for MemTx {
	async fn commit(self: Box<Self>) -> Result<()> {
		*self.shared.lock() = self.work;
		Ok(())
	}

	async fn rollback(self: Box<Self>) -> Result<()> {
		Ok(())
	}

	async fn create_account(&mut self, row: &mut Account) -> Result<()> {
		row.row_id = AccountId(next(&mut self.work.ids.account));
		self.work.rows.accounts.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn update_account(&mut self, row: &Account) -> Result<()> {
		let slot = self.work.rows.accounts.get_mut(&row.row_id.value()).ok_or_else(|| missing("account"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn delete_accounts(&mut self, ids: &[AccountId]) -> Result<u64> {
		let mut n = 0;
		for id in ids {
			if self.work.rows.accounts.remove(&id.value()).is_some() {
				n += 1;
			}
		}
		Ok(n)
	}

	async fn delete_accounts_by_first_seen(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.accounts, |a| a.first_seen == height))
	}

	async fn account_by_id(&mut self, id: AccountId) -> Result<Option<Account>> {
		Ok(self.work.rows.accounts.get(&id.value()).cloned())
	}

	async fn account_by_address(&mut self, address: &str) -> Result<Option<Account>> {
		Ok(self.work.rows.accounts.values().find(|a| a.address == address).cloned())
	}

	async fn delegate_accounts(&mut self) -> Result<Vec<Account>> {
		Ok(self.work.rows.accounts.values().filter(|a| a.is_delegate).cloned().collect())
	}

	async fn create_block(&mut self, row: &mut Block) -> Result<()> {
		row.row_id = crate::types::BlockId(next(&mut self.work.ids.block));
		self.work.rows.blocks.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn update_block(&mut self, row: &Block) -> Result<()> {
		let slot = self.work.rows.blocks.get_mut(&row.row_id.value()).ok_or_else(|| missing("block"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn block_by_height(&mut self, height: i64) -> Result<Option<Block>> {
		Ok(self.work.rows.blocks.values().rev().find(|b| b.height == height).cloned())
	}

	async fn latest_block(&mut self) -> Result<Option<Block>> {
		Ok(self.work.rows.blocks.values().max_by_key(|b| b.height).cloned())
	}

	async fn delete_blocks_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.blocks, |b| b.height == height))
	}

	async fn create_chain(&mut self, row: &mut Chain) -> Result<()> {
		row.row_id = crate::types::ChainId(next(&mut self.work.ids.chain));
		self.work.rows.chains.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn delete_chains_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.chains, |c| c.height == height))
	}

	async fn create_supply(&mut self, row: &mut Supply) -> Result<()> {
		row.row_id = crate::types::SupplyId(next(&mut self.work.ids.supply));
		self.work.rows.supplies.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn supply_by_height(&mut self, height: i64) -> Result<Option<Supply>> {
		Ok(self.work.rows.supplies.values().rev().find(|s| s.height == height).cloned())
	}

	async fn delete_supplies_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.supplies, |s| s.height == height))
	}

	async fn create_flows(&mut self, rows: &mut [Flow]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::FlowId(next(&mut self.work.ids.flow));
			self.work.rows.flows.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn delete_flows_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.flows, |f| f.height == height))
	}

	async fn create_ops(&mut self, rows: &mut [Op]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::OpId(next(&mut self.work.ids.op));
			self.work.rows.ops.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn delete_ops_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.ops, |o| o.height == height))
	}

	async fn create_contracts(&mut self, rows: &mut [Contract]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::ContractId(next(&mut self.work.ids.contract));
			self.work.rows.contracts.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn delete_contracts_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.contracts, |c| c.height == height))
	}

	async fn create_bigmap_items(&mut self, rows: &mut [BigmapItem]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::BigmapItemId(next(&mut self.work.ids.bigmap_item));
			self.work.rows.bigmap_items.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn delete_bigmap_items_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.bigmap_items, |b| b.height == height))
	}

	async fn create_rights(&mut self, rows: &mut [Right]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::RightId(next(&mut self.work.ids.right));
			self.work.rows.rights.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn update_right(&mut self, row: &Right) -> Result<()> {
		let slot = self.work.rows.rights.get_mut(&row.row_id.value()).ok_or_else(|| missing("right"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn rights_by_height(&mut self, height: i64, kind: RightKind) -> Result<Vec<Right>> {
		Ok(self.work.rows.rights.values().filter(|r| r.height == height && r.kind == kind).cloned().collect())
	}

	async fn unrevealed_seed_rights(&mut self, cycle: i64) -> Result<Vec<Right>> {
		Ok(self
			.work
			.rows
			.rights
			.values()
			.filter(|r| {
				r.cycle == cycle && r.kind == RightKind::Baking && r.is_seed_required && !r.is_seed_revealed
			})
			.cloned()
			.collect())
	}

	async fn delete_rights_by_cycle(&mut self, cycle: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.rights, |r| r.cycle == cycle))
	}

	async fn delete_rights_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.rights, |r| r.height == height))
	}

	async fn create_snapshots(&mut self, rows: &mut [Snapshot]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::SnapshotId(next(&mut self.work.ids.snapshot));
			self.work.rows.snapshots.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn delete_snapshots_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.snapshots, |s| s.height == height))
	}

	async fn snapshot_rolls(&mut self, height: i64, account: AccountId) -> Result<Option<i64>> {
		Ok(self
			.work
			.rows
			.snapshots
			.values()
			.rev()
			.find(|s| s.height == height && s.account_id == account)
			.map(|s| s.rolls))
	}

	async fn snapshots_by_cycle_index(&mut self, cycle: i64, index: i64) -> Result<Vec<Snapshot>> {
		Ok(self
			.work
			.rows
			.snapshots
			.values()
			.filter(|s| s.cycle == cycle && s.index == index && s.is_active)
			.cloned()
			.collect())
	}

	async fn create_election(&mut self, row: &mut Election) -> Result<()> {
		row.row_id = ElectionId(next(&mut self.work.ids.election));
		self.work.rows.elections.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn update_election(&mut self, row: &Election) -> Result<()> {
		let slot = self.work.rows.elections.get_mut(&row.row_id.value()).ok_or_else(|| missing("election"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn election_by_height(&mut self, height: i64) -> Result<Option<Election>> {
		Ok(self.work.rows.elections.values().rev().find(|e| e.start_height <= height).cloned())
	}

	async fn delete_elections_by_start_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.elections, |e| e.start_height == height))
	}

	async fn create_vote(&mut self, row: &mut Vote) -> Result<()> {
		row.row_id = crate::types::VoteId(next(&mut self.work.ids.vote));
		self.work.rows.votes.insert(row.row_id.value(), row.clone());
		Ok(())
	}

	async fn update_vote(&mut self, row: &Vote) -> Result<()> {
		let slot = self.work.rows.votes.get_mut(&row.row_id.value()).ok_or_else(|| missing("vote"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn vote_by_height(&mut self, height: i64) -> Result<Option<Vote>> {
		Ok(self.work.rows.votes.values().rev().find(|v| v.start_height <= height).cloned())
	}

	async fn votes_before(&mut self, height: i64) -> Result<Vec<Vote>> {
		Ok(self.work.rows.votes.values().rev().filter(|v| v.start_height < height).cloned().collect())
	}

	async fn delete_votes_by_start_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.votes, |v| v.start_height == height))
	}

	async fn create_proposals(&mut self, rows: &mut [Proposal]) -> Result<()> {
		for row in rows {
			row.row_id = ProposalId(next(&mut self.work.ids.proposal));
			self.work.rows.proposals.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn update_proposal(&mut self, row: &Proposal) -> Result<()> {
		let slot = self.work.rows.proposals.get_mut(&row.row_id.value()).ok_or_else(|| missing("proposal"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn proposals_by_election(&mut self, election: ElectionId) -> Result<Vec<Proposal>> {
		Ok(self.work.rows.proposals.values().filter(|p| p.election_id == election).cloned().collect())
	}

	async fn proposals_by_height(&mut self, height: i64) -> Result<Vec<Proposal>> {
		Ok(self.work.rows.proposals.values().filter(|p| p.height == height).cloned().collect())
	}

	async fn delete_proposals_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.proposals, |p| p.height == height))
	}

	async fn create_ballots(&mut self, rows: &mut [Ballot]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::BallotId(next(&mut self.work.ids.ballot));
			self.work.rows.ballots.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn ballots_by_height(&mut self, height: i64) -> Result<Vec<Ballot>> {
		Ok(self.work.rows.ballots.values().filter(|b| b.height == height).cloned().collect())
	}

	async fn ballots_by_period(&mut self, period: i64) -> Result<Vec<Ballot>> {
		Ok(self.work.rows.ballots.values().filter(|b| b.voting_period == period).cloned().collect())
	}

	async fn count_ballots(&mut self, source: AccountId, period: i64) -> Result<i64> {
		Ok(self.work.rows.ballots.values().filter(|b| b.source_id == source && b.voting_period == period).count()
			as i64)
	}

	async fn count_ballots_for_proposal(
		&mut self,
		source: AccountId,
		period: i64,
		proposal: ProposalId,
	) -> Result<i64> {
		Ok(self
			.work
			.rows
			.ballots
			.values()
			.filter(|b| b.source_id == source && b.voting_period == period && b.proposal_id == proposal)
			.count() as i64)
	}

	async fn delete_ballots_by_height(&mut self, height: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.ballots, |b| b.height == height))
	}

	async fn create_incomes(&mut self, rows: &mut [Income]) -> Result<()> {
		for row in rows {
			row.row_id = crate::types::IncomeId(next(&mut self.work.ids.income));
			self.work.rows.incomes.insert(row.row_id.value(), row.clone());
		}
		Ok(())
	}

	async fn update_income(&mut self, row: &Income) -> Result<()> {
		let slot = self.work.rows.incomes.get_mut(&row.row_id.value()).ok_or_else(|| missing("income"))?;
		*slot = row.clone();
		Ok(())
	}

	async fn income_by_cycle_account(&mut self, cycle: i64, account: AccountId) -> Result<Option<Income>> {
		Ok(self.work.rows.incomes.values().rev().find(|i| i.cycle == cycle && i.account_id == account).cloned())
	}

	async fn incomes_by_cycle(&mut self, cycle: i64) -> Result<Vec<Income>> {
		Ok(self.work.rows.incomes.values().filter(|i| i.cycle == cycle).cloned().collect())
	}

	async fn delete_incomes_by_cycle(&mut self, cycle: i64) -> Result<u64> {
		Ok(drain_where(&mut self.work.rows.incomes, |i| i.cycle == cycle))
	}

	async fn row_counts(&mut self) -> Result<TableCounts> {
		Ok(count_tables(&self.work.rows))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uncommitted_transactions_publish_nothing() {
		smol::block_on(async {
			let store = MemStore::new();
			let mut tx = store.begin().await.unwrap();
			let mut acc = Account::new("tz1aaa", 1);
			tx.create_account(&mut acc).await.unwrap();
			assert_eq!(acc.row_id, AccountId(1));
			tx.rollback().await.unwrap();
			assert_eq!(store.counts().accounts, 0);

			let mut tx = store.begin().await.unwrap();
			let mut acc = Account::new("tz1aaa", 1);
			tx.create_account(&mut acc).await.unwrap();
			tx.commit().await.unwrap();
			assert_eq!(store.counts().accounts, 1);
		});
	}

	#[test]
	fn transactions_read_their_own_writes() {
		smol::block_on(async {
			let store = MemStore::new();
			let mut tx = store.begin().await.unwrap();
			let mut acc = Account::new("tz1bbb", 5);
			tx.create_account(&mut acc).await.unwrap();
			let found = tx.account_by_address("tz1bbb").await.unwrap().unwrap();
			assert_eq!(found.row_id, acc.row_id);
			tx.commit().await.unwrap();
		});
	}

	#[test]
	fn ids_stay_monotone_across_deletes() {
		smol::block_on(async {
			let store = MemStore::new();
			let mut tx = store.begin().await.unwrap();
			let mut a = Account::new("tz1a", 1);
			tx.create_account(&mut a).await.unwrap();
			tx.delete_accounts_by_first_seen(1).await.unwrap();
			let mut b = Account::new("tz1b", 2);
			tx.create_account(&mut b).await.unwrap();
			assert_eq!(b.row_id, AccountId(2));
			tx.commit().await.unwrap();
		});
	}
}
