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

//! Cycle-wide reward accounting: expected income from rights, actual income
//! from flows, stolen and missed block attribution, denunciation and seed
//! nonce losses, and the performance/contribution ratios derived from them.

use std::collections::BTreeMap;

use crate::{
	builder::BlockBuilder,
	error::{ArchiveError, Result},
	indexer::BlockIndexer,
	store::StoreTx,
	types::{
		Account, AccountId, BlockData, FlowCategory, FlowKind, Income, OpKind, RightKind,
	},
};

pub struct IncomeIndex;

#[async_trait::async_trait]
impl BlockIndexer for IncomeIndex {
	fn name(&self) -> &'static str {
		"income"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		// ignore genesis
		if block.height() == 0 {
			return Ok(());
		}

		// block 1 carries all initial rights; use genesis bakers as the
		// snapshot proxy for the first preserved cycles
		if block.height() == 1 {
			return self.bootstrap_income(tx, block, builder).await;
		}

		// expected income and deposits settle once ramp-up constants are
		// known at cycle start
		if block.params.is_cycle_start(block.height()) {
			self.update_cycle_income(tx, block, 1).await?;
		}

		self.update_block_income(tx, block, builder, 1).await?;
		self.update_nonce_revelations(tx, block, 1).await?;

		// skip when no new rights are defined
		if !block.raw.has_rights() {
			return Ok(());
		}
		self.create_cycle_income(tx, block, builder).await
	}

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		if block.height() == 0 {
			return Ok(());
		}
		if block.height() == 1 {
			for cycle in 0..=block.params.preserved_cycles {
				tx.delete_incomes_by_cycle(cycle).await?;
			}
			return Ok(());
		}

		// rows created for the cycle this block announced
		if block.raw.has_rights() {
			if let Some(sn) = block.raw.snapshot {
				log::debug!("Rollback deleting income for cycle {}", sn.cycle);
				tx.delete_incomes_by_cycle(sn.cycle).await?;
			}
		}

		self.update_nonce_revelations(tx, block, -1).await?;
		self.update_block_income(tx, block, builder, -1).await?;

		if block.params.is_cycle_start(block.height()) {
			self.update_cycle_income(tx, block, -1).await?;
		}
		Ok(())
	}

	async fn delete_block(&self, _tx: &mut dyn StoreTx, _height: i64) -> Result<()> {
		Ok(())
	}
}

impl IncomeIndex {
	async fn bootstrap_income(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		let p = &block.params;
		let delegates = builder.delegates(tx).await?;

		for cycle in 0..=p.preserved_cycles {
			let mut total_rolls = 0i64;
			let mut income_map: BTreeMap<AccountId, Income> = BTreeMap::new();
			for d in &delegates {
				let rolls = d.rolls(p);
				total_rolls += rolls;
				income_map.insert(d.row_id, new_income(cycle, d, rolls));
			}
			log::debug!("New bootstrap income for cycle {} from no snapshot with {} delegates", cycle, income_map.len());

			// deposits ramp up while the chain is young, rewards start later
			let (mut block_deposit, mut endorse_deposit) =
				(p.block_security_deposit, p.endorsement_security_deposit);
			if cycle < p.security_deposit_ramp_up_cycles - 1 {
				block_deposit = block_deposit * cycle / p.security_deposit_ramp_up_cycles;
				endorse_deposit = endorse_deposit * cycle / p.security_deposit_ramp_up_cycles;
			}
			let (block_reward, endorse_reward) =
				if cycle < p.no_reward_cycles { (0, 0) } else { (p.block_reward, p.endorsement_reward) };

			for r in &block.raw.baking_rights {
				if p.cycle_from_height(r.level) != cycle || r.priority > 0 {
					continue;
				}
				let id = account_id_of(tx, builder, &r.delegate, "bootstrap baker").await?;
				let ic = income_map.get_mut(&id).ok_or_else(|| {
					ArchiveError::integrity(format!("income: missing bootstrap income data for baker {}", r.delegate))
				})?;
				ic.n_baking_rights += 1;
				ic.expected_income += block_reward;
				ic.expected_bonds += block_deposit;
			}

			// endorsement income for a cycle is left-shifted by one: the last
			// block of a cycle is endorsed in the next cycle
			let endorse_start = p.cycle_end_height(cycle - 1);
			let endorse_end = p.cycle_end_height(cycle) - 1;
			for r in &block.raw.endorsing_rights {
				if r.level < endorse_start || r.level > endorse_end {
					continue;
				}
				let id = account_id_of(tx, builder, &r.delegate, "bootstrap endorser").await?;
				let ic = income_map.get_mut(&id).ok_or_else(|| {
					ArchiveError::integrity(format!(
						"income: missing bootstrap income data for endorser {}",
						r.delegate
					))
				})?;
				let n = r.slots.len() as i64;
				ic.n_endorsing_rights += n;
				ic.expected_income += endorse_reward * n;
				ic.expected_bonds += endorse_deposit * n;
			}

			let mut rows: Vec<Income> = income_map.into_iter().map(|(_, v)| v).collect();
			for v in rows.iter_mut() {
				v.update_luck(total_rolls, p);
			}
			tx.create_incomes(&mut rows).await?;
		}
		Ok(())
	}

	/// Re-apply expected rewards and deposits for cycles whose constants
	/// only settled now: every cycle start during ramp-up, and all preserved
	/// cycles at the v6 activation height. `mul` reverses the application on
	/// rollback.
	async fn update_cycle_income(&self, tx: &mut dyn StoreTx, block: &BlockData, mul: i64) -> Result<()> {
		let p = &block.params;
		let update_cycles: Vec<i64> = if block.cycle() <= 2 * (p.preserved_cycles + 2) {
			log::debug!("Updating expected income for cycle {} during ramp-up.", block.cycle());
			vec![block.cycle()]
		} else if block.height() == p.start_height && p.version == 6 {
			log::debug!("Updating expected income after v006 activation.");
			(0..p.preserved_cycles).map(|i| block.cycle() + i).collect()
		} else {
			return Ok(());
		};

		for cycle in update_cycles {
			let mut rows = tx.incomes_by_cycle(cycle).await?;
			let mut total_rolls = 0i64;
			for income in rows.iter_mut() {
				income.expected_income += p.block_reward * income.n_baking_rights * mul;
				income.expected_bonds += p.block_security_deposit * income.n_baking_rights * mul;
				income.expected_income += p.endorsement_reward * income.n_endorsing_rights * mul;
				income.expected_bonds += p.endorsement_security_deposit * income.n_endorsing_rights * mul;
				total_rolls += income.rolls;
			}
			for income in rows.iter_mut() {
				income.update_luck(total_rolls, p);
				income.update_performance();
				tx.update_income(income).await?;
			}
		}
		Ok(())
	}

	/// Build the income rows of the future cycle a block's rights delivery
	/// names, from the referenced roll snapshot or, before the first
	/// snapshots exist, from the live delegate set.
	async fn create_cycle_income(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		let p = &block.params;
		let sn = block
			.raw
			.snapshot
			.ok_or_else(|| ArchiveError::integrity("income: rights delivered without snapshot descriptor"))?;
		let mut income_map: BTreeMap<AccountId, Income> = BTreeMap::new();
		let mut total_rolls = 0i64;

		if sn.cycle < p.preserved_cycles + 2 {
			// no snapshot yet, use the live delegate set
			for d in builder.delegates(tx).await? {
				let rolls = d.rolls(p);
				total_rolls += rolls;
				income_map.insert(d.row_id, new_income(sn.cycle, &d, rolls));
			}
			log::debug!("New bootstrap income for cycle {} from no snapshot with {} delegates", sn.cycle, income_map.len());
		} else {
			let source_cycle = sn.cycle - (p.preserved_cycles + 2);
			for s in tx.snapshots_by_cycle_index(source_cycle, sn.index).await? {
				income_map.insert(s.account_id, Income {
					cycle: sn.cycle,
					account_id: s.account_id,
					rolls: s.rolls,
					balance: s.balance,
					delegated: s.delegated,
					n_delegations: s.n_delegations,
					luck_pct: 10000,
					..Default::default()
				});
				total_rolls += s.rolls;
			}
			log::debug!(
				"New income for cycle {} from snapshot [{}/{}] with {} delegates",
				sn.cycle,
				source_cycle,
				sn.index,
				income_map.len()
			);
		}

		let (mut block_deposit, mut endorse_deposit) = (p.block_security_deposit, p.endorsement_security_deposit);
		if sn.cycle < p.security_deposit_ramp_up_cycles - 1 {
			block_deposit = block_deposit * sn.cycle / p.security_deposit_ramp_up_cycles;
			endorse_deposit = endorse_deposit * sn.cycle / p.security_deposit_ramp_up_cycles;
		}
		let (block_reward, endorse_reward) = (p.block_reward, p.endorsement_reward);

		// assign from rights
		for r in &block.raw.baking_rights {
			if r.priority > 0 {
				continue;
			}
			let id = account_id_of(tx, builder, &r.delegate, "baker").await?;
			let ic = income_map.get_mut(&id).ok_or_else(|| {
				ArchiveError::integrity(format!(
					"income: missing snapshot data for baker {} at snapshot {}[{}]",
					r.delegate, sn.cycle, sn.index
				))
			})?;
			ic.n_baking_rights += 1;
			ic.expected_income += block_reward;
			ic.expected_bonds += block_deposit;
		}

		// endorsement income is left-shifted by one block (see bootstrap)
		let endorse_start = p.cycle_end_height(sn.cycle - 1);
		let endorse_end = p.cycle_end_height(sn.cycle) - 1;
		for r in &block.raw.endorsing_rights {
			if r.level > endorse_end {
				continue;
			}
			let id = account_id_of(tx, builder, &r.delegate, "endorser").await?;
			let ic = income_map.get_mut(&id).ok_or_else(|| {
				ArchiveError::integrity(format!(
					"income: missing income data for endorser {} at {}[{}]",
					r.delegate, sn.cycle, sn.index
				))
			})?;
			let n = r.slots.len() as i64;
			ic.n_endorsing_rights += n;
			ic.expected_income += endorse_reward * n;
			ic.expected_bonds += endorse_deposit * n;
		}

		// delegates from the previous cycle may still earn trailing rewards
		// for endorsing its last block even without rights in this cycle
		for right in tx.rights_by_height(endorse_start, RightKind::Endorsing).await? {
			if !income_map.contains_key(&right.account_id) {
				let prev =
					tx.income_by_cycle_account(right.cycle, right.account_id).await?.ok_or_else(|| {
						ArchiveError::integrity(format!(
							"income: missing income data for prev cycle endorser {} at {}[{}]",
							right.account_id, sn.cycle, sn.index
						))
					})?;
				income_map.insert(right.account_id, Income {
					cycle: sn.cycle,
					account_id: right.account_id,
					rolls: prev.rolls,
					balance: prev.balance,
					delegated: prev.delegated,
					n_delegations: prev.n_delegations,
					luck_pct: 10000,
					..Default::default()
				});
			}
			let ic = income_map.get_mut(&right.account_id).ok_or(ArchiveError::NoEntry("income"))?;
			ic.n_endorsing_rights += 1;
			ic.expected_income += endorse_reward;
			ic.expected_bonds += endorse_deposit;
		}

		let mut rows: Vec<Income> = income_map.into_iter().map(|(_, v)| v).collect();
		for v in rows.iter_mut() {
			v.update_luck(total_rolls, p);
		}
		tx.create_incomes(&mut rows).await
	}

	/// Fold one block's frozen flows, bake/endorse counters and
	/// denunciations into the income rows of its cycle. `mul` is 1 on
	/// connect and -1 on disconnect.
	async fn update_block_income(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
		mul: i64,
	) -> Result<()> {
		let p = block.params.clone();
		let cycle = block.cycle();
		let mut income_map: BTreeMap<AccountId, Income> = BTreeMap::new();
		let block_reward = block.block_reward();

		// flows from baking, endorsing, seed nonces and denunciations
		for f in &block.flows {
			// all income is frozen, ignore any other flow right away
			if !f.is_frozen {
				continue;
			}
			load_income(&mut income_map, tx, cycle, f.account_id, "baker").await?;
			let income = entry(&mut income_map, f.account_id)?;

			match f.kind {
				FlowKind::Baking => match f.category {
					FlowCategory::Deposits => income.total_bonds += f.amount_in * mul,
					FlowCategory::Rewards => {
						income.total_income += f.amount_in * mul;
						income.baking_income += f.amount_in * mul;
						if block.block.priority > 0 {
							// the real baker stole this income
							income.stolen_baking_income += f.amount_in * mul;

							// the original priority-0 baker lost it
							let losers: Vec<AccountId> = block
								.rights(RightKind::Baking)
								.filter(|r| r.priority == 0)
								.map(|r| r.account_id)
								.collect();
							for id in losers {
								load_income(&mut income_map, tx, cycle, id, "losing baker").await?;
								entry(&mut income_map, id)?.missed_baking_income += block_reward * mul;
							}
						}
					}
					_ => {}
				},
				FlowKind::Endorsement => match f.category {
					FlowCategory::Deposits => income.total_bonds += f.amount_in * mul,
					FlowCategory::Rewards => {
						income.total_income += f.amount_in * mul;
						income.endorsing_income += f.amount_in * mul;
					}
					_ => {}
				},
				FlowKind::NonceRevelation => {
					// burns are handled against the previous cycle
					if !f.is_burned && f.category == FlowCategory::Rewards {
						income.total_income += f.amount_in * mul;
						income.seed_income += f.amount_in * mul;
					}
				}
				FlowKind::Denunciation => {
					// one flow kind for both evidence types; the accuser is
					// credited from the op below, the offender debited here
					match f.category {
						FlowCategory::Deposits => income.lost_accusation_deposits += f.amount_out * mul,
						FlowCategory::Rewards => income.lost_accusation_rewards += f.amount_out * mul,
						FlowCategory::Fees => income.lost_accusation_fees += f.amount_out * mul,
						FlowCategory::Balance => {}
					}
					income.total_lost += f.amount_out * mul;
				}
				_ => {
					// fee flows from all kinds of operations
					if f.category == FlowCategory::Fees {
						income.fees_income += f.amount_in * mul;
					}
				}
			}
		}

		// bake counters, separate from flows
		if !block.block.baker_id.is_zero() {
			let baker_id = block.block.baker_id;
			load_income(&mut income_map, tx, cycle, baker_id, "baker").await?;
			entry(&mut income_map, baker_id)?.n_blocks_baked += mul;
			if block.block.priority > 0 {
				entry(&mut income_map, baker_id)?.n_blocks_stolen += mul;
				let losers: Vec<AccountId> =
					block.rights(RightKind::Baking).filter(|r| r.priority == 0).map(|r| r.account_id).collect();
				for id in losers {
					load_income(&mut income_map, tx, cycle, id, "losing baker").await?;
					entry(&mut income_map, id)?.n_blocks_lost += mul;
				}
			}
		}

		// counters and accuser credits from operations
		for op in &block.ops {
			match op.kind {
				OpKind::SeedNonceRevelation => {
					load_income(&mut income_map, tx, cycle, op.sender_id, "seeder").await?;
					entry(&mut income_map, op.sender_id)?.n_seeds_revealed += mul;
				}
				OpKind::Endorsement => {
					load_income(&mut income_map, tx, cycle, op.sender_id, "endorser").await?;
					let slots: u32 = op.data.parse().unwrap_or(0);
					entry(&mut income_map, op.sender_id)?.n_slots_endorsed += mul * i64::from(slots.count_ones());
				}
				OpKind::DoubleBakingEvidence => {
					load_income(&mut income_map, tx, cycle, op.sender_id, "2bake accuser").await?;
					entry(&mut income_map, op.sender_id)?.double_baking_income += op.reward * mul;
				}
				OpKind::DoubleEndorsementEvidence => {
					load_income(&mut income_map, tx, cycle, op.sender_id, "2endorse accuser").await?;
					entry(&mut income_map, op.sender_id)?.double_endorsing_income += op.reward * mul;
				}
				_ => {}
			}
		}

		// missed endorsements, valued at the current endorsement reward
		let endorse_reward = if cycle < p.no_reward_cycles { 0 } else { p.endorsement_reward };
		let parent_unfilled = match &block.parent {
			Some(parent) => !builder.all_slots_endorsed(parent.slots_endorsed),
			None => false,
		};
		if parent_unfilled {
			let missed: Vec<AccountId> =
				block.rights(RightKind::Endorsing).filter(|r| r.is_missed).map(|r| r.account_id).collect();
			for id in missed {
				load_income(&mut income_map, tx, cycle, id, "missed endorser").await?;
				let income = entry(&mut income_map, id)?;
				income.missed_endorsing_income += endorse_reward * mul;
				income.n_slots_missed += mul;
			}
		}

		if income_map.is_empty() {
			return Ok(());
		}
		for income in income_map.values_mut() {
			income.update_performance();
			tx.update_income(income).await?;
		}
		Ok(())
	}

	/// Burned seed nonce rewards always debit the previous cycle.
	async fn update_nonce_revelations(&self, tx: &mut dyn StoreTx, block: &BlockData, mul: i64) -> Result<()> {
		let cycle = block.cycle() - 1;
		if cycle < 0 {
			return Ok(());
		}
		let mut income_map: BTreeMap<AccountId, Income> = BTreeMap::new();

		for f in &block.flows {
			if f.kind != FlowKind::NonceRevelation || !f.is_burned {
				continue;
			}
			load_income(&mut income_map, tx, cycle, f.account_id, "seed nonce baker").await?;
			let income = entry(&mut income_map, f.account_id)?;
			income.total_lost += f.amount_out * mul;
			match f.category {
				FlowCategory::Rewards => income.lost_revelation_rewards += f.amount_out * mul,
				FlowCategory::Fees => income.lost_revelation_fees += block.block.fee * mul,
				_ => {}
			}
		}

		if income_map.is_empty() {
			return Ok(());
		}
		for income in income_map.values_mut() {
			income.update_performance();
			tx.update_income(income).await?;
		}
		Ok(())
	}
}

fn new_income(cycle: i64, d: &Account, rolls: i64) -> Income {
	Income {
		cycle,
		account_id: d.row_id,
		rolls,
		balance: d.balance(),
		delegated: d.delegated_balance,
		n_delegations: d.active_delegations,
		luck_pct: 10000,
		..Default::default()
	}
}

async fn account_id_of(
	tx: &mut dyn StoreTx,
	builder: &BlockBuilder,
	address: &str,
	what: &str,
) -> Result<AccountId> {
	if let Some(acc) = builder.account_by_address(address) {
		return Ok(acc.row_id);
	}
	tx.account_by_address(address)
		.await?
		.map(|a| a.row_id)
		.ok_or_else(|| ArchiveError::integrity(format!("income: missing {} {}", what, address)))
}

async fn load_income(
	map: &mut BTreeMap<AccountId, Income>,
	tx: &mut dyn StoreTx,
	cycle: i64,
	id: AccountId,
	what: &str,
) -> Result<()> {
	if map.contains_key(&id) {
		return Ok(());
	}
	match tx.income_by_cycle_account(cycle, id).await? {
		Some(income) => {
			map.insert(id, income);
			Ok(())
		}
		None => Err(ArchiveError::integrity(format!("income: unknown {} {}", what, id))),
	}
}

fn entry(map: &mut BTreeMap<AccountId, Income>, id: AccountId) -> Result<&mut Income> {
	map.get_mut(&id).ok_or(ArchiveError::NoEntry("income"))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use chrono::{DateTime, TimeZone, Utc};

	use super::*;
	use crate::{
		params::Params,
		store::{mem::MemStore, Store as _, StoreTx},
		types::{Block, Chain, Flow, Right, Supply},
	};

	fn ts(height: i64) -> DateTime<Utc> {
		Utc.timestamp(1_600_000_000 + height * 60, 0)
	}

	fn make_block(p: &Arc<Params>, height: i64, baker: AccountId, priority: i64) -> BlockData {
		let mut block = Block::new(height, ts(height));
		block.cycle = p.cycle_from_height(height);
		block.priority = priority;
		block.baker_id = baker;
		let raw = crate::rpc::RawBlock {
			hash: format!("B{}", height),
			predecessor: format!("B{}", height - 1),
			height,
			time: ts(height),
			cycle: block.cycle,
			voting_period: p.voting_period_from_height(height),
			voting_period_kind: crate::types::VotingPeriodKind::Proposal,
			priority,
			baker: "tz1baker".into(),
			operations: Vec::new(),
			baking_rights: Vec::new(),
			endorsing_rights: Vec::new(),
			snapshot: None,
		};
		BlockData {
			block,
			params: p.clone(),
			raw,
			parent: None,
			chain: Chain::default(),
			supply: Supply::default(),
			flows: Vec::new(),
			ops: Vec::new(),
			snapshots: Vec::new(),
			contracts: Vec::new(),
			bigmap_items: Vec::new(),
			rights: Vec::new(),
			undo: Default::default(),
		}
	}

	async fn seed_income(tx: &mut dyn StoreTx, cycle: i64, account: AccountId, expected: i64) -> Income {
		let mut rows =
			vec![Income { cycle, account_id: account, expected_income: expected, ..Default::default() }];
		tx.create_incomes(&mut rows).await.unwrap();
		rows.remove(0)
	}

	#[test]
	fn stolen_block_accounting() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let idx = IncomeIndex;
			let builder = BlockBuilder::new(p.clone());
			let loser = AccountId(1);
			let baker = AccountId(2);

			let mut tx = store.begin().await.unwrap();
			let initial_loser = seed_income(tx.as_mut(), 2, loser, 0).await;
			let initial_baker = seed_income(tx.as_mut(), 2, baker, 100).await;

			// block at height 20 (cycle 2) baked at priority 2
			let mut block = make_block(&p, 20, baker, 2);
			let reward = p.block_reward;
			block.flows.push(
				Flow::new(20, 2, baker, FlowKind::Baking, FlowCategory::Deposits).in_amount(256).frozen(),
			);
			block.flows.push(
				Flow::new(20, 2, baker, FlowKind::Baking, FlowCategory::Rewards).in_amount(reward).frozen(),
			);
			block.rights.push(Right::new(RightKind::Baking, 20, 2, 0, loser));
			block.rights.push(Right::new(RightKind::Baking, 20, 2, 2, baker));

			idx.update_block_income(tx.as_mut(), &block, &builder, 1).await.unwrap();

			let b = tx.income_by_cycle_account(2, baker).await.unwrap().unwrap();
			assert_eq!(b.total_bonds, 256);
			assert_eq!(b.total_income, reward);
			assert_eq!(b.baking_income, reward);
			assert_eq!(b.stolen_baking_income, reward);
			assert_eq!(b.n_blocks_baked, 1);
			assert_eq!(b.n_blocks_stolen, 1);
			assert_eq!(b.performance_pct, 10000 + (reward - 100) * 10000 / 100);

			let a = tx.income_by_cycle_account(2, loser).await.unwrap().unwrap();
			assert_eq!(a.missed_baking_income, block.block_reward());
			assert_eq!(a.n_blocks_lost, 1);
			assert_eq!(a.n_blocks_baked, 0);

			// the disconnect transformation restores both rows exactly
			idx.update_block_income(tx.as_mut(), &block, &builder, -1).await.unwrap();
			assert_eq!(tx.income_by_cycle_account(2, loser).await.unwrap().unwrap(), initial_loser);
			assert_eq!(tx.income_by_cycle_account(2, baker).await.unwrap().unwrap(), initial_baker);
		});
	}

	#[test]
	fn nonce_burn_debits_previous_cycle() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let idx = IncomeIndex;
			let sleeper = AccountId(7);

			let mut tx = store.begin().await.unwrap();
			let initial = seed_income(tx.as_mut(), 0, sleeper, 0).await;

			// burn surfaces in the first block of cycle 1
			let mut block = make_block(&p, 9, AccountId(1), 0);
			block.flows.push(
				Flow::new(9, 1, sleeper, FlowKind::NonceRevelation, FlowCategory::Rewards)
					.out_amount(p.block_reward)
					.frozen()
					.burned(),
			);

			idx.update_nonce_revelations(tx.as_mut(), &block, 1).await.unwrap();
			let row = tx.income_by_cycle_account(0, sleeper).await.unwrap().unwrap();
			assert_eq!(row.total_lost, p.block_reward);
			assert_eq!(row.lost_revelation_rewards, p.block_reward);

			idx.update_nonce_revelations(tx.as_mut(), &block, -1).await.unwrap();
			assert_eq!(tx.income_by_cycle_account(0, sleeper).await.unwrap().unwrap(), initial);
		});
	}

	#[test]
	fn burned_seed_income_is_not_counted_twice() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let idx = IncomeIndex;
			let builder = BlockBuilder::new(p.clone());
			let baker = AccountId(3);

			let mut tx = store.begin().await.unwrap();
			seed_income(tx.as_mut(), 1, baker, 0).await;
			seed_income(tx.as_mut(), 0, baker, 0).await;

			let mut block = make_block(&p, 9, baker, 0);
			// a burned revelation flow must not credit seed income
			block.flows.push(
				Flow::new(9, 1, baker, FlowKind::NonceRevelation, FlowCategory::Rewards)
					.out_amount(4)
					.frozen()
					.burned(),
			);
			idx.update_block_income(tx.as_mut(), &block, &builder, 1).await.unwrap();
			let row = tx.income_by_cycle_account(1, baker).await.unwrap().unwrap();
			assert_eq!(row.seed_income, 0);
			assert_eq!(row.total_income, 0);
		});
	}
}
