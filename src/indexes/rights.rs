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

use std::collections::BTreeSet;

use crate::{
	builder::BlockBuilder,
	error::{ArchiveError, Result},
	indexer::BlockIndexer,
	store::StoreTx,
	types::{AccountId, BlockData, OpKind, Right, RightKind},
};

/// Inserts the rights a block delivers for a future cycle (one row per
/// baking priority, one row per endorsement slot) and keeps the
/// stolen/lost/missed/seed flags of live rights current.
pub struct RightsIndex;

impl RightsIndex {
	async fn account_id_of(
		tx: &mut dyn StoreTx,
		builder: &BlockBuilder,
		address: &str,
	) -> Result<AccountId> {
		if let Some(acc) = builder.account_by_address(address) {
			return Ok(acc.row_id);
		}
		tx.account_by_address(address)
			.await?
			.map(|a| a.row_id)
			.ok_or_else(|| ArchiveError::integrity(format!("rights: missing delegate {}", address)))
	}

	/// Rows for every right the raw block delivers.
	async fn rows_from_raw(
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<Vec<Right>> {
		let p = &block.params;
		let mut rows = Vec::new();
		for r in &block.raw.baking_rights {
			let id = Self::account_id_of(tx, builder, &r.delegate).await?;
			let mut right = Right::new(RightKind::Baking, r.level, p.cycle_from_height(r.level), r.priority, id);
			right.is_seed_required = r.priority == 0 && p.is_seed_required(r.level);
			rows.push(right);
		}
		for r in &block.raw.endorsing_rights {
			let id = Self::account_id_of(tx, builder, &r.delegate).await?;
			for slot in &r.slots {
				rows.push(Right::new(RightKind::Endorsing, r.level, p.cycle_from_height(r.level), *slot, id));
			}
		}
		Ok(rows)
	}

	/// The baking right whose seed nonce a revelation op at this block
	/// refers to.
	async fn seed_right(tx: &mut dyn StoreTx, level: i64) -> Result<Option<Right>> {
		let baker = match tx.block_by_height(level).await? {
			Some(b) => b.baker_id,
			None => return Ok(None),
		};
		let rights = tx.rights_by_height(level, RightKind::Baking).await?;
		Ok(rights.into_iter().find(|r| r.account_id == baker && r.is_seed_required))
	}

	async fn mark_seed_revealed(
		tx: &mut dyn StoreTx,
		block: &BlockData,
		revealed: bool,
	) -> Result<()> {
		for op in block.ops.iter().filter(|o| o.kind == OpKind::SeedNonceRevelation) {
			let level: i64 = op
				.data
				.parse()
				.map_err(|_| ArchiveError::integrity(format!("bad seed revelation level {:?}", op.data)))?;
			if let Some(mut right) = Self::seed_right(tx, level).await? {
				right.is_seed_revealed = revealed;
				tx.update_right(&right).await?;
			}
		}
		Ok(())
	}

	fn delivered_cycles(block: &BlockData) -> BTreeSet<i64> {
		let p = &block.params;
		let baking = block.raw.baking_rights.iter().map(|r| r.level);
		let endorsing = block.raw.endorsing_rights.iter().map(|r| r.level);
		baking.chain(endorsing).map(|level| p.cycle_from_height(level)).collect()
	}
}

#[async_trait::async_trait]
impl BlockIndexer for RightsIndex {
	fn name(&self) -> &'static str {
		"rights"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		if block.raw.has_rights() {
			let mut rows = Self::rows_from_raw(tx, block, builder).await?;
			tx.create_rights(&mut rows).await?;
		}

		// stolen/lost on this height's baking rights, missed on the
		// parent's endorsement slots
		for right in block.rights.iter() {
			if right.row_id.is_zero() {
				continue;
			}
			if right.is_lost || right.is_stolen || right.is_missed {
				tx.update_right(right).await?;
			}
		}

		Self::mark_seed_revealed(tx, block, true).await
	}

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		Self::mark_seed_revealed(tx, block, false).await?;

		for right in block.rights.iter() {
			if right.row_id.is_zero() {
				continue;
			}
			if right.is_lost || right.is_stolen || right.is_missed {
				let mut cleared = right.clone();
				cleared.is_lost = false;
				cleared.is_stolen = false;
				cleared.is_missed = false;
				tx.update_right(&cleared).await?;
			}
		}

		if block.raw.has_rights() {
			for cycle in Self::delivered_cycles(block) {
				log::debug!("Rollback deleting rights of cycle {}", cycle);
				tx.delete_rights_by_cycle(cycle).await?;
			}
		}
		Ok(())
	}

	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()> {
		log::debug!("Rollback deleting rights at height {}", height);
		tx.delete_rights_by_height(height).await?;
		Ok(())
	}
}
