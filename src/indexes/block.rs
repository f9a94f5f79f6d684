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

use crate::{
	builder::BlockBuilder,
	error::{ArchiveError, Result},
	indexer::BlockIndexer,
	store::StoreTx,
	types::BlockData,
};

/// Writes the block row, pushes the endorsement bitmap into the parent row
/// and marks the roll-snapshot block a new cycle refers to.
pub struct BlockIndex;

impl BlockIndex {
	/// The block whose roll distribution seeds the announced cycle, if the
	/// announcement points far enough back to name one.
	fn snapshot_height(block: &BlockData) -> Option<(i64, crate::rpc::SnapshotInfo)> {
		let sn = block.raw.snapshot?;
		if sn.cycle < block.params.preserved_cycles + 2 {
			return None;
		}
		Some((block.params.snapshot_block(sn.cycle, sn.index), sn))
	}
}

#[async_trait::async_trait]
impl BlockIndexer for BlockIndex {
	fn name(&self) -> &'static str {
		"block"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		// write the endorsed-slot bitmap collected for the parent
		if let Some(parent) = &block.parent {
			if parent.height > 0 {
				tx.update_block(parent).await?;
			}
		}

		if let Some((height, sn)) = Self::snapshot_height(block) {
			log::debug!("Marking block {} index {} as roll snapshot for cycle {}", height, sn.index, sn.cycle);
			let mut snap_block = tx.block_by_height(height).await?.ok_or_else(|| {
				ArchiveError::integrity(format!("missing snapshot index block {} for cycle {}", height, sn.cycle))
			})?;
			snap_block.is_cycle_snapshot = true;
			tx.update_block(&snap_block).await?;
		}

		tx.create_block(&mut block.block).await
	}

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		// restore the parent bitmap this block filled
		if let Some(parent) = &block.parent {
			if parent.height > 0 {
				let mut prev = parent.clone();
				prev.slots_endorsed = block.undo.parent_slots_endorsed;
				tx.update_block(&prev).await?;
			}
		}

		if let Some((height, _)) = Self::snapshot_height(block) {
			if let Some(mut snap_block) = tx.block_by_height(height).await? {
				snap_block.is_cycle_snapshot = false;
				tx.update_block(&snap_block).await?;
			}
		}

		tx.delete_blocks_by_height(block.height()).await?;
		Ok(())
	}

	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()> {
		log::debug!("Rollback deleting block at height {}", height);
		tx.delete_blocks_by_height(height).await?;
		Ok(())
	}
}
