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
	error::Result,
	indexer::BlockIndexer,
	store::StoreTx,
	types::BlockData,
};

/// Persists big map bindings touched by a block.
pub struct BigmapIndex;

#[async_trait::async_trait]
impl BlockIndexer for BigmapIndex {
	fn name(&self) -> &'static str {
		"bigmap"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		tx.create_bigmap_items(&mut block.bigmap_items).await
	}

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		self.delete_block(tx, block.height()).await
	}

	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()> {
		log::debug!("Rollback deleting bigmap items at height {}", height);
		tx.delete_bigmap_items_by_height(height).await?;
		Ok(())
	}
}
