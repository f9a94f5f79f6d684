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

use itertools::Itertools;

use crate::{
	builder::BlockBuilder,
	error::Result,
	indexer::BlockIndexer,
	store::StoreTx,
	types::BlockData,
};

/// Persists the builder's account working set: batch updates for dirty
/// accounts on connect, deletes plus updates on disconnect.
pub struct AccountIndex;

#[async_trait::async_trait]
impl BlockIndexer for AccountIndex {
	fn name(&self) -> &'static str {
		"account"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		_block: &mut BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		for acc in builder.accounts().filter(|a| a.is_dirty) {
			let mut row = acc.clone();
			row.is_dirty = false;
			row.must_delete = false;
			tx.update_account(&row).await?;
		}
		Ok(())
	}

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		let del = builder
			.accounts()
			.filter(|a| a.must_delete)
			.map(|a| a.row_id)
			.sorted()
			.dedup()
			.collect::<Vec<_>>();
		if !del.is_empty() {
			log::debug!("Rollback removing {} accounts", del.len());
			tx.delete_accounts(&del).await?;
		}
		for acc in builder.accounts().filter(|a| a.is_dirty && !a.must_delete) {
			let mut row = acc.clone();
			row.is_dirty = false;
			tx.update_account(&row).await?;
		}
		// rows the rollback never touched still vanish with their block
		tx.delete_accounts_by_first_seen(block.height()).await?;
		Ok(())
	}

	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()> {
		log::debug!("Rollback deleting accounts at height {}", height);
		tx.delete_accounts_by_first_seen(height).await?;
		Ok(())
	}
}
