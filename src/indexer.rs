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

//! Transactional fan-out: one store transaction per block, every sub-index
//! invoked in list order on connect and in reverse order on disconnect. The
//! list order is configuration and follows the table dependencies: account
//! and block primitives first, then rights and snapshots, income,
//! governance, supply last.

use crate::{
	builder::BlockBuilder,
	error::Result,
	indexes,
	rpc::RawBlock,
	store::{Store, StoreTx},
	types::BlockData,
};

/// Capability set of one sub-index. The driver only ever calls these three
/// operations; everything else is internal to the index.
#[async_trait::async_trait]
pub trait BlockIndexer: Send + Sync {
	fn name(&self) -> &'static str;

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		builder: &BlockBuilder,
	) -> Result<()>;

	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()>;

	/// Height-scoped hard delete for deep rollbacks where the in-flight
	/// block value is gone.
	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()>;
}

pub struct Indexer {
	indexes: Vec<Box<dyn BlockIndexer>>,
}

impl Indexer {
	pub fn new(indexes: Vec<Box<dyn BlockIndexer>>) -> Self {
		Indexer { indexes }
	}

	/// The full sub-index list in dependency order, or the reduced list when
	/// only the block table family is wanted.
	pub fn with_defaults(only_block: bool) -> Self {
		if only_block {
			return Indexer::new(vec![
				Box::new(indexes::AccountIndex),
				Box::new(indexes::BlockIndex),
				Box::new(indexes::OpIndex),
			]);
		}
		Indexer::new(vec![
			Box::new(indexes::AccountIndex),
			Box::new(indexes::BlockIndex),
			Box::new(indexes::ChainIndex),
			Box::new(indexes::FlowIndex),
			Box::new(indexes::OpIndex),
			Box::new(indexes::ContractIndex),
			Box::new(indexes::BigmapIndex),
			Box::new(indexes::RightsIndex),
			Box::new(indexes::SnapshotIndex),
			Box::new(indexes::IncomeIndex),
			Box::new(indexes::GovIndex),
			Box::new(indexes::SupplyIndex),
		])
	}

	/// Build and connect one raw block inside a single transaction. Returns
	/// the in-flight value so the crawler can keep it for later disconnects.
	pub async fn connect_block(
		&self,
		store: &dyn Store,
		builder: &mut BlockBuilder,
		raw: RawBlock,
	) -> Result<BlockData> {
		let mut tx = store.begin().await?;
		let res = self.run_connect(tx.as_mut(), builder, raw).await;
		match res {
			Ok(data) => {
				tx.commit().await?;
				Ok(data)
			}
			Err(e) => {
				let _ = tx.rollback().await;
				Err(e)
			}
		}
	}

	async fn run_connect(
		&self,
		tx: &mut dyn StoreTx,
		builder: &mut BlockBuilder,
		raw: RawBlock,
	) -> Result<BlockData> {
		let mut data = builder.build(tx, raw).await?;
		for idx in &self.indexes {
			if let Err(e) = idx.connect_block(tx, &mut data, builder).await {
				log::error!("connect {} at block {}: {}", idx.name(), data.height(), e);
				return Err(e);
			}
		}
		Ok(data)
	}

	/// Undo one previously connected block, sub-indexes in reverse order.
	pub async fn disconnect_block(
		&self,
		store: &dyn Store,
		builder: &mut BlockBuilder,
		data: &BlockData,
	) -> Result<()> {
		let mut tx = store.begin().await?;
		let res = self.run_disconnect(tx.as_mut(), builder, data).await;
		match res {
			Ok(()) => tx.commit().await,
			Err(e) => {
				let _ = tx.rollback().await;
				Err(e)
			}
		}
	}

	async fn run_disconnect(
		&self,
		tx: &mut dyn StoreTx,
		builder: &mut BlockBuilder,
		data: &BlockData,
	) -> Result<()> {
		builder.rollback(tx, data).await?;
		for idx in self.indexes.iter().rev() {
			if let Err(e) = idx.disconnect_block(tx, data, builder).await {
				log::error!("disconnect {} at block {}: {}", idx.name(), data.height(), e);
				return Err(e);
			}
		}
		Ok(())
	}

	/// Hard-delete all rows of `height` across every sub-index, used during
	/// deep rollbacks when the block value is no longer around.
	pub async fn delete_block(&self, store: &dyn Store, height: i64) -> Result<()> {
		let mut tx = store.begin().await?;
		for idx in self.indexes.iter().rev() {
			if let Err(e) = idx.delete_block(tx.as_mut(), height).await {
				log::error!("delete {} at block {}: {}", idx.name(), height, e);
				let _ = tx.rollback().await;
				return Err(e);
			}
		}
		tx.commit().await
	}
}
