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

//! Follows the node's head: prefetches raw blocks into a bounded pipeline,
//! connects them serially, and walks back to the fork point when the node
//! disagrees about a parent hash. The writer is strictly single-threaded;
//! only fetching overlaps with indexing.

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use futures::{
	future::BoxFuture,
	stream::{FuturesOrdered, StreamExt},
	FutureExt,
};

use crate::{
	builder::BlockBuilder,
	config::ArchiveConfig,
	error::{ArchiveError, Result},
	indexer::Indexer,
	params::Params,
	rpc::{RawBlock, RpcSource},
	store::Store,
	types::BlockData,
};

/// Connected blocks kept in memory for exact disconnects; deeper reorgs
/// fall back to height-scoped hard deletes.
const REORG_HISTORY: usize = 64;

/// Idle delay while waiting for the node head to advance.
const HEAD_POLL_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub struct ChainTip {
	pub height: i64,
	pub hash: String,
}

pub struct Crawler {
	store: Arc<dyn Store>,
	rpc: Arc<dyn RpcSource>,
	indexer: Indexer,
	builder: BlockBuilder,
	config: ArchiveConfig,
	tip: Option<ChainTip>,
	recent: VecDeque<BlockData>,
}

type FetchFuture = Pin<Box<dyn Future<Output = (i64, Result<RawBlock>)> + Send>>;

impl Crawler {
	pub fn new(
		store: Arc<dyn Store>,
		rpc: Arc<dyn RpcSource>,
		indexer: Indexer,
		params: Arc<Params>,
		config: ArchiveConfig,
	) -> Self {
		Crawler {
			store,
			rpc,
			indexer,
			builder: BlockBuilder::new(params),
			config,
			tip: None,
			recent: VecDeque::new(),
		}
	}

	pub fn tip(&self) -> Option<&ChainTip> {
		self.tip.as_ref()
	}

	/// Drive indexing until the end height is reached or `kill` fires.
	pub async fn run(&mut self, mut kill: flume::Receiver<()>) -> Result<()> {
		self.resume().await?;

		if self.config.fix {
			return self.run_fix().await;
		}

		let mut next = self.tip.as_ref().map(|t| t.height + 1).unwrap_or(self.config.start_height);
		let mut inflight: FuturesOrdered<FetchFuture> = FuturesOrdered::new();
		let mut queued = next;

		loop {
			if let Some(end) = self.config.end_height {
				if next > end {
					log::info!("Reached end height {}, stopping", end);
					return Ok(());
				}
			}

			// top up the prefetch pipeline
			let head = self.retry(|rpc| rpc.head()).await?;
			while ((queued - next) as usize) < self.config.queue_depth && queued <= head.height {
				if let Some(end) = self.config.end_height {
					if queued > end {
						break;
					}
				}
				let rpc = self.rpc.clone();
				let height = queued;
				inflight.push(async move { (height, rpc.block(height).await) }.boxed());
				queued += 1;
			}

			if inflight.is_empty() {
				// caught up with the node, wait for a new head
				futures::select! {
					_ = kill.recv_async() => return Ok(()),
					_ = smol::Timer::new(HEAD_POLL_DELAY).fuse() => continue,
				}
			}

			let (height, fetched) = futures::select! {
				_ = kill.recv_async() => return Ok(()),
				item = inflight.next() => match item {
					Some(item) => item,
					None => continue,
				},
			};
			let raw = match fetched {
				Ok(raw) => raw,
				Err(e) if e.is_transient() => {
					// refetch through the retry budget, then give up
					log::warn!("Fetching block {}: {}", height, e);
					self.retry(|rpc| rpc.block(height)).await?
				}
				Err(e) => return Err(e),
			};

			match self.connect(raw).await {
				Ok(()) => {
					next = height + 1;
				}
				Err(ArchiveError::ReorgDetected { height }) => {
					log::warn!("Reorg detected at height {}, walking back to fork point", height);
					self.rollback_to_fork().await?;
					next = self.tip.as_ref().map(|t| t.height + 1).unwrap_or(self.config.start_height);
					inflight = FuturesOrdered::new();
					queued = next;
				}
				Err(e) => return Err(e),
			}
		}
	}

	/// Load the resume point from previously committed state.
	async fn resume(&mut self) -> Result<()> {
		let mut tx = self.store.begin().await?;
		let latest = tx.latest_block().await?;
		tx.rollback().await?;
		self.tip = latest.map(|b| ChainTip { height: b.height, hash: b.hash });
		if let Some(tip) = &self.tip {
			log::info!("Resuming above committed block {}", tip.height);
		}
		Ok(())
	}

	/// Re-index a fixed height range by delete-then-connect.
	async fn run_fix(&mut self) -> Result<()> {
		let start = self.config.start_height;
		let end = self
			.config
			.end_height
			.ok_or_else(|| ArchiveError::Configuration("fix mode requires end_height".into()))?;
		log::info!("Fixing blocks {}..{}", start, end);
		for height in start..=end {
			self.indexer.delete_block(self.store.as_ref(), height).await?;
			let raw = self.retry(|rpc| rpc.block(height)).await?;
			self.tip = None;
			self.connect(raw).await?;
		}
		Ok(())
	}

	async fn connect(&mut self, raw: RawBlock) -> Result<()> {
		if let Some(tip) = &self.tip {
			if raw.height == tip.height + 1 && raw.predecessor != tip.hash {
				return Err(ArchiveError::ReorgDetected { height: raw.height });
			}
		}
		let tip = ChainTip { height: raw.height, hash: raw.hash.clone() };
		let data = self.indexer.connect_block(self.store.as_ref(), &mut self.builder, raw).await?;
		log::debug!("Connected block {} [cycle {}]", data.height(), data.cycle());
		self.tip = Some(tip);
		self.recent.push_back(data);
		while self.recent.len() > REORG_HISTORY {
			self.recent.pop_front();
		}
		Ok(())
	}

	/// Disconnect committed blocks until the local chain matches the node
	/// again. Blocks older than the in-memory history are hard-deleted.
	async fn rollback_to_fork(&mut self) -> Result<()> {
		loop {
			let tip = match self.tip.clone() {
				Some(tip) => tip,
				None => return Ok(()),
			};
			let height = tip.height;
			let node_hash = self.retry(move |rpc| rpc.block_hash(height)).await?;
			if node_hash == tip.hash {
				log::info!("Fork point found at height {}", tip.height);
				return Ok(());
			}

			match self.recent.back() {
				Some(data) if data.height() == tip.height => {
					let data = self.recent.pop_back().ok_or(ArchiveError::NoEntry("block history"))?;
					self.indexer.disconnect_block(self.store.as_ref(), &mut self.builder, &data).await?;
				}
				_ => {
					// beyond the in-memory history, fall back to hard deletes
					self.indexer.delete_block(self.store.as_ref(), tip.height).await?;
				}
			}
			log::debug!("Disconnected block {}", tip.height);

			let mut tx = self.store.begin().await?;
			let prev = tx.block_by_height(tip.height - 1).await?;
			tx.rollback().await?;
			self.tip = prev.map(|b| ChainTip { height: b.height, hash: b.hash });
		}
	}

	/// Bounded exponential backoff around a transient RPC call.
	async fn retry<'a, T, F>(&'a self, f: F) -> Result<T>
	where
		F: Fn(&'a dyn RpcSource) -> BoxFuture<'a, Result<T>>,
	{
		let rpc: &'a dyn RpcSource = self.rpc.as_ref();
		let mut delay = Duration::from_millis(250);
		let mut attempt = 0u32;
		loop {
			match f(rpc).await {
				Ok(v) => return Ok(v),
				Err(e) if e.is_transient() && attempt < self.config.rpc_retries => {
					attempt += 1;
					log::warn!("rpc attempt {}/{} failed: {}", attempt, self.config.rpc_retries, e);
					smol::Timer::new(delay).await;
					delay *= 2;
				}
				Err(e) => return Err(e),
			}
		}
	}
}

/// Runs a crawler on a dedicated thread. Will exit on `shutdown` or when
/// the configured end height is reached.
pub struct System {
	kill_tx: flume::Sender<()>,
	handle: jod_thread::JoinHandle<Result<()>>,
}

impl System {
	pub fn spawn(
		config: ArchiveConfig,
		params: Arc<Params>,
		store: Arc<dyn Store>,
		rpc: Arc<dyn RpcSource>,
	) -> Result<Self> {
		config.validate()?;
		let (kill_tx, kill_rx) = flume::bounded(1);
		let indexer = Indexer::with_defaults(config.only_block);
		let handle = jod_thread::spawn(move || {
			let mut crawler = Crawler::new(store, rpc, indexer, params, config);
			smol::block_on(crawler.run(kill_rx))
		});
		Ok(System { kill_tx, handle })
	}

	/// Block until the crawler finishes on its own.
	pub fn join(self) -> Result<()> {
		self.handle.join()
	}

	pub fn shutdown(self) -> Result<()> {
		let _ = self.kill_tx.send(());
		self.handle.join()
	}
}
