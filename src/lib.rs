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

#![forbid(unsafe_code)]
#![deny(dead_code)]

pub mod builder;
pub mod config;
pub mod crawler;
mod error;
pub mod indexer;
pub mod indexes;
pub mod logger;
pub mod params;
pub mod rpc;
pub mod store;
pub mod types;

pub use self::builder::BlockBuilder;
pub use self::config::ArchiveConfig;
pub use self::crawler::{ChainTip, Crawler, System};
pub use self::error::{ArchiveError, Result};
pub use self::indexer::{BlockIndexer, Indexer};
pub use self::params::Params;
pub use self::store::{mem::MemStore, Store, StoreTx};

#[cfg(test)]
pub use test_util::initialize;

#[cfg(test)]
mod test_util {
	use std::sync::Once;

	static INIT: Once = Once::new();

	/// Guard that should be called at the beginning of every test.
	pub fn initialize() {
		INIT.call_once(|| {
			pretty_env_logger::init();
		});
	}
}
