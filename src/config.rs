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

//! Runtime configuration. Loading (files, flags, environment) is a
//! collaborator's job; this is the recognized option set with defaults and
//! start-up validation.

use serde::Deserialize;

use crate::error::{ArchiveError, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct ArchiveConfig {
	/// JSON-RPC endpoint of a full node.
	pub rpc_url: String,
	/// Optional HTTP proxy for node access.
	#[serde(default)]
	pub proxy_url: Option<String>,
	/// Store connection string.
	pub store_url: String,
	/// First height to index, inclusive.
	#[serde(default = "default_start_height")]
	pub start_height: i64,
	/// Stop after this height; follow the head forever when absent.
	#[serde(default)]
	pub end_height: Option<i64>,
	/// Re-index `[start_height, end_height]` by delete-then-connect.
	#[serde(default)]
	pub fix: bool,
	/// Restrict indexing to the block table family.
	#[serde(default)]
	pub only_block: bool,
	/// Network identifier (mainnet or a test-net name).
	#[serde(default = "default_network")]
	pub network: String,
	/// Optional tracing collector endpoint.
	#[serde(default)]
	pub tracing_url: Option<String>,
	/// Optional messaging bus endpoint.
	#[serde(default)]
	pub message_bus_url: Option<String>,
	/// Depth of the prefetch queue between RPC and the writer.
	#[serde(default = "default_queue_depth")]
	pub queue_depth: usize,
	/// Transient RPC failures retried before the block aborts.
	#[serde(default = "default_rpc_retries")]
	pub rpc_retries: u32,
}

const fn default_start_height() -> i64 {
	1
}

fn default_network() -> String {
	"mainnet".to_string()
}

const fn default_queue_depth() -> usize {
	4
}

const fn default_rpc_retries() -> u32 {
	5
}

impl ArchiveConfig {
	/// Fatal at start-up when the option set cannot work.
	pub fn validate(&self) -> Result<()> {
		if self.rpc_url.is_empty() {
			return Err(ArchiveError::Configuration("rpc_url must be set".into()));
		}
		if self.store_url.is_empty() {
			return Err(ArchiveError::Configuration("store_url must be set".into()));
		}
		if self.start_height < 1 {
			return Err(ArchiveError::Configuration("start_height must be >= 1".into()));
		}
		if let Some(end) = self.end_height {
			if end < self.start_height {
				return Err(ArchiveError::Configuration(format!(
					"end_height {} lies before start_height {}",
					end, self.start_height
				)));
			}
		}
		if self.queue_depth == 0 {
			return Err(ArchiveError::Configuration("queue_depth must be > 0".into()));
		}
		if self.fix && self.end_height.is_none() {
			return Err(ArchiveError::Configuration("fix mode requires end_height".into()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base() -> ArchiveConfig {
		serde_json::from_str(
			r#"{ "rpc_url": "http://localhost:8732", "store_url": "mem://" }"#,
		)
		.unwrap()
	}

	#[test]
	fn defaults_are_applied() {
		let cfg = base();
		assert_eq!(cfg.start_height, 1);
		assert_eq!(cfg.queue_depth, 4);
		assert_eq!(cfg.network, "mainnet");
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn end_before_start_is_rejected() {
		let mut cfg = base();
		cfg.start_height = 100;
		cfg.end_height = Some(50);
		assert!(matches!(cfg.validate(), Err(ArchiveError::Configuration(_))));
	}

	#[test]
	fn fix_requires_end() {
		let mut cfg = base();
		cfg.fix = true;
		assert!(cfg.validate().is_err());
		cfg.end_height = Some(10);
		assert!(cfg.validate().is_ok());
	}
}
