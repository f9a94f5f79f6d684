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

//! Read-only chain parameters and the height arithmetic derived from them.
//! The indexing core consumes a `Params` per block; constants change only at
//! protocol activations.

use serde::{Deserialize, Serialize};

/// Protocol constants for one protocol version of the chain.
///
/// All monetary amounts are in the smallest chain unit; all percentages used
/// by consumers are scaled by 10000.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
	/// protocol version counter, bumps at each activation
	pub version: i64,
	pub network: String,
	/// height at which this protocol version activated
	pub start_height: i64,

	pub blocks_per_cycle: i64,
	pub blocks_per_voting_period: i64,
	pub blocks_per_roll_snapshot: i64,
	/// a seed nonce commitment is required every this many blocks
	pub blocks_per_commitment: i64,
	pub preserved_cycles: i64,
	pub endorsers_per_block: i64,

	pub tokens_per_roll: i64,
	pub block_reward: i64,
	pub endorsement_reward: i64,
	pub block_security_deposit: i64,
	pub endorsement_security_deposit: i64,
	pub seed_nonce_tip: i64,
	/// deposits ramp up linearly over this many cycles after genesis
	pub security_deposit_ramp_up_cycles: i64,
	/// rewards are zero during the first cycles of a new chain
	pub no_reward_cycles: i64,

	/// minimum proposal-period quorum, scaled by 10000
	pub min_proposal_quorum: i64,
	/// participation EMA caps (protocol v5+), scaled by 10000
	pub quorum_min: i64,
	pub quorum_max: i64,
}

impl Params {
	pub fn mainnet() -> Self {
		Params {
			version: 6,
			network: "mainnet".into(),
			start_height: 1,
			blocks_per_cycle: 4096,
			blocks_per_voting_period: 32768,
			blocks_per_roll_snapshot: 256,
			blocks_per_commitment: 32,
			preserved_cycles: 5,
			endorsers_per_block: 32,
			tokens_per_roll: 8_000_000_000,
			block_reward: 16_000_000,
			endorsement_reward: 2_000_000,
			block_security_deposit: 512_000_000,
			endorsement_security_deposit: 64_000_000,
			seed_nonce_tip: 125_000,
			security_deposit_ramp_up_cycles: 64,
			no_reward_cycles: 7,
			min_proposal_quorum: 500,
			quorum_min: 2000,
			quorum_max: 7000,
		}
	}

	/// Small constants for deterministic tests: 8-block cycles, 16-block
	/// voting periods, snapshots every 4 blocks.
	pub fn test(version: i64) -> Self {
		Params {
			version,
			network: "sandbox".into(),
			start_height: 1,
			blocks_per_cycle: 8,
			blocks_per_voting_period: 16,
			blocks_per_roll_snapshot: 4,
			blocks_per_commitment: 4,
			preserved_cycles: 2,
			endorsers_per_block: 4,
			tokens_per_roll: 8_000,
			block_reward: 16,
			endorsement_reward: 2,
			block_security_deposit: 512,
			endorsement_security_deposit: 64,
			seed_nonce_tip: 1,
			security_deposit_ramp_up_cycles: 4,
			no_reward_cycles: 0,
			min_proposal_quorum: 500,
			quorum_min: 2000,
			quorum_max: 7000,
		}
	}

	/// Block 1 belongs to cycle 0; cycles are `blocks_per_cycle` long.
	pub fn cycle_from_height(&self, height: i64) -> i64 {
		if height <= 0 {
			return 0;
		}
		(height - 1) / self.blocks_per_cycle
	}

	pub fn cycle_start_height(&self, cycle: i64) -> i64 {
		cycle * self.blocks_per_cycle + 1
	}

	/// Last block of `cycle`; 0 for cycle -1, which callers use as the
	/// left-shifted endorsement window start.
	pub fn cycle_end_height(&self, cycle: i64) -> i64 {
		(cycle + 1) * self.blocks_per_cycle
	}

	pub fn is_cycle_start(&self, height: i64) -> bool {
		height > 0 && (height - 1) % self.blocks_per_cycle == 0
	}

	pub fn is_cycle_end(&self, height: i64) -> bool {
		height > 0 && height % self.blocks_per_cycle == 0
	}

	pub fn is_vote_start(&self, height: i64) -> bool {
		height > 0 && (height - 1) % self.blocks_per_voting_period == 0
	}

	pub fn is_vote_end(&self, height: i64) -> bool {
		height > 0 && height % self.blocks_per_voting_period == 0
	}

	pub fn voting_period_from_height(&self, height: i64) -> i64 {
		if height <= 0 {
			return 0;
		}
		(height - 1) / self.blocks_per_voting_period
	}

	/// Roll distributions are snapshotted every `blocks_per_roll_snapshot`.
	pub fn is_snapshot_block(&self, height: i64) -> bool {
		height > 0 && height % self.blocks_per_roll_snapshot == 0
	}

	/// Index of a snapshot block within its cycle, starting at 0.
	pub fn snapshot_index(&self, height: i64) -> i64 {
		((height - 1) % self.blocks_per_cycle + 1) / self.blocks_per_roll_snapshot - 1
	}

	/// Height whose roll distribution seeds rights for `cycle` under
	/// snapshot `index`. The source cycle is `preserved_cycles + 2` back.
	pub fn snapshot_block(&self, cycle: i64, index: i64) -> i64 {
		self.cycle_start_height(cycle - (self.preserved_cycles + 2)) + (index + 1) * self.blocks_per_roll_snapshot - 1
	}

	pub fn is_seed_required(&self, height: i64) -> bool {
		height > 0 && height % self.blocks_per_commitment == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cycle_arithmetic() {
		let p = Params::test(6);
		assert_eq!(p.cycle_from_height(1), 0);
		assert_eq!(p.cycle_from_height(8), 0);
		assert_eq!(p.cycle_from_height(9), 1);
		assert_eq!(p.cycle_start_height(1), 9);
		assert_eq!(p.cycle_end_height(0), 8);
		assert_eq!(p.cycle_end_height(-1), 0);
		assert!(p.is_cycle_start(9));
		assert!(p.is_cycle_end(8));
		assert!(!p.is_cycle_start(10));
	}

	#[test]
	fn vote_boundaries() {
		let p = Params::test(6);
		assert!(p.is_vote_start(1));
		assert!(p.is_vote_start(17));
		assert!(p.is_vote_end(16));
		assert!(!p.is_vote_end(17));
		assert_eq!(p.voting_period_from_height(16), 0);
		assert_eq!(p.voting_period_from_height(17), 1);
	}

	#[test]
	fn snapshot_arithmetic() {
		let p = Params::test(6);
		assert!(p.is_snapshot_block(4));
		assert!(p.is_snapshot_block(8));
		assert!(!p.is_snapshot_block(5));
		assert_eq!(p.snapshot_index(4), 0);
		assert_eq!(p.snapshot_index(8), 1);
		assert_eq!(p.snapshot_index(12), 0);
		// cycle 4 draws on cycle 0 (preserved + 2 = 4 back)
		assert_eq!(p.snapshot_block(4, 0), 4);
		assert_eq!(p.snapshot_block(4, 1), 8);
		assert_eq!(p.snapshot_block(5, 0), 12);
	}

	#[test]
	fn mainnet_snapshot_block_is_snapshot_height() {
		let p = Params::mainnet();
		let h = p.snapshot_block(7, 0);
		assert!(p.is_snapshot_block(h));
		assert_eq!(p.snapshot_index(h), 0);
	}
}
