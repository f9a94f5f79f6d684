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

//! End-to-end connect/disconnect law over a deterministic scripted chain,
//! plus crawler runs against a scripted node, including a mid-run reorg.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Once,
};

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;

use tezos_archive::{
	rpc::{BakingRight, EndorsingRight, HeadInfo, RawBigmapDiff, RawOperation, RawBlock, RpcSource, SnapshotInfo},
	store::mem::Rows,
	types::{BigmapAction, VotingPeriodKind},
	ArchiveConfig, ArchiveError, BlockBuilder, Indexer, MemStore, Params, Result, Store, System,
};

static INIT: Once = Once::new();

fn initialize() {
	INIT.call_once(|| {
		pretty_env_logger::init();
	});
}

static PARAMS: Lazy<Arc<Params>> = Lazy::new(|| Arc::new(Params::test(6)));

fn delegate(i: i64) -> String {
	format!("tz1delegate{}", i)
}

/// Deterministic chain: four baking delegates in round-robin, one idle
/// delegate, full endorsements except one skipped block, a stolen block, a
/// proposal winner, an empty voting period and a proposal draw. `fork`
/// switches block hashes from that height on, standing in for a competing
/// chain after a reorg.
struct TestChain {
	params: Arc<Params>,
	fork: i64,
}

impl TestChain {
	fn new(params: Arc<Params>) -> Self {
		TestChain { params, fork: i64::MAX }
	}

	fn forked(params: Arc<Params>, fork: i64) -> Self {
		TestChain { params, fork }
	}

	fn hash(&self, height: i64) -> String {
		if height == 0 {
			return "genesis".into();
		}
		if height >= self.fork {
			format!("B{}b", height)
		} else {
			format!("B{}", height)
		}
	}

	fn baker_index(height: i64) -> i64 {
		if height == 15 {
			0
		} else {
			height % 4
		}
	}

	fn priority(height: i64) -> i64 {
		if height == 15 {
			1
		} else {
			0
		}
	}

	fn baking_rights_for_cycle(&self, cycle: i64) -> Vec<BakingRight> {
		let p = &self.params;
		let mut rights = Vec::new();
		for level in p.cycle_start_height(cycle)..=p.cycle_end_height(cycle) {
			rights.push(BakingRight { level, delegate: delegate(level % 4), priority: 0 });
			if level == 15 {
				// the round-robin holder misses this one, priority 1 takes it
				rights.push(BakingRight { level, delegate: delegate(0), priority: 1 });
			}
		}
		rights
	}

	fn endorsing_rights_for_cycle(&self, cycle: i64) -> Vec<EndorsingRight> {
		let p = &self.params;
		(p.cycle_start_height(cycle)..=p.cycle_end_height(cycle))
			.map(|level| EndorsingRight { level, delegate: delegate(level % 4), slots: vec![0, 1, 2, 3] })
			.collect()
	}

	fn ops(&self, height: i64) -> Vec<Vec<RawOperation>> {
		let mut list = Vec::new();
		if height == 1 {
			for i in 0..5 {
				list.push(RawOperation::Activation { account: delegate(i), amount: 80_000 });
			}
			for i in 0..5 {
				list.push(RawOperation::Delegation { source: delegate(i), delegate: Some(delegate(i)), fee: 0 });
			}
			return vec![list];
		}

		// every block endorses its parent, except 21 which misses
		if height != 21 {
			list.push(RawOperation::Endorsement { delegate: delegate((height - 1) % 4), slots: vec![0, 1, 2, 3] });
		}

		match height {
			3 => list.push(RawOperation::Proposals {
				source: delegate(1),
				period: 0,
				proposals: vec!["PtA".into()],
			}),
			6 => list.push(RawOperation::SeedNonceRevelation { level: 4, nonce: "deadbeef".into() }),
			11 => list.push(RawOperation::Transaction {
				source: delegate(1),
				destination: "tz1user".into(),
				amount: 5_000,
				fee: 10,
				gas_limit: 10_000,
				gas_used: 9_000,
				big_map_diff: Vec::new(),
			}),
			13 => list.push(RawOperation::Delegation {
				source: "tz1user".into(),
				delegate: Some(delegate(2)),
				fee: 0,
			}),
			14 => list.push(RawOperation::Origination {
				source: delegate(2),
				originated: "KT1counter".into(),
				balance: 1_000,
				fee: 5,
				storage_size: 57,
				script: Some(serde_json::json!({ "code": [], "storage": { "int": "0" } })),
				big_map_diff: vec![
					RawBigmapDiff {
						bigmap_id: 1,
						action: BigmapAction::Alloc,
						key_hash: String::new(),
						key: None,
						value: None,
					},
					RawBigmapDiff {
						bigmap_id: 1,
						action: BigmapAction::Update,
						key_hash: "exprtotal".into(),
						key: Some(serde_json::json!({ "string": "total" })),
						value: Some(serde_json::json!({ "int": "42" })),
					},
				],
			}),
			18 => list.push(RawOperation::DoubleBakingEvidence {
				offender: delegate(3),
				lost_deposits: 100,
				lost_rewards: 10,
				lost_fees: 0,
				reward: 55,
			}),
			35 => {
				list.push(RawOperation::Proposals {
					source: delegate(0),
					period: 2,
					proposals: vec!["PtB".into()],
				});
				list.push(RawOperation::Proposals {
					source: delegate(4),
					period: 2,
					proposals: vec!["PtC".into()],
				});
			}
			_ => {}
		}
		vec![list]
	}

	fn raw(&self, height: i64) -> RawBlock {
		let p = &self.params;
		let (baking_rights, endorsing_rights, snapshot) = if height == 1 {
			let mut baking = Vec::new();
			let mut endorsing = Vec::new();
			for cycle in 0..=p.preserved_cycles {
				baking.extend(self.baking_rights_for_cycle(cycle));
				endorsing.extend(self.endorsing_rights_for_cycle(cycle));
			}
			(baking, endorsing, None)
		} else if p.is_cycle_start(height) {
			let cycle = p.cycle_from_height(height) + p.preserved_cycles;
			(
				self.baking_rights_for_cycle(cycle),
				self.endorsing_rights_for_cycle(cycle),
				Some(SnapshotInfo { cycle, index: 1 }),
			)
		} else {
			(Vec::new(), Vec::new(), None)
		};

		RawBlock {
			hash: self.hash(height),
			predecessor: self.hash(height - 1),
			height,
			time: Utc.timestamp(1_600_000_000 + height * 60, 0),
			cycle: p.cycle_from_height(height),
			voting_period: p.voting_period_from_height(height),
			voting_period_kind: VotingPeriodKind::Proposal,
			priority: Self::priority(height),
			baker: delegate(Self::baker_index(height)),
			operations: self.ops(height),
			baking_rights,
			endorsing_rights,
			snapshot,
		}
	}
}

/// Structural checks from the testable properties: single open election and
/// vote, quorum arithmetic, ballot/turnout agreement, income ratios.
fn check_invariants(rows: &Rows) {
	assert!(rows.elections.values().filter(|e| e.is_open).count() <= 1, "more than one open election");
	assert!(rows.votes.values().filter(|v| v.is_open).count() <= 1, "more than one open vote");

	for vote in rows.votes.values() {
		assert_eq!(
			vote.quorum_rolls,
			vote.eligible_rolls * vote.quorum_pct / 10000,
			"quorum arithmetic broken for period {}",
			vote.voting_period
		);
		let ballots: Vec<_> =
			rows.ballots.values().filter(|b| b.voting_period == vote.voting_period).collect();
		if !ballots.is_empty() {
			let rolls: i64 = ballots.iter().map(|b| b.rolls).sum();
			assert_eq!(rolls, vote.turnout_rolls, "ballot rolls disagree with turnout");
			assert_eq!(ballots.len() as i64, vote.turnout_voters, "ballot count disagrees with turnout");
		}
	}

	for income in rows.incomes.values() {
		if income.expected_income > 0 {
			let gain = income.total_income - income.total_lost - income.expected_income;
			assert_eq!(
				income.performance_pct,
				10000 + gain * 10000 / income.expected_income,
				"performance ratio broken for cycle {} account {}",
				income.cycle,
				income.account_id
			);
		}
	}
}

const CHAIN_LENGTH: i64 = 48;

#[test]
fn connect_disconnect_round_trip() {
	initialize();
	smol::block_on(async {
		let params = PARAMS.clone();
		let chain = TestChain::new(params.clone());
		let store = MemStore::new();
		let indexer = Indexer::with_defaults(false);
		let mut builder = BlockBuilder::new(params.clone());

		// connect the whole chain, checkpointing storage after every block
		let mut connected = Vec::new();
		let mut checkpoints = vec![store.rows()];
		for height in 1..=CHAIN_LENGTH {
			let data = indexer
				.connect_block(&store, &mut builder, chain.raw(height))
				.await
				.unwrap_or_else(|e| panic!("connect {}: {}", height, e));
			connected.push(data);
			checkpoints.push(store.rows());
			check_invariants(&store.rows());
		}

		let full = store.rows();

		// the first election elected PtA
		let election1 = full.elections.get(&1).unwrap();
		assert!(!election1.is_open);
		assert!(!election1.is_failed);
		let winner = full.proposals.values().find(|p| p.hash == "PtA").unwrap();
		assert_eq!(election1.proposal_id, winner.row_id);
		assert_eq!(winner.voters, 1);

		// the second period saw no proposals at all
		let election2 = full.elections.get(&2).unwrap();
		assert!(election2.is_empty);
		assert!(election2.is_failed);

		// the third drew between PtB and PtC
		let election3 = full.elections.get(&3).unwrap();
		assert!(election3.is_failed);
		let vote3 = full.votes.values().find(|v| v.voting_period == 2).unwrap();
		assert!(vote3.is_draw);
		assert_eq!(election3.proposal_id.value(), 0);

		// stolen block 15: thief and loser accounting
		let thief = full.accounts.values().find(|a| a.address == delegate(0)).unwrap();
		let loser = full.accounts.values().find(|a| a.address == delegate(3)).unwrap();
		let thief_income =
			full.incomes.values().find(|i| i.cycle == 1 && i.account_id == thief.row_id).unwrap();
		let loser_income =
			full.incomes.values().find(|i| i.cycle == 1 && i.account_id == loser.row_id).unwrap();
		assert_eq!(thief_income.n_blocks_stolen, 1);
		assert_eq!(thief_income.stolen_baking_income, params.block_reward);
		assert_eq!(loser_income.n_blocks_lost, 1);
		assert_eq!(loser_income.missed_baking_income, params.block_reward);

		// block 21 skipped its endorsement of level 20
		let d0_income_cycle2 =
			full.incomes.values().find(|i| i.cycle == 2 && i.account_id == thief.row_id).unwrap();
		assert_eq!(d0_income_cycle2.n_slots_missed, 4);
		assert_eq!(d0_income_cycle2.missed_endorsing_income, 4 * params.endorsement_reward);

		// unrevealed seed nonce of level 8 burned, the revealed one did not
		let d0_income_cycle0 =
			full.incomes.values().find(|i| i.cycle == 0 && i.account_id == thief.row_id).unwrap();
		assert_eq!(d0_income_cycle0.lost_revelation_rewards, params.block_reward);
		let revealed = full
			.rights
			.values()
			.find(|r| r.height == 4 && r.is_seed_required)
			.unwrap();
		assert!(revealed.is_seed_revealed);
		let burned = full.rights.values().find(|r| r.height == 8 && r.is_seed_required).unwrap();
		assert!(!burned.is_seed_revealed);

		// denunciation debited the offender and credited the accuser
		let offender_income =
			full.incomes.values().find(|i| i.cycle == 2 && i.account_id == loser.row_id).unwrap();
		assert_eq!(offender_income.lost_accusation_deposits, 100);
		assert_eq!(offender_income.lost_accusation_rewards, 10);
		assert_eq!(offender_income.total_lost, 110);
		let accuser = full.accounts.values().find(|a| a.address == delegate(2)).unwrap();
		let accuser_income =
			full.incomes.values().find(|i| i.cycle == 2 && i.account_id == accuser.row_id).unwrap();
		assert_eq!(accuser_income.double_baking_income, 55);

		// originated contract and its big map made it to the tables
		assert_eq!(full.contracts.len(), 1);
		assert_eq!(full.bigmap_items.len(), 2);

		// disconnect everything in reverse order; storage must retrace the
		// exact same states it went through on the way up
		for height in (1..=CHAIN_LENGTH).rev() {
			let data = connected.pop().unwrap();
			indexer
				.disconnect_block(&store, &mut builder, &data)
				.await
				.unwrap_or_else(|e| panic!("disconnect {}: {}", height, e));
			assert_eq!(
				store.rows(),
				checkpoints[(height - 1) as usize],
				"storage diverged after disconnecting block {}",
				height
			);
		}

		assert_eq!(store.rows(), Rows::default());
	});
}

struct MockRpc {
	chain_a: TestChain,
	chain_b: TestChain,
	head_a: i64,
	head_b: i64,
	/// flips to the B chain once the A head has been fully served
	forked: AtomicBool,
}

impl MockRpc {
	fn steady(params: Arc<Params>, head: i64) -> Self {
		MockRpc {
			chain_a: TestChain::new(params.clone()),
			chain_b: TestChain::new(params),
			head_a: head,
			head_b: head,
			forked: AtomicBool::new(true),
		}
	}

	fn reorging(params: Arc<Params>, head_a: i64, fork: i64, head_b: i64) -> Self {
		MockRpc {
			chain_a: TestChain::new(params.clone()),
			chain_b: TestChain::forked(params, fork),
			head_a,
			head_b,
			forked: AtomicBool::new(false),
		}
	}

	fn current(&self) -> (&TestChain, i64) {
		if self.forked.load(Ordering::SeqCst) {
			(&self.chain_b, self.head_b)
		} else {
			(&self.chain_a, self.head_a)
		}
	}
}

#[async_trait::async_trait]
impl RpcSource for MockRpc {
	async fn head(&self) -> Result<HeadInfo> {
		let (chain, head) = self.current();
		Ok(HeadInfo { height: head, hash: chain.hash(head) })
	}

	async fn block(&self, height: i64) -> Result<RawBlock> {
		let (chain, head) = self.current();
		if height > head {
			return Err(ArchiveError::Rpc(format!("block {} not yet known", height)));
		}
		let raw = chain.raw(height);
		if height == self.head_a {
			// the node switches branches once the old head was served
			self.forked.store(true, Ordering::SeqCst);
		}
		Ok(raw)
	}

	async fn block_hash(&self, height: i64) -> Result<String> {
		let (chain, _) = self.current();
		Ok(chain.hash(height))
	}
}

fn config(end: i64) -> ArchiveConfig {
	ArchiveConfig {
		rpc_url: "mock://node".into(),
		proxy_url: None,
		store_url: "mem://".into(),
		start_height: 1,
		end_height: Some(end),
		fix: false,
		only_block: false,
		network: "sandbox".into(),
		tracing_url: None,
		message_bus_url: None,
		queue_depth: 4,
		rpc_retries: 2,
	}
}

#[test]
fn crawler_follows_to_end_height() {
	initialize();
	let params = PARAMS.clone();
	let store = Arc::new(MemStore::new());
	let rpc = Arc::new(MockRpc::steady(params.clone(), 20));

	let system = System::spawn(config(20), params, store.clone() as Arc<dyn Store>, rpc).unwrap();
	system.join().unwrap();

	let rows = store.rows();
	assert_eq!(rows.blocks.len(), 20);
	assert!(rows.blocks.values().any(|b| b.height == 20));
	check_invariants(&rows);
}

#[test]
fn crawler_walks_back_to_fork_point() {
	initialize();
	let params = PARAMS.clone();
	let store = Arc::new(MemStore::new());
	// branch A reaches 12, the node then switches to branch B which
	// diverges at height 10 and reaches 15
	let rpc = Arc::new(MockRpc::reorging(params.clone(), 12, 10, 15));

	let system = System::spawn(config(15), params, store.clone() as Arc<dyn Store>, rpc).unwrap();
	system.join().unwrap();

	let rows = store.rows();
	assert_eq!(rows.blocks.len(), 15);
	for block in rows.blocks.values() {
		if block.height >= 10 {
			assert_eq!(block.hash, format!("B{}b", block.height), "height {} still on the old branch", block.height);
		} else {
			assert_eq!(block.hash, format!("B{}", block.height));
		}
	}
	check_invariants(&rows);
}
