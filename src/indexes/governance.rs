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

//! The amendment state machine: elections spanning up to four voting
//! periods (proposal, exploration, testing, promotion), per-period quorum
//! tracking with the participation EMA of protocol v5+, proposal tallies
//! and per-voter roll snapshots.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
	builder::BlockBuilder,
	error::{ArchiveError, Result},
	indexer::BlockIndexer,
	params::Params,
	rpc::RawOperation,
	store::StoreTx,
	types::{
		Account, Ballot, BallotVote, BlockData, Election, OpKind, Proposal, ProposalId, Vote, VotingPeriodKind,
	},
};

/// The chain is initialized at block 1; voting state exists from block 2 on.
const FIRST_VOTE_BLOCK: i64 = 2;

pub struct GovIndex;

#[async_trait::async_trait]
impl BlockIndexer for GovIndex {
	fn name(&self) -> &'static str {
		"governance"
	}

	async fn connect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &mut BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		// skip genesis and bootstrap blocks
		if block.height() < FIRST_VOTE_BLOCK {
			return Ok(());
		}

		let height = block.height();
		let p = &block.params;
		let is_period_start = height == FIRST_VOTE_BLOCK || p.is_vote_start(height);
		let is_period_end = height > FIRST_VOTE_BLOCK && p.is_vote_end(height);

		// open a new election or vote on first block
		if is_period_start {
			if block.block.voting_period_kind == VotingPeriodKind::Proposal {
				if let Err(e) = self.open_election(tx, block).await {
					log::error!("Open election at block {} {}: {}", height, block.block.voting_period_kind, e);
					return Err(e);
				}
			}
			if let Err(e) = self.open_vote(tx, block).await {
				log::error!("Open vote at block {} {}: {}", height, block.block.voting_period_kind, e);
				return Err(e);
			}
		}

		// process proposals (1) or ballots (2, 4)
		match block.block.voting_period_kind {
			VotingPeriodKind::Proposal => self.process_proposals(tx, block, builder).await?,
			VotingPeriodKind::Exploration | VotingPeriodKind::Promotion => {
				self.process_ballots(tx, block, builder).await?
			}
			VotingPeriodKind::Testing => {}
		}

		// close any previous period after last block
		if is_period_end {
			let success = self.close_vote(tx, block).await?;

			// on failure or on end, close last election
			if !success || block.block.voting_period_kind == VotingPeriodKind::Proposal {
				if let Err(e) = self.close_election(tx, block).await {
					log::error!("Close election at block {}: {}", height, e);
					return Err(e);
				}
			}
		}
		Ok(())
	}

	/// Exact inverse of `connect_block`: reverses tally and counter updates
	/// on surviving rows before removing the rows this height created.
	async fn disconnect_block(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		_builder: &BlockBuilder,
	) -> Result<()> {
		if block.height() < FIRST_VOTE_BLOCK {
			return Ok(());
		}

		let height = block.height();
		let p = &block.params;
		let is_period_start = height == FIRST_VOTE_BLOCK || p.is_vote_start(height);
		let is_period_end = height > FIRST_VOTE_BLOCK && p.is_vote_end(height);

		if is_period_end {
			self.reopen_vote(tx, block).await?;
		}

		self.unapply_ballots(tx, block).await?;
		self.unapply_proposals(tx, block).await?;

		tx.delete_ballots_by_height(height).await?;
		tx.delete_proposals_by_height(height).await?;

		if is_period_start {
			tx.delete_votes_by_start_height(height).await?;
			if block.block.voting_period_kind == VotingPeriodKind::Proposal {
				tx.delete_elections_by_start_height(height).await?;
			} else if let Some(mut election) = tx.election_by_height(height).await? {
				// the deleted vote had advanced the period counter
				election.num_periods = block.block.voting_period_kind.period_index() - 1;
				tx.update_election(&election).await?;
			}
		}
		Ok(())
	}

	/// Height-scoped hard delete, idempotent; counter reversal is the
	/// disconnect path's job.
	async fn delete_block(&self, tx: &mut dyn StoreTx, height: i64) -> Result<()> {
		tx.delete_ballots_by_height(height).await?;
		tx.delete_proposals_by_height(height).await?;
		tx.delete_votes_by_start_height(height).await?;
		tx.delete_elections_by_start_height(height).await?;
		Ok(())
	}
}

impl GovIndex {
	async fn open_election(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let mut election = Election {
			row_id: Default::default(),
			proposal_id: ProposalId::default(),
			voting_period: block.block.voting_period,
			start_time: block.block.time,
			end_time: None,
			start_height: block.height(),
			end_height: 0,
			num_periods: 1,
			num_proposals: 0,
			is_empty: true,
			is_open: true,
			is_failed: false,
			no_quorum: false,
			no_majority: false,
		};
		tx.create_election(&mut election).await
	}

	async fn close_election(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let mut election = self.election_by_height(tx, block.height()).await?;
		if !election.is_open {
			return Err(ArchiveError::contract(format!("closing election: election {} already closed", election.row_id)));
		}
		let vote = self.vote_by_height(tx, block.height()).await?;
		if vote.is_open {
			return Err(ArchiveError::contract(format!(
				"closing election: vote {}/{} is not closed",
				vote.election_id, vote.voting_period
			)));
		}
		election.end_height = vote.end_height;
		election.end_time = vote.end_time;
		election.is_open = false;
		election.is_empty = election.num_proposals == 0 && vote.is_failed;
		election.is_failed = vote.is_failed;
		election.no_quorum = vote.no_quorum;
		election.no_majority = vote.no_majority;
		tx.update_election(&election).await
	}

	async fn open_vote(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let mut election = self.election_by_height(tx, block.height()).await?;
		if !election.is_open {
			return Err(ArchiveError::contract(format!("opening vote: election {} already closed", election.row_id)));
		}

		match block.block.voting_period_kind {
			VotingPeriodKind::Exploration => election.num_periods = 2,
			VotingPeriodKind::Testing => election.num_periods = 3,
			VotingPeriodKind::Promotion => election.num_periods = 4,
			VotingPeriodKind::Proposal => {}
		}

		// Note: this adjusts end height of the first period (we run this at
		// height 2 instead of 0), otherwise the formula could be simpler
		let p = &block.params;
		let height = block.height();
		let end_height = (height - height % p.blocks_per_voting_period) + p.blocks_per_voting_period;

		let mut vote = Vote {
			row_id: Default::default(),
			election_id: election.row_id,
			// voted proposal, zero in the first voting period
			proposal_id: election.proposal_id,
			voting_period: block.block.voting_period,
			voting_period_kind: block.block.voting_period_kind,
			start_time: block.block.time,
			end_time: None,
			start_height: height,
			end_height,
			eligible_rolls: block.chain.rolls,
			eligible_voters: block.chain.roll_owners,
			quorum_pct: 0,
			quorum_rolls: 0,
			turnout_rolls: 0,
			turnout_voters: 0,
			turnout_pct: 0,
			turnout_ema: 0,
			yay_rolls: 0,
			yay_voters: 0,
			nay_rolls: 0,
			nay_voters: 0,
			pass_rolls: 0,
			pass_voters: 0,
			is_open: true,
			is_failed: false,
			is_draw: false,
			no_proposal: false,
			no_quorum: false,
			no_majority: false,
		};

		match vote.voting_period_kind {
			VotingPeriodKind::Proposal => {
				// fixed min proposal quorum as defined by the protocol
				vote.quorum_pct = p.min_proposal_quorum;
			}
			VotingPeriodKind::Testing => {
				// no quorum
				vote.quorum_pct = 0;
			}
			VotingPeriodKind::Exploration | VotingPeriodKind::Promotion => {
				// from most recent exploration or promotion period; the
				// quorum adjusts at the end of each of those
				let (quorum_pct, turnout_ema) = self.quorum_by_height(tx, height, p).await?;
				vote.quorum_pct = quorum_pct;
				vote.turnout_ema = turnout_ema;
			}
		}
		vote.quorum_rolls = vote.eligible_rolls * vote.quorum_pct / 10000;

		tx.create_vote(&mut vote).await?;
		tx.update_election(&election).await
	}

	async fn close_vote(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<bool> {
		let mut vote = self.vote_by_height(tx, block.height()).await?;
		if !vote.is_open {
			return Err(ArchiveError::contract(format!(
				"closing vote: vote {}/{} is already closed",
				vote.election_id, vote.voting_period
			)));
		}
		let params = &block.params;

		match vote.voting_period_kind {
			VotingPeriodKind::Proposal => {
				// select the winning proposal if any and update the election
				let mut is_draw = false;
				if vote.turnout_rolls > 0 {
					let proposals = tx.proposals_by_election(vote.election_id).await?;

					let mut winner = ProposalId::default();
					let mut count = 0i64;
					for v in &proposals {
						if v.rolls < count {
							continue;
						}
						if v.rolls > count {
							is_draw = false;
							count = v.rolls;
							winner = v.row_id;
						} else {
							is_draw = true;
						}
					}

					if !is_draw {
						let mut election = self.election_by_height(tx, block.height()).await?;
						election.proposal_id = winner;
						tx.update_election(&election).await?;
						vote.proposal_id = winner;
					}
				}
				vote.no_proposal = vote.turnout_rolls == 0;
				vote.no_quorum = params.min_proposal_quorum > 0 && vote.turnout_rolls < vote.quorum_rolls;
				vote.is_draw = is_draw;
				vote.is_failed = vote.no_proposal || vote.no_quorum || vote.is_draw;
			}

			VotingPeriodKind::Exploration | VotingPeriodKind::Promotion => {
				vote.no_quorum = vote.turnout_rolls < vote.quorum_rolls;
				vote.no_majority = vote.yay_rolls < (vote.yay_rolls + vote.nay_rolls) * 8 / 10;
				vote.is_failed = vote.no_quorum || vote.no_majority;
			}

			VotingPeriodKind::Testing => {
				// empty, cannot fail
			}
		}

		vote.end_time = Some(block.block.time);
		vote.is_open = false;
		tx.update_vote(&vote).await?;
		Ok(!vote.is_failed)
	}

	async fn process_proposals(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		// skip blocks without proposals
		if block.block.n_proposal == 0 {
			return Ok(());
		}

		let mut vote = self.vote_by_height(tx, block.height()).await?;

		let mut proposal_map: BTreeMap<String, Proposal> = BTreeMap::new();
		for prop in tx.proposals_by_election(vote.election_id).await? {
			proposal_map.insert(prop.hash.clone(), prop);
		}

		// find and insert unknown proposals first so they have row ids
		let mut new_proposals: Vec<Proposal> = Vec::new();
		for op in block.ops.iter().filter(|o| o.kind == OpKind::Proposals) {
			let (source, proposals) = proposals_op(block, op.op_n, op.op_c)?;
			let acc = account_of(builder, &source, op.op_n, op.op_c)?;
			for hash in &proposals {
				if proposal_map.contains_key(hash) || new_proposals.iter().any(|p| &p.hash == hash) {
					continue;
				}
				new_proposals.push(Proposal {
					row_id: ProposalId::default(),
					hash: hash.clone(),
					height: block.height(),
					time: block.block.time,
					source_id: acc.row_id,
					op_id: op.row_id,
					election_id: vote.election_id,
					voting_period: vote.voting_period,
					rolls: 0,
					voters: 0,
				});
			}
		}
		if !new_proposals.is_empty() {
			tx.create_proposals(&mut new_proposals).await?;
			let n = new_proposals.len() as i64;
			for p in new_proposals {
				proposal_map.insert(p.hash.clone(), p);
			}
			let mut election = self.election_by_height(tx, block.height()).await?;
			if !election.is_open {
				return Err(ArchiveError::contract(format!(
					"update election: election {} already closed",
					election.row_id
				)));
			}
			election.is_empty = false;
			election.num_proposals += n;
			tx.update_election(&election).await?;
		}

		// create ballots, tally proposals and count turnout once per voter
		let mut new_ballots: Vec<Ballot> = Vec::new();
		let mut counted: BTreeSet<u64> = BTreeSet::new();
		for op in block.ops.iter().filter(|o| o.kind == OpKind::Proposals) {
			let (source, proposals) = proposals_op(block, op.op_n, op.op_c)?;
			let acc = account_of(builder, &source, op.op_n, op.op_c)?;
			let rolls = self.voter_rolls(tx, block, acc, &vote).await?;

			for hash in &proposals {
				let prop = proposal_map.get_mut(hash).ok_or_else(|| {
					ArchiveError::integrity(format!("missing proposal {} in op [{}:{}]", hash, op.op_n, op.op_c))
				})?;

				// skip when the voter already balloted this proposal
				if tx.count_ballots_for_proposal(acc.row_id, vote.voting_period, prop.row_id).await? > 0 {
					continue;
				}
				if new_ballots.iter().any(|b| b.source_id == acc.row_id && b.proposal_id == prop.row_id) {
					continue;
				}

				new_ballots.push(Ballot {
					row_id: Default::default(),
					election_id: vote.election_id,
					proposal_id: prop.row_id,
					voting_period: vote.voting_period,
					voting_period_kind: vote.voting_period_kind,
					height: block.height(),
					time: block.block.time,
					source_id: acc.row_id,
					op_id: op.row_id,
					rolls,
					ballot: BallotVote::Yay,
				});
				prop.voters += 1;
				prop.rolls += rolls;
			}

			// a voter counts into turnout once per period
			if !counted.contains(&acc.row_id.value())
				&& tx.count_ballots(acc.row_id, vote.voting_period).await? == 0
				&& new_ballots.iter().any(|b| b.source_id == acc.row_id)
			{
				vote.turnout_rolls += rolls;
				vote.turnout_voters += 1;
				counted.insert(acc.row_id.value());
			}
		}

		self.refresh_eligibility(tx, block, &mut vote).await?;
		if vote.eligible_rolls > 0 {
			vote.turnout_pct = vote.turnout_rolls * 10000 / vote.eligible_rolls;
		}
		tx.update_vote(&vote).await?;

		for prop in proposal_map.values() {
			tx.update_proposal(prop).await?;
		}
		tx.create_ballots(&mut new_ballots).await
	}

	async fn process_ballots(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		builder: &BlockBuilder,
	) -> Result<()> {
		// skip blocks without ballots
		if block.block.n_ballot == 0 {
			return Ok(());
		}

		let mut vote = self.vote_by_height(tx, block.height()).await?;

		let mut new_ballots: Vec<Ballot> = Vec::new();
		for op in block.ops.iter().filter(|o| o.kind == OpKind::Ballot) {
			let (source, ballot) = ballot_op(block, op.op_n, op.op_c)?;
			let acc = account_of(builder, &source, op.op_n, op.op_c)?;
			let rolls = self.voter_rolls(tx, block, acc, &vote).await?;

			vote.turnout_rolls += rolls;
			vote.turnout_voters += 1;
			match ballot {
				BallotVote::Yay => {
					vote.yay_rolls += rolls;
					vote.yay_voters += 1;
				}
				BallotVote::Nay => {
					vote.nay_rolls += rolls;
					vote.nay_voters += 1;
				}
				BallotVote::Pass => {
					vote.pass_rolls += rolls;
					vote.pass_voters += 1;
				}
			}

			new_ballots.push(Ballot {
				row_id: Default::default(),
				election_id: vote.election_id,
				proposal_id: vote.proposal_id,
				voting_period: vote.voting_period,
				voting_period_kind: vote.voting_period_kind,
				height: block.height(),
				time: block.block.time,
				source_id: acc.row_id,
				op_id: op.row_id,
				rolls,
				ballot,
			});
		}

		self.refresh_eligibility(tx, block, &mut vote).await?;
		if vote.eligible_rolls > 0 {
			vote.turnout_pct = vote.turnout_rolls * 10000 / vote.eligible_rolls;
		}
		tx.update_vote(&vote).await?;
		tx.create_ballots(&mut new_ballots).await
	}

	/// Eligibility back-fill for votes opened on genesis state, keeping the
	/// quorum invariant intact.
	async fn refresh_eligibility(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		vote: &mut Vote,
	) -> Result<()> {
		if vote.eligible_rolls != 0 {
			return Ok(());
		}
		let p = &block.params;
		vote.eligible_rolls = block.chain.rolls;
		vote.eligible_voters = block.chain.roll_owners;
		vote.quorum_pct = match vote.voting_period_kind {
			VotingPeriodKind::Proposal => p.min_proposal_quorum,
			VotingPeriodKind::Testing => 0,
			VotingPeriodKind::Exploration | VotingPeriodKind::Promotion => {
				self.quorum_by_height(tx, block.height(), p).await?.0
			}
		};
		vote.quorum_rolls = vote.eligible_rolls * vote.quorum_pct / 10000;
		Ok(())
	}

	async fn election_by_height(&self, tx: &mut dyn StoreTx, height: i64) -> Result<Election> {
		tx.election_by_height(height).await?.ok_or(ArchiveError::NoEntry("election"))
	}

	async fn vote_by_height(&self, tx: &mut dyn StoreTx, height: i64) -> Result<Vote> {
		tx.vote_by_height(height).await?.ok_or(ArchiveError::NoEntry("vote"))
	}

	/// Rolls of a voter at the snapshot preceding the running period, with
	/// the pre-genesis fallback to live staking balance.
	async fn voter_rolls(
		&self,
		tx: &mut dyn StoreTx,
		block: &BlockData,
		acc: &Account,
		vote: &Vote,
	) -> Result<i64> {
		match tx.snapshot_rolls(vote.start_height - 1, acc.row_id).await? {
			Some(rolls) => {
				// fix for missing pre-genesis snapshot
				if block.cycle() == 0 && rolls == 0 {
					return Ok(acc.rolls(&block.params));
				}
				Ok(rolls)
			}
			None if block.cycle() == 0 => Ok(acc.rolls(&block.params)),
			None => Err(ArchiveError::integrity(format!(
				"missing roll snapshot for {} in vote period {} ({}) start {}",
				acc.address, vote.voting_period, vote.voting_period_kind, vote.start_height
			))),
		}
	}

	/// Quorum for the next exploration or promotion period. Returns the
	/// quorum percent and the participation EMA, both scaled by 10000.
	async fn quorum_by_height(&self, tx: &mut dyn StoreTx, height: i64, params: &Params) -> Result<(i64, i64)> {
		// find the most recent exploration or promotion period
		let last = tx.votes_before(height).await?.into_iter().find(|v| {
			matches!(v.voting_period_kind, VotingPeriodKind::Exploration | VotingPeriodKind::Promotion)
		});

		let (last_quorum, last_turnout, mut last_turnout_ema) = match last {
			Some(v) => (v.quorum_pct, v.turnout_pct, v.turnout_ema),
			None => {
				// initial protocol quorum
				if params.version < 5 {
					return Ok((8000, 0));
				}
				let ema = params.quorum_max;
				let next = params.quorum_min + ema * (params.quorum_max - params.quorum_min) / 10000;
				return Ok((next, ema));
			}
		};

		if params.version >= 5 {
			// Babylon v005 changed this to a participation EMA with caps
			let next_ema = if last_turnout_ema == 0 {
				if last_turnout == 0 {
					// init from upper bound on chains that never voted before
					last_turnout_ema = params.quorum_max;
				} else {
					// init from the last pre-Babylon quorum
					last_turnout_ema = (8 * last_quorum + 2 * last_turnout) / 10;
				}
				last_turnout_ema
			} else {
				// update using actual turnout
				(8 * last_turnout_ema + 2 * last_turnout) / 10
			};

			// q = q_min + participation_ema * (q_max - q_min)
			let next_quorum = params.quorum_min + next_ema * (params.quorum_max - params.quorum_min) / 10000;
			Ok((next_quorum, next_ema))
		} else {
			// 80/20 rule up to protocol v004
			Ok(((8 * last_quorum + 2 * last_turnout) / 10, 0))
		}
	}

	/// Reopen the vote (and election) a period-end block closed.
	async fn reopen_vote(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let mut vote = match tx.vote_by_height(block.height()).await? {
			Some(v) if !v.is_open => v,
			_ => return Ok(()),
		};

		if let Some(mut election) = tx.election_by_height(block.height()).await? {
			let mut changed = false;
			if !election.is_open && election.end_height == block.height() {
				election.is_open = true;
				election.end_height = 0;
				election.end_time = None;
				election.is_failed = false;
				election.no_quorum = false;
				election.no_majority = false;
				election.is_empty = election.num_proposals == 0;
				changed = true;
			}
			if vote.voting_period_kind == VotingPeriodKind::Proposal && !vote.proposal_id.is_zero() {
				// winner selection happened at this close
				election.proposal_id = ProposalId::default();
				changed = true;
			}
			if changed {
				tx.update_election(&election).await?;
			}
		}

		if vote.voting_period_kind == VotingPeriodKind::Proposal {
			vote.proposal_id = ProposalId::default();
		}
		vote.is_open = true;
		vote.end_time = None;
		vote.is_failed = false;
		vote.is_draw = false;
		vote.no_proposal = false;
		vote.no_quorum = false;
		vote.no_majority = false;
		tx.update_vote(&vote).await
	}

	/// Subtract the tally and turnout contributions of every ballot cast at
	/// this height.
	async fn unapply_ballots(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let height = block.height();
		let ballots = tx.ballots_by_height(height).await?;
		if ballots.is_empty() {
			return Ok(());
		}

		let mut vote = self.vote_by_height(tx, height).await?;

		match vote.voting_period_kind {
			VotingPeriodKind::Proposal => {
				// proposal tallies; rows created at this height vanish anyway
				let dropped: BTreeSet<u64> =
					tx.proposals_by_height(height).await?.into_iter().map(|p| p.row_id.value()).collect();
				let mut props: BTreeMap<u64, Proposal> = tx
					.proposals_by_election(vote.election_id)
					.await?
					.into_iter()
					.map(|p| (p.row_id.value(), p))
					.collect();
				for b in &ballots {
					if dropped.contains(&b.proposal_id.value()) {
						continue;
					}
					if let Some(prop) = props.get_mut(&b.proposal_id.value()) {
						prop.voters -= 1;
						prop.rolls -= b.rolls;
					}
				}
				for prop in props.values() {
					tx.update_proposal(prop).await?;
				}

				// turnout counted once per voter per period
				let earlier = tx.ballots_by_period(vote.voting_period).await?;
				let mut seen: BTreeSet<u64> = BTreeSet::new();
				for b in &ballots {
					let source = b.source_id.value();
					if !seen.insert(source) {
						continue;
					}
					let voted_before =
						earlier.iter().any(|e| e.source_id == b.source_id && e.height < height);
					if !voted_before {
						vote.turnout_rolls -= b.rolls;
						vote.turnout_voters -= 1;
					}
				}
			}
			VotingPeriodKind::Exploration | VotingPeriodKind::Promotion => {
				for b in &ballots {
					vote.turnout_rolls -= b.rolls;
					vote.turnout_voters -= 1;
					match b.ballot {
						BallotVote::Yay => {
							vote.yay_rolls -= b.rolls;
							vote.yay_voters -= 1;
						}
						BallotVote::Nay => {
							vote.nay_rolls -= b.rolls;
							vote.nay_voters -= 1;
						}
						BallotVote::Pass => {
							vote.pass_rolls -= b.rolls;
							vote.pass_voters -= 1;
						}
					}
				}
			}
			VotingPeriodKind::Testing => {}
		}

		vote.turnout_pct =
			if vote.eligible_rolls > 0 { vote.turnout_rolls * 10000 / vote.eligible_rolls } else { 0 };
		tx.update_vote(&vote).await
	}

	/// Take proposals created at this height back out of the election
	/// counters.
	async fn unapply_proposals(&self, tx: &mut dyn StoreTx, block: &BlockData) -> Result<()> {
		let props = tx.proposals_by_height(block.height()).await?;
		if props.is_empty() {
			return Ok(());
		}
		let mut election = self.election_by_height(tx, block.height()).await?;
		election.num_proposals -= props.len() as i64;
		if election.num_proposals == 0 {
			election.is_empty = true;
		}
		tx.update_election(&election).await
	}
}

/// Contents of a proposals op, from the raw operation backing the row.
fn proposals_op(block: &BlockData, op_n: i64, op_c: i64) -> Result<(String, Vec<String>)> {
	match block.get_rpc_op(op_n, op_c) {
		Some(RawOperation::Proposals { source, proposals, .. }) => Ok((source.clone(), proposals.clone())),
		Some(other) => Err(ArchiveError::integrity(format!(
			"proposals op [{}:{}]: unexpected contents {:?}",
			op_n, op_c, other
		))),
		None => Err(ArchiveError::integrity(format!("missing proposal op [{}:{}]", op_n, op_c))),
	}
}

/// Contents of a ballot op, from the raw operation backing the row.
fn ballot_op(block: &BlockData, op_n: i64, op_c: i64) -> Result<(String, BallotVote)> {
	match block.get_rpc_op(op_n, op_c) {
		Some(RawOperation::Ballot { source, ballot, .. }) => Ok((source.clone(), *ballot)),
		Some(other) => {
			Err(ArchiveError::integrity(format!("ballot op [{}:{}]: unexpected contents {:?}", op_n, op_c, other)))
		}
		None => Err(ArchiveError::integrity(format!("missing ballot op [{}:{}]", op_n, op_c))),
	}
}

fn account_of<'a>(builder: &'a BlockBuilder, source: &str, op_n: i64, op_c: i64) -> Result<&'a Account> {
	builder.account_by_address(source).ok_or_else(|| {
		ArchiveError::integrity(format!("missing account {} in voting op [{}:{}]", source, op_n, op_c))
	})
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use chrono::{DateTime, TimeZone, Utc};

	use super::*;
	use crate::{
		store::{mem::MemStore, Store as _, StoreTx},
		types::{AccountId, Block, Chain, ElectionId, Op, Snapshot, Supply},
	};

	fn ts(height: i64) -> DateTime<Utc> {
		Utc.timestamp(1_600_000_000 + height * 60, 0)
	}

	fn make_block(
		p: &Arc<Params>,
		height: i64,
		kind: VotingPeriodKind,
		raw_ops: Vec<Vec<RawOperation>>,
	) -> BlockData {
		let mut block = Block::new(height, ts(height));
		block.cycle = p.cycle_from_height(height);
		block.voting_period = p.voting_period_from_height(height);
		block.voting_period_kind = kind;

		let mut ops = Vec::new();
		for (op_n, list) in raw_ops.iter().enumerate() {
			for (op_c, raw) in list.iter().enumerate() {
				let op_kind = match raw {
					RawOperation::Proposals { .. } => {
						block.n_proposal += 1;
						OpKind::Proposals
					}
					RawOperation::Ballot { .. } => {
						block.n_ballot += 1;
						OpKind::Ballot
					}
					_ => OpKind::Transaction,
				};
				ops.push(Op::new(height, block.cycle, op_n as i64, op_c as i64, op_kind));
			}
		}

		let raw = crate::rpc::RawBlock {
			hash: format!("B{}", height),
			predecessor: format!("B{}", height - 1),
			height,
			time: ts(height),
			cycle: block.cycle,
			voting_period: block.voting_period,
			voting_period_kind: kind,
			priority: 0,
			baker: "tz1baker".into(),
			operations: raw_ops,
			baking_rights: Vec::new(),
			endorsing_rights: Vec::new(),
			snapshot: None,
		};

		BlockData {
			block,
			params: p.clone(),
			raw,
			parent: None,
			chain: Chain { rolls: 1000, roll_owners: 4, ..Default::default() },
			supply: Supply::default(),
			flows: Vec::new(),
			ops,
			snapshots: Vec::new(),
			contracts: Vec::new(),
			bigmap_items: Vec::new(),
			rights: Vec::new(),
			undo: Default::default(),
		}
	}

	fn seed_voter(builder: &mut BlockBuilder, id: u64, address: &str, rolls: i64, p: &Params) -> AccountId {
		let mut acc = Account::new(address, 1);
		acc.row_id = AccountId(id);
		acc.spendable_balance = rolls * p.tokens_per_roll;
		builder.seed_account(acc);
		AccountId(id)
	}

	fn proposals_op(source: &str, proposals: &[&str]) -> RawOperation {
		RawOperation::Proposals {
			source: source.into(),
			period: 0,
			proposals: proposals.iter().map(|s| s.to_string()).collect(),
		}
	}

	fn ballot_op(source: &str, ballot: BallotVote) -> RawOperation {
		RawOperation::Ballot { source: source.into(), period: 1, proposal: "P1".into(), ballot }
	}

	/// Open an exploration vote directly, the way a prior proposal period
	/// would have left it.
	async fn seed_exploration(tx: &mut dyn StoreTx, quorum_pct: i64, eligible: i64) -> Vote {
		let mut election = Election {
			row_id: Default::default(),
			proposal_id: ProposalId::default(),
			voting_period: 1,
			start_time: ts(2),
			end_time: None,
			start_height: 2,
			end_height: 0,
			num_periods: 2,
			num_proposals: 1,
			is_empty: false,
			is_open: true,
			is_failed: false,
			no_quorum: false,
			no_majority: false,
		};
		tx.create_election(&mut election).await.unwrap();
		let mut vote = Vote {
			row_id: Default::default(),
			election_id: election.row_id,
			proposal_id: ProposalId(1),
			voting_period: 1,
			voting_period_kind: VotingPeriodKind::Exploration,
			start_time: ts(17),
			end_time: None,
			start_height: 17,
			end_height: 32,
			eligible_rolls: eligible,
			eligible_voters: 4,
			quorum_pct,
			quorum_rolls: eligible * quorum_pct / 10000,
			turnout_rolls: 0,
			turnout_voters: 0,
			turnout_pct: 0,
			turnout_ema: 0,
			yay_rolls: 0,
			yay_voters: 0,
			nay_rolls: 0,
			nay_voters: 0,
			pass_rolls: 0,
			pass_voters: 0,
			is_open: true,
			is_failed: false,
			is_draw: false,
			no_proposal: false,
			no_quorum: false,
			no_majority: false,
		};
		tx.create_vote(&mut vote).await.unwrap();
		vote
	}

	async fn seed_snapshot(tx: &mut dyn StoreTx, height: i64, account: AccountId, rolls: i64) {
		let mut rows = vec![Snapshot {
			height,
			cycle: 1,
			index: 1,
			account_id: account,
			rolls,
			is_active: true,
			..Default::default()
		}];
		tx.create_snapshots(&mut rows).await.unwrap();
	}

	#[test]
	fn proposal_period_tally_and_draw() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let gov = GovIndex;
			let mut builder = BlockBuilder::new(p.clone());
			seed_voter(&mut builder, 11, "tz1v1", 100, &p);
			seed_voter(&mut builder, 12, "tz1v2", 50, &p);
			seed_voter(&mut builder, 13, "tz1v3", 150, &p);

			let mut tx = store.begin().await.unwrap();
			let open_block = make_block(&p, 2, VotingPeriodKind::Proposal, Vec::new());
			gov.open_election(tx.as_mut(), &open_block).await.unwrap();
			gov.open_vote(tx.as_mut(), &open_block).await.unwrap();

			let ops = vec![vec![
				proposals_op("tz1v1", &["P1"]),
				proposals_op("tz1v2", &["P1"]),
				proposals_op("tz1v3", &["P2"]),
			]];
			let block = make_block(&p, 3, VotingPeriodKind::Proposal, ops);
			gov.process_proposals(tx.as_mut(), &block, &builder).await.unwrap();

			let proposals = tx.proposals_by_election(ElectionId(1)).await.unwrap();
			let p1 = proposals.iter().find(|x| x.hash == "P1").unwrap();
			let p2 = proposals.iter().find(|x| x.hash == "P2").unwrap();
			assert_eq!((p1.rolls, p1.voters), (150, 2));
			assert_eq!((p2.rolls, p2.voters), (150, 1));

			let vote = tx.vote_by_height(3).await.unwrap().unwrap();
			assert_eq!(vote.turnout_rolls, 300);
			assert_eq!(vote.turnout_voters, 3);

			let close_block = make_block(&p, 16, VotingPeriodKind::Proposal, Vec::new());
			let success = gov.close_vote(tx.as_mut(), &close_block).await.unwrap();
			assert!(!success);

			let vote = tx.vote_by_height(16).await.unwrap().unwrap();
			assert!(vote.is_draw);
			assert!(vote.is_failed);
			assert!(!vote.no_proposal);
			assert!(!vote.no_quorum);
			let election = tx.election_by_height(16).await.unwrap().unwrap();
			assert_eq!(election.proposal_id, ProposalId::default());
		});
	}

	#[test]
	fn proposal_period_unique_winner() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let gov = GovIndex;
			let mut builder = BlockBuilder::new(p.clone());
			seed_voter(&mut builder, 11, "tz1v1", 100, &p);
			seed_voter(&mut builder, 13, "tz1v3", 150, &p);

			let mut tx = store.begin().await.unwrap();
			let open_block = make_block(&p, 2, VotingPeriodKind::Proposal, Vec::new());
			gov.open_election(tx.as_mut(), &open_block).await.unwrap();
			gov.open_vote(tx.as_mut(), &open_block).await.unwrap();

			let ops = vec![vec![proposals_op("tz1v1", &["P1"]), proposals_op("tz1v3", &["P2"])]];
			let block = make_block(&p, 3, VotingPeriodKind::Proposal, ops);
			gov.process_proposals(tx.as_mut(), &block, &builder).await.unwrap();

			let close_block = make_block(&p, 16, VotingPeriodKind::Proposal, Vec::new());
			let success = gov.close_vote(tx.as_mut(), &close_block).await.unwrap();
			assert!(success);

			let winner =
				tx.proposals_by_election(ElectionId(1)).await.unwrap().into_iter().find(|x| x.hash == "P2").unwrap();
			let vote = tx.vote_by_height(16).await.unwrap().unwrap();
			let election = tx.election_by_height(16).await.unwrap().unwrap();
			assert_eq!(vote.proposal_id, winner.row_id);
			assert_eq!(election.proposal_id, winner.row_id);
		});
	}

	#[test]
	fn exploration_majority_passes() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let gov = GovIndex;
			let mut builder = BlockBuilder::new(p.clone());
			let v1 = seed_voter(&mut builder, 11, "tz1v1", 600, &p);
			let v2 = seed_voter(&mut builder, 12, "tz1v2", 100, &p);
			let v3 = seed_voter(&mut builder, 13, "tz1v3", 100, &p);

			let mut tx = store.begin().await.unwrap();
			seed_exploration(tx.as_mut(), 7000, 1000).await;
			seed_snapshot(tx.as_mut(), 16, v1, 600).await;
			seed_snapshot(tx.as_mut(), 16, v2, 100).await;
			seed_snapshot(tx.as_mut(), 16, v3, 100).await;

			let ops = vec![vec![
				ballot_op("tz1v1", BallotVote::Yay),
				ballot_op("tz1v2", BallotVote::Nay),
				ballot_op("tz1v3", BallotVote::Pass),
			]];
			let block = make_block(&p, 18, VotingPeriodKind::Exploration, ops);
			gov.process_ballots(tx.as_mut(), &block, &builder).await.unwrap();

			let vote = tx.vote_by_height(18).await.unwrap().unwrap();
			assert_eq!(vote.turnout_rolls, 800);
			assert_eq!((vote.yay_rolls, vote.nay_rolls, vote.pass_rolls), (600, 100, 100));

			let close_block = make_block(&p, 32, VotingPeriodKind::Exploration, Vec::new());
			let success = gov.close_vote(tx.as_mut(), &close_block).await.unwrap();
			assert!(success);
			let vote = tx.vote_by_height(32).await.unwrap().unwrap();
			assert!(!vote.no_quorum);
			assert!(!vote.no_majority);
			assert!(!vote.is_failed);
		});
	}

	#[test]
	fn exploration_no_majority_fails() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let gov = GovIndex;
			let mut builder = BlockBuilder::new(p.clone());
			let v1 = seed_voter(&mut builder, 11, "tz1v1", 500, &p);
			let v2 = seed_voter(&mut builder, 12, "tz1v2", 200, &p);
			let v3 = seed_voter(&mut builder, 13, "tz1v3", 100, &p);

			let mut tx = store.begin().await.unwrap();
			seed_exploration(tx.as_mut(), 7000, 1000).await;
			seed_snapshot(tx.as_mut(), 16, v1, 500).await;
			seed_snapshot(tx.as_mut(), 16, v2, 200).await;
			seed_snapshot(tx.as_mut(), 16, v3, 100).await;

			let ops = vec![vec![
				ballot_op("tz1v1", BallotVote::Yay),
				ballot_op("tz1v2", BallotVote::Nay),
				ballot_op("tz1v3", BallotVote::Pass),
			]];
			let block = make_block(&p, 18, VotingPeriodKind::Exploration, ops);
			gov.process_ballots(tx.as_mut(), &block, &builder).await.unwrap();

			let close_block = make_block(&p, 32, VotingPeriodKind::Exploration, Vec::new());
			let success = gov.close_vote(tx.as_mut(), &close_block).await.unwrap();
			assert!(!success);
			let vote = tx.vote_by_height(32).await.unwrap().unwrap();
			assert!(!vote.no_quorum);
			assert!(vote.no_majority);
			assert!(vote.is_failed);
		});
	}

	#[test]
	fn quorum_ema_rolls_forward() {
		crate::initialize();
		smol::block_on(async {
			let p = Params::test(6);
			let store = MemStore::new();
			let gov = GovIndex;
			let mut tx = store.begin().await.unwrap();
			let mut prior = seed_exploration(tx.as_mut(), 7000, 1000).await;
			prior.turnout_pct = 5000;
			prior.turnout_ema = 6000;
			prior.is_open = false;
			tx.update_vote(&prior).await.unwrap();

			let (quorum, ema) = gov.quorum_by_height(tx.as_mut(), 33, &p).await.unwrap();
			assert_eq!(ema, (8 * 6000 + 2 * 5000) / 10);
			assert_eq!(ema, 5800);
			assert_eq!(quorum, 2000 + 5800 * (7000 - 2000) / 10000);
			assert_eq!(quorum, 4900);
		});
	}

	#[test]
	fn quorum_defaults_without_prior_votes() {
		crate::initialize();
		smol::block_on(async {
			let store = MemStore::new();
			let gov = GovIndex;
			let mut tx = store.begin().await.unwrap();

			let v4 = Params::test(4);
			assert_eq!(gov.quorum_by_height(tx.as_mut(), 10, &v4).await.unwrap(), (8000, 0));

			let v6 = Params::test(6);
			let (quorum, ema) = gov.quorum_by_height(tx.as_mut(), 10, &v6).await.unwrap();
			assert_eq!(ema, 7000);
			assert_eq!(quorum, 2000 + 7000 * (7000 - 2000) / 10000);
		});
	}

	#[test]
	fn disconnect_restores_tallies() {
		crate::initialize();
		smol::block_on(async {
			let p = Arc::new(Params::test(6));
			let store = MemStore::new();
			let gov = GovIndex;
			let mut builder = BlockBuilder::new(p.clone());
			seed_voter(&mut builder, 11, "tz1v1", 100, &p);
			seed_voter(&mut builder, 13, "tz1v3", 150, &p);

			let mut tx = store.begin().await.unwrap();
			let open_block = make_block(&p, 2, VotingPeriodKind::Proposal, Vec::new());
			gov.open_election(tx.as_mut(), &open_block).await.unwrap();
			gov.open_vote(tx.as_mut(), &open_block).await.unwrap();

			let vote_before = tx.vote_by_height(2).await.unwrap().unwrap();
			let election_before = tx.election_by_height(2).await.unwrap().unwrap();

			let ops = vec![vec![proposals_op("tz1v1", &["P1"]), proposals_op("tz1v3", &["P2"])]];
			let block = make_block(&p, 3, VotingPeriodKind::Proposal, ops);
			gov.process_proposals(tx.as_mut(), &block, &builder).await.unwrap();
			assert_eq!(tx.ballots_by_height(3).await.unwrap().len(), 2);

			gov.disconnect_block(tx.as_mut(), &block, &builder).await.unwrap();

			assert_eq!(tx.vote_by_height(3).await.unwrap().unwrap(), vote_before);
			assert_eq!(tx.election_by_height(3).await.unwrap().unwrap(), election_before);
			assert!(tx.ballots_by_height(3).await.unwrap().is_empty());
			assert!(tx.proposals_by_election(ElectionId(1)).await.unwrap().is_empty());
		});
	}
}
