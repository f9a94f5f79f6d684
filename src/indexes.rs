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

//! One sub-index per table family. Each implements the three driver
//! capabilities; `DisconnectBlock` is the exact inverse of `ConnectBlock`
//! so a connect/disconnect pair leaves every table unchanged.

pub mod account;
pub mod bigmap;
pub mod block;
pub mod chain;
pub mod contract;
pub mod flow;
pub mod governance;
pub mod income;
pub mod op;
pub mod rights;
pub mod snapshot;
pub mod supply;

pub use self::{
	account::AccountIndex, bigmap::BigmapIndex, block::BlockIndex, chain::ChainIndex, contract::ContractIndex,
	flow::FlowIndex, governance::GovIndex, income::IncomeIndex, op::OpIndex, rights::RightsIndex,
	snapshot::SnapshotIndex, supply::SupplyIndex,
};
