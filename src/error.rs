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

use std::{env, io, num};

use thiserror::Error;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Tezos Archive Error Enum
#[derive(Debug, Error)]
pub enum ArchiveError {
	// Rust std io error
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Env(#[from] env::VarError),
	#[error(transparent)]
	Conversion(#[from] num::TryFromIntError),

	// encoding error
	#[error(transparent)]
	Serialization(#[from] serde_json::Error),

	// channel error
	#[error("Sending on a disconnected channel")]
	Channel,

	/// a query expected a row that the store does not hold
	#[error("{0} not found")]
	NoEntry(&'static str),

	/// missing account, snapshot or rights data inside a block transaction
	#[error("data integrity: {0}")]
	Integrity(String),

	/// indexer and node disagree on protocol state, e.g. a vote closed twice
	#[error("protocol contract violation: {0}")]
	ContractViolation(String),

	/// parent hash of the incoming block does not extend the local head
	#[error("reorg detected at height {height}")]
	ReorgDetected { height: i64 },

	/// transient RPC failure, retried by the crawler
	#[error("rpc: {0}")]
	Rpc(String),

	#[error("store: {0}")]
	Store(String),

	#[error("configuration: {0}")]
	Configuration(String),

	#[error("{0}")]
	Shutdown(String),

	#[error("Rust Standard Library does not support negative durations")]
	TimestampOutOfRange,
}

impl ArchiveError {
	/// Transient errors are retried with backoff; everything else aborts the
	/// current block transaction.
	pub fn is_transient(&self) -> bool {
		matches!(self, ArchiveError::Rpc(_))
	}

	pub fn integrity(msg: impl Into<String>) -> Self {
		ArchiveError::Integrity(msg.into())
	}

	pub fn contract(msg: impl Into<String>) -> Self {
		ArchiveError::ContractViolation(msg.into())
	}
}

impl<T> From<flume::SendError<T>> for ArchiveError {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}

impl From<flume::RecvError> for ArchiveError {
	fn from(_: flume::RecvError) -> Self {
		Self::Channel
	}
}
