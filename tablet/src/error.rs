/*
 * Created on Mon Jan 15 2024
 *
 * This file is a part of Tabletd
 * Tabletd is a free and open-source, horizontally-partitioned columnar
 * storage engine providing snapshot-isolated, replicated tablets for
 * structured data.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use std::{fmt, io};

/// The crate-wide result alias. Every fallible public operation in this
/// engine returns this.
pub type RuntimeResult<T> = Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
    pub const fn with_kind(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

/// The error taxonomy every per-op failure, background task failure, and
/// bootstrap failure is classified under.
#[derive(Debug)]
pub enum ErrorKind {
    NotFound,
    AlreadyPresent,
    InvalidArgument(&'static str),
    Corruption(&'static str),
    IoError(io::Error),
    IllegalState(&'static str),
    ServiceUnavailable,
    Aborted,
    TimedOut,
    EndOfFile,
    Uninitialized,
    NotSupported(&'static str),
    RuntimeError(String),
    ConfigurationError(String),
    Storage(StorageError),
    Txn(TransactionError),
    Mvcc(MvccError),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyPresent => write!(f, "already present"),
            Self::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            Self::Corruption(m) => write!(f, "corruption detected: {m}"),
            Self::IoError(e) => write!(f, "i/o error: {e}"),
            Self::IllegalState(m) => write!(f, "illegal state: {m}"),
            Self::ServiceUnavailable => write!(f, "service unavailable"),
            Self::Aborted => write!(f, "aborted"),
            Self::TimedOut => write!(f, "timed out"),
            Self::EndOfFile => write!(f, "end of file"),
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::NotSupported(m) => write!(f, "not supported: {m}"),
            Self::RuntimeError(m) => write!(f, "runtime error: {m}"),
            Self::ConfigurationError(m) => write!(f, "configuration error: {m}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Txn(e) => write!(f, "transaction error: {e}"),
            Self::Mvcc(e) => write!(f, "mvcc error: {e}"),
        }
    }
}

/// Errors specific to the on-disk block container, WAL, or rowset format.
#[derive(Debug)]
pub enum StorageError {
    /// a log-container was found with `.data` xor `.metadata` missing, or
    /// either below the minimum valid length
    ContainerIncomplete,
    /// `.metadata` had a truncated trailing record
    ContainerTruncatedMetadata,
    /// a CREATE record referenced a range that was never hole-punched
    ContainerUnpunchedTail,
    /// a CREATE record referenced a misaligned, inadmissible gap
    ContainerMisalignedBlock,
    /// the WAL segment's magic bytes didn't match
    WalBadMagic,
    /// an entry-batch header failed its CRC check
    WalCrcMismatch,
    /// a segment's footer is missing and could not be reconstructed
    WalFooterMissing,
    /// the log-reader's segment sequence has a gap
    WalSegmentSequenceGap,
    /// within one batch, entry indexes were not strictly increasing
    WalEntryIndexOutOfOrder,
    /// a DRS's delta carries a pre-creation timestamp outside of bootstrap replay
    DeltaTimestampPrecedesCreation,
    /// the ad-hoc PK index or bloom filter failed to decode
    PkIndexCorrupted,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::ContainerIncomplete => "incomplete log-container (data/metadata mismatch)",
            Self::ContainerTruncatedMetadata => "truncated trailing metadata record",
            Self::ContainerUnpunchedTail => "deleted block range was never hole-punched",
            Self::ContainerMisalignedBlock => "misaligned block placement",
            Self::WalBadMagic => "bad WAL segment magic",
            Self::WalCrcMismatch => "WAL entry batch failed CRC check",
            Self::WalFooterMissing => "WAL segment footer missing",
            Self::WalSegmentSequenceGap => "gap in WAL segment sequence",
            Self::WalEntryIndexOutOfOrder => "out-of-order entry index within WAL batch",
            Self::DeltaTimestampPrecedesCreation => "delta timestamp precedes rowset creation",
            Self::PkIndexCorrupted => "primary key index corrupted",
        };
        write!(f, "{msg}")
    }
}

/// Errors from replaying or applying WAL-sourced operations.
#[derive(Debug)]
pub enum TransactionError {
    /// a COMMITted REPLICATE referenced an op id already reflected on disk
    AlreadyApplied,
    /// a REPLICATE was committed but never found in the segment
    MissingReplicate,
    /// re-applying an op during bootstrap hit a conflict the write path
    /// shouldn't be able to produce outside of corruption
    ReplayConflict,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AlreadyApplied => "operation already applied",
            Self::MissingReplicate => "commit with no matching replicate",
            Self::ReplayConflict => "conflict while replaying a committed operation",
        };
        write!(f, "{msg}")
    }
}

/// Errors surfaced by the MVCC coordinator's waiter API.
#[derive(Debug)]
pub enum MvccError {
    TimedOut,
    Aborted,
}

impl fmt::Display for MvccError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out waiting on mvcc condition"),
            Self::Aborted => write!(f, "mvcc manager closed while waiting"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Self::with_kind(ErrorKind::EndOfFile);
        }
        Self::with_kind(ErrorKind::IoError(e))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::with_kind(ErrorKind::Storage(e))
    }
}

impl From<TransactionError> for Error {
    fn from(e: TransactionError) -> Self {
        Self::with_kind(ErrorKind::Txn(e))
    }
}

impl From<MvccError> for Error {
    fn from(e: MvccError) -> Self {
        Self::with_kind(ErrorKind::Mvcc(e))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::with_kind(ErrorKind::ConfigurationError(e.to_string()))
    }
}
