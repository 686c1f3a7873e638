//! Import decoder for transfer files
//!
//! Decoding is all-or-nothing: a payload either yields fully formed records
//! or a [`DecodeError`], never a partially applied record.

use dce_common::models::{ShareableRecord, ShareableRecordBundle, TRANSFER_FORMAT_VERSION};
use serde::de::IgnoredAny;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Why a transfer payload was refused
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Transfer file is empty")]
    Empty,

    /// Malformed JSON, a missing field, or an unparseable value; the message
    /// names the field or value and its position
    #[error("Invalid transfer file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported transfer format version {found:?} (this build reads {supported}.x)")]
    UnsupportedVersion { found: String, supported: u32 },
}

/// A decoded transfer file of either shape
#[derive(Debug, Clone, PartialEq)]
pub enum TransferPayload {
    Single(ShareableRecord),
    Bundle(ShareableRecordBundle),
}

impl TransferPayload {
    /// Records in file order
    pub fn into_records(self) -> Vec<ShareableRecord> {
        match self {
            TransferPayload::Single(record) => vec![record],
            TransferPayload::Bundle(bundle) => bundle.drivers,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TransferPayload::Single(_) => 1,
            TransferPayload::Bundle(bundle) => bundle.drivers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Top-level shape probe: bundles carry a `drivers` array
#[derive(Deserialize)]
struct ShapeProbe {
    #[serde(default)]
    drivers: Option<IgnoredAny>,
}

fn supported_major() -> u32 {
    major_version(TRANSFER_FORMAT_VERSION).unwrap_or(1)
}

fn major_version(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}

/// Accept any version whose major component this build understands
pub fn check_version(version: &str) -> Result<(), DecodeError> {
    let supported = supported_major();
    match major_version(version) {
        Some(major) if major <= supported => Ok(()),
        _ => Err(DecodeError::UnsupportedVersion {
            found: version.to_string(),
            supported,
        }),
    }
}

fn ensure_not_empty(bytes: &[u8]) -> Result<(), DecodeError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        Err(DecodeError::Empty)
    } else {
        Ok(())
    }
}

/// Decode a single shared record
pub fn decode_record(bytes: &[u8]) -> Result<ShareableRecord, DecodeError> {
    ensure_not_empty(bytes)?;
    let record: ShareableRecord = serde_json::from_slice(bytes)?;
    check_version(&record.version)?;
    Ok(record)
}

/// Decode a bundle of shared records
pub fn decode_bundle(bytes: &[u8]) -> Result<ShareableRecordBundle, DecodeError> {
    ensure_not_empty(bytes)?;
    let bundle: ShareableRecordBundle = serde_json::from_slice(bytes)?;
    check_version(&bundle.version)?;
    for record in &bundle.drivers {
        check_version(&record.version)?;
    }
    if bundle.count != bundle.drivers.len() {
        warn!(
            declared = bundle.count,
            actual = bundle.drivers.len(),
            "Bundle count does not match its records, using the records"
        );
    }
    Ok(bundle)
}

/// Decode either shape, telling them apart by a top-level `drivers` array
pub fn decode_transfer(bytes: &[u8]) -> Result<TransferPayload, DecodeError> {
    ensure_not_empty(bytes)?;
    let probe: ShapeProbe = serde_json::from_slice(bytes)?;
    if probe.drivers.is_some() {
        decode_bundle(bytes).map(TransferPayload::Bundle)
    } else {
        decode_record(bytes).map(TransferPayload::Single)
    }
}
