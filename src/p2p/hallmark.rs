//! Hallmarks: signed host/weight attestations.
//!
//! Wire form is a hex string of
//! `public key (32) | host length (u16 LE) | host | weight (u32 LE) | date (u32 LE, yyyymmdd) | nonce (1) | signature (64)`
//! where the ed25519 signature covers every byte before it.

use chrono::{Datelike, NaiveDate};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::address::parse_address;
use crate::chain::AccountId;

/// Largest weight a hallmark may claim (whole units of the total supply)
pub const MAX_BALANCE: u64 = 1_000_000_000;
/// Base units per whole unit
pub const ONE_UNIT: u64 = 100_000_000;

const MAX_HOST_LENGTH: usize = 300;
const MAX_VALID_HOST_LENGTH: usize = 100;
const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HallmarkError {
    #[error("hallmark is not valid hex")]
    Hex,
    #[error("hallmark is truncated")]
    Truncated,
    #[error("invalid host length {0}")]
    HostLength(usize),
    #[error("hallmark host is not UTF-8")]
    HostEncoding,
    #[error("weight {0} out of range")]
    Weight(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hallmark {
    encoded: String,
    public_key: [u8; 32],
    host: String,
    weight: u32,
    date: u32,
    port: u16,
    valid: bool,
}

impl Hallmark {
    /// Decode a hallmark. Structural problems are errors; a bad signature or
    /// out-of-range weight yields a hallmark with `is_valid() == false`.
    pub fn parse(encoded: &str, default_port: u16) -> Result<Self, HallmarkError> {
        let encoded = encoded.trim().to_ascii_lowercase();
        let bytes = hex::decode(&encoded).map_err(|_| HallmarkError::Hex)?;
        let mut reader = Reader::new(&bytes);

        let public_key: [u8; 32] = reader.array()?;
        let host_len = usize::from(u16::from_le_bytes(reader.array()?));
        if host_len > MAX_HOST_LENGTH {
            return Err(HallmarkError::HostLength(host_len));
        }
        let host = std::str::from_utf8(reader.take(host_len)?)
            .map_err(|_| HallmarkError::HostEncoding)?
            .to_string();
        let weight = u32::from_le_bytes(reader.array()?);
        let date = u32::from_le_bytes(reader.array()?);
        reader.take(1)?;
        let signature: [u8; SIGNATURE_LENGTH] = reader.array()?;
        let signed = &bytes[..bytes.len() - SIGNATURE_LENGTH];

        let parsed_host = parse_address(&host);
        let port = parsed_host
            .as_ref()
            .map(|a| a.port_or(default_port))
            .unwrap_or(default_port);

        let valid = parsed_host.is_some()
            && host.len() < MAX_VALID_HOST_LENGTH
            && weight > 0
            && u64::from(weight) <= MAX_BALANCE
            && verify(&public_key, signed, &signature);

        Ok(Self {
            encoded,
            public_key,
            host,
            weight,
            date,
            port,
            valid,
        })
    }

    /// Create a signed hallmark for `host`.
    pub fn generate(
        key: &SigningKey,
        host: &str,
        weight: u32,
        date: u32,
    ) -> Result<String, HallmarkError> {
        let host_bytes = host.as_bytes();
        if host_bytes.len() > MAX_HOST_LENGTH {
            return Err(HallmarkError::HostLength(host_bytes.len()));
        }
        if weight == 0 || u64::from(weight) > MAX_BALANCE {
            return Err(HallmarkError::Weight(weight));
        }
        let mut data = Vec::with_capacity(32 + 2 + host_bytes.len() + 9 + SIGNATURE_LENGTH);
        data.extend_from_slice(key.verifying_key().as_bytes());
        data.extend_from_slice(&(host_bytes.len() as u16).to_le_bytes());
        data.extend_from_slice(host_bytes);
        data.extend_from_slice(&weight.to_le_bytes());
        data.extend_from_slice(&date.to_le_bytes());
        data.push(0);
        let signature = key.sign(&data);
        data.extend_from_slice(&signature.to_bytes());
        Ok(hex::encode(data))
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn account_id(&self) -> AccountId {
        account_id(&self.public_key)
    }

    /// Host exactly as signed, possibly including a port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host without any port suffix
    pub fn host_name(&self) -> String {
        parse_address(&self.host)
            .map(|a| a.host)
            .unwrap_or_else(|| self.host.clone())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Issue date as yyyymmdd
    pub fn date(&self) -> u32 {
        self.date
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Account id of a public key: first 8 bytes (LE) of its SHA-256 digest.
pub fn account_id(public_key: &[u8; 32]) -> AccountId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(id)
}

/// yyyymmdd encoding of a calendar date
pub fn hallmark_date(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 10_000 + date.month() * 100 + date.day()
}

/// Parse `yyyy-mm-dd` into the hallmark date encoding
pub fn parse_hallmark_date(s: &str) -> Option<u32> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .map(hallmark_date)
}

fn verify(public_key: &[u8; 32], data: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(data, &Signature::from_bytes(signature)).is_ok()
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HallmarkError> {
        let end = self.pos.checked_add(n).ok_or(HallmarkError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(HallmarkError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], HallmarkError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
