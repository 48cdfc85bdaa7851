//! Static process-variable mapping table.
//!
//! A [`PdoRegistration`] names a process variable and the slave entry it
//! lives in. Registering the table with a domain yields one
//! [`ProcessVariableBinding`] per entry: the variable's slot in domain memory.
//! Bindings are immutable once created.

use pdx_common::config::BindingConfig;
use pdx_common::error::{PdxError, PdxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bus address of a slave: an alias plus a position relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SlaveAddress {
    /// Station alias, 0 for absolute ring positions.
    pub alias: u16,
    /// Position behind the alias.
    pub position: u16,
}

impl SlaveAddress {
    /// Absolute ring position.
    #[must_use]
    pub fn position(position: u16) -> Self {
        Self { alias: 0, position }
    }
}

impl fmt::Display for SlaveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alias == 0 {
            write!(f, "{}", self.position)
        } else {
            write!(f, "#{}:{}", self.alias, self.position)
        }
    }
}

/// Error parsing a slave address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlaveAddressError {
    /// The string was empty.
    #[error("empty slave address")]
    Empty,
    /// An alias address without the `:<position>` part.
    #[error("alias address {0:?} lacks a position")]
    MissingPosition(String),
    /// A number did not fit into 16 bits.
    #[error("invalid number {0:?} in slave address")]
    InvalidNumber(String),
}

impl FromStr for SlaveAddress {
    type Err = SlaveAddressError;

    /// Parses `"<position>"` or `"#<alias>:<position>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SlaveAddressError::Empty);
        }

        let number = |part: &str| {
            part.parse::<u16>()
                .map_err(|_| SlaveAddressError::InvalidNumber(part.to_string()))
        };

        match s.strip_prefix('#') {
            Some(rest) => {
                let (alias, position) = rest
                    .split_once(':')
                    .ok_or_else(|| SlaveAddressError::MissingPosition(s.to_string()))?;
                Ok(Self {
                    alias: number(alias)?,
                    position: number(position)?,
                })
            }
            None => Ok(Self::position(number(s)?)),
        }
    }
}

/// One row of the mapping table handed to the bus master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoRegistration {
    /// Variable name.
    pub name: String,
    /// Slave holding the entry.
    pub slave: SlaveAddress,
    /// Expected vendor id.
    pub vendor_id: u32,
    /// Expected product code.
    pub product_code: u32,
    /// Entry index.
    pub index: u16,
    /// Entry subindex.
    pub subindex: u8,
    /// Entry width in bits.
    pub bit_len: u8,
}

impl TryFrom<&BindingConfig> for PdoRegistration {
    type Error = PdxError;

    fn try_from(config: &BindingConfig) -> PdxResult<Self> {
        let slave = config
            .slave
            .parse()
            .map_err(|e| PdxError::Config(format!("binding {}: {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            slave,
            vendor_id: config.vendor_id,
            product_code: config.product_code,
            index: config.index,
            subindex: config.subindex,
            bit_len: config.bit_len,
        })
    }
}

/// Convert a configured table into registrations.
///
/// # Errors
///
/// Returns [`PdxError::Config`] for the first malformed slave address.
pub fn registrations_from_config(table: &[BindingConfig]) -> PdxResult<Vec<PdoRegistration>> {
    table.iter().map(PdoRegistration::try_from).collect()
}

/// Resolved slot of a process variable in domain memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessVariableBinding {
    /// Variable name.
    pub name: String,
    /// Byte offset in domain memory.
    pub offset: usize,
    /// Bit position inside the first byte, for sub-byte entries.
    pub bit_position: u8,
    /// Width in bits.
    pub bit_len: u8,
}

impl ProcessVariableBinding {
    /// Number of bytes spanned by the slot.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        (usize::from(self.bit_position) + usize::from(self.bit_len)).div_ceil(8)
    }
}

/// Set of bindings owned by a domain.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: Vec<ProcessVariableBinding>,
}

impl BindingTable {
    /// Wrap the bindings returned by registration.
    #[must_use]
    pub fn new(bindings: Vec<ProcessVariableBinding>) -> Self {
        Self { bindings }
    }

    /// Look up a binding by variable name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProcessVariableBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True if no variables are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate over all bindings.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessVariableBinding> {
        self.bindings.iter()
    }

    /// Highest byte touched by any binding, i.e. the minimum image size.
    #[must_use]
    pub fn required_size(&self) -> usize {
        self.bindings
            .iter()
            .map(|b| b.offset + b.byte_len())
            .max()
            .unwrap_or(0)
    }
}
