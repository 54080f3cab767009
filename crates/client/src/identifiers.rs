// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Identifiers for accounts and the backend instances serving them.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use ustr::Ustr;

use crate::error::SyncError;

/// Identifier of a trading account or of one of its region replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Ustr);

impl AccountId {
    /// Creates a new [`AccountId`] instance.
    #[must_use]
    pub fn new(value: &str) -> Self {
        Self(Ustr::from(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[must_use]
    pub const fn inner(&self) -> Ustr {
        self.0
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One logical backend process serving part of an account's traffic.
///
/// Rendered on the wire as `region:instanceNumber:host` and parsed once at the transport
/// boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub region: Ustr,
    pub instance_number: u32,
    pub host: Ustr,
}

impl InstanceKey {
    /// Creates a new [`InstanceKey`] instance.
    #[must_use]
    pub fn new(region: &str, instance_number: u32, host: &str) -> Self {
        Self {
            region: Ustr::from(region),
            instance_number,
            host: Ustr::from(host),
        }
    }

    /// Returns whether this key belongs to the given region and instance slot.
    #[must_use]
    pub fn is_slot(&self, region: &str, instance_number: u32) -> bool {
        self.region.as_str() == region && self.instance_number == instance_number
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.region, self.instance_number, self.host)
    }
}

impl FromStr for InstanceKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(region), Some(number), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(SyncError::Validation(format!(
                "Invalid instance key '{s}', expected 'region:instanceNumber:host'"
            )));
        };
        if region.is_empty() || host.is_empty() {
            return Err(SyncError::Validation(format!(
                "Invalid instance key '{s}', empty region or host"
            )));
        }
        let instance_number = number.parse::<u32>().map_err(|e| {
            SyncError::Validation(format!("Invalid instance number in '{s}': {e}"))
        })?;
        Ok(Self::new(region, instance_number, host))
    }
}

/// An [`InstanceKey`] qualified by the primary account it serves.
///
/// Rendered as `accountId:region:instanceNumber:host`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountInstanceId {
    pub account_id: AccountId,
    pub key: InstanceKey,
}

impl AccountInstanceId {
    /// Creates a new [`AccountInstanceId`] instance.
    #[must_use]
    pub const fn new(account_id: AccountId, key: InstanceKey) -> Self {
        Self { account_id, key }
    }

    #[must_use]
    pub const fn region(&self) -> Ustr {
        self.key.region
    }
}

impl Display for AccountInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.account_id, self.key)
    }
}

impl FromStr for AccountInstanceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((account, key)) = s.split_once(':') else {
            return Err(SyncError::Validation(format!(
                "Invalid account instance id '{s}'"
            )));
        };
        if account.is_empty() {
            return Err(SyncError::Validation(format!(
                "Invalid account instance id '{s}', empty account"
            )));
        }
        Ok(Self::new(AccountId::new(account), key.parse()?))
    }
}
