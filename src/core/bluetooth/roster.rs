//! Discovered device roster
//! Keeps one row per physical device, merging repeat sightings in place.

use log::debug;

use crate::core::bluetooth::constants::{ADDRESS_SENTINELS, NO_ADDRESS_PREFIX, UNNAMED_DEVICE};
use crate::core::bluetooth::types::{Advertisement, PeripheralRecord};

/// Outcome of merging one advertisement into the roster
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted(PeripheralRecord),
    Updated(PeripheralRecord),
    Unchanged,
}

/// Ordered list of discovered devices for the current scan window
#[derive(Debug, Default)]
pub struct Roster {
    records: Vec<PeripheralRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeripheralRecord> {
        self.records.clone()
    }

    /// Finds a record by address, platform id, or name for unverified rows
    pub fn find(&self, key: &str) -> Option<&PeripheralRecord> {
        self.records.iter().find(|r| r.matches_key(key))
    }

    /// Merges a sighting. A sentinel name never overwrites a real one,
    /// and a newly available address upgrades a name-keyed row.
    pub fn upsert(&mut self, advertisement: &Advertisement) -> Upsert {
        let display_name = resolve_display_name(
            advertisement.local_name.as_deref(),
            advertisement.device_name.as_deref(),
        );
        let address = normalize_address(advertisement.address.as_deref());

        let Some(index) = self.position_of(&advertisement.id, address.as_deref(), &display_name)
        else {
            let record = PeripheralRecord {
                id: advertisement.id.clone(),
                identity_verified: address.is_some(),
                display_name,
                address,
                rssi: advertisement.rssi,
            };
            debug!("New roster entry {}", record.identity_key());
            self.records.push(record.clone());
            return Upsert::Inserted(record);
        };

        let record = &mut self.records[index];
        let mut changed = false;

        if display_name != UNNAMED_DEVICE && record.display_name != display_name {
            record.display_name = display_name;
            changed = true;
        }
        if record.address.is_none() && address.is_some() {
            record.address = address;
            record.identity_verified = true;
            changed = true;
        }
        if advertisement.rssi.is_some() && record.rssi != advertisement.rssi {
            record.rssi = advertisement.rssi;
            changed = true;
        }
        // The platform id may change between sightings on some stacks; keep the latest
        if record.id != advertisement.id {
            record.id = advertisement.id.clone();
            changed = true;
        }

        if changed {
            Upsert::Updated(record.clone())
        } else {
            Upsert::Unchanged
        }
    }

    fn position_of(&self, id: &str, address: Option<&str>, name: &str) -> Option<usize> {
        if let Some(address) = address {
            if let Some(i) = self
                .records
                .iter()
                .position(|r| r.address.as_deref() == Some(address))
            {
                return Some(i);
            }
        }
        if let Some(i) = self.records.iter().position(|r| r.id == id) {
            // Same platform device, unless both sides carry conflicting addresses
            let existing = &self.records[i];
            if existing.address.is_none() || address.is_none() || existing.address.as_deref() == address {
                return Some(i);
            }
        }
        // Weak fallback: a real name matches a row that has no address yet.
        // The sentinel name is not an identity.
        if name != UNNAMED_DEVICE {
            return self.records.iter().position(|r| {
                r.display_name == name && (r.address.is_none() || address.is_none())
            });
        }
        None
    }
}

/// Advertised name, else platform name, else the "(Unnamed)" sentinel
pub fn resolve_display_name(local_name: Option<&str>, device_name: Option<&str>) -> String {
    [local_name, device_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNNAMED_DEVICE.to_string())
}

/// Maps empty strings and platform placeholders to `None` and upper-cases real addresses
pub fn normalize_address(address: Option<&str>) -> Option<String> {
    let address = address?.trim();
    if address.is_empty()
        || address.starts_with(NO_ADDRESS_PREFIX)
        || ADDRESS_SENTINELS
            .iter()
            .any(|sentinel| sentinel.eq_ignore_ascii_case(address))
    {
        return None;
    }
    Some(address.to_uppercase())
}
