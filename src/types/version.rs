use std::{collections::BTreeMap, fmt};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::{
    error::{Result, RoomservError},
    keys::{self, Element, Versionstamp, ZERO_VERSIONSTAMP},
};

/// Sub-stream identifiers inside a sync cursor. Each maps to one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionKey(&'static str);

impl VersionKey {
    pub const ROOMS: VersionKey = VersionKey("r");
    pub const ACCOUNTS: VersionKey = VersionKey("a");
    /// Reserved for the transient database (typing, presence, to-device);
    /// carried in cursors but currently always empty.
    pub const DEVICES: VersionKey = VersionKey("d");

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "r" => Some(Self::ROOMS),
            "a" => Some(Self::ACCOUNTS),
            "d" => Some(Self::DEVICES),
            _ => None,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Per-sub-stream last-seen versions; the pagination cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMap {
    entries: BTreeMap<&'static str, Versionstamp>,
}

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: VersionKey) -> Versionstamp {
        self.entries
            .get(key.as_str())
            .copied()
            .unwrap_or(ZERO_VERSIONSTAMP)
    }

    pub fn set(&mut self, key: VersionKey, version: Versionstamp) {
        self.entries.insert(key.as_str(), version);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered-tuple encoding of the map, base64-url encoded. The empty
    /// string is the initial-sync cursor.
    pub fn to_cursor(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut elems = Vec::with_capacity(self.entries.len() * 2);
        for (key, version) in &self.entries {
            elems.push(Element::Str((*key).to_owned()));
            elems.push(Element::Version(*version));
        }
        URL_SAFE_NO_PAD.encode(keys::pack(&elems))
    }

    pub fn from_cursor(cursor: &str) -> Result<Self> {
        let mut map = Self::new();
        if cursor.is_empty() {
            return Ok(map);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| RoomservError::InvalidVersion)?;
        let elems = keys::unpack(&raw).map_err(|_| RoomservError::InvalidVersion)?;
        if elems.len() % 2 != 0 {
            return Err(RoomservError::InvalidVersion);
        }
        for pair in elems.chunks(2) {
            let key = keys::element_str(&pair[0]).map_err(|_| RoomservError::InvalidVersion)?;
            let key = VersionKey::parse(key).ok_or(RoomservError::InvalidVersion)?;
            let version =
                keys::element_version(&pair[1]).map_err(|_| RoomservError::InvalidVersion)?;
            map.set(key, version);
        }
        Ok(map)
    }

    /// Store-side encoding for persisted federation positions.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut elems = Vec::with_capacity(self.entries.len() * 2);
        for (key, version) in &self.entries {
            elems.push(Element::Str((*key).to_owned()));
            elems.push(Element::Version(*version));
        }
        keys::pack(&elems)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let elems = keys::unpack(raw)?;
        if elems.len() % 2 != 0 {
            return Err(RoomservError::InvalidVersion);
        }
        let mut map = Self::new();
        for pair in elems.chunks(2) {
            let key = keys::element_str(&pair[0])?;
            let key = VersionKey::parse(key).ok_or(RoomservError::InvalidVersion)?;
            map.set(key, keys::element_version(&pair[1])?);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrips() {
        let mut map = VersionMap::new();
        map.set(
            VersionKey::ROOMS,
            Versionstamp::complete([0, 0, 0, 0, 0, 0, 0, 0, 1, 4], 12),
        );
        map.set(
            VersionKey::ACCOUNTS,
            Versionstamp::complete([0, 0, 0, 0, 0, 0, 0, 0, 0, 9], 0),
        );

        let cursor = map.to_cursor();
        assert!(!cursor.is_empty());
        let decoded = VersionMap::from_cursor(&cursor).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn empty_cursor_means_initial_sync() {
        let map = VersionMap::from_cursor("").unwrap();
        assert!(map.is_empty());
        assert_eq!(map.to_cursor(), "");
        assert_eq!(map.get(VersionKey::ROOMS), ZERO_VERSIONSTAMP);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(matches!(
            VersionMap::from_cursor("not!base64"),
            Err(RoomservError::InvalidVersion)
        ));
    }

    #[test]
    fn stored_positions_roundtrip() {
        let mut map = VersionMap::new();
        map.set(
            VersionKey::ROOMS,
            Versionstamp::complete([1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 3),
        );
        let decoded = VersionMap::from_bytes(&map.to_bytes()).unwrap();
        assert_eq!(decoded, map);
    }
}
