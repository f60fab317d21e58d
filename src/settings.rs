//! Option and timer settings and their inheritance.
//!
//! Each node of the topology (global, network, subnet, pool) carries a
//! [`Settings`] block; global and network nodes additionally carry one block
//! for registered and one for unregistered clients. After parsing, every
//! node is resolved once per mode into an immutable [`EffectiveSettings`]
//! by walking from the node towards the root:
//!
//! ```text
//! pool -> subnet -> network (mode) -> network -> global (mode) -> global
//! ```
//!
//! The first block that sets an option code or timer wins, so a more
//! specific node always overrides what it inherits.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::TimeDelta;

use crate::option_table::{VENDOR_OPTIONS_CODE, encode_vendor_options};

/// Lease time used when no block in the chain sets one (one week).
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One settings block as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Encoded option payloads keyed by option code.
    pub options: BTreeMap<u8, Vec<u8>>,
    /// Vendor sub-options set in this block, keyed by sub-option code.
    pub vendor_options: BTreeMap<u8, Vec<u8>>,
    /// Set by `option vendor-options true`.
    pub send_vendor_options: bool,
    pub default_lease_time: Option<Duration>,
    pub max_lease_time: Option<Duration>,
    pub free_lease_after: Option<Duration>,
}

impl Settings {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Builds option 43 from this block's vendor sub-options when requested.
    ///
    /// Called once when the block is closed; afterwards the vendor option is
    /// an ordinary entry of `options`.
    pub fn seal_vendor_options(&mut self) {
        if !self.send_vendor_options {
            return;
        }
        if let Some(encoded) = encode_vendor_options(&self.vendor_options) {
            self.options.insert(VENDOR_OPTIONS_CODE, encoded);
        }
    }

    /// Fills everything `self` leaves unset from `parent`.
    pub fn inherit(&mut self, parent: &Settings) {
        for (code, value) in &parent.options {
            self.options.entry(*code).or_insert_with(|| value.clone());
        }
        self.default_lease_time = self.default_lease_time.or(parent.default_lease_time);
        self.max_lease_time = self.max_lease_time.or(parent.max_lease_time);
        self.free_lease_after = self.free_lease_after.or(parent.free_lease_after);
    }
}

/// Settings blocks of a node that distinguishes registered clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModalSettings {
    pub root: Settings,
    pub registered: Settings,
    pub unregistered: Settings,
}

impl ModalSettings {
    pub fn for_mode(&self, registered: bool) -> &Settings {
        if registered {
            &self.registered
        } else {
            &self.unregistered
        }
    }
}

/// Fully inherited settings of one node for one client mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub options: BTreeMap<u8, Vec<u8>>,
    pub default_lease_time: Duration,
    pub max_lease_time: Duration,
    pub free_lease_after: Duration,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self::from_chain(std::iter::empty())
    }
}

impl EffectiveSettings {
    /// Merges blocks ordered from most to least specific.
    pub fn from_chain<'a>(chain: impl IntoIterator<Item = &'a Settings>) -> Self {
        let mut merged = Settings::default();
        for block in chain {
            merged.inherit(block);
        }

        let default_lease_time = merged.default_lease_time.unwrap_or(DEFAULT_LEASE_TIME);
        Self {
            options: merged.options,
            default_lease_time,
            max_lease_time: merged.max_lease_time.unwrap_or(default_lease_time),
            free_lease_after: merged.free_lease_after.unwrap_or(Duration::ZERO),
        }
    }

    /// Lease duration granted for a client's requested duration.
    ///
    /// A zero request yields the default; anything else is capped at the
    /// maximum.
    pub fn lease_time(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.default_lease_time
        } else {
            requested.min(self.max_lease_time)
        }
    }

    pub fn free_lease_after_delta(&self) -> TimeDelta {
        to_delta(self.free_lease_after)
    }
}

/// Resolved settings of a node for both client modes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub registered: EffectiveSettings,
    pub unregistered: EffectiveSettings,
}

impl Resolved {
    /// Resolves a node given a function producing its chain for a mode.
    pub fn build<'a, F, I>(chain: F) -> Self
    where
        F: Fn(bool) -> I,
        I: IntoIterator<Item = &'a Settings>,
    {
        Self {
            registered: EffectiveSettings::from_chain(chain(true)),
            unregistered: EffectiveSettings::from_chain(chain(false)),
        }
    }

    pub fn get(&self, registered: bool) -> &EffectiveSettings {
        if registered {
            &self.registered
        } else {
            &self.unregistered
        }
    }
}

pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_option(code: u8, value: &[u8]) -> Settings {
        let mut settings = Settings::default();
        settings.options.insert(code, value.to_vec());
        settings
    }

    #[test]
    fn test_child_option_overrides_parent() {
        let child = with_option(3, &[10, 0, 0, 1]);
        let parent = with_option(3, &[10, 0, 0, 254]);
        let effective = EffectiveSettings::from_chain([&child, &parent]);
        assert_eq!(effective.options[&3], vec![10, 0, 0, 1]);
    }

    #[test]
    fn test_inherits_missing_codes() {
        let child = with_option(3, &[10, 0, 0, 1]);
        let parent = with_option(6, &[8, 8, 8, 8]);
        let effective = EffectiveSettings::from_chain([&child, &parent]);
        assert_eq!(effective.options.len(), 2);
        assert_eq!(effective.options[&6], vec![8, 8, 8, 8]);
    }

    #[test]
    fn test_lease_time_defaults() {
        let effective = EffectiveSettings::default();
        assert_eq!(effective.lease_time(Duration::ZERO), DEFAULT_LEASE_TIME);
        assert_eq!(effective.max_lease_time, DEFAULT_LEASE_TIME);
        assert_eq!(effective.free_lease_after, Duration::ZERO);
    }

    #[test]
    fn test_lease_time_from_ancestor() {
        let global = Settings {
            default_lease_time: Some(Duration::from_secs(86400)),
            ..Default::default()
        };
        let pool = Settings::default();
        let effective = EffectiveSettings::from_chain([&pool, &global]);
        assert_eq!(
            effective.lease_time(Duration::ZERO),
            Duration::from_secs(86400)
        );
    }

    #[test]
    fn test_requested_lease_time_is_capped() {
        let settings = Settings {
            default_lease_time: Some(Duration::from_secs(3600)),
            max_lease_time: Some(Duration::from_secs(7200)),
            ..Default::default()
        };
        let effective = EffectiveSettings::from_chain([&settings]);
        assert_eq!(
            effective.lease_time(Duration::from_secs(600)),
            Duration::from_secs(600)
        );
        assert_eq!(
            effective.lease_time(Duration::from_secs(100_000)),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_max_falls_back_to_default() {
        let settings = Settings {
            default_lease_time: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let effective = EffectiveSettings::from_chain([&settings]);
        assert_eq!(
            effective.lease_time(Duration::from_secs(100_000)),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let child = with_option(15, b"example.org");
        let parent = with_option(6, &[8, 8, 4, 4]);
        let first = Resolved::build(|_| [&child, &parent]);
        let second = Resolved::build(|_| [&child, &parent]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_modes_resolve_independently() {
        let modal = ModalSettings {
            registered: with_option(3, &[10, 0, 0, 1]),
            unregistered: with_option(3, &[10, 99, 0, 1]),
            ..Default::default()
        };
        let resolved = Resolved::build(|registered| [modal.for_mode(registered), &modal.root]);
        assert_eq!(resolved.get(true).options[&3], vec![10, 0, 0, 1]);
        assert_eq!(resolved.get(false).options[&3], vec![10, 99, 0, 1]);
    }

    #[test]
    fn test_vendor_options_sealed_when_enabled() {
        let mut settings = Settings::default();
        settings.vendor_options.insert(1, vec![1]);
        settings.seal_vendor_options();
        assert!(!settings.options.contains_key(&VENDOR_OPTIONS_CODE));

        settings.send_vendor_options = true;
        settings.seal_vendor_options();
        assert_eq!(settings.options[&VENDOR_OPTIONS_CODE], vec![1, 1, 1]);
    }

    #[test]
    fn test_empty_settings() {
        assert!(Settings::default().is_empty());
        assert!(!with_option(1, &[255, 255, 255, 0]).is_empty());
    }
}
