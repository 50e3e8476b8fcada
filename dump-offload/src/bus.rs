// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow slice of the management bus we depend on: property reads,
//! property-change subscriptions and dump entry enumeration.

use crate::error::BusError;
use crate::DumpCategory;
use crate::DumpEntry;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use tokio::sync::mpsc;

pub const BIOS_CONFIG_SERVICE: &str = "xyz.openbmc_project.BIOSConfigManager";
pub const BIOS_CONFIG_PATH: &str = "/xyz/openbmc_project/bios_config/manager";
pub const BIOS_CONFIG_INTERFACE: &str = "xyz.openbmc_project.BIOSConfig.Manager";
pub const BASE_BIOS_TABLE: &str = "BaseBIOSTable";
pub const HMC_MANAGED_ATTRIBUTE: &str = "pvm_hmc_managed";
pub const HMC_MANAGED_ENABLED: &str = "Enabled";

pub const HOST_STATE_SERVICE: &str = "xyz.openbmc_project.State.Host";
pub const HOST_STATE_PATH: &str = "/xyz/openbmc_project/state/host0";
pub const BOOT_PROGRESS_INTERFACE: &str =
    "xyz.openbmc_project.State.Boot.Progress";
pub const BOOT_PROGRESS_PROPERTY: &str = "BootProgress";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Integer(i64),
    String(String),
}

/// One row of the BIOS attribute table. We only care about the current
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosAttribute {
    pub current: AttributeValue,
}

pub type BiosTable = BTreeMap<String, BiosAttribute>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Str(String),
    U64(u64),
    I64(i64),
    BiosTable(BiosTable),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::U64(_) => "u64",
            Self::I64(_) => "i64",
            Self::BiosTable(_) => "BIOS table",
        }
    }
}

pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Selects the property-change signals a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    pub path: String,
    pub interface: String,
}

impl MatchRule {
    pub fn properties_changed(path: &str, interface: &str) -> Self {
        Self { path: path.to_string(), interface: interface.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: PropertyMap,
}

/// An ordered stream of property-change signals matching one rule.
///
/// Dropping the subscription cancels it; publishers notice via
/// `UnboundedSender::is_closed`.
#[derive(Debug)]
pub struct Subscription {
    rule: MatchRule,
    rx: mpsc::UnboundedReceiver<PropertiesChanged>,
}

impl Subscription {
    pub fn channel(
        rule: MatchRule,
    ) -> (mpsc::UnboundedSender<PropertiesChanged>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rule, rx })
    }

    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }
}

impl Stream for Subscription {
    type Item = PropertiesChanged;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub trait PropertyStore {
    fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<PropertyValue, BusError>;
}

pub trait EntrySource {
    /// List dump entries, optionally restricted to one category.
    fn list_entries(
        &self,
        category: Option<DumpCategory>,
    ) -> Result<Vec<DumpEntry>, BusError>;
}

pub trait Subscribe {
    fn subscribe(&self, rule: MatchRule) -> Subscription;
}

#[derive(Debug, Default)]
struct InMemoryState {
    // Keyed by (path, interface, name); service names are not modeled.
    properties: BTreeMap<(String, String, String), PropertyValue>,
    entries: BTreeMap<(DumpCategory, u32), DumpEntry>,
    subscribers: Vec<(MatchRule, mpsc::UnboundedSender<PropertiesChanged>)>,
    closed: bool,
    list_calls: usize,
}

/// In-memory bus useful for simulation and tests.
///
/// Clones share state, so one clone can be handed to the service while
/// another drives property changes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBus {
    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        // Every update is a single insert or remove, so a poisoned lock
        // still guards consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set a property without emitting a change signal.
    pub fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) {
        self.state().properties.insert(
            (path.to_string(), interface.to_string(), name.to_string()),
            value,
        );
    }

    pub fn remove_property(&self, path: &str, interface: &str, name: &str) {
        self.state().properties.remove(&(
            path.to_string(),
            interface.to_string(),
            name.to_string(),
        ));
    }

    /// Set a property and emit a change signal for it.
    pub fn update_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) {
        self.set_property(path, interface, name, value.clone());
        let mut changed = PropertyMap::new();
        changed.insert(name.to_string(), value);
        self.emit(path, interface, changed);
    }

    /// Deliver a change signal to matching subscribers, returning how many
    /// received it.
    pub fn emit(&self, path: &str, interface: &str, changed: PropertyMap) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());

        let signal =
            PropertiesChanged { interface: interface.to_string(), changed };
        let mut delivered = 0;
        for (rule, tx) in &state.subscribers {
            if rule.path == path
                && rule.interface == interface
                && tx.send(signal.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn insert_entry(&self, entry: DumpEntry) {
        self.state().entries.insert(entry.key(), entry);
    }

    pub fn remove_entry(
        &self,
        category: DumpCategory,
        id: u32,
    ) -> Option<DumpEntry> {
        self.state().entries.remove(&(category, id))
    }

    /// End every subscription; their streams finish once drained. Any
    /// later subscription ends as soon as it is created.
    pub fn close_subscriptions(&self) {
        let mut state = self.state();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Number of live subscriptions for `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.iter().filter(|(rule, _)| rule.path == path).count()
    }

    /// Number of times entries have been enumerated.
    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }
}

impl PropertyStore for InMemoryBus {
    fn get_property(
        &self,
        _service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<PropertyValue, BusError> {
        self.state()
            .properties
            .get(&(path.to_string(), interface.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| BusError::NotFound {
                path: path.to_string(),
                interface: interface.to_string(),
                name: name.to_string(),
            })
    }
}

impl EntrySource for InMemoryBus {
    fn list_entries(
        &self,
        category: Option<DumpCategory>,
    ) -> Result<Vec<DumpEntry>, BusError> {
        let mut state = self.state();
        state.list_calls += 1;
        Ok(state
            .entries
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect())
    }
}

impl Subscribe for InMemoryBus {
    fn subscribe(&self, rule: MatchRule) -> Subscription {
        let (tx, subscription) = Subscription::channel(rule.clone());
        let mut state = self.state();
        if !state.closed {
            state.subscribers.push((rule, tx));
        }
        subscription
    }
}
