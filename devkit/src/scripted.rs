//! Collecteur piloté par le test et constructeur de fiches hôtes.

use anyhow::anyhow;
use async_trait::async_trait;
use hostsync_kernel::collectors::SourceCollector;
use hostsync_kernel::models::{Host, Interface};
use hostsync_kernel::units::{ParamSpec, Params};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Collecteur qui renvoie d'abord les résultats scriptés (succès ou échec),
/// puis la liste d'hôtes courante
#[derive(Default)]
pub struct ScriptedCollector {
    steady: Mutex<Vec<Host>>,
    queued: Mutex<VecDeque<Result<Vec<Host>, String>>>,
    calls: AtomicUsize,
}

impl ScriptedCollector {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { steady: Mutex::new(hosts), ..Self::default() }
    }

    /// Remplace la liste renvoyée à chaque collecte
    pub fn set_hosts(&self, hosts: Vec<Host>) {
        *self.steady.lock() = hosts;
    }

    pub fn push_result(&self, hosts: Vec<Host>) {
        self.queued.lock().push_back(Ok(hosts));
    }

    pub fn push_failure(&self, message: &str) {
        self.queued.lock().push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceCollector for ScriptedCollector {
    fn kind(&self) -> &str {
        "scripted"
    }

    fn schema(&self) -> &[ParamSpec] {
        &[]
    }

    async fn collect(&self, _params: &Params) -> anyhow::Result<Vec<Host>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.queued.lock().pop_front() {
            Some(Ok(hosts)) => Ok(hosts),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.steady.lock().clone()),
        }
    }
}

/// Construction fluide d'un `Host`
pub struct HostBuilder {
    host: Host,
}

impl HostBuilder {
    pub fn new(hostname: &str) -> Self {
        Self { host: Host::new(hostname) }
    }

    pub fn disabled(mut self) -> Self {
        self.host.enabled = false;
        self
    }

    pub fn importance(mut self, importance: u32) -> Self {
        self.host.importance = Some(importance);
        self
    }

    pub fn property(mut self, property: &str) -> Self {
        self.host.properties.insert(property.to_string());
        self
    }

    pub fn siteadmin(mut self, email: &str) -> Self {
        self.host.siteadmins.insert(email.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.host.tags.insert((key.to_string(), value.to_string()));
        self
    }

    pub fn inventory(mut self, key: &str, value: &str) -> Self {
        self.host.inventory.insert(key.to_string(), value.to_string());
        self
    }

    pub fn interface(mut self, interface: Interface) -> Self {
        self.host.interfaces.push(interface);
        self
    }

    pub fn build(self) -> Host {
        self.host
    }
}
