/*!
Plateforme de supervision en mémoire

Implémente `PlatformApi` sans serveur : les écritures modifient l'état comme
le ferait la vraie API (groupes, templates, statut, maintenances) et sont
enregistrées pour les assertions. Des échecs peuvent être injectés par hôte.
*/

use async_trait::async_trait;
use hostsync_kernel::models::Interface;
use hostsync_kernel::platform::{
    ApiError, ApiVersion, HostCreate, HostPatch, HostStatus, IdMap, Maintenance, PlatformApi,
    PlatformHost, PlatformInterface,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

pub const GROUP_ALL: &str = "All-hosts";
pub const GROUP_MANUAL: &str = "All-manual-hosts";
pub const GROUP_DISABLED: &str = "All-auto-disabled-hosts";

/// Écriture reçue par la plateforme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    CreateHost(String),
    UpdateHost { host: String, patch: HostPatch },
    SetInterface { host: String, kind: u8, existing: bool },
    CreateHostGroup(String),
    CreateTemplateGroup(String),
    UpdateMaintenance { id: String, host_ids: Vec<String> },
    DeleteMaintenance(String),
}

#[derive(Default)]
struct FakeState {
    hosts: BTreeMap<String, PlatformHost>,
    hostgroups: IdMap,
    templategroups: IdMap,
    templates: IdMap,
    maintenances: Vec<Maintenance>,
    writes: Vec<WriteRecord>,
    failing_hosts: BTreeSet<String>,
    next_id: u64,
}

impl FakeState {
    fn new_id(&mut self) -> String {
        self.next_id += 1;
        (10_000 + self.next_id).to_string()
    }

    fn group_name(&self, id: &str) -> Result<String, ApiError> {
        self.hostgroups
            .iter()
            .find(|(_, gid)| gid.as_str() == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| rpc_error(format!("No permissions to referred object or it does not exist! (group {id})")))
    }

    fn template_name(&self, id: &str) -> Result<String, ApiError> {
        self.templates
            .iter()
            .find(|(_, tid)| tid.as_str() == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| rpc_error(format!("No permissions to referred object or it does not exist! (template {id})")))
    }

    fn host_mut(&mut self, id: &str) -> Result<&mut PlatformHost, ApiError> {
        self.hosts
            .values_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| rpc_error(format!("host {id} does not exist")))
    }

    fn check_failure(&self, hostname: &str) -> Result<(), ApiError> {
        if self.failing_hosts.contains(hostname) {
            return Err(rpc_error(format!("injected failure for '{hostname}'")));
        }
        Ok(())
    }

    fn platform_interface(&mut self, interface: &Interface) -> PlatformInterface {
        PlatformInterface {
            id: self.new_id(),
            endpoint: interface.endpoint.clone(),
            port: interface.port.clone(),
            kind: interface.kind,
            main: true,
            use_ip: interface.use_ip(),
            details: interface.details.clone(),
        }
    }
}

fn rpc_error(data: String) -> ApiError {
    ApiError::Rpc { code: -32500, message: "Application error.".into(), data }
}

pub struct FakePlatform {
    version: ApiVersion,
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new(version: ApiVersion) -> Self {
        Self { version, state: Mutex::new(FakeState::default()) }
    }

    /// Plateforme 7.0 avec les groupes "tous", "manuels" et "désactivés"
    pub fn with_default_groups() -> Self {
        let platform = Self::new(ApiVersion::new(7, 0, 0));
        for group in [GROUP_ALL, GROUP_MANUAL, GROUP_DISABLED] {
            platform.add_hostgroup(group);
        }
        platform
    }

    pub fn add_hostgroup(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let id = state.new_id();
        state.hostgroups.insert(name.to_string(), id.clone());
        id
    }

    pub fn remove_hostgroup(&self, name: &str) {
        self.state.lock().hostgroups.remove(name);
    }

    pub fn add_template(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let id = state.new_id();
        state.templates.insert(name.to_string(), id.clone());
        id
    }

    /// Ajoute un hôte supervisé dans les groupes donnés (créés si besoin)
    pub fn add_host(&self, name: &str, groups: &[&str]) -> String {
        for group in groups {
            if !self.state.lock().hostgroups.contains_key(*group) {
                self.add_hostgroup(group);
            }
        }
        let mut state = self.state.lock();
        let id = state.new_id();
        let groups = groups
            .iter()
            .map(|g| (g.to_string(), state.hostgroups[*g].clone()))
            .collect();
        state.hosts.insert(
            name.to_string(),
            PlatformHost {
                id: id.clone(),
                name: name.to_string(),
                status: HostStatus::Monitored,
                groups,
                templates: IdMap::new(),
                interfaces: Vec::new(),
                tags: BTreeSet::new(),
                inventory_mode: 1,
                inventory: BTreeMap::new(),
            },
        );
        id
    }

    /// Modifie directement un hôte (mise en place d'un scénario)
    pub fn edit_host(&self, name: &str, edit: impl FnOnce(&mut PlatformHost)) {
        if let Some(host) = self.state.lock().hosts.get_mut(name) {
            edit(host);
        }
    }

    pub fn add_maintenance(&self, name: &str, hosts: &[&str]) -> String {
        let mut state = self.state.lock();
        let id = state.new_id();
        let host_ids = hosts.iter().filter_map(|h| state.hosts.get(*h)).map(|h| h.id.clone()).collect();
        state.maintenances.push(Maintenance {
            id: id.clone(),
            name: name.to_string(),
            host_ids,
            group_ids: BTreeSet::new(),
        });
        id
    }

    /// Les écritures sur cet hôte échoueront
    pub fn fail_writes_for(&self, hostname: &str) {
        self.state.lock().failing_hosts.insert(hostname.to_string());
    }

    pub fn host(&self, name: &str) -> Option<PlatformHost> {
        self.state.lock().hosts.get(name).cloned()
    }

    pub fn host_names(&self) -> Vec<String> {
        self.state.lock().hosts.keys().cloned().collect()
    }

    pub fn hostgroup_names(&self) -> BTreeSet<String> {
        self.state.lock().hostgroups.keys().cloned().collect()
    }

    pub fn maintenance(&self, id: &str) -> Option<Maintenance> {
        self.state.lock().maintenances.iter().find(|m| m.id == id).cloned()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn version(&self) -> Result<ApiVersion, ApiError> {
        Ok(self.version)
    }

    async fn hosts(&self, inventory_fields: &[String]) -> Result<Vec<PlatformHost>, ApiError> {
        let state = self.state.lock();
        Ok(state
            .hosts
            .values()
            .cloned()
            .map(|mut host| {
                host.inventory.retain(|key, _| inventory_fields.contains(key));
                host
            })
            .collect())
    }

    async fn hostgroups(&self) -> Result<IdMap, ApiError> {
        Ok(self.state.lock().hostgroups.clone())
    }

    async fn templategroups(&self) -> Result<IdMap, ApiError> {
        if !self.version.supports_templategroups() {
            return Err(rpc_error("Incorrect API \"templategroup\".".into()));
        }
        Ok(self.state.lock().templategroups.clone())
    }

    async fn templates(&self) -> Result<IdMap, ApiError> {
        Ok(self.state.lock().templates.clone())
    }

    async fn maintenances(&self) -> Result<Vec<Maintenance>, ApiError> {
        Ok(self.state.lock().maintenances.clone())
    }

    async fn create_host(&self, host: &HostCreate) -> Result<String, ApiError> {
        let mut state = self.state.lock();
        state.check_failure(&host.name)?;
        if state.hosts.contains_key(&host.name) {
            return Err(rpc_error(format!("Host with the same name \"{}\" already exists.", host.name)));
        }
        let groups = host
            .group_ids
            .iter()
            .map(|id| Ok::<_, ApiError>((state.group_name(id)?, id.clone())))
            .collect::<Result<IdMap, ApiError>>()?;
        let interfaces = host.interfaces.iter().map(|i| state.platform_interface(i)).collect();
        let id = state.new_id();
        state.hosts.insert(
            host.name.clone(),
            PlatformHost {
                id: id.clone(),
                name: host.name.clone(),
                status: HostStatus::Monitored,
                groups,
                templates: IdMap::new(),
                interfaces,
                tags: host.tags.clone(),
                inventory_mode: host.inventory_mode,
                inventory: host.inventory.clone(),
            },
        );
        state.writes.push(WriteRecord::CreateHost(host.name.clone()));
        Ok(id)
    }

    async fn update_host(&self, host_id: &str, patch: &HostPatch) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let hostname = state.host_mut(host_id)?.name.clone();
        state.check_failure(&hostname)?;

        let groups = match &patch.group_ids {
            Some(ids) => Some(
                ids.iter()
                    .map(|id| Ok::<_, ApiError>((state.group_name(id)?, id.clone())))
                    .collect::<Result<IdMap, ApiError>>()?,
            ),
            None => None,
        };
        let templates = match &patch.template_ids {
            Some(ids) => Some(
                ids.iter()
                    .map(|id| Ok::<_, ApiError>((state.template_name(id)?, id.clone())))
                    .collect::<Result<IdMap, ApiError>>()?,
            ),
            None => None,
        };

        let host = state.host_mut(host_id)?;
        if let Some(status) = patch.status {
            host.status = status;
        }
        if let Some(groups) = groups {
            host.groups = groups;
        }
        if let Some(clear) = &patch.clear_template_ids {
            host.templates.retain(|_, id| !clear.contains(id));
        }
        if let Some(templates) = templates {
            host.templates = templates;
        }
        if let Some(tags) = &patch.tags {
            host.tags = tags.clone();
        }
        if let Some(mode) = patch.inventory_mode {
            host.inventory_mode = mode;
        }
        if let Some(inventory) = &patch.inventory {
            host.inventory.extend(inventory.clone());
        }
        state.writes.push(WriteRecord::UpdateHost { host: hostname, patch: patch.clone() });
        Ok(())
    }

    async fn set_interface(
        &self,
        host_id: &str,
        interface: &Interface,
        existing: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let hostname = state.host_mut(host_id)?.name.clone();
        state.check_failure(&hostname)?;
        let mut new_interface = state.platform_interface(interface);

        let host = state.host_mut(host_id)?;
        match existing.and_then(|id| host.interfaces.iter_mut().find(|i| i.id == id)) {
            Some(current) => {
                new_interface.id = current.id.clone();
                *current = new_interface;
            }
            None => host.interfaces.push(new_interface),
        }
        state.writes.push(WriteRecord::SetInterface {
            host: hostname,
            kind: interface.kind,
            existing: existing.is_some(),
        });
        Ok(())
    }

    async fn create_hostgroup(&self, name: &str) -> Result<String, ApiError> {
        let mut state = self.state.lock();
        if state.hostgroups.contains_key(name) {
            return Err(rpc_error(format!("Host group \"{name}\" already exists.")));
        }
        let id = state.new_id();
        state.hostgroups.insert(name.to_string(), id.clone());
        state.writes.push(WriteRecord::CreateHostGroup(name.to_string()));
        Ok(id)
    }

    async fn create_templategroup(&self, name: &str) -> Result<String, ApiError> {
        let mut state = self.state.lock();
        let id = state.new_id();
        state.templategroups.insert(name.to_string(), id.clone());
        state.writes.push(WriteRecord::CreateTemplateGroup(name.to_string()));
        Ok(id)
    }

    async fn update_maintenance_hosts(
        &self,
        maintenance_id: &str,
        host_ids: &[String],
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let maintenance = state
            .maintenances
            .iter_mut()
            .find(|m| m.id == maintenance_id)
            .ok_or_else(|| rpc_error(format!("maintenance {maintenance_id} does not exist")))?;
        maintenance.host_ids = host_ids.iter().cloned().collect();
        state.writes.push(WriteRecord::UpdateMaintenance {
            id: maintenance_id.to_string(),
            host_ids: host_ids.to_vec(),
        });
        Ok(())
    }

    async fn delete_maintenance(&self, maintenance_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let before = state.maintenances.len();
        state.maintenances.retain(|m| m.id != maintenance_id);
        if state.maintenances.len() == before {
            return Err(rpc_error(format!("maintenance {maintenance_id} does not exist")));
        }
        state.writes.push(WriteRecord::DeleteMaintenance(maintenance_id.to_string()));
        Ok(())
    }
}
