/**
 * ZABBIX CLIENT - implémentation JSON-RPC de `PlatformApi`
 *
 * SESSION :
 * - Version lue une fois (apiinfo.version, sans authentification)
 * - Login au premier appel authentifié, jeton gardé en mémoire
 * - Session expirée : un seul nouveau login puis on rejoue l'appel
 * - Jeton en en-tête Bearer à partir de 6.4, dans le corps avant
 *
 * DÉCODAGE :
 * L'API renvoie les nombres sous forme de chaînes, et `[]` à la place
 * d'un objet vide (inventaire désactivé, interface sans détails).
 */

use super::{
    ApiError, ApiVersion, HostCreate, HostPatch, HostStatus, IdMap, Maintenance, PlatformApi,
    PlatformHost, PlatformInterface,
};
use crate::config::PlatformConfig;
use crate::models::{Interface, Tag};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ZabbixClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    timeout_secs: u64,
    version: Mutex<Option<ApiVersion>>,
    session: Mutex<Option<String>>,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

fn api_endpoint(url: &str) -> String {
    if url.ends_with("api_jsonrpc.php") {
        url.to_string()
    } else {
        format!("{}/api_jsonrpc.php", url.trim_end_matches('/'))
    }
}

fn session_expired(message: &str, data: &str) -> bool {
    [message, data].iter().any(|text| {
        text.contains("re-login") || text.contains("Session terminated") || text.contains("Not authorized")
    })
}

impl ZabbixClient {
    pub fn new(config: &PlatformConfig) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!config.verify_ssl);
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        if !config.verify_ssl {
            warn!("TLS certificate verification is disabled for {}", config.url);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: api_endpoint(&config.url),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout_secs: config.timeout_secs,
            version: Mutex::new(None),
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout(self.timeout_secs)
        } else {
            ApiError::Http(e)
        }
    }

    async fn post(
        &self,
        method: &str,
        params: Value,
        auth: Option<(&str, ApiVersion)>,
    ) -> Result<Value, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id });
        let mut request = self.http.post(&self.endpoint);
        if let Some((token, version)) = auth {
            if version.auth_in_header() {
                request = request.bearer_auth(token);
            } else {
                body["auth"] = Value::String(token.to_string());
            }
        }

        debug!("API call {method} (id {id})");
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?
            .error_for_status()?;
        let reply: RpcReply = response.json().await.map_err(|e| self.transport_error(e))?;

        match (reply.result, reply.error) {
            (_, Some(error)) => Err(ApiError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data.map(|d| value_text(&d)).unwrap_or_default(),
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ApiError::Decode(format!("{method}: reply has neither result nor error"))),
        }
    }

    async fn login(&self, version: ApiVersion) -> Result<String, ApiError> {
        let params = json!({
            version.login_user_field(): self.username,
            "password": self.password,
        });
        let token = match self.post("user.login", params, None).await {
            Ok(Value::String(token)) => token,
            Ok(other) => return Err(ApiError::Auth(format!("unexpected login result {other}"))),
            Err(ApiError::Rpc { message, data, .. }) => return Err(ApiError::Auth(format!("{message} {data}"))),
            Err(e) => return Err(e),
        };
        info!("Logged in to platform API as '{}' (version {version})", self.username);
        Ok(token)
    }

    async fn token(&self, version: ApiVersion) -> Result<String, ApiError> {
        let cached = self.session.lock().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        let token = self.login(version).await?;
        *self.session.lock() = Some(token.clone());
        Ok(token)
    }

    /// Appel authentifié, avec un nouveau login si la session a expiré
    async fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        let version = self.version().await?;
        let token = self.token(version).await?;
        match self.post(method, params.clone(), Some((&token, version))).await {
            Err(ApiError::Rpc { message, data, .. }) if session_expired(&message, &data) => {
                warn!("Platform session expired during {method}, logging in again");
                *self.session.lock() = None;
                let token = self.token(version).await?;
                self.post(method, params, Some((&token, version))).await
            }
            other => other,
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ApiError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(|e| ApiError::Decode(format!("{method}: {e}")))
    }

    async fn create_named(&self, method: &str, name: &str) -> Result<String, ApiError> {
        let result = self.call(method, json!({ "name": name })).await?;
        first_id(method, &result, "groupids")
    }
}

#[derive(Deserialize)]
struct RawGroup {
    groupid: String,
    name: String,
}

#[derive(Deserialize)]
struct RawTemplate {
    templateid: String,
    host: String,
}

#[derive(Deserialize)]
struct RawTag {
    tag: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct RawInterface {
    interfaceid: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    dns: String,
    port: String,
    #[serde(rename = "type")]
    kind: String,
    main: String,
    useip: String,
    #[serde(default)]
    details: Value,
}

#[derive(Deserialize)]
struct RawHost {
    hostid: String,
    host: String,
    status: String,
    #[serde(default)]
    inventory_mode: Option<String>,
    #[serde(default, alias = "hostgroups")]
    groups: Vec<RawGroup>,
    #[serde(default, rename = "parentTemplates")]
    parent_templates: Vec<RawTemplate>,
    #[serde(default)]
    interfaces: Vec<RawInterface>,
    #[serde(default)]
    tags: Vec<RawTag>,
    #[serde(default)]
    inventory: Value,
}

#[derive(Deserialize)]
struct HostRef {
    hostid: String,
}

#[derive(Deserialize)]
struct GroupRef {
    groupid: String,
}

#[derive(Deserialize)]
struct RawMaintenance {
    maintenanceid: String,
    name: String,
    #[serde(default)]
    hosts: Vec<HostRef>,
    #[serde(default, alias = "hostgroups")]
    groups: Vec<GroupRef>,
}

fn number<T: FromStr>(field: &str, text: &str) -> Result<T, ApiError> {
    text.parse()
        .map_err(|_| ApiError::Decode(format!("field '{field}' is not a number: '{text}'")))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Objet JSON -> map de chaînes ; `[]` ou null -> map vide
fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), value_text(v))).collect())
        .unwrap_or_default()
}

fn first_id(method: &str, result: &Value, key: &str) -> Result<String, ApiError> {
    result[key][0]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ApiError::Decode(format!("{method}: missing '{key}' in result")))
}

impl TryFrom<RawInterface> for PlatformInterface {
    type Error = ApiError;

    fn try_from(raw: RawInterface) -> Result<Self, ApiError> {
        let use_ip = number::<u8>("useip", &raw.useip)? == 1;
        Ok(Self {
            id: raw.interfaceid,
            endpoint: if use_ip { raw.ip } else { raw.dns },
            port: raw.port,
            kind: number("type", &raw.kind)?,
            main: number::<u8>("main", &raw.main)? == 1,
            use_ip,
            details: string_map(&raw.details),
        })
    }
}

impl TryFrom<RawHost> for PlatformHost {
    type Error = ApiError;

    fn try_from(raw: RawHost) -> Result<Self, ApiError> {
        let interfaces = raw
            .interfaces
            .into_iter()
            .map(PlatformInterface::try_from)
            .collect::<Result<_, _>>()?;
        let inventory_mode = match raw.inventory_mode.as_deref() {
            Some(mode) => number("inventory_mode", mode)?,
            None => -1,
        };
        Ok(Self {
            id: raw.hostid,
            name: raw.host,
            status: HostStatus::from_code(number("status", &raw.status)?),
            groups: raw.groups.into_iter().map(|g| (g.name, g.groupid)).collect(),
            templates: raw.parent_templates.into_iter().map(|t| (t.host, t.templateid)).collect(),
            interfaces,
            tags: raw.tags.into_iter().map(|t| (t.tag, t.value)).collect(),
            inventory_mode,
            inventory: string_map(&raw.inventory),
        })
    }
}

fn interface_params(interface: &Interface) -> Value {
    let use_ip = interface.use_ip();
    let (ip, dns) = if use_ip {
        (interface.endpoint.as_str(), "")
    } else {
        ("", interface.endpoint.as_str())
    };
    let mut params = json!({
        "type": interface.kind,
        "main": 1,
        "useip": u8::from(use_ip),
        "ip": ip,
        "dns": dns,
        "port": interface.port,
    });
    if !interface.details.is_empty() {
        params["details"] = json!(interface.details);
    }
    params
}

fn tags_params(tags: &BTreeSet<Tag>) -> Value {
    tags.iter()
        .map(|(tag, value)| json!({ "tag": tag, "value": value }))
        .collect()
}

fn id_objects(key: &str, ids: &[String]) -> Value {
    ids.iter().map(|id| json!({ key: id })).collect()
}

fn patch_params(host_id: &str, patch: &HostPatch) -> Value {
    let mut params = Map::new();
    params.insert("hostid".into(), json!(host_id));
    if let Some(status) = patch.status {
        params.insert("status".into(), json!(status.code()));
    }
    if let Some(ids) = &patch.group_ids {
        params.insert("groups".into(), id_objects("groupid", ids));
    }
    if let Some(ids) = &patch.template_ids {
        params.insert("templates".into(), id_objects("templateid", ids));
    }
    if let Some(ids) = &patch.clear_template_ids {
        params.insert("templates_clear".into(), id_objects("templateid", ids));
    }
    if let Some(tags) = &patch.tags {
        params.insert("tags".into(), tags_params(tags));
    }
    if let Some(mode) = patch.inventory_mode {
        params.insert("inventory_mode".into(), json!(mode));
    }
    if let Some(inventory) = &patch.inventory {
        params.insert("inventory".into(), json!(inventory));
    }
    Value::Object(params)
}

#[async_trait]
impl PlatformApi for ZabbixClient {
    async fn version(&self) -> Result<ApiVersion, ApiError> {
        let cached = *self.version.lock();
        if let Some(version) = cached {
            return Ok(version);
        }
        let result = self.post("apiinfo.version", json!({}), None).await?;
        let version = ApiVersion::parse(&value_text(&result))?;
        *self.version.lock() = Some(version);
        Ok(version)
    }

    async fn hosts(&self, inventory_fields: &[String]) -> Result<Vec<PlatformHost>, ApiError> {
        let version = self.version().await?;
        let mut params = json!({
            "output": ["hostid", "host", "status", "inventory_mode"],
            "filter": { "flags": 0 },
            "selectInterfaces": ["interfaceid", "dns", "ip", "main", "port", "type", "useip", "details"],
            "selectParentTemplates": ["templateid", "host"],
            "selectTags": ["tag", "value"],
        });
        params[version.select_hostgroups_param()] = json!(["groupid", "name"]);
        if !inventory_fields.is_empty() {
            params["selectInventory"] = json!(inventory_fields);
        }
        let raw: Vec<RawHost> = self.call_as("host.get", params).await?;
        raw.into_iter().map(PlatformHost::try_from).collect()
    }

    async fn hostgroups(&self) -> Result<IdMap, ApiError> {
        let raw: Vec<RawGroup> = self
            .call_as("hostgroup.get", json!({ "output": ["name", "groupid"] }))
            .await?;
        Ok(raw.into_iter().map(|g| (g.name, g.groupid)).collect())
    }

    async fn templategroups(&self) -> Result<IdMap, ApiError> {
        let raw: Vec<RawGroup> = self
            .call_as("templategroup.get", json!({ "output": ["name", "groupid"] }))
            .await?;
        Ok(raw.into_iter().map(|g| (g.name, g.groupid)).collect())
    }

    async fn templates(&self) -> Result<IdMap, ApiError> {
        let raw: Vec<RawTemplate> = self
            .call_as("template.get", json!({ "output": ["host", "templateid"] }))
            .await?;
        Ok(raw.into_iter().map(|t| (t.host, t.templateid)).collect())
    }

    async fn maintenances(&self) -> Result<Vec<Maintenance>, ApiError> {
        let version = self.version().await?;
        let mut params = json!({
            "output": ["maintenanceid", "name"],
            "selectHosts": ["hostid"],
        });
        params[version.select_hostgroups_param()] = json!(["groupid"]);
        let raw: Vec<RawMaintenance> = self.call_as("maintenance.get", params).await?;
        Ok(raw
            .into_iter()
            .map(|m| Maintenance {
                id: m.maintenanceid,
                name: m.name,
                host_ids: m.hosts.into_iter().map(|h| h.hostid).collect(),
                group_ids: m.groups.into_iter().map(|g| g.groupid).collect(),
            })
            .collect())
    }

    async fn create_host(&self, host: &HostCreate) -> Result<String, ApiError> {
        let params = json!({
            "host": host.name,
            "status": HostStatus::Monitored.code(),
            "groups": id_objects("groupid", &host.group_ids),
            "interfaces": host.interfaces.iter().map(interface_params).collect::<Vec<_>>(),
            "tags": tags_params(&host.tags),
            "inventory_mode": host.inventory_mode,
            "inventory": host.inventory,
        });
        let result = self.call("host.create", params).await?;
        first_id("host.create", &result, "hostids")
    }

    async fn update_host(&self, host_id: &str, patch: &HostPatch) -> Result<(), ApiError> {
        self.call("host.update", patch_params(host_id, patch)).await?;
        Ok(())
    }

    async fn set_interface(
        &self,
        host_id: &str,
        interface: &Interface,
        existing: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut params = interface_params(interface);
        params["hostid"] = json!(host_id);
        match existing {
            Some(id) => {
                params["interfaceid"] = json!(id);
                self.call("hostinterface.update", params).await?;
            }
            None => {
                self.call("hostinterface.create", params).await?;
            }
        }
        Ok(())
    }

    async fn create_hostgroup(&self, name: &str) -> Result<String, ApiError> {
        self.create_named("hostgroup.create", name).await
    }

    async fn create_templategroup(&self, name: &str) -> Result<String, ApiError> {
        self.create_named("templategroup.create", name).await
    }

    async fn update_maintenance_hosts(
        &self,
        maintenance_id: &str,
        host_ids: &[String],
    ) -> Result<(), ApiError> {
        let version = self.version().await?;
        let mut params = json!({ "maintenanceid": maintenance_id });
        if version.maintenance_hosts_as_objects() {
            params["hosts"] = id_objects("hostid", host_ids);
        } else {
            params["hostids"] = json!(host_ids);
        }
        self.call("maintenance.update", params).await?;
        Ok(())
    }

    async fn delete_maintenance(&self, maintenance_id: &str) -> Result<(), ApiError> {
        self.call("maintenance.delete", json!([maintenance_id])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;

    /// Serveur JSON-RPC minimal : version configurable, une session expirée
    /// sur le premier host.get si `expire_first`
    struct Stub {
        version: &'static str,
        expire_first: bool,
        logins: Mutex<u32>,
        calls: Mutex<Vec<(String, Value, Option<String>)>>,
    }

    impl Stub {
        fn new(version: &'static str, expire_first: bool) -> Arc<Self> {
            Arc::new(Self {
                version,
                expire_first,
                logins: Mutex::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls_to(&self, method: &str) -> Vec<(Value, Option<String>)> {
            self.calls
                .lock()
                .iter()
                .filter(|(m, _, _)| m == method)
                .map(|(_, params, token)| (params.clone(), token.clone()))
                .collect()
        }
    }

    fn sample_host() -> Value {
        json!({
            "hostid": "10501",
            "host": "web01.example.com",
            "status": "0",
            "inventory_mode": "1",
            "hostgroups": [{ "groupid": "5", "name": "All-hosts" }],
            "parentTemplates": [{ "templateid": "10001", "host": "Linux by Zabbix agent" }],
            "interfaces": [{
                "interfaceid": "3", "ip": "", "dns": "web01.example.com", "port": "10050",
                "type": "1", "main": "1", "useip": "0", "details": []
            }],
            "tags": [{ "tag": "zac_env", "value": "prod" }],
            "inventory": []
        })
    }

    async fn rpc(State(stub): State<Arc<Stub>>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        let method = body["method"].as_str().unwrap_or_default().to_string();
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("Bearer ").to_string())
            .or_else(|| body["auth"].as_str().map(str::to_string));
        stub.calls.lock().push((method.clone(), body["params"].clone(), token.clone()));

        let result = match method.as_str() {
            "apiinfo.version" => json!(stub.version),
            "user.login" => {
                let mut logins = stub.logins.lock();
                *logins += 1;
                json!(format!("tok-{}", *logins))
            }
            "host.get" if stub.expire_first && token.as_deref() == Some("tok-1") => {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": { "code": -32602, "message": "Invalid params.", "data": "Session terminated, re-login, please." }
                }));
            }
            "host.get" => json!([sample_host()]),
            "hostgroup.create" => json!({ "groupids": ["42"] }),
            _ => json!({}),
        };
        Json(json!({ "jsonrpc": "2.0", "id": body["id"], "result": result }))
    }

    async fn start(stub: Arc<Stub>) -> ZabbixClient {
        let app = Router::new().route("/api_jsonrpc.php", post(rpc)).with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut config = PlatformConfig::with_url(format!("http://{addr}/"));
        config.password = "secret".into();
        config.timeout_secs = 5;
        ZabbixClient::new(&config).unwrap()
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        assert_eq!(api_endpoint("https://zbx.example.com/"), "https://zbx.example.com/api_jsonrpc.php");
        assert_eq!(
            api_endpoint("https://zbx.example.com/api_jsonrpc.php"),
            "https://zbx.example.com/api_jsonrpc.php"
        );
    }

    #[tokio::test]
    async fn relogs_once_when_session_expires() {
        let stub = Stub::new("7.0.0", true);
        let client = start(stub.clone()).await;

        let hosts = client.hosts(&["location".into()]).await.unwrap();
        assert_eq!(*stub.logins.lock(), 2);
        assert_eq!(hosts.len(), 1);

        let host = &hosts[0];
        assert_eq!(host.status, HostStatus::Monitored);
        assert!(host.in_group("All-hosts"));
        assert_eq!(host.templates["Linux by Zabbix agent"], "10001");
        assert!(host.inventory.is_empty());
        assert_eq!(host.main_interface(1).unwrap().endpoint, "web01.example.com");
        assert!(host.tags.contains(&("zac_env".to_string(), "prod".to_string())));

        let calls = stub.calls_to("host.get");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.as_deref(), Some("tok-2"));
        assert!(calls[1].0.get("selectHostGroups").is_some());
    }

    #[tokio::test]
    async fn old_versions_use_body_auth_and_user_field() {
        let stub = Stub::new("5.0.30", false);
        let client = start(stub.clone()).await;

        assert_eq!(client.create_hostgroup("Siteadmin-ops").await.unwrap(), "42");
        let login = stub.calls_to("user.login");
        assert_eq!(login[0].0["user"], "Admin");
        assert_eq!(stub.calls_to("hostgroup.create")[0].1.as_deref(), Some("tok-1"));
    }

    #[test]
    fn patch_only_sends_set_fields() {
        let patch = HostPatch {
            status: Some(HostStatus::Unmonitored),
            template_ids: Some(Vec::new()),
            ..HostPatch::default()
        };
        let params = patch_params("10501", &patch);
        assert_eq!(params["status"], 1);
        assert_eq!(params["templates"], json!([]));
        assert!(params.get("groups").is_none());
        assert!(params.get("inventory").is_none());
    }
}
