//! In-memory collaborators for lifecycle and scheduler tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use nodeshift_control::{LifecycleContext, OrchestratorConfig, SshProbe};
use nodeshift_proto::{
    CreateInstanceRequest, Instance, InstanceGroup, Platform, ProviderCapability, ProviderKind,
    Region, TunnelType,
};
use nodeshift_provider::{CreatedInstance, DeleteSummary, ProviderAdapter, ProviderError, ProviderResult};
use nodeshift_store::PersistenceStore;
use nodeshift_trust::{HostKeyToken, KvClient, TrustError, TrustResult, TrustStore};
use nodeshift_tunnel::{ProcessError, ProcessOutput, ProcessRunner, ScriptMatrix, TunnelManager};

pub const HOST_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
pub const NODE_IP: &str = "203.0.113.5";
pub const FAKE_API_BASE: &str = "fake://api";

/// Value of `NAME='value'` in a rendered first-boot script
fn script_var(script: &str, name: &str) -> Option<String> {
    let marker = format!("{}='", name);
    let start = script.find(&marker)? + marker.len();
    let end = script[start..].find('\'')? + start;
    Some(script[start..end].to_string())
}

#[derive(Default)]
struct ProviderState {
    next_id: usize,
    instances: HashMap<String, Instance>,
    polls: HashMap<String, usize>,
    requests: Vec<CreateInstanceRequest>,
    keys_added: Vec<String>,
    keys_deleted: Vec<String>,
    instances_deleted: Vec<String>,
}

/// A provider whose instances get `ip` after `ip_after` lookups and whose
/// "boot" publishes a signed host key token into `kv`
pub struct FakeProvider {
    capability: ProviderCapability,
    regions: Vec<Region>,
    ip: IpAddr,
    ip_after: usize,
    kv: Option<Arc<FakeKv>>,
    tamper: AtomicBool,
    pub get_calls: AtomicUsize,
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            capability: ProviderCapability {
                kind,
                api_base: FAKE_API_BASE.to_string(),
                default_size: "small".to_string(),
                default_image: "ubuntu".to_string(),
                native_key_registration: true,
            },
            regions: vec![Region::new("r1", "DE"), Region::new("r2", "NL")],
            ip: NODE_IP.parse().unwrap(),
            ip_after: 1,
            kv: None,
            tamper: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn ip_after(mut self, polls: usize) -> Self {
        self.ip_after = polls;
        self
    }

    pub fn booting_into(mut self, kv: Arc<FakeKv>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Subsequent nodes sign their host key with the wrong secret
    pub fn set_tampered(&self, tampered: bool) {
        self.tamper.store(tampered, Ordering::SeqCst);
    }

    /// Seed an instance that exists before the test starts
    pub fn seed_instance(&self, id: &str, name: &str) {
        self.state.lock().unwrap().instances.insert(
            id.to_string(),
            Instance {
                id: id.to_string(),
                name: name.to_string(),
                region: Some("r2".to_string()),
                public_ip: None,
            },
        );
    }

    pub fn live_instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn requests(&self) -> Vec<CreateInstanceRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn keys_added(&self) -> Vec<String> {
        self.state.lock().unwrap().keys_added.clone()
    }

    pub fn keys_deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().keys_deleted.clone()
    }

    pub fn instances_deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().instances_deleted.clone()
    }

    fn boot(&self, user_data: &str) {
        let Some(kv) = &self.kv else { return };
        let (Some(uid), Some(secret)) = (
            script_var(user_data, "NS_NODE_UID"),
            script_var(user_data, "NS_SECRET"),
        ) else {
            return;
        };

        let secret = if self.tamper.load(Ordering::SeqCst) {
            "not-the-shared-secret".to_string()
        } else {
            secret
        };
        let token =
            HostKeyToken::sign(&uid, HOST_KEY, &secret, chrono::Duration::hours(1)).unwrap();
        kv.stage(&uid, &token);
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn capability(&self) -> &ProviderCapability {
        &self.capability
    }

    async fn fetch_regions(&self, _size: Option<&str>) -> ProviderResult<Vec<Region>> {
        Ok(self.regions.clone())
    }

    async fn add_key(&self, _public_key: &str, _name: &str) -> ProviderResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = format!("key-{}", state.keys_added.len() + 1);
        state.keys_added.push(id.clone());
        Ok(id)
    }

    async fn delete_key(&self, key_id: &str) -> ProviderResult<()> {
        self.state
            .lock()
            .unwrap()
            .keys_deleted
            .push(key_id.to_string());
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<CreatedInstance> {
        let instance = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let instance = Instance {
                id: format!("inst-{}", state.next_id),
                name: request.name.clone(),
                region: Some(request.region.clone()),
                public_ip: None,
            };
            state.instances.insert(instance.id.clone(), instance.clone());
            state.requests.push(request.clone());
            instance
        };

        self.boot(&request.user_data);

        Ok(CreatedInstance {
            instance,
            api_base: FAKE_API_BASE.to_string(),
        })
    }

    async fn get_instance(&self, id: &str, _api_base: &str) -> ProviderResult<Instance> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        let polls = {
            let count = state.polls.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let ip = self.ip;
        let ip_after = self.ip_after;
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| ProviderError::Api {
                provider: self.capability.kind,
                operation: "get_instance",
                status: 404,
                raw_response: "not found".to_string(),
            })?;
        if polls >= ip_after {
            instance.public_ip = Some(ip);
        }
        Ok(instance.clone())
    }

    async fn list_instances(&self) -> ProviderResult<Vec<InstanceGroup>> {
        let state = self.state.lock().unwrap();
        Ok(vec![InstanceGroup {
            api_base: FAKE_API_BASE.to_string(),
            instances: state.instances.values().cloned().collect(),
        }])
    }

    async fn delete_instances(&self, ids: &[String], _api_base: &str) -> DeleteSummary {
        let mut state = self.state.lock().unwrap();
        let mut summary = DeleteSummary::default();
        for id in ids {
            if state.instances.remove(id).is_some() {
                state.instances_deleted.push(id.clone());
                summary.deleted.push(id.clone());
            } else {
                summary.not_found.push(id.clone());
            }
        }
        summary
    }
}

/// KV service that returns a staged token once its key was read `publish_after` times
pub struct FakeKv {
    publish_after: usize,
    staged: Mutex<HashMap<String, String>>,
    reads: Mutex<HashMap<String, usize>>,
    pub gets: AtomicUsize,
    pub reachable: AtomicBool,
}

impl FakeKv {
    pub fn new(publish_after: usize) -> Self {
        Self {
            publish_after,
            staged: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// A service that never sees a publication
    pub fn silent() -> Self {
        Self::new(usize::MAX)
    }

    pub fn stage(&self, key: &str, token: &str) {
        self.staged
            .lock()
            .unwrap()
            .insert(key.to_string(), token.to_string());
    }
}

#[async_trait]
impl KvClient for FakeKv {
    async fn get(&self, key: &str) -> TrustResult<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let reads = {
            let mut reads = self.reads.lock().unwrap();
            let count = reads.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if reads < self.publish_after {
            return Ok(None);
        }
        Ok(self.staged.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> TrustResult<()> {
        self.stage(key, value);
        Ok(())
    }

    async fn ping(&self) -> TrustResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TrustError::Kv {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }
}

/// Port of the `-D`/`-L` forward an ssh master is asked to open
fn forward_port(script: &str) -> Option<u16> {
    ["-D 127.0.0.1:", "-L 127.0.0.1:"].iter().find_map(|flag| {
        let start = script.find(flag)? + flag.len();
        let digits: String = script[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    })
}

/// Control socket given with `-S`
fn control_socket(script: &str) -> Option<String> {
    let start = script.find("-S ")? + 3;
    script[start..].split_whitespace().next().map(str::to_string)
}

/// Records every command; `ssh-keygen` writes a throwaway key pair
///
/// Local ports behave like the real thing: an ssh master binding a port that
/// another master still holds exits 255, and `-O exit` frees its ports.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    bound: Mutex<HashMap<u16, String>>,
    pub bind_failures: AtomicUsize,
}

impl RecordingRunner {
    /// Control socket of the ssh master holding `port`
    pub fn port_owner(&self, port: u16) -> Option<String> {
        self.bound.lock().unwrap().get(&port).cloned()
    }

    fn forward(&self, script: &str) -> ProcessOutput {
        let mut bound = self.bound.lock().unwrap();
        if script.contains("-O exit") {
            if let Some(ctl) = control_socket(script) {
                bound.retain(|_, owner| *owner != ctl);
            }
        } else if let (Some(port), Some(ctl)) = (forward_port(script), control_socket(script)) {
            if bound.contains_key(&port) {
                self.bind_failures.fetch_add(1, Ordering::SeqCst);
                return ProcessOutput {
                    code: 255,
                    stdout: String::new(),
                    stderr: format!("bind [127.0.0.1:{}]: Address already in use", port),
                };
            }
            bound.insert(port, ctl);
        }
        ProcessOutput::default()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(program, _)| program.clone())
            .collect()
    }

    /// Bodies passed to `sh -c`
    pub fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(program, _)| program == "/bin/sh")
            .filter_map(|(_, args)| args.last().cloned())
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if program == "ssh-keygen" {
            if let Some(pos) = args.iter().position(|a| a == "-f") {
                let path = PathBuf::from(&args[pos + 1]);
                std::fs::write(&path, "PRIVATE KEY").unwrap();
                std::fs::write(
                    format!("{}.pub", path.display()),
                    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIClient nodeshift\n",
                )
                .unwrap();
            }
        }

        if program == "/bin/sh" {
            if let Some(script) = args.last() {
                return Ok(self.forward(script));
            }
        }

        Ok(ProcessOutput::default())
    }
}

/// Reports sshd ready from the `ready_after`-th probe on
pub struct StaticProbe {
    ready_after: usize,
    pub calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(ready_after: usize) -> Self {
        Self {
            ready_after,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SshProbe for StaticProbe {
    async fn is_ready(&self, _ip: IpAddr, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<LifecycleContext>,
    pub kv: Arc<FakeKv>,
    pub runner: Arc<RecordingRunner>,
    pub probe: Arc<StaticProbe>,
}

pub fn harness(
    providers: Vec<Arc<FakeProvider>>,
    kv: Arc<FakeKv>,
    tweak: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    let dir = TempDir::new().unwrap();

    let mut config = OrchestratorConfig {
        name_prefix: "nodeshift".to_string(),
        providers: providers.iter().map(|p| p.kind()).collect(),
        tunnel_type: TunnelType::Socks5Proxy,
        platform: Platform::Linux,
        poll_interval: Duration::from_secs(1),
        check_interval: Duration::from_secs(10),
        recycle_interval: Duration::from_secs(3600),
        kv_base_url: "http://kv.test".to_string(),
        state_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let runner = Arc::new(RecordingRunner::default());
    let probe = Arc::new(StaticProbe::new(1));

    let trust = Arc::new(TrustStore::new(kv.clone(), config.poll_interval));
    let tunnels = Arc::new(
        TunnelManager::new(
            ScriptMatrix::standard(),
            runner.clone(),
            config.tunnel_settings(),
            &[config.tunnel_type],
            &[config.platform],
        )
        .unwrap(),
    );
    let store = Arc::new(PersistenceStore::open(config.store_path()).unwrap());
    let providers: Vec<Arc<dyn ProviderAdapter>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn ProviderAdapter>)
        .collect();

    let ctx = Arc::new(LifecycleContext::new(
        config,
        providers,
        trust,
        tunnels,
        store,
        probe.clone(),
        runner.clone(),
    ));

    Harness {
        dir,
        ctx,
        kv,
        runner,
        probe,
    }
}
