//! Tunnel script matrix
//!
//! Every script is addressed by a [`ScriptKey`]. Server scripts always target
//! Linux since that is what the provisioned images run; client scripts exist
//! per client platform. Client `main/prepare` is optional, everything listed
//! by [`ScriptMatrix::required_keys`] must be present.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use nodeshift_proto::{Node, Platform, ScriptAction, ScriptPhase, Side, TunnelType};

use crate::error::{TunnelError, TunnelResult};

/// pf anchor loaded under the stock macOS `com.apple/*` hook
const PF_ANCHOR: &str = "com.apple/nodeshift";

/// Address plan for the point-to-point wireguard link
const WG_SERVER_ADDR: &str = "10.66.66.1/24";
const WG_CLIENT_ADDR: &str = "10.66.66.2/32";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub tunnel: TunnelType,
    pub side: Side,
    pub platform: Platform,
    pub action: ScriptAction,
    pub phase: ScriptPhase,
}

impl ScriptKey {
    pub fn client(
        tunnel: TunnelType,
        platform: Platform,
        action: ScriptAction,
        phase: ScriptPhase,
    ) -> Self {
        Self {
            tunnel,
            side: Side::Client,
            platform,
            action,
            phase,
        }
    }

    pub fn server(tunnel: TunnelType, phase: ScriptPhase) -> Self {
        Self {
            tunnel,
            side: Side::Server,
            platform: Platform::Linux,
            action: ScriptAction::Main,
            phase,
        }
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.tunnel, self.side, self.platform, self.action, self.phase
        )
    }
}

/// Everything a renderer may interpolate
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub node: &'a Node,
    pub ssh_user: &'a str,
    pub known_hosts: &'a Path,
    pub state_dir: &'a Path,
    pub allowed_subnets: &'a [String],
}

impl<'a> ScriptContext<'a> {
    pub fn ip(&self) -> TunnelResult<IpAddr> {
        self.node
            .public_ip
            .ok_or_else(|| TunnelError::MissingAttribute {
                uid: self.node.uid.clone(),
                attribute: "public IP",
            })
    }

    fn destination(&self) -> TunnelResult<String> {
        Ok(format!("{}@{}", self.ssh_user, self.ip()?))
    }

    /// Options shared by ssh, scp and sshuttle; host key checking is strict
    /// against our own known-hosts file
    fn ssh_identity_options(&self) -> String {
        format!(
            "-i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            sh_quote(&self.node.ssh_key_path.display().to_string()),
            sh_quote(&self.known_hosts.display().to_string()),
        )
    }

    fn ssh_options(&self) -> String {
        format!("{} -p {}", self.ssh_identity_options(), self.node.ssh_port)
    }

    fn runtime_file(&self, extension: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.{}", self.interface_name(), extension))
    }

    /// Interface names are capped at 15 bytes on Linux
    fn interface_name(&self) -> String {
        let suffix: String = self
            .node
            .uid
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(10)
            .collect();
        format!("ns{}", suffix)
    }

    fn log(&self) -> String {
        sh_quote(&self.node.params.log_path.display().to_string())
    }

    /// Endpoint the killswitch must keep reachable
    ///
    /// Proxy tunnels route no host traffic, so for them the SSH port stays
    /// open to every address and the replacement node can be reached.
    fn endpoint_rule(&self) -> (&'static str, u16) {
        match self.node.tunnel_type {
            TunnelType::WireGuard => ("udp", self.node.params.remote_port),
            _ => ("tcp", self.node.ssh_port),
        }
    }
}

/// Single-quote `value` for POSIX sh
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

pub type Renderer = fn(&ScriptContext<'_>) -> TunnelResult<String>;

#[derive(Clone, Default)]
pub struct ScriptMatrix {
    scripts: HashMap<ScriptKey, Renderer>,
}

impl fmt::Debug for ScriptMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.scripts.keys()).finish()
    }
}

impl ScriptMatrix {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scripts for every tunnel type on Linux and macOS clients
    pub fn standard() -> Self {
        let mut matrix = Self::empty();

        matrix.insert(
            ScriptKey::server(TunnelType::WireGuard, ScriptPhase::Prepare),
            wireguard_server_prepare,
        );
        matrix.insert(
            ScriptKey::server(TunnelType::Sshuttle, ScriptPhase::Prepare),
            sshuttle_server_prepare,
        );
        matrix.insert(
            ScriptKey::server(TunnelType::HttpProxy, ScriptPhase::Prepare),
            http_proxy_server_prepare,
        );
        matrix.insert(
            ScriptKey::server(TunnelType::Socks5Proxy, ScriptPhase::Prepare),
            socks5_server_prepare,
        );

        for platform in Platform::ALL {
            let client = |tunnel, action, phase| ScriptKey::client(tunnel, platform, action, phase);

            matrix.insert(
                client(TunnelType::WireGuard, ScriptAction::Main, ScriptPhase::Prepare),
                wireguard_client_prepare,
            );
            matrix.insert(
                client(TunnelType::WireGuard, ScriptAction::Main, ScriptPhase::Enable),
                wireguard_client_enable,
            );
            matrix.insert(
                client(TunnelType::WireGuard, ScriptAction::Main, ScriptPhase::Disable),
                wireguard_client_disable,
            );

            matrix.insert(
                client(TunnelType::Sshuttle, ScriptAction::Main, ScriptPhase::Enable),
                sshuttle_client_enable,
            );
            matrix.insert(
                client(TunnelType::Sshuttle, ScriptAction::Main, ScriptPhase::Disable),
                sshuttle_client_disable,
            );

            matrix.insert(
                client(TunnelType::HttpProxy, ScriptAction::Main, ScriptPhase::Enable),
                http_proxy_client_enable,
            );
            matrix.insert(
                client(TunnelType::Socks5Proxy, ScriptAction::Main, ScriptPhase::Enable),
                socks5_client_enable,
            );
            for tunnel in [TunnelType::HttpProxy, TunnelType::Socks5Proxy] {
                matrix.insert(
                    client(tunnel, ScriptAction::Main, ScriptPhase::Disable),
                    ssh_forward_client_disable,
                );
            }

            let (enable, disable): (Renderer, Renderer) = match platform {
                Platform::Linux => (
                    ufw_killswitch_enable as Renderer,
                    ufw_killswitch_disable as Renderer,
                ),
                Platform::Darwin => (
                    pf_killswitch_enable as Renderer,
                    pf_killswitch_disable as Renderer,
                ),
            };
            for tunnel in TunnelType::ALL {
                matrix.insert(
                    client(tunnel, ScriptAction::Killswitch, ScriptPhase::Enable),
                    enable,
                );
                matrix.insert(
                    client(tunnel, ScriptAction::Killswitch, ScriptPhase::Disable),
                    disable,
                );
            }
        }

        matrix
    }

    pub fn insert(&mut self, key: ScriptKey, renderer: Renderer) {
        self.scripts.insert(key, renderer);
    }

    pub fn remove(&mut self, key: &ScriptKey) -> Option<Renderer> {
        self.scripts.remove(key)
    }

    pub fn contains(&self, key: &ScriptKey) -> bool {
        self.scripts.contains_key(key)
    }

    pub fn render(&self, key: ScriptKey, ctx: &ScriptContext<'_>) -> TunnelResult<String> {
        let renderer = self
            .scripts
            .get(&key)
            .ok_or(TunnelError::MissingScript(key))?;
        renderer(ctx)
    }

    /// Keys that must exist before a tunnel of this type can run on `platform`
    pub fn required_keys(tunnel: TunnelType, platform: Platform) -> Vec<ScriptKey> {
        let mut keys = vec![ScriptKey::server(tunnel, ScriptPhase::Prepare)];
        for action in [ScriptAction::Main, ScriptAction::Killswitch] {
            for phase in [ScriptPhase::Enable, ScriptPhase::Disable] {
                keys.push(ScriptKey::client(tunnel, platform, action, phase));
            }
        }
        keys
    }

    /// Check every required combination, reporting all gaps at once
    pub fn validate(&self, tunnels: &[TunnelType], platforms: &[Platform]) -> TunnelResult<()> {
        let mut missing: Vec<ScriptKey> = Vec::new();
        for &tunnel in tunnels {
            for &platform in platforms {
                for key in Self::required_keys(tunnel, platform) {
                    if !self.contains(&key) && !missing.contains(&key) {
                        missing.push(key);
                    }
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::IncompleteMatrix(missing))
        }
    }
}

fn apt_install(packages: &str) -> String {
    format!(
        "export DEBIAN_FRONTEND=noninteractive\napt-get update -y\napt-get install -y {}\n",
        packages
    )
}

fn wireguard_server_prepare(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let port = ctx.node.params.remote_port;
    Ok(format!(
        r#"# wireguard server
{install}umask 077
mkdir -p /etc/wireguard
wg genkey | tee /etc/wireguard/server.key | wg pubkey > /etc/wireguard/server.pub
wg genkey | tee /etc/wireguard/client.key | wg pubkey > /etc/wireguard/client.pub
NS_IFACE="$(ip -o -4 route show to default | awk '{{print $5}}' | head -n1)"
cat > /etc/wireguard/wg0.conf <<NSEOF
[Interface]
Address = {server_addr}
ListenPort = {port}
PrivateKey = $(cat /etc/wireguard/server.key)
PostUp = iptables -t nat -A POSTROUTING -o $NS_IFACE -j MASQUERADE
PostDown = iptables -t nat -D POSTROUTING -o $NS_IFACE -j MASQUERADE

[Peer]
PublicKey = $(cat /etc/wireguard/client.pub)
AllowedIPs = {client_addr}
NSEOF
cat > /root/wg-client.conf <<NSEOF
[Interface]
Address = {client_addr}
PrivateKey = $(cat /etc/wireguard/client.key)
DNS = 1.1.1.1

[Peer]
PublicKey = $(cat /etc/wireguard/server.pub)
AllowedIPs = 0.0.0.0/0
PersistentKeepalive = 25
NSEOF
sysctl -w net.ipv4.ip_forward=1
systemctl enable --now wg-quick@wg0
"#,
        install = apt_install("wireguard iptables"),
        server_addr = WG_SERVER_ADDR,
        client_addr = WG_CLIENT_ADDR,
        port = port,
    ))
}

fn sshuttle_server_prepare(_ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(format!(
        "# sshuttle server\ncommand -v python3 >/dev/null || {{\n{}}}\n",
        apt_install("python3")
    ))
}

fn http_proxy_server_prepare(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(format!(
        r#"# http proxy server
{install}sed -i 's/^Port .*/Port {port}/' /etc/tinyproxy/tinyproxy.conf
sed -i 's/^#\?Listen .*/Listen 127.0.0.1/' /etc/tinyproxy/tinyproxy.conf
grep -q '^Listen 127.0.0.1' /etc/tinyproxy/tinyproxy.conf || echo 'Listen 127.0.0.1' >> /etc/tinyproxy/tinyproxy.conf
systemctl restart tinyproxy
"#,
        install = apt_install("tinyproxy"),
        port = ctx.node.params.remote_port,
    ))
}

fn socks5_server_prepare(_ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(r#"# socks5 server
sed -i 's/^#\?AllowTcpForwarding .*/AllowTcpForwarding yes/' /etc/ssh/sshd_config
systemctl reload ssh || systemctl reload sshd
"#
    .to_string())
}

fn wireguard_client_prepare(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let conf = sh_quote(&ctx.runtime_file("conf").display().to_string());
    Ok(format!(
        r#"mkdir -p {state_dir}
umask 077
scp {identity} -P {ssh_port} {dest}:/root/wg-client.conf {conf}
echo 'Endpoint = {ip}:{port}' >> {conf}
"#,
        state_dir = sh_quote(&ctx.state_dir.display().to_string()),
        identity = ctx.ssh_identity_options(),
        ssh_port = ctx.node.ssh_port,
        dest = ctx.destination()?,
        conf = conf,
        ip = ctx.ip()?,
        port = ctx.node.params.remote_port,
    ))
}

fn wireguard_client_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(format!(
        "wg-quick up {} >> {} 2>&1\n",
        sh_quote(&ctx.runtime_file("conf").display().to_string()),
        ctx.log()
    ))
}

fn wireguard_client_disable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let conf = sh_quote(&ctx.runtime_file("conf").display().to_string());
    Ok(format!(
        "wg-quick down {conf} >> {log} 2>&1\nrm -f {conf}\n",
        conf = conf,
        log = ctx.log()
    ))
}

fn sshuttle_client_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let ip = ctx.ip()?;
    Ok(format!(
        "mkdir -p {state_dir}\nsshuttle --daemon --pidfile {pid} --dns -e {ssh} -r {dest}:{port} -x {ip} 0/0 >> {log} 2>&1\n",
        state_dir = sh_quote(&ctx.state_dir.display().to_string()),
        pid = sh_quote(&ctx.runtime_file("pid").display().to_string()),
        ssh = sh_quote(&format!("ssh {}", ctx.ssh_identity_options())),
        dest = ctx.destination()?,
        port = ctx.node.ssh_port,
        ip = ip,
        log = ctx.log(),
    ))
}

fn sshuttle_client_disable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let pid = sh_quote(&ctx.runtime_file("pid").display().to_string());
    Ok(format!(
        "if [ -f {pid} ]; then\n  kill \"$(cat {pid})\" || true\n  rm -f {pid}\nfi\n",
        pid = pid
    ))
}

fn ssh_forward(ctx: &ScriptContext<'_>, forward: &str) -> TunnelResult<String> {
    Ok(format!(
        "mkdir -p {state_dir}\nssh -f -N -M -S {ctl} -E {log} -o ExitOnForwardFailure=yes {forward} {opts} {dest}\n",
        state_dir = sh_quote(&ctx.state_dir.display().to_string()),
        ctl = sh_quote(&ctx.runtime_file("ctl").display().to_string()),
        log = ctx.log(),
        forward = forward,
        opts = ctx.ssh_options(),
        dest = ctx.destination()?,
    ))
}

fn http_proxy_client_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let forward = format!(
        "-L 127.0.0.1:{}:127.0.0.1:{}",
        ctx.node.params.local_port, ctx.node.params.remote_port
    );
    ssh_forward(ctx, &forward)
}

fn socks5_client_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let forward = format!("-D 127.0.0.1:{}", ctx.node.params.local_port);
    ssh_forward(ctx, &forward)
}

fn ssh_forward_client_disable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(format!(
        "ssh -S {ctl} -O exit {opts} {dest} || true\n",
        ctl = sh_quote(&ctx.runtime_file("ctl").display().to_string()),
        opts = ctx.ssh_options(),
        dest = ctx.destination()?,
    ))
}

fn ufw_killswitch_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let ip = ctx.ip()?;
    let (proto, port) = ctx.endpoint_rule();

    let mut script = String::from(
        "ufw --force reset\nufw default deny incoming\nufw default deny outgoing\nufw allow in on lo\nufw allow out on lo\n",
    );
    script.push_str(&format!(
        "ufw allow out to {} port {} proto {}\n",
        ip, port, proto
    ));
    if ctx.node.tunnel_type.binds_local_port() {
        script.push_str(&format!("ufw allow out proto tcp to any port {}\n", port));
    }
    for subnet in ctx.allowed_subnets {
        script.push_str(&format!("ufw allow out to {}\n", subnet));
    }
    if ctx.node.tunnel_type == TunnelType::WireGuard {
        script.push_str(&format!("ufw allow out on {}\n", ctx.interface_name()));
    }
    script.push_str("ufw --force enable\n");

    Ok(script)
}

fn ufw_killswitch_disable(_ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok("ufw --force disable\nufw --force reset\n".to_string())
}

fn pf_killswitch_enable(ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    let ip = ctx.ip()?;
    let (proto, port) = ctx.endpoint_rule();
    let rules_path = ctx.state_dir.join("killswitch.pf");
    let rules_file = sh_quote(&rules_path.display().to_string());

    let mut rules = String::from("block drop out all\npass out quick on lo0 all\n");
    rules.push_str(&format!(
        "pass out quick proto {} to {} port {}\n",
        proto, ip, port
    ));
    if ctx.node.tunnel_type.binds_local_port() {
        rules.push_str(&format!("pass out quick proto tcp to any port {}\n", port));
    }
    for subnet in ctx.allowed_subnets {
        rules.push_str(&format!("pass out quick to {}\n", subnet));
    }
    if ctx.node.tunnel_type == TunnelType::WireGuard {
        rules.push_str("pass out quick on utun all\n");
    }

    Ok(format!(
        "mkdir -p {state_dir}\ncat > {file} <<'NSEOF'\n{rules}NSEOF\npfctl -a {anchor} -f {file}\npfctl -E\n",
        state_dir = sh_quote(&ctx.state_dir.display().to_string()),
        file = rules_file,
        rules = rules,
        anchor = PF_ANCHOR,
    ))
}

fn pf_killswitch_disable(_ctx: &ScriptContext<'_>) -> TunnelResult<String> {
    Ok(format!("pfctl -a {} -F all || true\n", PF_ANCHOR))
}
