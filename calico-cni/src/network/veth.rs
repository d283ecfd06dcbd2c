//! Veth pairs connecting a container's namespace to the host.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, info, warn};
use unshare::{Command, Stdio};

use super::namespace::{self, NetnsError};
use crate::datastore::Endpoint;

/// Next hop for every route in the container. The host side answers ARP for it with proxy ARP.
pub const GATEWAY_V4: &str = "169.254.1.1";

/// Where iproute2 is looked for; processes are spawned without a `PATH` search.
const IP_SEARCH_PATH: &[&str] = &["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

/// Creates and removes the interface pair backing an endpoint.
pub trait VethManager {
    /// Creates the pair for `endpoint`: the host side is named `endpoint.name`, the container side `ifname` inside
    /// `netns`. Returns the container side's MAC address.
    fn provision_veth(&self, endpoint: &Endpoint, netns: &Path, ifname: &str) -> Result<String, NetnsError>;

    /// Deletes the host side of a pair, which also deletes its peer. Returns whether it existed.
    fn remove_veth(&self, name: &str) -> Result<bool, NetnsError>;
}

/// [`VethManager`] driving iproute2.
pub struct IpVethManager {
    ip_binary: PathBuf,
    proc_sys: PathBuf,
}

impl Default for IpVethManager {
    fn default() -> Self {
        IpVethManager {
            ip_binary: find_ip_binary(),
            proc_sys: "/proc/sys".into(),
        }
    }
}

fn find_ip_binary() -> PathBuf {
    IP_SEARCH_PATH
        .iter()
        .map(|dir| Path::new(dir).join("ip"))
        .find(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from("/sbin/ip"))
}

impl IpVethManager {
    fn ip(&self, args: &[&str]) -> Result<String, NetnsError> {
        let rendered = format!("ip {}", args.join(" "));
        debug!("Running {}", rendered);

        let mut command = Command::new(&self.ip_binary);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|error| NetnsError::Exec {
            command: rendered.clone(),
            error,
        })?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).map_err(|error| NetnsError::Io {
                context: format!("could not read output of {}", rendered),
                error,
            })?;
        }
        let status = child.wait().map_err(|error| NetnsError::Io {
            context: format!("could not wait for {}", rendered),
            error,
        })?;
        let stderr = stderr.and_then(|handle| handle.join().ok()).unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            Err(NetnsError::Command {
                command: rendered,
                status: status.to_string(),
                stderr: stderr.trim().into(),
            })
        }
    }

    fn enable_proxy_arp(&self, host_ifname: &str) -> Result<(), NetnsError> {
        let path = self
            .proc_sys
            .join("net/ipv4/conf")
            .join(host_ifname)
            .join("proxy_arp");
        fs::write(&path, "1").map_err(|error| NetnsError::Io {
            context: format!("could not enable proxy ARP on {}", host_ifname),
            error,
        })
    }

    /// Everything done from inside the container's namespace.
    fn configure_container_side(
        &self,
        endpoint: &Endpoint,
        netns: &Path,
        peer: &str,
        ifname: &str,
    ) -> Result<String, NetnsError> {
        let _guard = namespace::enter(netns)?;

        self.ip(&["link", "set", "dev", peer, "name", ifname])?;
        self.ip(&["link", "set", "dev", ifname, "up"])?;

        if let Some(net) = endpoint.ipv4() {
            self.ip(&["-4", "addr", "add", &net.to_string(), "dev", ifname])?;
            self.ip(&["-4", "route", "add", GATEWAY_V4, "dev", ifname])?;
            self.ip(&["-4", "route", "add", "default", "via", GATEWAY_V4, "dev", ifname])?;
        }
        if let Some(net) = endpoint.ipv6() {
            self.ip(&["-6", "addr", "add", &net.to_string(), "dev", ifname])?;
            self.ip(&["-6", "route", "add", "default", "dev", ifname])?;
        }

        let link = self.ip(&["-o", "link", "show", "dev", ifname])?;
        parse_mac(&link).ok_or_else(|| NetnsError::NoMac(ifname.into()))
    }
}

impl VethManager for IpVethManager {
    #[tracing::instrument(skip(self, endpoint), fields(host_ifname = %endpoint.name))]
    fn provision_veth(&self, endpoint: &Endpoint, netns: &Path, ifname: &str) -> Result<String, NetnsError> {
        let host = endpoint.name.as_str();
        let peer = temporary_peer_name(&endpoint.endpoint_id);
        let netns_arg = netns.to_string_lossy();

        info!("Creating veth pair {} / {}", host, peer);
        self.ip(&["link", "add", host, "type", "veth", "peer", "name", &peer])?;

        let result = self
            .ip(&["link", "set", "dev", host, "up"])
            .and_then(|_| {
                if endpoint.ipv4().is_some() {
                    self.enable_proxy_arp(host)?;
                }
                Ok(())
            })
            .and_then(|_| self.ip(&["link", "set", "dev", &peer, "netns", &netns_arg]))
            .and_then(|_| self.configure_container_side(endpoint, netns, &peer, ifname));

        match result {
            Ok(mac) => {
                info!("Provisioned {} in {} with MAC {}", ifname, netns.display(), mac);
                Ok(mac)
            }
            Err(err) => {
                if let Err(cleanup) = self.ip(&["link", "del", "dev", host]) {
                    warn!("Could not clean up veth {}: {}", host, cleanup);
                }
                Err(err)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    fn remove_veth(&self, name: &str) -> Result<bool, NetnsError> {
        if self.ip(&["link", "show", "dev", name]).is_err() {
            info!("Veth {} does not exist", name);
            return Ok(false);
        }
        self.ip(&["link", "del", "dev", name])?;
        info!("Removed veth {}", name);
        Ok(true)
    }
}

/// Peer names must be unique on the host until the peer moves into the container.
fn temporary_peer_name(endpoint_id: &str) -> String {
    format!("tmp{}", endpoint_id.chars().take(11).collect::<String>())
}

/// Pulls the MAC address out of `ip -o link show` output.
pub fn parse_mac(link: &str) -> Option<String> {
    let mut tokens = link.split_whitespace();
    tokens.find(|token| *token == "link/ether")?;
    tokens.next().map(str::to_lowercase)
}
