//! Container networking.
//!
//! At `create` the runtime scans the current network namespace for
//! interfaces carrying addresses, captures their configuration, and plumbs
//! each veth into the VM through a bridge/tap pair. The discovered
//! configuration is also rendered into guest boot parameters and into the
//! hypervisor's netdev arguments. SR-IOV virtual functions are passed
//! through via VFIO instead, and interfaces backed by a vhost-user socket
//! get the corresponding chardev/netdev/device triple.

use anyhow::{bail, Context, Result};
use futures_util::stream::TryStreamExt;
use getset::Getters;
use ipnetwork::{Ipv4Network, Ipv6Network};
use log::{debug, trace, warn};
use rtnetlink::packet::rtnl::{
    address::nlas::Nla as AddressNla, link::nlas::Nla as LinkNla, route::nlas::Nla as RouteNla,
    LinkMessage,
};
use std::{
    fs,
    net::{Ipv4Addr, Ipv6Addr},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use tokio::runtime::Builder;

/// Directory scanned for vhost-user sockets named after the interface.
pub const VHOST_USER_DIR: &str = "/var/run/vhostuser";

/// Path of the tun/tap control device.
const TUN_DEVICE: &str = "/dev/net/tun";

/// An IPv4 address with its netmask-derived prefix.
pub type Ipv4Cfg = Ipv4Network;

/// An IPv6 address with its prefix length.
pub type Ipv6Cfg = Ipv6Network;

#[derive(Clone, Debug, Default, PartialEq, Getters)]
/// Configuration of one discovered interface.
pub struct NetInterface {
    #[get = "pub"]
    /// Interface (veth) name inside the namespace, reused inside the VM.
    ifname: String,

    #[get = "pub"]
    /// MAC address with colon separators.
    mac: String,

    #[get = "pub"]
    /// Name of the bridge connecting the veth to the tap device.
    bridge: String,

    #[get = "pub"]
    /// Name of the tap device handed to the hypervisor.
    tap_device: String,

    #[get = "pub"]
    /// IPv4 addresses assigned to the interface.
    ipv4_addrs: Vec<Ipv4Cfg>,

    #[get = "pub"]
    /// IPv6 addresses assigned to the interface.
    ipv6_addrs: Vec<Ipv6Cfg>,

    #[get = "pub"]
    /// PCI address when the interface is an SR-IOV virtual function.
    vf_bdf: Option<String>,

    #[get = "pub"]
    /// Backing vhost-user socket, when one exists for the interface.
    vhostuser_socket: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Getters)]
/// Network configuration discovered for the container.
pub struct NetConfig {
    #[get = "pub"]
    /// Hostname handed to the guest.
    hostname: String,

    #[get = "pub"]
    /// Default IPv4 gateway, when one exists.
    gateway: Option<Ipv4Addr>,

    #[get = "pub"]
    /// Discovered interfaces.
    interfaces: Vec<NetInterface>,
}

impl NetConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }
}

/// Deterministic tap device name for an interface.
pub fn tap_name(ifname: &str) -> String {
    format!("c{}", ifname)
}

/// Deterministic bridge name for an interface.
pub fn bridge_name(ifname: &str) -> String {
    format!("b{}", ifname)
}

/// Parse a colon-separated MAC address.
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let bytes: Vec<u8> = mac
        .split(':')
        .map(|p| u8::from_str_radix(p, 16))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("parse MAC address {}", mac))?;
    if bytes.len() != 6 {
        bail!("MAC address {} has {} octets", mac, bytes.len());
    }
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Format a MAC address with colon separators.
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Derive a non-conflicting, locally administered MAC for the in-namespace
/// endpoint, freeing the original address for the guest.
pub fn derive_mac(mac: &str) -> Result<String> {
    let mut bytes = parse_mac(mac)?;
    bytes[0] = 0x02;
    bytes[5] = bytes[5].wrapping_add(1);
    Ok(format_mac(&bytes))
}

/// Whether the interface is an SR-IOV virtual function, returning its PCI
/// address if so. VFs expose a `physfn` link below their device node.
pub fn detect_vf(sysfs_root: &Path, ifname: &str) -> Option<String> {
    let device = sysfs_root.join("class/net").join(ifname).join("device");
    if !device.join("physfn").exists() {
        return None;
    }

    fs::read_link(&device)
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

/// Look for a vhost-user socket named after the interface.
pub fn detect_vhostuser(socket_dir: &Path, ifname: &str) -> Option<PathBuf> {
    let path = socket_dir.join(format!("{}.sock", ifname));
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

/// Unbind a PCI device from its current driver and bind it to vfio-pci.
pub fn vfio_bind(sysfs_root: &Path, bdf: &str) -> Result<()> {
    let device = sysfs_root.join("bus/pci/devices").join(bdf);

    let unbind = device.join("driver/unbind");
    if unbind.exists() {
        fs::write(&unbind, bdf)
            .with_context(|| format!("unbind {} from current driver", bdf))?;
    }

    let vendor = fs::read_to_string(device.join("vendor"))
        .with_context(|| format!("read vendor id of {}", bdf))?;
    let device_id = fs::read_to_string(device.join("device"))
        .with_context(|| format!("read device id of {}", bdf))?;

    let new_id = sysfs_root.join("bus/pci/drivers/vfio-pci/new_id");
    fs::write(
        &new_id,
        format!(
            "{} {}",
            vendor.trim().trim_start_matches("0x"),
            device_id.trim().trim_start_matches("0x")
        ),
    )
    .with_context(|| format!("register {} with vfio-pci", bdf))?;

    debug!("bound {} to vfio-pci", bdf);
    Ok(())
}

/// Create a persistent tap device.
fn tap_create(tap: &str) -> Result<()> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .with_context(|| format!("open {}", TUN_DEVICE))?;

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(tap.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = libc::IFF_TAP as libc::c_short;

    if unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &ifr) } < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("create tap device {}", tap));
    }
    if unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETPERSIST, 1) } < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("persist tap device {}", tap));
    }

    debug!("created tap device {}", tap);
    Ok(())
}

/// Netlink interface abstraction.
pub struct Netlink {
    handle: rtnetlink::Handle,
}

impl Netlink {
    /// Create a new netlink instance.
    pub async fn new() -> Result<Self> {
        debug!("creating new netlink connection");

        let (connection, handle, _) =
            rtnetlink::new_connection().context("create new netlink connection")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    async fn link_index(&self, name: &str) -> Result<u32> {
        let link = self
            .handle
            .link()
            .get()
            .set_name_filter(name.into())
            .execute()
            .try_next()
            .await
            .context("get links")?
            .with_context(|| format!("no link found for name {}", name))?;
        Ok(link.header.index)
    }

    fn link_name(message: &LinkMessage) -> Option<String> {
        message.nlas.iter().find_map(|nla| match nla {
            LinkNla::IfName(name) => Some(name.clone()),
            _ => None,
        })
    }

    fn link_mac(message: &LinkMessage) -> Option<String> {
        message.nlas.iter().find_map(|nla| match nla {
            LinkNla::Address(addr) if addr.len() == 6 => Some(format_mac(addr)),
            _ => None,
        })
    }

    async fn addresses(&self, index: u32) -> Result<(Vec<Ipv4Cfg>, Vec<Ipv6Cfg>)> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        while let Some(msg) = stream.try_next().await.context("get addresses")? {
            let prefix = msg.header.prefix_len;
            for nla in &msg.nlas {
                if let AddressNla::Address(bytes) = nla {
                    match bytes.len() {
                        4 => {
                            let addr = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                            match Ipv4Network::new(addr, prefix) {
                                Ok(net) => v4.push(net),
                                Err(e) => warn!("skipping address {}: {}", addr, e),
                            }
                        }
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(bytes);
                            let addr = Ipv6Addr::from(octets);
                            match Ipv6Network::new(addr, prefix) {
                                Ok(net) => v6.push(net),
                                Err(e) => warn!("skipping address {}: {}", addr, e),
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok((v4, v6))
    }

    /// Query the default IPv4 gateway.
    pub async fn default_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let mut stream = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();

        while let Some(route) = stream.try_next().await.context("get routes")? {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            for nla in &route.nlas {
                if let RouteNla::Gateway(bytes) = nla {
                    if bytes.len() == 4 {
                        return Ok(Some(Ipv4Addr::new(
                            bytes[0], bytes[1], bytes[2], bytes[3],
                        )));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Scan the current network namespace for configured interfaces.
    ///
    /// Discovery is tolerant of partial results: no interfaces or no gateway
    /// still yields a valid (isolated) configuration.
    pub async fn discover(&self, hostname: &str) -> Result<NetConfig> {
        let mut config = NetConfig::new(hostname);

        debug!("discovering container interfaces");

        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await.context("get links")? {
            let name = match Self::link_name(&link) {
                Some(name) => name,
                None => continue,
            };
            if name == "lo" {
                continue;
            }

            let (ipv4_addrs, ipv6_addrs) = self.addresses(link.header.index).await?;
            if ipv4_addrs.is_empty() && ipv6_addrs.is_empty() {
                trace!("skipping interface {} without addresses", name);
                continue;
            }

            let mac = Self::link_mac(&link).unwrap_or_default();
            debug!("discovered interface {} ({})", name, mac);

            config.interfaces.push(NetInterface {
                tap_device: tap_name(&name),
                bridge: bridge_name(&name),
                vf_bdf: detect_vf(Path::new("/sys"), &name),
                vhostuser_socket: detect_vhostuser(Path::new(VHOST_USER_DIR), &name),
                ifname: name,
                mac,
                ipv4_addrs,
                ipv6_addrs,
            });
        }

        if !config.interfaces.is_empty() {
            config.gateway = self.default_gateway().await?;
        }
        if config.gateway.is_none() {
            debug!("no default gateway, configuring the guest as isolated");
        }

        Ok(config)
    }

    /// Plumb `veth ↔ bridge ↔ tap` for every discovered interface.
    ///
    /// VF-backed interfaces get no bridge; their PCI device is rebound to
    /// vfio-pci so the hypervisor can take it whole. Vhost-user interfaces
    /// are plumbed by their backend.
    pub async fn create(&self, config: &NetConfig) -> Result<()> {
        for iface in &config.interfaces {
            if let Some(bdf) = &iface.vf_bdf {
                vfio_bind(Path::new("/sys"), bdf)
                    .with_context(|| format!("prepare {} for passthrough", iface.ifname))?;
                continue;
            }
            if iface.vhostuser_socket.is_some() {
                continue;
            }

            tap_create(&iface.tap_device)?;

            self.handle
                .link()
                .add()
                .bridge(iface.bridge.clone())
                .execute()
                .await
                .with_context(|| format!("create bridge {}", iface.bridge))?;

            let veth_index = self.link_index(&iface.ifname).await?;
            let bridge_index = self.link_index(&iface.bridge).await?;
            let tap_index = self.link_index(&iface.tap_device).await?;

            // Free the original MAC for the guest-side device.
            let derived = derive_mac(&iface.mac)?;
            self.handle
                .link()
                .set(veth_index)
                .address(parse_mac(&derived)?.to_vec())
                .execute()
                .await
                .with_context(|| format!("set MAC of {}", iface.ifname))?;

            for (index, name) in &[(veth_index, &iface.ifname), (tap_index, &iface.tap_device)] {
                self.handle
                    .link()
                    .set(*index)
                    .master(bridge_index)
                    .execute()
                    .await
                    .with_context(|| format!("enslave {} to {}", name, iface.bridge))?;
            }

            for (index, name) in &[
                (veth_index, &iface.ifname),
                (tap_index, &iface.tap_device),
                (bridge_index, &iface.bridge),
            ] {
                self.handle
                    .link()
                    .set(*index)
                    .up()
                    .execute()
                    .await
                    .with_context(|| format!("set link {} up", name))?;
            }

            debug!(
                "plumbed {} via {} onto {}",
                iface.ifname, iface.bridge, iface.tap_device
            );
        }

        Ok(())
    }
}

/// Discover the namespace's network configuration and create the tap/bridge
/// plumbing, driving the async netlink conversation on a private runtime.
pub fn discover_and_create(hostname: &str) -> Result<NetConfig> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build netlink runtime")?;

    runtime.block_on(async {
        let netlink = Netlink::new().await?;
        let config = netlink.discover(hostname).await?;
        netlink.create(&config).await?;
        Ok(config)
    })
}

/// Render the discovered configuration into `KEY=VALUE` guest boot
/// parameters.
pub fn kernel_net_params(config: &NetConfig) -> Vec<String> {
    let mut params = Vec::new();

    if !config.hostname.is_empty() {
        params.push(format!("hostname={}", config.hostname));
    }
    if let Some(gateway) = config.gateway {
        params.push(format!("gateway={}", gateway));
    }

    for (i, iface) in config.interfaces.iter().enumerate() {
        let mut fields = vec![iface.ifname.clone(), iface.mac.clone()];
        fields.extend(iface.ipv4_addrs.iter().map(|a| a.to_string()));
        params.push(format!("if{}={}", i, fields.join(",")));

        for addr in &iface.ipv6_addrs {
            params.push(format!("if{}.ip6={}", i, addr));
        }
    }

    params
}

/// Assemble the hypervisor's network device arguments.
///
/// Each interface contributes either a tap netdev, a vhost-user triple or a
/// VFIO passthrough device; vhost-user additionally pulls in the shared
/// memory backing objects once. Without interfaces, networking is disabled
/// explicitly.
pub fn netdev_args(config: &NetConfig) -> Vec<String> {
    let mut args = Vec::new();
    let mut need_memory_backend = false;

    for (i, iface) in config.interfaces.iter().enumerate() {
        if let Some(bdf) = &iface.vf_bdf {
            args.push("-device".into());
            args.push(format!("vfio-pci,host={}", bdf));
            continue;
        }

        if let Some(socket) = &iface.vhostuser_socket {
            need_memory_backend = true;
            args.push("-chardev".into());
            args.push(format!("socket,id=char{},path={}", i, socket.display()));
            args.push("-netdev".into());
            args.push(format!("type=vhost-user,id=net{},chardev=char{},vhostforce", i, i));
            args.push("-device".into());
            args.push(format!("virtio-net-pci,netdev=net{},mac={}", i, iface.mac));
            continue;
        }

        args.push("-netdev".into());
        args.push(format!(
            "tap,id=net{},ifname={},script=no,downscript=no",
            i, iface.tap_device
        ));
        args.push("-device".into());
        args.push(format!(
            "driver=virtio-net-pci,netdev=net{},mac={}",
            i, iface.mac
        ));
    }

    if need_memory_backend {
        args.push("-object".into());
        args.push("memory-backend-file,id=mem0,size=2048M,mem-path=/dev/hugepages,share=on".into());
        args.push("-numa".into());
        args.push("node,memdev=mem0".into());
    }

    if args.is_empty() {
        args.push("-net".into());
        args.push("none".into());
    }

    args
}
