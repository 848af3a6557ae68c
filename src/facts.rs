//! System fact gathering.
//!
//! Runs a fixed probe sequence over a connection and parses the outputs
//! into `ansible_*` facts. A failed probe contributes nothing; gathering
//! never fails as a whole.

use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::connection::{Connection, ExecuteOptions};
use crate::vars::VarMap;

/// Gathers facts from hosts over their connections.
#[derive(Debug, Default)]
pub struct FactGatherer;

impl FactGatherer {
    /// Create a gatherer.
    pub fn new() -> Self {
        Self
    }

    /// Run the probe sequence and collect facts. Probe failures are
    /// skipped.
    pub async fn gather(&self, conn: &dyn Connection) -> VarMap {
        let mut facts = VarMap::new();
        let options = ExecuteOptions::default().with_timeout(30);

        let probe = |cmd: &str| {
            let cmd = cmd.to_string();
            let options = options.clone();
            async move {
                match conn.execute(&cmd, &options).await {
                    Ok(result) if result.success => Some(result.stdout.trim().to_string()),
                    Ok(result) => {
                        trace!(cmd = %cmd, exit_code = result.exit_code, "probe failed");
                        None
                    }
                    Err(e) => {
                        trace!(cmd = %cmd, error = %e, "probe errored");
                        None
                    }
                }
            }
        };

        if let Some(hostname) = probe("hostname").await {
            facts.insert("ansible_hostname".into(), JsonValue::String(hostname));
        }
        if let Some(fqdn) = probe("hostname -f").await {
            facts.insert("ansible_fqdn".into(), JsonValue::String(fqdn));
        }
        if let Some(system) = probe("uname -s").await {
            facts.insert("ansible_system".into(), JsonValue::String(system));
        }
        if let Some(kernel) = probe("uname -r").await {
            facts.insert("ansible_kernel".into(), JsonValue::String(kernel));
        }
        if let Some(arch) = probe("uname -m").await {
            facts.insert("ansible_architecture".into(), JsonValue::String(arch));
        }

        if let Some(os_release) = probe("cat /etc/os-release").await {
            for (key, value) in parse_os_release(&os_release) {
                facts.insert(key, value);
            }
        } else if let Some(redhat) = probe("cat /etc/redhat-release").await {
            facts.insert("ansible_distribution".into(), JsonValue::String(redhat));
        } else if let Some(version) = probe("cat /etc/debian_version").await {
            facts.insert(
                "ansible_distribution".into(),
                JsonValue::String("Debian".into()),
            );
            facts.insert(
                "ansible_distribution_version".into(),
                JsonValue::String(version),
            );
        }

        if let Some(route) = probe("ip route get 1.1.1.1").await {
            if let Some(default_ipv4) = parse_default_route(&route) {
                facts.insert("ansible_default_ipv4".into(), default_ipv4);
            }
        }

        if let Some(links) = probe("ip -o link show").await {
            let interfaces = parse_link_show(&links);
            for name in &interfaces {
                if let Some(addr_out) = probe(&format!("ip addr show {}", name)).await {
                    facts.insert(
                        format!("ansible_{}", name.replace(['-', '.'], "_")),
                        parse_addr_show(name, &addr_out),
                    );
                }
            }
            facts.insert(
                "ansible_interfaces".into(),
                JsonValue::Array(interfaces.into_iter().map(JsonValue::String).collect()),
            );
        }

        if let Some(nproc) = probe("nproc").await {
            if let Ok(count) = nproc.parse::<u64>() {
                facts.insert("ansible_processor_count".into(), JsonValue::from(count));
            }
        }
        if let Some(cpuinfo) = probe("cat /proc/cpuinfo").await {
            let models = parse_cpuinfo(&cpuinfo);
            if !models.is_empty() {
                facts.insert(
                    "ansible_processor".into(),
                    JsonValue::Array(models.into_iter().map(JsonValue::String).collect()),
                );
            }
        }
        if let Some(meminfo) = probe("cat /proc/meminfo").await {
            for (key, value) in parse_meminfo(&meminfo) {
                facts.insert(key, value);
            }
        }
        if let Some(df) = probe("df -P").await {
            facts.insert("ansible_mounts".into(), parse_df(&df));
        }

        if let Some(user) = probe("whoami").await {
            facts.insert("ansible_user_id".into(), JsonValue::String(user));
        }
        if let Some(id_out) = probe("id").await {
            for (key, value) in parse_id(&id_out) {
                facts.insert(key, value);
            }
        }
        if let Some(home) = probe("echo $HOME").await {
            facts.insert("ansible_user_dir".into(), JsonValue::String(home));
        }
        if let Some(shell) = probe("echo $SHELL").await {
            facts.insert("ansible_user_shell".into(), JsonValue::String(shell));
        }
        if let Some(path) = probe("echo $PATH").await {
            facts.insert(
                "ansible_env".into(),
                serde_json::json!({ "PATH": path }),
            );
        }

        debug!(count = facts.len(), host = %conn.host(), "facts gathered");
        facts
    }
}

/// Parse `/etc/os-release` key=value lines.
fn parse_os_release(content: &str) -> VarMap {
    let mut facts = VarMap::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "NAME" => {
                facts.insert("ansible_distribution".into(), JsonValue::String(value));
            }
            "VERSION_ID" => {
                facts.insert(
                    "ansible_distribution_version".into(),
                    JsonValue::String(value),
                );
            }
            "ID_LIKE" => {
                facts.insert("ansible_os_family".into(), JsonValue::String(value));
            }
            _ => {}
        }
    }
    facts
}

/// Parse `ip route get 1.1.1.1` into `{address, interface, gateway}`.
fn parse_default_route(output: &str) -> Option<JsonValue> {
    let line = output.lines().next()?;
    let words: Vec<&str> = line.split_whitespace().collect();
    let mut address = None;
    let mut interface = None;
    let mut gateway = None;
    for window in words.windows(2) {
        match window[0] {
            "src" => address = Some(window[1]),
            "dev" => interface = Some(window[1]),
            "via" => gateway = Some(window[1]),
            _ => {}
        }
    }
    let mut map = serde_json::Map::new();
    map.insert("address".into(), JsonValue::String(address?.to_string()));
    map.insert(
        "interface".into(),
        JsonValue::String(interface.unwrap_or_default().to_string()),
    );
    if let Some(gateway) = gateway {
        map.insert("gateway".into(), JsonValue::String(gateway.to_string()));
    }
    Some(JsonValue::Object(map))
}

/// Parse `ip -o link show` into interface names, loopback excluded.
fn parse_link_show(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(':');
            let _index = parts.next()?;
            let name = parts.next()?.trim();
            // Strip VLAN/master suffixes such as `eth0@if2`.
            let name = name.split('@').next()?.trim();
            if name.is_empty() || name == "lo" {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// Parse `ip addr show <iface>` into `{ipv4: [..], ipv6: [..], mac}`.
fn parse_addr_show(name: &str, output: &str) -> JsonValue {
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    let mut mac = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("inet ") {
            if let Some(addr) = rest.split_whitespace().next() {
                ipv4.push(JsonValue::String(addr.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix("inet6 ") {
            if let Some(addr) = rest.split_whitespace().next() {
                ipv6.push(JsonValue::String(addr.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix("link/ether ") {
            mac = rest.split_whitespace().next().map(str::to_string);
        }
    }
    let mut map = serde_json::Map::new();
    map.insert("device".into(), JsonValue::String(name.to_string()));
    map.insert("ipv4".into(), JsonValue::Array(ipv4));
    map.insert("ipv6".into(), JsonValue::Array(ipv6));
    if let Some(mac) = mac {
        map.insert("macaddress".into(), JsonValue::String(mac));
    }
    JsonValue::Object(map)
}

/// Parse `/proc/cpuinfo` model names.
fn parse_cpuinfo(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| line.starts_with("model name"))
        .filter_map(|line| line.split_once(':').map(|(_, v)| v.trim().to_string()))
        .collect()
}

/// Parse `/proc/meminfo` totals into MiB facts.
fn parse_meminfo(content: &str) -> VarMap {
    let mut facts = VarMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kb: Option<u64> = rest
            .trim()
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok());
        let Some(kb) = kb else { continue };
        match key.trim() {
            "MemTotal" => {
                facts.insert("ansible_memtotal_mb".into(), JsonValue::from(kb / 1024));
            }
            "MemFree" => {
                facts.insert("ansible_memfree_mb".into(), JsonValue::from(kb / 1024));
            }
            "SwapTotal" => {
                facts.insert("ansible_swaptotal_mb".into(), JsonValue::from(kb / 1024));
            }
            _ => {}
        }
    }
    facts
}

/// Parse `df -P` into mount records.
fn parse_df(content: &str) -> JsonValue {
    let mounts: Vec<JsonValue> = content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.len() < 6 {
                return None;
            }
            Some(serde_json::json!({
                "device": words[0],
                "size_total": words[1].parse::<u64>().ok()? * 1024,
                "size_used": words[2].parse::<u64>().ok()? * 1024,
                "size_available": words[3].parse::<u64>().ok()? * 1024,
                "mount": words[5],
            }))
        })
        .collect();
    JsonValue::Array(mounts)
}

/// Parse `id` output into uid/gid facts.
fn parse_id(output: &str) -> VarMap {
    let mut facts = VarMap::new();
    for field in output.split_whitespace() {
        if let Some(rest) = field.strip_prefix("uid=") {
            if let Some(uid) = rest.split('(').next().and_then(|v| v.parse::<u64>().ok()) {
                facts.insert("ansible_user_uid".into(), JsonValue::from(uid));
            }
        } else if let Some(rest) = field.strip_prefix("gid=") {
            if let Some(gid) = rest.split('(').next().and_then(|v| v.parse::<u64>().ok()) {
                facts.insert("ansible_user_gid".into(), JsonValue::from(gid));
            }
        }
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::connection::{Connection as _, ConnectionInfo};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_os_release() {
        let content = r#"
NAME="Ubuntu"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
VERSION_ID="22.04"
"#;
        let facts = parse_os_release(content);
        assert_eq!(facts["ansible_distribution"], json!("Ubuntu"));
        assert_eq!(facts["ansible_distribution_version"], json!("22.04"));
        assert_eq!(facts["ansible_os_family"], json!("debian"));
    }

    #[test]
    fn test_parse_default_route() {
        let output = "1.1.1.1 via 192.168.1.1 dev eth0 src 192.168.1.50 uid 1000";
        let parsed = parse_default_route(output).unwrap();
        assert_eq!(parsed["address"], json!("192.168.1.50"));
        assert_eq!(parsed["interface"], json!("eth0"));
        assert_eq!(parsed["gateway"], json!("192.168.1.1"));

        assert!(parse_default_route("1.1.1.1 dev eth0").is_none());
    }

    #[test]
    fn test_parse_link_show() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
3: docker0@if4: <BROADCAST> mtu 1500";
        assert_eq!(parse_link_show(output), vec!["eth0", "docker0"]);
    }

    #[test]
    fn test_parse_addr_show() {
        let output = "\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
    inet 192.168.1.50/24 brd 192.168.1.255 scope global eth0
    inet6 fe80::5054:ff:fe12:3456/64 scope link";
        let parsed = parse_addr_show("eth0", output);
        assert_eq!(parsed["device"], json!("eth0"));
        assert_eq!(parsed["ipv4"], json!(["192.168.1.50/24"]));
        assert_eq!(parsed["ipv6"], json!(["fe80::5054:ff:fe12:3456/64"]));
        assert_eq!(parsed["macaddress"], json!("52:54:00:12:34:56"));
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "\
MemTotal:       16340212 kB
MemFree:         8123456 kB
SwapTotal:       2097148 kB";
        let facts = parse_meminfo(content);
        assert_eq!(facts["ansible_memtotal_mb"], json!(15957));
        assert_eq!(facts["ansible_memfree_mb"], json!(7933));
        assert_eq!(facts["ansible_swaptotal_mb"], json!(2047));
    }

    #[test]
    fn test_parse_df() {
        let content = "\
Filesystem     1024-blocks    Used Available Capacity Mounted on
/dev/sda1         41152812 9273248  29965436      24% /
tmpfs              8170106       0   8170106       0% /dev/shm";
        let mounts = parse_df(content);
        let mounts = mounts.as_array().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0]["device"], json!("/dev/sda1"));
        assert_eq!(mounts[0]["mount"], json!("/"));
        assert_eq!(mounts[0]["size_total"], json!(41152812u64 * 1024));
    }

    #[test]
    fn test_parse_id() {
        let facts = parse_id("uid=1000(deploy) gid=1000(deploy) groups=1000(deploy),27(sudo)");
        assert_eq!(facts["ansible_user_uid"], json!(1000));
        assert_eq!(facts["ansible_user_gid"], json!(1000));
    }

    #[tokio::test]
    async fn test_gather_local_smoke() {
        let mut conn = LocalConnection::new();
        conn.connect(ConnectionInfo::new("localhost")).await.unwrap();

        let facts = FactGatherer::new().gather(&conn).await;
        // The basics resolve on any Unix control node.
        assert!(facts.contains_key("ansible_hostname"));
        assert!(facts.contains_key("ansible_system"));
        assert!(facts.contains_key("ansible_user_id"));
    }
}
