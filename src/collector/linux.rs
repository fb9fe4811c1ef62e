// Linux-specific helpers: /proc and /etc/os-release fallbacks.

/// First "model name" from /proc/cpuinfo. Used when sysinfo reports an empty brand.
pub(super) fn read_cpu_model() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/cpuinfo").ok()?;
        for line in content.lines() {
            if line.starts_with("model name") {
                let name = line
                    .find(": ")
                    .map(|i| line[i + 2..].trim())
                    .filter(|s| !s.is_empty() && *s != "cpu0")?;
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Distro display name from /etc/os-release.
pub(super) fn read_os_pretty_name() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/etc/os-release").ok()?;
        return parse_os_release(&content);
    }
    #[cfg(not(target_os = "linux"))]
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_os_release(content: &str) -> Option<String> {
    let value = |key: &str| {
        content
            .lines()
            .find_map(|l| l.strip_prefix(key))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    };
    value("PRETTY_NAME=").or_else(|| value("NAME="))
}

/// Loopback and virtual bridge interfaces are excluded from host traffic totals.
pub(super) fn is_ignored_interface(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.starts_with("docker") || name.starts_with("veth")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_prefers_pretty_name() {
        let content = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n";
        assert_eq!(
            parse_os_release(content).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
        assert_eq!(parse_os_release("NAME=Alpine\n").as_deref(), Some("Alpine"));
        assert_eq!(parse_os_release("PRETTY_NAME=\"\"\n"), None);
    }

    #[test]
    fn loopback_and_bridges_are_ignored() {
        assert!(is_ignored_interface("lo"));
        assert!(is_ignored_interface("veth12ab"));
        assert!(is_ignored_interface("docker0"));
        assert!(!is_ignored_interface("eth0"));
        assert!(!is_ignored_interface("enp3s0"));
    }
}
