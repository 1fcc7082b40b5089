//! OS proxy configuration.
//!
//! The server talks to a [`SystemProxyController`]; [`PlatformSystemProxy`]
//! drives the platform's own tooling and [`NoopSystemProxy`] is used for
//! headless runs and tests.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ProxyError, Result};

/// True on platforms where the OS proxy can be configured.
pub const SUPPORTS_SYSTEM_PROXY: bool = cfg!(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "linux"
));

/// Points the operating system's proxy setting somewhere.
#[async_trait]
pub trait SystemProxyController: Send + Sync {
    /// Points the OS proxy at this machine's `port` (`enable`), or turns it off.
    async fn set_system_proxy_enable(
        &self,
        port: u16,
        enable: bool,
        tls_enabled: bool,
        pass_domains: &[String],
    ) -> Result<()>;

    /// Points the OS proxy at an arbitrary `host:port`.
    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        tls_enabled: bool,
        pass_domains: &[String],
    ) -> Result<()>;
}

/// Controller that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSystemProxy;

#[async_trait]
impl SystemProxyController for NoopSystemProxy {
    async fn set_system_proxy_enable(
        &self,
        port: u16,
        enable: bool,
        _tls_enabled: bool,
        _pass_domains: &[String],
    ) -> Result<()> {
        tracing::debug!(port, enable, "System proxy change skipped");
        Ok(())
    }

    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        _tls_enabled: bool,
        _pass_domains: &[String],
    ) -> Result<()> {
        tracing::debug!(host, port, "System proxy change skipped");
        Ok(())
    }
}

/// Controller backed by `networksetup` (macOS), `gsettings` (Linux/GNOME)
/// or the WinINet registry keys (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformSystemProxy;

#[async_trait]
impl SystemProxyController for PlatformSystemProxy {
    async fn set_system_proxy_enable(
        &self,
        port: u16,
        enable: bool,
        tls_enabled: bool,
        pass_domains: &[String],
    ) -> Result<()> {
        if enable {
            self.set_system_proxy("127.0.0.1", port, tls_enabled, pass_domains)
                .await
        } else {
            disable_proxy().await?;
            tracing::info!("System proxy disabled");
            Ok(())
        }
    }

    async fn set_system_proxy(
        &self,
        host: &str,
        port: u16,
        tls_enabled: bool,
        pass_domains: &[String],
    ) -> Result<()> {
        enable_proxy(host, port, tls_enabled, pass_domains).await?;
        tracing::info!("System proxy set to {}:{}", host, port);
        Ok(())
    }
}

fn command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = command(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProxyError::SystemProxy(format!("Failed to run {program}: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ProxyError::SystemProxy(format!(
            "{program} {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn wininet_proxy_server(host: &str, port: u16, tls_enabled: bool) -> String {
    if tls_enabled {
        format!("http={host}:{port};https={host}:{port}")
    } else {
        format!("http={host}:{port}")
    }
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn wininet_override(pass_domains: &[String]) -> String {
    let mut entries: Vec<&str> = pass_domains.iter().map(String::as_str).collect();
    entries.push("<local>");
    entries.join(";")
}

#[cfg(target_os = "windows")]
async fn enable_proxy(host: &str, port: u16, tls_enabled: bool, pass_domains: &[String]) -> Result<()> {
    let script = format!(
        r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 1
        Set-ItemProperty -Path $regPath -Name ProxyServer -Value '{}'
        Set-ItemProperty -Path $regPath -Name ProxyOverride -Value '{}'
        "#,
        wininet_proxy_server(host, port, tls_enabled),
        wininet_override(pass_domains).replace('\'', "''"),
    );
    run(
        "powershell",
        &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script],
    )
    .await
    .map(|_| ())
}

#[cfg(target_os = "windows")]
async fn disable_proxy() -> Result<()> {
    let script = r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 0
    "#;
    run(
        "powershell",
        &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script],
    )
    .await
    .map(|_| ())
}

// ============================================================================
// macOS Implementation
// ============================================================================

#[cfg(target_os = "macos")]
async fn active_network_service() -> Result<String> {
    let stdout = run("networksetup", &["-listallnetworkservices"]).await?;

    for service in ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"] {
        if stdout.lines().any(|line| line == service) {
            return Ok(service.to_string());
        }
    }

    // First enabled service (disabled ones start with '*').
    stdout
        .lines()
        .skip(1)
        .find(|line| !line.starts_with('*'))
        .map(str::to_string)
        .ok_or_else(|| ProxyError::SystemProxy("Could not find active network service".into()))
}

#[cfg(target_os = "macos")]
async fn enable_proxy(host: &str, port: u16, tls_enabled: bool, pass_domains: &[String]) -> Result<()> {
    let service = active_network_service().await?;
    let port = port.to_string();

    run("networksetup", &["-setwebproxy", &service, host, &port]).await?;
    run("networksetup", &["-setwebproxystate", &service, "on"]).await?;
    if tls_enabled {
        run("networksetup", &["-setsecurewebproxy", &service, host, &port]).await?;
        run("networksetup", &["-setsecurewebproxystate", &service, "on"]).await?;
    } else {
        run("networksetup", &["-setsecurewebproxystate", &service, "off"]).await?;
    }

    let mut args = vec!["-setproxybypassdomains", service.as_str()];
    if pass_domains.is_empty() {
        args.push("Empty");
    } else {
        args.extend(pass_domains.iter().map(String::as_str));
    }
    run("networksetup", &args).await.map(|_| ())
}

#[cfg(target_os = "macos")]
async fn disable_proxy() -> Result<()> {
    let service = active_network_service().await?;
    run("networksetup", &["-setwebproxystate", &service, "off"]).await?;
    run("networksetup", &["-setsecurewebproxystate", &service, "off"]).await?;
    Ok(())
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn gsettings_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

#[cfg(target_os = "linux")]
async fn enable_proxy(host: &str, port: u16, tls_enabled: bool, pass_domains: &[String]) -> Result<()> {
    let port = port.to_string();

    run("gsettings", &["set", "org.gnome.system.proxy", "mode", "manual"]).await?;
    run("gsettings", &["set", "org.gnome.system.proxy.http", "host", host]).await?;
    run("gsettings", &["set", "org.gnome.system.proxy.http", "port", &port]).await?;
    let (https_host, https_port) = if tls_enabled { (host, port.as_str()) } else { ("", "0") };
    run("gsettings", &["set", "org.gnome.system.proxy.https", "host", https_host]).await?;
    run("gsettings", &["set", "org.gnome.system.proxy.https", "port", https_port]).await?;
    run(
        "gsettings",
        &["set", "org.gnome.system.proxy", "ignore-hosts", &gsettings_list(pass_domains)],
    )
    .await
    .map(|_| ())
}

#[cfg(target_os = "linux")]
async fn disable_proxy() -> Result<()> {
    run("gsettings", &["set", "org.gnome.system.proxy", "mode", "none"])
        .await
        .map(|_| ())
}

// ============================================================================
// Unsupported platforms
// ============================================================================

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
async fn enable_proxy(_host: &str, _port: u16, _tls_enabled: bool, _pass_domains: &[String]) -> Result<()> {
    Err(ProxyError::SystemProxy("Unsupported operating system".into()))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
async fn disable_proxy() -> Result<()> {
    Err(ProxyError::SystemProxy("Unsupported operating system".into()))
}
