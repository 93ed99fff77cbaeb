//! Proxy tunnel for executable traffic
//!
//! When enabled, every outbound connection of the external executables is
//! forced through a local SOCKS proxy helper by a proxy-chaining wrapper.
//! [`ProxyTunnel`] owns the helper process for the duration of one run: it is
//! started on `open` and terminated when the tunnel is dropped, whatever the
//! outcome of the child.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::params::file::split_terminator;
use crate::study::Role;

/// How long a helper gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Proxy helper and wrapper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Route executable traffic through the proxy
    pub enabled: bool,
    /// Proxy helper program
    pub helper: PathBuf,
    /// Helper arguments; `{role}` and `{port}` are substituted
    pub helper_args: Vec<String>,
    /// Local SOCKS port the helper binds
    pub port: u16,
    /// Proxy-chain configuration template
    pub template: PathBuf,
    /// Where the rewritten configuration is written
    pub config_path: PathBuf,
    /// Proxy-chaining wrapper prefixed to the command
    pub wrapper: String,
    /// Delay after starting the helper before the child is launched (milliseconds)
    pub startup_delay_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            helper: PathBuf::from("sfkit-proxy"),
            helper_args: vec!["--role".into(), "{role}".into(), "--port".into(), "{port}".into()],
            port: 8000,
            template: PathBuf::from("/etc/proxychains.conf"),
            config_path: PathBuf::from("proxychains.conf"),
            wrapper: "proxychains".to_string(),
            startup_delay_ms: 2000,
        }
    }
}

/// Rewrite every line starting with `socks` to point at the local helper
pub fn rewrite_socks_directive(contents: &str, port: u16) -> String {
    let mut out = String::with_capacity(contents.len());
    for line in contents.split_inclusive('\n') {
        if line.starts_with("socks") {
            let (_, terminator) = split_terminator(line);
            out.push_str(&format!("socks5 127.0.0.1 {}", port));
            out.push_str(terminator);
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Running proxy helper plus the configuration pointing at it
pub struct ProxyTunnel {
    child: Child,
    program: String,
    config_path: PathBuf,
    wrapper: String,
}

impl ProxyTunnel {
    /// Write the proxy-chain configuration and start the helper
    pub fn open(settings: &ProxySettings, role: Role) -> Result<Self> {
        let config_path = absolute(&settings.config_path)?;
        let template = fs::read_to_string(&settings.template).map_err(|e| {
            Error::io(format!("Failed to read proxy template {}", settings.template.display()), e)
        })?;
        fs::write(&config_path, rewrite_socks_directive(&template, settings.port)).map_err(|e| {
            Error::io(format!("Failed to write proxy configuration {}", config_path.display()), e)
        })?;

        let program = settings.helper.display().to_string();
        let args: Vec<String> = settings
            .helper_args
            .iter()
            .map(|arg| {
                arg.replace("{role}", &role.to_string())
                    .replace("{port}", &settings.port.to_string())
            })
            .collect();

        tracing::info!("starting proxy helper {} on 127.0.0.1:{}", program, settings.port);
        let child = Command::new(&settings.helper)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let mut tunnel = Self {
            child,
            program,
            config_path,
            wrapper: settings.wrapper.clone(),
        };

        std::thread::sleep(Duration::from_millis(settings.startup_delay_ms));
        if let Ok(Some(status)) = tunnel.child.try_wait() {
            return Err(Error::Spawn {
                program: tunnel.program.clone(),
                source: io::Error::new(io::ErrorKind::Other, format!("proxy helper exited early ({})", status)),
            });
        }

        Ok(tunnel)
    }

    /// Process id of the helper
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Command prefix forcing the child's connections through the tunnel
    pub fn command_prefix(&self) -> Vec<OsString> {
        vec![
            OsString::from(&self.wrapper),
            OsString::from("-f"),
            self.config_path.clone().into_os_string(),
        ]
    }

    /// Best-effort terminate: SIGTERM, short grace period, then kill
    fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to poll proxy helper: {}", e),
        }

        tracing::debug!("terminating proxy helper (PID: {})", self.child.id());
        // SAFETY: kill(2) on a pid we spawned and have not yet reaped
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        tracing::warn!("proxy helper ignored SIGTERM, killing");
        if let Err(e) = self.child.kill() {
            tracing::warn!("failed to kill proxy helper: {}", e);
        }
        let _ = self.child.wait();
    }
}

impl Drop for ProxyTunnel {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| Error::io("Failed to read working directory", e))?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn process_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    fn settings(dir: &Path, helper_args: Vec<String>) -> ProxySettings {
        let template = dir.join("template.conf");
        fs::write(&template, "strict_chain\n[ProxyList]\nsocks4 127.0.0.1 9050\n").unwrap();
        ProxySettings {
            enabled: true,
            helper: PathBuf::from("sh"),
            helper_args,
            port: 8123,
            template,
            config_path: dir.join("proxychains.conf"),
            wrapper: "proxychains".into(),
            startup_delay_ms: 50,
        }
    }

    #[test]
    fn test_rewrite_socks_directive() {
        let out = rewrite_socks_directive("# socks here\nstrict_chain\nsocks4 127.0.0.1 9050\nhttp 1.2.3.4 80", 8000);
        assert_eq!(out, "# socks here\nstrict_chain\nsocks5 127.0.0.1 8000\nhttp 1.2.3.4 80");
    }

    #[test]
    fn test_open_and_drop_terminates_helper() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path(), vec!["-c".into(), "exec sleep 30 # {role} {port}".into()]);

        let tunnel = ProxyTunnel::open(&settings, Role::new(1).unwrap()).unwrap();
        let pid = tunnel.pid();
        assert!(process_alive(pid));

        let prefix = tunnel.command_prefix();
        assert_eq!(prefix[0], "proxychains");
        assert_eq!(prefix[1], "-f");
        assert_eq!(PathBuf::from(&prefix[2]), dir.path().join("proxychains.conf"));

        let conf = fs::read_to_string(dir.path().join("proxychains.conf")).unwrap();
        assert_eq!(conf, "strict_chain\n[ProxyList]\nsocks5 127.0.0.1 8123\n");

        drop(tunnel);
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_helper_that_exits_early() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path(), vec!["-c".into(), "exit 3".into()]);
        settings.startup_delay_ms = 300;

        let result = ProxyTunnel::open(&settings, Role::new(0).unwrap());
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_missing_helper() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path(), vec![]);
        settings.helper = PathBuf::from("/nonexistent/proxy-helper");

        let result = ProxyTunnel::open(&settings, Role::new(0).unwrap());
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }
}
