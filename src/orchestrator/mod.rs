//! External process orchestration
//!
//! Runs the protocol executables for one role and phase. The command line is
//!
//! ```text
//! [wrapper -f proxy.conf] <executable> <role> <parameter file> [phase args...]
//! ```
//!
//! executed synchronously from the executables directory. The child gets
//! its own working directory through [`Command::current_dir`]; the caller's
//! working directory is never touched, on success or failure.

pub mod proxy;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::study::{Phase, Role};

pub use proxy::{ProxySettings, ProxyTunnel};

/// One execution of a protocol executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub phase: Phase,
    /// Executable, relative paths resolve against the executables directory
    pub executable: PathBuf,
    pub role: Role,
    /// Parameter file as the executable should see it
    pub par_file: PathBuf,
    /// Phase-specific positional arguments
    pub extra_args: Vec<String>,
}

impl Invocation {
    pub fn new(phase: Phase, executable: impl Into<PathBuf>, role: Role, par_file: impl Into<PathBuf>) -> Self {
        Self {
            phase,
            executable: executable.into(),
            role,
            par_file: par_file.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Arguments after the executable
    pub fn args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(self.role.to_string()),
            self.par_file.clone().into_os_string(),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Message logged when the executable fails
    pub fn fail_message(&self) -> String {
        match self.phase {
            Phase::DataSharing => "Failed data sharing protocol".to_string(),
            Phase::Computation => "Failed computation protocol".to_string(),
            other => format!("Failed '{}' step", other),
        }
    }
}

/// Launches protocol executables, optionally through the proxy tunnel
#[derive(Debug, Clone)]
pub struct ProcessOrchestrator {
    work_dir: PathBuf,
    proxy: Option<ProxySettings>,
}

impl ProcessOrchestrator {
    /// Run executables from `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            proxy: None,
        }
    }

    /// Route executable traffic through the proxy when `settings.enabled`
    pub fn with_proxy(mut self, settings: ProxySettings) -> Self {
        self.proxy = settings.enabled.then_some(settings);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Full command line for `invocation` (without the proxy prefix)
    pub fn command_line(&self, invocation: &Invocation) -> Vec<OsString> {
        let mut line = vec![self.resolve_executable(&invocation.executable).into_os_string()];
        line.extend(invocation.args());
        line
    }

    /// Run `invocation` to completion
    ///
    /// The proxy tunnel, if any, lives exactly as long as this call.
    pub fn run(&self, invocation: &Invocation) -> Result<()> {
        let tunnel = match &self.proxy {
            Some(settings) => Some(ProxyTunnel::open(settings, invocation.role)?),
            None => None,
        };

        let mut line = tunnel.as_ref().map(ProxyTunnel::command_prefix).unwrap_or_default();
        line.extend(self.command_line(invocation));

        let program = line.remove(0);
        let shown = program.to_string_lossy().into_owned();
        tracing::info!(
            role = %invocation.role,
            "starting {}: {} {}",
            invocation.phase,
            shown,
            line.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
        );

        let status = Command::new(&program)
            .args(&line)
            .current_dir(&self.work_dir)
            .status()
            .map_err(|e| Error::Spawn {
                program: shown,
                source: e,
            })?;

        if !status.success() {
            tracing::error!("{} ({})", invocation.fail_message(), status);
            return Err(Error::Process {
                phase: invocation.phase,
                exit_code: status.code(),
            });
        }

        tracing::info!("finished {}", invocation.phase);
        Ok(())
    }

    fn resolve_executable(&self, executable: &Path) -> PathBuf {
        if executable.is_absolute() || executable.components().count() == 1 {
            // Absolute, or a bare name looked up on PATH
            executable.to_path_buf()
        } else {
            self.work_dir.join(executable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn process_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    fn role(r: u8) -> Role {
        Role::new(r).unwrap()
    }

    #[test]
    fn test_argument_vector_and_working_dir() {
        let dir = TempDir::new().unwrap();
        let code = dir.path().join("code");
        script(&code, "bin/ShareData", "pwd > args.txt; echo \"$@\" >> args.txt");

        let orchestrator = ProcessOrchestrator::new(&code);
        let invocation = Invocation::new(Phase::DataSharing, "bin/ShareData", role(3), "../par/test.par.3.txt")
            .with_arg("/data/party3");

        let cwd_before = std::env::current_dir().unwrap();
        orchestrator.run(&invocation).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), cwd_before);

        let recorded = fs::read_to_string(code.join("args.txt")).unwrap();
        let mut lines = recorded.lines();
        assert_eq!(
            fs::canonicalize(lines.next().unwrap()).unwrap(),
            fs::canonicalize(&code).unwrap()
        );
        assert_eq!(lines.next().unwrap(), "3 ../par/test.par.3.txt /data/party3");
    }

    #[test]
    fn test_nonzero_exit_is_process_error() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "bin/TrainSecureDTI", "exit 1");

        let cwd_before = std::env::current_dir().unwrap();
        let result = ProcessOrchestrator::new(dir.path())
            .run(&Invocation::new(Phase::Computation, "bin/TrainSecureDTI", role(0), "p.txt"));

        assert_eq!(std::env::current_dir().unwrap(), cwd_before);
        match result {
            Err(Error::Process { phase, exit_code }) => {
                assert_eq!(phase, Phase::Computation);
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_executable_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let result = ProcessOrchestrator::new(dir.path())
            .run(&Invocation::new(Phase::DataSharing, "bin/missing", role(0), "p.txt"));
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_command_line_resolution() {
        let orchestrator = ProcessOrchestrator::new("/opt/mpc/code");
        let inv = Invocation::new(Phase::DataSharing, "bin/ShareData", role(1), "../par/test.par.1.txt");
        assert_eq!(
            orchestrator.command_line(&inv),
            vec![
                OsString::from("/opt/mpc/code/bin/ShareData"),
                OsString::from("1"),
                OsString::from("../par/test.par.1.txt"),
            ]
        );

        let inv = Invocation::new(Phase::DataSharing, "true", role(1), "p");
        assert_eq!(orchestrator.command_line(&inv)[0], OsString::from("true"));
    }

    fn proxy_settings(dir: &Path) -> (ProxySettings, PathBuf) {
        let template = dir.join("template.conf");
        fs::write(&template, "[ProxyList]\nsocks4 127.0.0.1 9050\n").unwrap();

        // Wrapper drops "-f <conf>" after checking the conf exists, then runs the command
        let wrapper = script(dir, "wrapper.sh", "test -f \"$2\" || exit 97\nshift 2\nexec \"$@\"");
        let pid_file = dir.join("helper.pid");

        let settings = ProxySettings {
            enabled: true,
            helper: PathBuf::from("sh"),
            helper_args: vec!["-c".into(), format!("echo $$ > {}; exec sleep 30", pid_file.display())],
            port: 8555,
            template,
            config_path: dir.join("proxychains.conf"),
            wrapper: wrapper.display().to_string(),
            startup_delay_ms: 100,
        };
        (settings, pid_file)
    }

    fn proxied(dir: &Path) -> (ProcessOrchestrator, PathBuf) {
        let (settings, pid_file) = proxy_settings(dir);
        (ProcessOrchestrator::new(dir).with_proxy(settings), pid_file)
    }

    fn helper_pid(pid_file: &Path) -> u32 {
        fs::read_to_string(pid_file).unwrap().trim().parse().unwrap()
    }

    #[test]
    fn test_proxy_torn_down_after_success() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "bin/ok", "exit 0");
        let (orchestrator, pid_file) = proxied(dir.path());

        orchestrator
            .run(&Invocation::new(Phase::DataSharing, "bin/ok", role(0), "p.txt"))
            .unwrap();

        assert!(!process_alive(helper_pid(&pid_file)));
        assert_eq!(
            fs::read_to_string(dir.path().join("proxychains.conf")).unwrap(),
            "[ProxyList]\nsocks5 127.0.0.1 8555\n"
        );
    }

    #[test]
    fn test_proxy_torn_down_after_failure() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "bin/fail", "exit 2");
        let (orchestrator, pid_file) = proxied(dir.path());

        let result = orchestrator.run(&Invocation::new(Phase::Computation, "bin/fail", role(0), "p.txt"));

        assert!(matches!(result, Err(Error::Process { exit_code: Some(2), .. })));
        assert!(!process_alive(helper_pid(&pid_file)));
    }

    #[test]
    fn test_proxy_torn_down_when_wrapper_missing() {
        let dir = TempDir::new().unwrap();
        script(dir.path(), "bin/ok", "exit 0");
        let (mut settings, pid_file) = proxy_settings(dir.path());
        settings.wrapper = "/nonexistent/proxychains".into();
        let orchestrator = ProcessOrchestrator::new(dir.path()).with_proxy(settings);

        let result = orchestrator.run(&Invocation::new(Phase::DataSharing, "bin/ok", role(0), "p.txt"));

        match result {
            Err(Error::Spawn { program, .. }) => assert_eq!(program, "/nonexistent/proxychains"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!process_alive(helper_pid(&pid_file)));
    }

    #[test]
    fn test_disabled_proxy_is_ignored() {
        let settings = ProxySettings::default();
        let orchestrator = ProcessOrchestrator::new("/tmp").with_proxy(settings);
        assert!(orchestrator.proxy.is_none());
    }
}
