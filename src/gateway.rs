// MIT License - Copyright (c) 2021 TJForc
// Supervision of the external gateway process

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{AtsError, Result};

/// Lifecycle of the process that speaks the panel's native protocol.
#[async_trait]
pub trait GatewayProcess: Send + Sync {
    /// Start the process and wait until it is ready. Succeeds immediately
    /// if it is already running.
    async fn start(&self) -> Result<()>;

    /// Terminate the process. No-op if it is not running.
    async fn stop(&self) -> Result<()>;

    /// Running flag; flips to false when the process exits for any reason.
    fn watch_running(&self) -> watch::Receiver<bool>;

    fn is_running(&self) -> bool {
        *self.watch_running().borrow()
    }
}

struct RunningChild {
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
    wait_handle: tokio::task::JoinHandle<()>,
}

/// Gateway launched as a child process:
/// `<executable> <args..> -p <port> -d <driver>`.
pub struct ExternalGateway {
    config: GatewayConfig,
    port: u16,
    running_tx: watch::Sender<bool>,
    child: Mutex<Option<RunningChild>>,
}

impl ExternalGateway {
    pub fn new(config: GatewayConfig, port: u16) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            config,
            port,
            running_tx,
            child: Mutex::new(None),
        }
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = self.config.args.clone();
        argv.extend([
            "-p".to_string(),
            self.port.to_string(),
            "-d".to_string(),
            self.config.driver.clone(),
        ]);
        argv
    }

    /// Full command line, as `ps` would show it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.config.executable.clone())
            .chain(self.argv())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn kill_stale_instances(&self) {
        let cmdline = self.command_line();
        let output = match Command::new("ps").args(["-A", "-o", "pid=,args="]).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!("Unable to list processes: {}", e);
                return;
            }
        };
        let listing = String::from_utf8_lossy(&output.stdout);
        for pid in find_stale_pids(&listing, &cmdline, std::process::id()) {
            info!("Killing stale gateway instance (pid {})", pid);
            match Command::new("kill").args(["-9", &pid.to_string()]).status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("kill -9 {} exited with {}", pid, status),
                Err(e) => warn!("Unable to kill pid {}: {}", pid, e),
            }
        }
    }
}

#[async_trait]
impl GatewayProcess for ExternalGateway {
    async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() && *self.running_tx.borrow() {
            return Ok(());
        }
        slot.take();

        if self.config.kill_stale {
            self.kill_stale_instances().await;
        }

        info!("Starting gateway: {}", self.command_line());
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(self.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AtsError::Gateway(format!("spawn {}: {}", self.config.executable, e)))?;
        let pid = child.id();

        let (ready_tx, ready_rx) = oneshot::channel();
        let marker = self.config.ready_marker.clone();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_stdout(stdout, marker.clone(), ready_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_stderr(stderr));
        }

        self.running_tx.send_replace(true);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let running_tx = self.running_tx.clone();
        let wait_handle = tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            match exited {
                Some(Ok(status)) => warn!("Gateway exited with {}", status),
                Some(Err(e)) => error!("Gateway wait failed: {}", e),
                None => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill gateway: {}", e);
                    }
                    debug!("Gateway killed");
                }
            }
            running_tx.send_replace(false);
        });

        *slot = Some(RunningChild {
            pid,
            kill_tx,
            wait_handle,
        });

        if marker.is_some() {
            let wait = Duration::from_millis(self.config.ready_timeout_ms);
            let ready = matches!(timeout(wait, ready_rx).await, Ok(Ok(())));
            if !ready {
                if let Some(running) = slot.take() {
                    let _ = running.kill_tx.send(());
                    let _ = running.wait_handle.await;
                }
                return Err(AtsError::Gateway(
                    "gateway did not report readiness".to_string(),
                ));
            }
        }

        info!("Gateway started (pid {:?})", pid);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.child.lock().await.take();
        if let Some(running) = running {
            info!("Stopping gateway (pid {:?})", running.pid);
            let _ = running.kill_tx.send(());
            let _ = running.wait_handle.await;
        }
        self.running_tx.send_replace(false);
        Ok(())
    }

    fn watch_running(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }
}

async fn pipe_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    marker: Option<String>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("Gateway [DEBUG]: {}", line);
        if let Some(m) = &marker
            && line.contains(m.as_str())
            && let Some(tx) = ready_tx.take()
        {
            let _ = tx.send(());
        }
    }
}

async fn pipe_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        error!("Gateway [ERROR]: {}", line);
    }
}

/// Pids in a `ps -o pid=,args=` listing whose arguments contain `cmdline`,
/// excluding `own_pid`.
pub fn find_stale_pids(listing: &str, cmdline: &str, own_pid: u32) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            (pid != own_pid && args.contains(cmdline)).then_some(pid)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_gateway(script: &str, marker: Option<&str>) -> ExternalGateway {
        let config = GatewayConfig {
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ready_marker: marker.map(str::to_string),
            ready_timeout_ms: 2000,
            kill_stale: false,
            ..GatewayConfig::default()
        };
        ExternalGateway::new(config, 8080)
    }

    #[test]
    fn test_command_line() {
        let gateway = ExternalGateway::new(GatewayConfig::default(), 8080);
        assert_eq!(
            gateway.command_line(),
            "mono --debug ATSAdvancedGateway.exe -p 8080 -d ats.advanced.drv"
        );
    }

    #[test]
    fn test_find_stale_pids() {
        let listing = "\
    1 /sbin/init
  412 mono --debug ATSAdvancedGateway.exe -p 8080 -d ats.advanced.drv
  413 /usr/bin/mono --debug ATSAdvancedGateway.exe -p 8080 -d ats.advanced.drv
  500 mono --debug ATSAdvancedGateway.exe -p 9090 -d ats.advanced.drv
  600 grep mono
";
        let cmdline = "mono --debug ATSAdvancedGateway.exe -p 8080 -d ats.advanced.drv";
        assert_eq!(find_stale_pids(listing, cmdline, 1), vec![412, 413]);
        assert_eq!(find_stale_pids(listing, cmdline, 412), vec![413]);
        assert!(find_stale_pids("", cmdline, 1).is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_marker_and_stop_kills() {
        let gateway = shell_gateway("echo starting; echo Gateway ready; sleep 30", Some("ready"));
        gateway.start().await.unwrap();
        assert!(gateway.is_running());
        // Second start is a no-op
        gateway.start().await.unwrap();
        gateway.stop().await.unwrap();
        assert!(!gateway.is_running());
    }

    #[tokio::test]
    async fn test_missing_marker_fails_start() {
        let gateway = shell_gateway("echo nothing here", Some("ready"));
        let err = gateway.start().await.unwrap_err();
        assert!(matches!(err, AtsError::Gateway(_)));
        assert!(!gateway.is_running());
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let gateway = shell_gateway("exit 3", None);
        let mut running = gateway.watch_running();
        gateway.start().await.unwrap();
        running.wait_for(|r| !*r).await.unwrap();
        assert!(!gateway.is_running());
    }
}
