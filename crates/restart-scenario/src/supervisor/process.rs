use alloy_primitives::{Address, B256, U256};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::genesis::write_genesis_file;
use super::rpc_client::{RpcClient, RpcError};
use super::{Genesis, NodeDiagnostics, NodeSupervisor, TeardownOptions};
use crate::config::{ChainSyncStrategy, ClusterTopology, KillSignal, P2pPlugin};
use crate::error::SupervisorError;
use crate::ledger::{AccountState, SignedTransfer, TxReceipt};
use crate::node::{NodeId, NodeInstance, NodeRole};
use crate::topology;

const HTTP_PORT_BASE: u16 = 8545;
const P2P_PORT_BASE: u16 = 30303;
const PORT_STRIDE: u16 = 10;
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// How the supervisor finds and lays out node processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisorConfig {
    pub binary_path: PathBuf,
    /// Root for `node_NN/` directories and `genesis.json`.
    pub work_dir: PathBuf,
    /// Added to every port so concurrent runs on one host do not collide.
    pub port_offset: u16,
    /// Bound on a single RPC request.
    pub rpc_timeout: Duration,
    /// How long a freshly spawned node may take to answer RPC.
    pub ready_timeout: Duration,
    /// How long a SIGTERM'd node may take to exit before it gets SIGKILL.
    pub stop_timeout: Duration,
}

impl ProcessSupervisorConfig {
    pub fn new(binary_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            binary_path,
            work_dir,
            port_offset: 0,
            rpc_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Launch parameters of one node, also written to `node_NN/config.json`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeConfig {
    pub node: NodeId,
    pub role: NodeRole,
    pub binary_path: PathBuf,
    pub genesis_path: PathBuf,
    pub data_dir: PathBuf,
    pub http_port: u16,
    pub p2p_port: u16,
    pub trusted_peers: Vec<String>,
    pub p2p_plugin: P2pPlugin,
}

impl NodeConfig {
    fn command(&self, extra_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("node")
            .arg("--chain").arg(&self.genesis_path)
            .arg("--datadir").arg(&self.data_dir)
            .arg("--http")
            .arg("--http.port").arg(self.http_port.to_string())
            .arg("--port").arg(self.p2p_port.to_string())
            .arg("--ipcdisable")
            .arg("--disable-discovery")
            .args(extra_args);

        cmd.env("LEDGER_NODE_INDEX", self.node.0.to_string())
            .env("LEDGER_PRODUCER", if self.role == NodeRole::Producer { "1" } else { "0" })
            .env("LEDGER_P2P_PLUGIN", self.p2p_plugin.as_str());
        if !self.trusted_peers.is_empty() {
            cmd.env("LEDGER_TRUSTED_PEERS", self.trusted_peers.join(","));
        }
        cmd
    }
}

/// A spawned node process.
struct NodeProcess {
    child: Option<Child>,
    pid: u32,
}

impl NodeProcess {
    fn spawn(config: &NodeConfig, node_dir: &Path, extra_args: &[&str]) -> Result<Self, SupervisorError> {
        let stdout_log = std::fs::File::create(node_dir.join("stdout.log"))?;
        let stderr_log = std::fs::File::create(node_dir.join("stderr.log"))?;

        let mut cmd = config.command(extra_args);
        cmd.stdout(Stdio::from(stdout_log)).stderr(Stdio::from(stderr_log)).stdin(Stdio::null());

        info!(
            node = %config.node,
            binary = %config.binary_path.display(),
            http_port = config.http_port,
            ?extra_args,
            "starting node"
        );

        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            node: config.node,
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            node: config.node,
            reason: "process exited immediately".into(),
        })?;
        std::fs::write(node_dir.join("pid"), pid.to_string())?;

        Ok(Self { child: Some(child), pid })
    }

    /// Delivers `signal`, waits for exit and escalates to SIGKILL after `timeout`.
    async fn stop(mut self, node: NodeId, signal: KillSignal, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = send_signal(node, self.pid, signal.as_raw()) {
            warn!(%node, error = %e, "signal delivery failed, killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%node, %signal, ?status, "node process exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(%node, error = %e, "error waiting for node to exit");
                Ok(())
            }
            Err(_) => {
                warn!(%node, timeout_secs = timeout.as_secs(), "node ignored signal, sending SIGKILL");
                child.start_kill()?;
                child.wait().await?;
                Ok(())
            }
        }
    }

    /// Lets the process outlive the supervisor.
    fn detach(mut self) {
        self.child.take();
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        // Best-effort cleanup: kill the child process if it's still attached.
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

fn send_signal(node: NodeId, pid: u32, signal: i32) -> Result<(), SupervisorError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        return Err(SupervisorError::Signal {
            node,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

struct ManagedNode {
    config: NodeConfig,
    dir: PathBuf,
    process: Option<NodeProcess>,
    rpc: RpcClient,
}

impl ManagedNode {
    fn rpc_error(&self, err: RpcError) -> SupervisorError {
        SupervisorError::Rpc { node: self.config.node, message: err.to_string() }
    }

    async fn wait_for_rpc_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let start = tokio::time::Instant::now();
        let poll_interval = Duration::from_millis(500);

        loop {
            match self.rpc.block_number().await {
                Ok(n) => {
                    info!(node = %self.config.node, block_number = n, "node is ready");
                    return Ok(());
                }
                Err(e) => {
                    if start.elapsed() > timeout {
                        return Err(SupervisorError::Spawn {
                            node: self.config.node,
                            reason: format!(
                                "RPC not ready within {}s: {e}",
                                timeout.as_secs()
                            ),
                        });
                    }
                    debug!(node = %self.config.node, "waiting for node to become ready...");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

/// Runs the cluster as child processes of a ledger node binary.
pub struct ProcessSupervisor {
    config: ProcessSupervisorConfig,
    nodes: Vec<ManagedNode>,
}

impl ProcessSupervisor {
    pub fn new(config: ProcessSupervisorConfig) -> Self {
        Self { config, nodes: Vec::new() }
    }

    fn node(&self, id: NodeId) -> Result<&ManagedNode, SupervisorError> {
        self.nodes.get(id.0).ok_or(SupervisorError::UnknownNode(id))
    }

    fn running_node(&self, id: NodeId) -> Result<&ManagedNode, SupervisorError> {
        let node = self.node(id)?;
        if node.process.is_none() {
            return Err(SupervisorError::NotRunning(id));
        }
        Ok(node)
    }

    fn http_port(&self, index: usize) -> u16 {
        HTTP_PORT_BASE + self.config.port_offset + index as u16 * PORT_STRIDE
    }

    fn p2p_port(&self, index: usize) -> u16 {
        P2P_PORT_BASE + self.config.port_offset + index as u16 * PORT_STRIDE
    }

    fn node_configs(&self, topology: &ClusterTopology, genesis_path: &Path) -> Vec<NodeConfig> {
        let peers = topology::peers(topology.shape, topology.total_nodes);
        (0..topology.total_nodes)
            .map(|i| {
                let node = NodeId(i);
                let role = if i < topology.producing_nodes {
                    NodeRole::Producer
                } else {
                    NodeRole::NonProducer
                };
                NodeConfig {
                    node,
                    role,
                    binary_path: self.config.binary_path.clone(),
                    genesis_path: genesis_path.to_path_buf(),
                    data_dir: self.config.work_dir.join(format!("node_{i:02}")).join("data"),
                    http_port: self.http_port(i),
                    p2p_port: self.p2p_port(i),
                    trusted_peers: peers[i]
                        .iter()
                        .map(|&j| format!("/ip4/127.0.0.1/tcp/{}", self.p2p_port(j)))
                        .collect(),
                    p2p_plugin: topology.p2p_plugin,
                }
            })
            .collect()
    }

    /// Kills nodes a previous run left behind. A pid is only signalled while
    /// it still runs the configured node binary.
    fn kill_recorded_pids(&self) {
        let Ok(entries) = std::fs::read_dir(&self.config.work_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let pid_file = entry.path().join("pid");
            let Ok(text) = std::fs::read_to_string(&pid_file) else {
                continue;
            };
            let _ = std::fs::remove_file(&pid_file);
            let Ok(pid) = text.trim().parse::<i32>() else {
                continue;
            };
            if pid <= 0 || !runs_binary(pid, &self.config.binary_path) {
                debug!(pid, "stale pid file, process left alone");
                continue;
            }
            let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
            info!(pid, rc, "killed leftover node process");
        }
    }

    async fn kill_all_instances(&self) {
        let Some(name) = self.config.binary_path.file_name() else {
            return;
        };
        match Command::new("pkill").arg("-9").arg("-x").arg(name).status().await {
            Ok(status) => info!(binary = ?name, ?status, "killed all node instances"),
            Err(e) => warn!(binary = ?name, error = %e, "pkill failed"),
        }
    }

    fn remove_work_dir(&self) {
        if self.config.work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.config.work_dir) {
                warn!(dir = %self.config.work_dir.display(), error = %e, "failed to remove work dir");
            }
        }
    }

    async fn stop_all(&mut self) {
        let stop_timeout = self.config.stop_timeout;
        for node in &mut self.nodes {
            if let Some(process) = node.process.take() {
                if let Err(e) = process.stop(node.config.node, KillSignal::Term, stop_timeout).await {
                    warn!(node = %node.config.node, error = %e, "failed to stop node");
                }
                let _ = std::fs::remove_file(node.dir.join("pid"));
            }
        }
    }
}

#[async_trait::async_trait]
impl NodeSupervisor for ProcessSupervisor {
    async fn prepare(&mut self, all_instances: bool) -> Result<(), SupervisorError> {
        self.kill_recorded_pids();
        if all_instances {
            self.kill_all_instances().await;
        }
        self.remove_work_dir();
        Ok(())
    }

    async fn launch(
        &mut self,
        topology: &ClusterTopology,
        genesis: &Genesis,
    ) -> Result<Vec<NodeInstance>, SupervisorError> {
        std::fs::create_dir_all(&self.config.work_dir)?;
        let genesis_path = write_genesis_file(&self.config.work_dir, genesis)?;

        let mut instances = Vec::with_capacity(topology.total_nodes);
        for (i, config) in self.node_configs(topology, &genesis_path).into_iter().enumerate() {
            if i > 0 && !topology.launch_delay.is_zero() {
                tokio::time::sleep(topology.launch_delay).await;
            }

            let dir = self.config.work_dir.join(format!("node_{i:02}"));
            std::fs::create_dir_all(&config.data_dir)?;
            let config_json = serde_json::to_string_pretty(&config).map_err(std::io::Error::other)?;
            std::fs::write(dir.join("config.json"), config_json)?;

            let rpc = RpcClient::new(
                format!("http://127.0.0.1:{}", config.http_port),
                self.config.rpc_timeout,
            );
            let process = match NodeProcess::spawn(&config, &dir, &[]) {
                Ok(process) => process,
                Err(e) => {
                    self.stop_all().await;
                    return Err(e);
                }
            };
            instances.push(NodeInstance::new(config.node, config.role));
            self.nodes.push(ManagedNode { config, dir, process: Some(process), rpc });
        }

        for i in 0..self.nodes.len() {
            let ready = self.nodes[i].wait_for_rpc_ready(self.config.ready_timeout).await;
            if let Err(e) = ready {
                self.stop_all().await;
                return Err(e);
            }
        }

        info!(nodes = instances.len(), "cluster launched");
        Ok(instances)
    }

    async fn kill(&mut self, node: NodeId, signal: KillSignal) -> Result<(), SupervisorError> {
        let stop_timeout = self.config.stop_timeout;
        let managed = self.nodes.get_mut(node.0).ok_or(SupervisorError::UnknownNode(node))?;
        let process = managed.process.take().ok_or(SupervisorError::NotRunning(node))?;
        let stopped = process.stop(node, signal, stop_timeout).await;
        let _ = std::fs::remove_file(managed.dir.join("pid"));
        stopped
    }

    async fn relaunch(
        &mut self,
        node: NodeId,
        strategy: ChainSyncStrategy,
    ) -> Result<(), SupervisorError> {
        let ready_timeout = self.config.ready_timeout;
        let managed = self.nodes.get_mut(node.0).ok_or(SupervisorError::UnknownNode(node))?;
        if managed.process.is_some() {
            return Err(SupervisorError::Spawn { node, reason: "already running".into() });
        }

        let extra_args: &[&str] = match strategy {
            ChainSyncStrategy::Replay => &["--replay-blockchain"],
            ChainSyncStrategy::Resync => {
                if managed.config.data_dir.exists() {
                    std::fs::remove_dir_all(&managed.config.data_dir)?;
                }
                std::fs::create_dir_all(&managed.config.data_dir)?;
                &["--delete-all-blocks"]
            }
            ChainSyncStrategy::None => &[],
        };

        info!(%node, %strategy, "relaunching node");
        managed.process = Some(NodeProcess::spawn(&managed.config, &managed.dir, extra_args)?);
        managed.wait_for_rpc_ready(ready_timeout).await
    }

    async fn query_height(&self, node: NodeId) -> Result<u64, SupervisorError> {
        let managed = self.running_node(node)?;
        managed.rpc.block_number().await.map_err(|e| managed.rpc_error(e))
    }

    async fn query_account(
        &self,
        node: NodeId,
        address: Address,
    ) -> Result<AccountState, SupervisorError> {
        let managed = self.running_node(node)?;
        let (balance, nonce) = futures::try_join!(
            managed.rpc.get_balance(address),
            managed.rpc.get_pending_nonce(address),
        )
        .map_err(|e| managed.rpc_error(e))?;
        Ok(AccountState { balance, nonce })
    }

    async fn submit(&self, node: NodeId, tx: &SignedTransfer) -> Result<B256, SupervisorError> {
        let managed = self.running_node(node)?;
        match managed.rpc.send_raw_transaction(&tx.raw).await {
            Ok(hash) => Ok(hash),
            Err(RpcError::Server { message, .. }) => {
                Err(SupervisorError::Rejected { node, reason: message })
            }
            Err(e) => Err(managed.rpc_error(e)),
        }
    }

    async fn receipt(&self, node: NodeId, hash: B256) -> Result<Option<TxReceipt>, SupervisorError> {
        let managed = self.running_node(node)?;
        let receipt = managed
            .rpc
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| managed.rpc_error(e))?;
        Ok(receipt.map(|r| TxReceipt {
            hash: r.transaction_hash,
            block_height: r.block_number,
            success: r.status == 1,
            fee: U256::from(r.gas_used) * r.effective_gas_price,
        }))
    }

    async fn shutdown(&mut self, options: TeardownOptions) -> Result<(), SupervisorError> {
        if options.stop_nodes {
            self.stop_all().await;
        } else {
            for node in &mut self.nodes {
                if let Some(process) = node.process.take() {
                    info!(node = %node.config.node, pid = process.pid, "leaving node running");
                    process.detach();
                }
            }
        }
        if options.all_instances {
            self.kill_all_instances().await;
        }
        if options.remove_state && options.stop_nodes {
            self.remove_work_dir();
        }
        Ok(())
    }

    fn diagnostics(&self) -> Vec<NodeDiagnostics> {
        self.nodes
            .iter()
            .map(|node| NodeDiagnostics {
                node: node.config.node,
                config: std::fs::read_to_string(node.dir.join("config.json")).unwrap_or_default(),
                stderr_tail: read_tail(&node.dir.join("stderr.log"), STDERR_TAIL_BYTES),
            })
            .collect()
    }
}

/// Whether `pid` is alive and executing `binary`, judged by `/proc/<pid>/exe`.
/// Processes whose executable cannot be read do not match.
fn runs_binary(pid: i32, binary: &Path) -> bool {
    let Ok(exe) = std::fs::read_link(format!("/proc/{pid}/exe")) else {
        return false;
    };
    exe == binary || std::fs::canonicalize(binary).is_ok_and(|canonical| exe == canonical)
}

fn read_tail(path: &Path, max_bytes: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(max_bytes);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) => format!("<unreadable: {e}>"),
    }
}

/// Finds the ledger node binary: `LEDGER_NODE_BINARY`, then `PATH`.
pub fn find_node_binary(name: &str) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LEDGER_NODE_BINARY") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyShape;

    fn supervisor(dir: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(ProcessSupervisorConfig::new(
            PathBuf::from("/opt/ledger/bin/ledger-node"),
            dir.to_path_buf(),
        ))
    }

    #[test]
    fn test_node_configs_follow_topology() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let topo = ClusterTopology {
            total_nodes: 4,
            producing_nodes: 2,
            shape: TopologyShape::Star,
            ..Default::default()
        };
        let configs = sup.node_configs(&topo, &dir.path().join("genesis.json"));

        assert_eq!(configs.len(), 4);
        assert_eq!(configs[0].role, NodeRole::Producer);
        assert_eq!(configs[1].role, NodeRole::Producer);
        assert_eq!(configs[2].role, NodeRole::NonProducer);
        assert_eq!(configs[0].trusted_peers.len(), 3, "hub peers with everyone");
        assert_eq!(configs[3].trusted_peers, vec!["/ip4/127.0.0.1/tcp/30303".to_string()]);
        assert_eq!(configs[2].http_port, 8565);
    }

    #[test]
    fn test_command_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let topo = ClusterTopology { total_nodes: 2, producing_nodes: 1, ..Default::default() };
        let configs = sup.node_configs(&topo, &dir.path().join("genesis.json"));

        let cmd = configs[1].command(&["--replay-blockchain"]);
        let std_cmd = cmd.as_std();
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"--replay-blockchain".to_string()));
        assert!(args.contains(&"8555".to_string()));

        let producer = std_cmd
            .get_envs()
            .find(|(k, _)| *k == "LEDGER_PRODUCER")
            .and_then(|(_, v)| v)
            .unwrap();
        assert_eq!(producer, "0");
    }

    #[tokio::test]
    async fn test_queries_require_running_node() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(matches!(
            sup.query_height(NodeId(0)).await,
            Err(SupervisorError::UnknownNode(NodeId(0)))
        ));
    }

    #[tokio::test]
    async fn test_launch_fails_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path());
        let topo = ClusterTopology {
            total_nodes: 1,
            producing_nodes: 1,
            launch_delay: Duration::ZERO,
            ..Default::default()
        };
        let genesis = Genesis { chain_id: 1, alloc: Default::default() };
        let err = sup.launch(&topo, &genesis).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { node: NodeId(0), .. }));
    }

    fn spawn_sleep() -> std::process::Child {
        std::process::Command::new("sleep").arg("100").spawn().unwrap()
    }

    fn write_pid(dir: &Path, pid: u32) {
        let node_dir = dir.join("node_00");
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(node_dir.join("pid"), pid.to_string()).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_runs_binary_checks_executable() {
        let own = std::process::id() as i32;
        assert!(runs_binary(own, &std::env::current_exe().unwrap()));
        assert!(!runs_binary(own, Path::new("/opt/ledger/bin/ledger-node")));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_prepare_spares_reused_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut unrelated = spawn_sleep();
        write_pid(dir.path(), unrelated.id());

        let mut sup = supervisor(dir.path());
        sup.prepare(false).await.unwrap();

        assert!(unrelated.try_wait().unwrap().is_none(), "unrelated process was killed");
        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_prepare_kills_leftover_node() {
        let dir = tempfile::tempdir().unwrap();
        let Some(sleep_path) = std::env::var_os("PATH")
            .and_then(|paths| std::env::split_paths(&paths).map(|d| d.join("sleep")).find(|p| p.is_file()))
        else {
            return;
        };
        let mut leftover = std::process::Command::new(&sleep_path).arg("100").spawn().unwrap();
        write_pid(dir.path(), leftover.id());

        let mut sup = ProcessSupervisor::new(ProcessSupervisorConfig::new(sleep_path, dir.path().to_path_buf()));
        sup.prepare(false).await.unwrap();

        let status = leftover.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_launch_removes_pid_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ledger-node");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let work_dir = dir.path().join("work");
        let mut config = ProcessSupervisorConfig::new(script, work_dir.clone());
        config.port_offset = 1234;
        config.rpc_timeout = Duration::from_millis(200);
        config.ready_timeout = Duration::from_secs(1);
        config.stop_timeout = Duration::from_secs(5);
        let mut sup = ProcessSupervisor::new(config);

        let topo = ClusterTopology {
            total_nodes: 1,
            producing_nodes: 1,
            launch_delay: Duration::ZERO,
            ..Default::default()
        };
        let genesis = Genesis { chain_id: 1, alloc: Default::default() };
        let err = sup.launch(&topo, &genesis).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Spawn { node: NodeId(0), .. }));
        assert!(work_dir.join("node_00").join("stdout.log").exists());
        assert!(!work_dir.join("node_00").join("pid").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_signal_still_kills_child() {
        let child = Command::new("sleep").arg("100").spawn().unwrap();
        let real_pid = child.id().unwrap() as i32;
        let process = NodeProcess { child: Some(child), pid: 0x7fff_fff0 };

        let err = process.stop(NodeId(0), KillSignal::Term, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, SupervisorError::Signal { node: NodeId(0), .. }));
        assert_ne!(unsafe { libc::kill(real_pid, 0) }, 0, "child outlived a failed stop");
    }

    #[test]
    fn test_read_tail_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr.log");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_tail(&path, 4), "6789");
        assert!(read_tail(&dir.path().join("missing"), 4).starts_with("<unreadable"));
    }
}
