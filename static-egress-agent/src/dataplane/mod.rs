pub mod addr;
pub mod director;
pub mod gateway;
pub mod ipset;
pub mod iptables;
pub mod routes;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod fake;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use thiserror::Error;

/// Mark attached to packets that must be steered through the egress path.
/// Directors mark the forward flow, the gateway marks the return flow; a
/// node is never both.
pub(crate) const STATIC_EGRESS_FWMARK: u32 = 1000;

const BUSY_ATTEMPTS: u32 = 3;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum DataplaneError {
    #[error("dataplane busy: {0}")]
    Busy(String),

    #[error("dataplane denied: {0}")]
    Denied(String),

    #[error("invalid dataplane operation: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DataplaneError> = std::result::Result<T, E>;

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl DataplaneError {
    fn from_output(context: &str, out: &CommandOutput) -> Self {
        let stderr = out.stderr.trim();
        if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
            return Self::Denied(format!("{context}: {stderr}"));
        }
        if out.code == Some(4)
            || stderr.contains("Resource temporarily unavailable")
            || stderr.contains("holding the xtables lock")
        {
            return Self::Busy(format!("{context}: {stderr}"));
        }
        Self::Invalid(format!("{context}: {stderr}"))
    }
}

/// Seam between the dataplane wrappers and the host. The production
/// implementation shells out; tests substitute a simulated kernel.
pub trait Commander {
    fn output(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SysCommander;

impl Commander for SysCommander {
    async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let out = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Runs a mutating command, retrying a bounded number of times while the
/// dataplane reports contention.
pub(crate) async fn run_checked<C: Commander + Sync>(
    commander: &C,
    program: &str,
    args: &[String],
    context: &str,
) -> Result<CommandOutput> {
    let mut attempt = 0;
    loop {
        let out = commander.output(program, args).await?;
        if out.success() {
            return Ok(out);
        }
        let err = DataplaneError::from_output(context, &out);
        attempt += 1;
        if matches!(err, DataplaneError::Busy(_)) && attempt < BUSY_ATTEMPTS {
            tokio::time::sleep(BUSY_RETRY_DELAY).await;
            continue;
        }
        return Err(err);
    }
}

pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

/// Normalizes a destination to dotted CIDR form; a bare address is `/32`.
pub fn normalize_destination(destination: &str) -> Result<String> {
    let net = destination
        .parse::<Ipv4Network>()
        .map_err(|e| DataplaneError::Invalid(format!("destination {destination}: {e}")))?;
    Ok(net.to_string())
}

/// Per-rule dataplane programming for one node role. The reconciler holds
/// exactly one implementation, chosen at startup: directors steer matching
/// flows into the tunnel toward the gateway, the gateway rewrites them to
/// the egress IP.
///
/// `target` is the gateway IP on a director and the egress IP on a gateway.
pub trait Programmer {
    /// One-time idempotent node preparation. Failure is fatal to the agent.
    fn setup(&self) -> impl Future<Output = Result<()>> + Send;

    fn program(
        &self,
        rule_id: &str,
        source_ips: &[Ipv4Addr],
        destination: &str,
        target: Ipv4Addr,
    ) -> impl Future<Output = Result<()>> + Send;

    fn unprogram(
        &self,
        rule_id: &str,
        destination: &str,
        target: Option<Ipv4Addr>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drift repair: drops leftover state for destinations no rule declares
    /// anymore.
    fn sweep(&self, live_destinations: &[String]) -> impl Future<Output = Result<()>> + Send;
}
