use crate::backup::pipe::{poison, ChunkSender};
use crate::config::MysqlConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub bytes: u64,
}

/// Produces the raw dump of one database into `sink`.
///
/// Success means the producer exited cleanly and the sink is closed without
/// an error item. Every failure path leaves an error item in the sink (unless
/// the receiving side is already gone) so it is never read as end-of-data.
/// Cancelling `cancel` kills the producer; after completion it is a no-op.
#[async_trait]
pub trait DumpSource: Send + Sync {
    async fn dump(
        &self,
        database: &str,
        sink: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<DumpSummary>;
}

/// Suspends and resumes the process feeding a reader.
pub trait ProcessControl: Send {
    fn suspend(&mut self) -> io::Result<()>;
    fn resume(&mut self) -> io::Result<()>;
}

#[derive(Debug)]
pub enum ForwardError {
    Read(io::Error),
    Signal(io::Error),
    Closed,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Read(err) => write!(f, "could not read output: {}", err),
            ForwardError::Signal(err) => write!(f, "could not signal process: {}", err),
            ForwardError::Closed => write!(f, "output stream closed"),
        }
    }
}

/// Copies `reader` into `sink` chunk by chunk. When the sink is full the
/// producing process is suspended until a slot frees up, so the pipe buffer
/// never grows past the channel bound.
pub async fn forward_output<R, C>(
    reader: &mut R,
    sink: &ChunkSender,
    control: &mut C,
    chunk_size: usize,
) -> std::result::Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
    C: ProcessControl,
{
    let mut total = 0u64;

    loop {
        let mut buf = bytes::BytesMut::with_capacity(chunk_size);
        let n = reader.read_buf(&mut buf).await.map_err(ForwardError::Read)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        let chunk = buf.freeze();

        match sink.try_reserve() {
            Ok(permit) => permit.send(Ok(chunk)),
            Err(TrySendError::Full(())) => {
                control.suspend().map_err(ForwardError::Signal)?;
                debug!("Output stream full, dump process suspended");
                let permit = sink.reserve().await.map_err(|_| ForwardError::Closed)?;
                permit.send(Ok(chunk));
                control.resume().map_err(ForwardError::Signal)?;
                debug!("Output stream drained, dump process resumed");
            }
            Err(TrySendError::Closed(())) => return Err(ForwardError::Closed),
        }
    }
}

struct SignalControl {
    pid: Option<u32>,
    suspended: bool,
}

impl SignalControl {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            suspended: false,
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SignalControl {
    fn suspend(&mut self) -> io::Result<()> {
        self.signal(libc::SIGSTOP)?;
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.signal(libc::SIGCONT)?;
        self.suspended = false;
        Ok(())
    }
}

#[cfg(not(unix))]
impl ProcessControl for SignalControl {
    fn suspend(&mut self) -> io::Result<()> {
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        self.suspended = false;
        Ok(())
    }
}

impl Drop for SignalControl {
    fn drop(&mut self) {
        if self.suspended {
            let _ = self.resume();
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return code.to_string();
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    status.to_string()
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("mysqldump already gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Could not reap mysqldump: {}", e);
    }
}

/// Runs the `mysqldump` executable and supervises it.
pub struct MysqlDump {
    config: MysqlConfig,
}

impl MysqlDump {
    pub fn new(config: &MysqlConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn command(&self, database: &str) -> Command {
        let mut cmd = Command::new(&self.config.dump_binary);
        cmd.arg("-h").arg(&self.config.host);
        if let Some(port) = self.config.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg("-u")
            .arg(&self.config.user)
            .arg("--single-transaction")
            .arg("--skip-lock-tables")
            .arg(database)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(password) = &self.config.password {
            cmd.env("MYSQL_PWD", password);
        }
        cmd
    }
}

#[async_trait]
impl DumpSource for MysqlDump {
    async fn dump(
        &self,
        database: &str,
        sink: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<DumpSummary> {
        let mut child = match self.command(database).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("could not start {}: {}", self.config.dump_binary, e);
                return Err(poison(&sink, BackupError::DumpStart, reason).await);
            }
        };
        debug!("'{}' mysqldump started (pid {:?})", database, child.id());

        let Some(mut stdout) = child.stdout.take() else {
            terminate(&mut child).await;
            let reason = "mysqldump stdout was not captured".to_string();
            return Err(poison(&sink, BackupError::DumpStart, reason).await);
        };

        let mut control = SignalControl::new(child.id());
        let forwarded = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = forward_output(&mut stdout, &sink, &mut control, CHUNK_SIZE) => Some(result),
        };
        drop(control);

        let bytes = match forwarded {
            None => {
                terminate(&mut child).await;
                let reason = "mysqldump killed".to_string();
                return Err(poison(&sink, BackupError::Cancelled, reason).await);
            }
            Some(Err(ForwardError::Closed)) => {
                terminate(&mut child).await;
                return Err(BackupError::Cancelled("output stream closed".to_string()));
            }
            Some(Err(e)) => {
                terminate(&mut child).await;
                return Err(poison(&sink, BackupError::DumpRuntime, e.to_string()).await);
            }
            Some(Ok(bytes)) => bytes,
        };

        // stdout EOF is not completion; only the exit status is.
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        match status {
            None => {
                terminate(&mut child).await;
                Err(poison(&sink, BackupError::Cancelled, "mysqldump killed".to_string()).await)
            }
            Some(Err(e)) => {
                let reason = format!("could not wait for mysqldump: {}", e);
                Err(poison(&sink, BackupError::DumpRuntime, reason).await)
            }
            Some(Ok(status)) if status.success() => {
                debug!("'{}' mysqldump finished successfully ({} bytes)", database, bytes);
                Ok(DumpSummary { bytes })
            }
            Some(Ok(status)) => {
                let reason = format!("mysqldump exited with {}", describe_exit(status));
                Err(poison(&sink, BackupError::DumpRuntime, reason).await)
            }
        }
    }
}
