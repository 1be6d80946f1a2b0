use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::{Child, Command};

use crate::config::ScriptConfig;

/// Spawn the script at `script` with piped stdout/stderr.
///
/// `script` should be absolute (see [`ScriptConfig::resolve_path`]): a bare
/// name would be looked up on `PATH` when executed directly. The child
/// inherits our environment with `env` layered on top and leads its own
/// process group, so [`signal_group`] also reaches anything it forks.
pub fn spawn_script(
    config: &ScriptConfig,
    script: &Path,
    env: &[(String, String)],
) -> anyhow::Result<Child> {
    let mut command = if config.interpreter.is_empty() {
        Command::new(script)
    } else {
        let mut c = Command::new(&config.interpreter);
        c.arg(script);
        c
    };

    command
        .args(&config.args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    if let Some(dir) = &config.workdir {
        command.current_dir(dir);
    }

    command
        .spawn()
        .map_err(|e| anyhow::anyhow!("spawn {} failed: {}", script.display(), e))
}

/// Send SIGTERM, or SIGKILL when `force`, to the process group led by `pid`.
pub fn signal_group(pid: u32, force: bool) -> anyhow::Result<()> {
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("Invalid PID: {}", pid))?;
    if raw <= 0 {
        anyhow::bail!("Invalid PID: {}", pid);
    }
    killpg(Pid::from_raw(raw), signal)
        .map_err(|e| anyhow::anyhow!("killpg({}, {:?}) failed: {}", pid, signal, e))
}

/// Read one line, without its terminator, replacing invalid UTF-8.
/// Returns `None` at end of stream.
pub async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
