//! Raw byte bridge between a local stream pair and a serial console.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::serial::READ_BUFFER_SIZE;
use crate::{ExecutorError, SerialConsole};

/// `Ctrl-]`: ends the session without forwarding the byte.
pub const DETACH_BYTE: u8 = 0x1d;

/// Bytes moved in each direction by [`bridge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub to_guest: u64,
    pub from_guest: u64,
}

/// Pump bytes between `input`/`output` and `console` until `input` reaches
/// EOF, the detach byte is typed, or the console closes.
///
/// The console is not closed on return.
///
/// # Errors
/// Returns the first console write error or local I/O error.
pub async fn bridge<R, W>(
    console: &SerialConsole,
    mut input: R,
    mut output: W,
) -> Result<BridgeStats, ExecutorError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut guest = console.subscribe()?;
    let mut stats = BridgeStats::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    tracing::info!(vm_id = %console.vm_id(), "terminal bridge attached");
    loop {
        tokio::select! {
            read = input.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let chunk = &buf[..n];
                let (chunk, detach) = match chunk.iter().position(|&b| b == DETACH_BYTE) {
                    Some(pos) => (&chunk[..pos], true),
                    None => (chunk, false),
                };
                if !chunk.is_empty() {
                    console.write(chunk).await?;
                    stats.to_guest += chunk.len() as u64;
                }
                if detach {
                    break;
                }
            }
            data = guest.recv() => {
                let Some(data) = data else { break };
                output.write_all(&data).await?;
                output.flush().await?;
                stats.from_guest += data.len() as u64;
            }
        }
    }

    tracing::info!(
        vm_id = %console.vm_id(),
        to_guest = stats.to_guest,
        from_guest = stats.from_guest,
        "terminal bridge detached"
    );
    Ok(stats)
}
