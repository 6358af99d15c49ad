//! Interactive TTY session bridging the local terminal to a container.
//!
//! The engine returns two stream endpoints: an input channel (keystrokes
//! toward the container) and an output channel doubling as the control path
//! (raw output interleaved with structured events, resize notifications
//! client to engine). Forwarding runs as independent tasks sharing a
//! cancellation token; end-of-stream on either channel tears down the other
//! so nothing is left half-open.

use std::io::IsTerminal;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cage_protocol::TtyEndpoints;
use cage_protocol::events::{ControlEvent, Decoded, EventDecoder, encode_event};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The engine delivered the container's exit code.
    Exited(i32),
    /// A channel closed without an exit event (server close or local EOF).
    Closed,
}

impl SessionOutcome {
    /// Process exit status mirroring the session outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Exited(code) => *code,
            SessionOutcome::Closed => 0,
        }
    }
}

/// Restores the terminal to its saved attributes on drop.
pub struct RawModeGuard {
    fd: RawFd,
    original: libc::termios,
}

impl RawModeGuard {
    /// Switch the terminal into raw mode: no line buffering, no local echo,
    /// every keystroke forwarded verbatim.
    pub fn enable(fd: RawFd) -> std::io::Result<Self> {
        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let original = termios;
        unsafe { libc::cfmakeraw(&mut termios) };
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.original) };
    }
}

/// Current terminal window size as (columns, rows).
fn window_size(fd: RawFd) -> std::io::Result<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((ws.ws_col, ws.ws_row))
}

/// An interactive session over the endpoints returned by `get_tty`. Owns
/// both channel connections exclusively until torn down.
pub struct TtySession {
    input: UnixStream,
    output: UnixStream,
}

impl TtySession {
    /// Open both stream connections to the engine-provided endpoints.
    pub async fn connect(endpoints: &TtyEndpoints) -> std::io::Result<Self> {
        let output = UnixStream::connect(&endpoints.output).await?;
        let input = UnixStream::connect(&endpoints.input).await?;
        Ok(Self { input, output })
    }

    /// Bridge the local terminal to the session until it closes. Switches
    /// stdin to raw mode for the duration (restored on return) and forwards
    /// window-resize notifications as control events.
    pub async fn attach(self) -> std::io::Result<SessionOutcome> {
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();

        let _raw = if stdin.is_terminal() {
            Some(RawModeGuard::enable(stdin_fd)?)
        } else {
            None
        };

        let (resize_tx, resize_rx) = mpsc::channel(4);
        let winch_task = tokio::spawn(watch_window_size(stdin_fd, resize_tx));

        let outcome = run_session(
            tokio::io::stdin(),
            tokio::io::stdout(),
            self.input,
            self.output,
            resize_rx,
        )
        .await;

        winch_task.abort();
        outcome
    }
}

/// Forward SIGWINCH notifications as (columns, rows) messages.
async fn watch_window_size(fd: RawFd, tx: mpsc::Sender<(u16, u16)>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(err) => {
            warn!("cannot watch window size: {err}");
            return;
        }
    };
    while winch.recv().await.is_some() {
        match window_size(fd) {
            Ok(size) => {
                if tx.send(size).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("window size query failed: {err}"),
        }
    }
}

/// Drive one duplex session: local input to the input channel, output
/// channel to local output, resize notifications onto the control path.
/// Generic over the endpoints so the state machine is testable without a
/// real terminal.
pub async fn run_session<LI, LO, CI, CO>(
    mut local_in: LI,
    mut local_out: LO,
    mut chan_in: CI,
    chan_out: CO,
    mut resize_rx: mpsc::Receiver<(u16, u16)>,
) -> std::io::Result<SessionOutcome>
where
    LI: AsyncRead + Unpin,
    LO: AsyncWrite + Unpin,
    CI: AsyncWrite + Unpin,
    CO: AsyncRead + AsyncWrite + Unpin,
{
    let closed = CancellationToken::new();
    let (mut out_read, mut out_write) = tokio::io::split(chan_out);

    // Local keystrokes -> input channel, verbatim.
    let forward_input = {
        let closed = closed.clone();
        async move {
            let mut buf = [0u8; 8192];
            loop {
                let read = tokio::select! {
                    _ = closed.cancelled() => break,
                    read = local_in.read(&mut buf) => read,
                };
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chan_in.write_all(&buf[..n]).await.is_err()
                            || chan_in.flush().await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            // Close the peer channel so nothing is left half-open.
            closed.cancel();
            let _ = chan_in.shutdown().await;
        }
    };

    // Output channel -> local output, watching for control events.
    let forward_output = {
        let closed = closed.clone();
        async move {
            let mut decoder = EventDecoder::new();
            let mut buf = [0u8; 8192];
            let mut items = Vec::new();
            let outcome = 'session: loop {
                let read = tokio::select! {
                    _ = closed.cancelled() => break SessionOutcome::Closed,
                    read = out_read.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) | Err(_) => break SessionOutcome::Closed,
                    Ok(n) => n,
                };
                items.clear();
                if let Err(err) = decoder.feed(&buf[..n], &mut items) {
                    warn!("corrupt control path: {err}");
                    break SessionOutcome::Closed;
                }
                for item in items.drain(..) {
                    match item {
                        Decoded::Data(bytes) => {
                            if local_out.write_all(&bytes).await.is_err() {
                                break 'session SessionOutcome::Closed;
                            }
                        }
                        Decoded::Event(ControlEvent::Exit { code }) => {
                            debug!("remote exit event: code {code}");
                            break 'session SessionOutcome::Exited(code);
                        }
                        Decoded::Event(other) => {
                            debug!("ignoring control event: {other:?}");
                        }
                    }
                }
                let _ = local_out.flush().await;
            };
            let _ = local_out.flush().await;
            closed.cancel();
            outcome
        }
    };

    // Resize notifications -> control path.
    let forward_resize = {
        let closed = closed.clone();
        async move {
            loop {
                let size = tokio::select! {
                    _ = closed.cancelled() => break,
                    size = resize_rx.recv() => size,
                };
                let Some((columns, rows)) = size else { break };
                let frame = match encode_event(&ControlEvent::Resize { columns, rows }) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("cannot encode resize event: {err}");
                        continue;
                    }
                };
                if out_write.write_all(&frame).await.is_err()
                    || out_write.flush().await.is_err()
                {
                    closed.cancel();
                    break;
                }
            }
        }
    };

    let (_, outcome, _) = tokio::join!(forward_input, forward_output, forward_resize);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cage_protocol::events::{Decoded, EventDecoder};

    /// Stand up a session over in-memory pipes. Returns the far ends:
    /// (stdin writer, stdout reader, input-channel reader, output-channel
    /// far end) plus the resize sender.
    struct Harness {
        stdin_far: tokio::io::DuplexStream,
        stdout_far: tokio::io::DuplexStream,
        input_far: tokio::io::DuplexStream,
        output_far: tokio::io::DuplexStream,
        resize_tx: mpsc::Sender<(u16, u16)>,
        session: tokio::task::JoinHandle<std::io::Result<SessionOutcome>>,
    }

    fn start_session() -> Harness {
        let (stdin_far, stdin_near) = tokio::io::duplex(64 * 1024);
        let (stdout_near, stdout_far) = tokio::io::duplex(64 * 1024);
        let (input_near, input_far) = tokio::io::duplex(64 * 1024);
        let (output_near, output_far) = tokio::io::duplex(64 * 1024);
        let (resize_tx, resize_rx) = mpsc::channel(4);

        let session = tokio::spawn(run_session(
            stdin_near, stdout_near, input_near, output_near, resize_rx,
        ));

        Harness {
            stdin_far,
            stdout_far,
            input_far,
            output_far,
            resize_tx,
            session,
        }
    }

    async fn read_some(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_remote_exit_ends_session_with_code() {
        let mut h = start_session();

        // Raw output, then the engine reports exit code 7.
        h.output_far.write_all(b"bye\r\n").await.unwrap();
        h.output_far
            .write_all(&encode_event(&ControlEvent::Exit { code: 7 }).unwrap())
            .await
            .unwrap();

        assert_eq!(read_some(&mut h.stdout_far).await, b"bye\r\n");

        let outcome = h.session.await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Exited(7));
        assert_eq!(outcome.exit_code(), 7);

        // Both channels are released: the input channel sees EOF.
        let mut buf = [0u8; 16];
        assert_eq!(h.input_far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keystrokes_forwarded_verbatim() {
        let mut h = start_session();

        h.stdin_far.write_all(b"ls -la\r").await.unwrap();
        assert_eq!(read_some(&mut h.input_far).await, b"ls -la\r");

        // Server close after stdin EOF yields the generic outcome.
        drop(h.stdin_far);
        let outcome = h.session.await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Closed);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_resize_sends_exactly_one_event() {
        let mut h = start_session();

        h.resize_tx.send((120, 40)).await.unwrap();

        // Interleave remote output to show forwarding is not interrupted.
        h.output_far.write_all(b"drawing").await.unwrap();
        assert_eq!(read_some(&mut h.stdout_far).await, b"drawing");

        let mut decoder = EventDecoder::new();
        let mut items = Vec::new();
        let chunk = read_some(&mut h.output_far).await;
        decoder.feed(&chunk, &mut items).unwrap();
        assert_eq!(
            items,
            vec![Decoded::Event(ControlEvent::Resize {
                columns: 120,
                rows: 40
            })]
        );

        // Nothing further is pending on the control path.
        drop(h.output_far);
        let outcome = h.session.await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Closed);
    }

    #[tokio::test]
    async fn test_server_close_ends_session() {
        let h = start_session();
        drop(h.output_far);
        let outcome = h.session.await.unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Closed);
    }
}
