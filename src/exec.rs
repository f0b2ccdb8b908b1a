use crate::Error;
use futures::future::BoxFuture;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Typed by the operator to leave the relay without waiting for the remote shell.
pub const EXIT_SENTINEL: &str = "exit";

const READ_BUFFER_SIZE: usize = 4096;

/// Streams of a command running in a container.
///
/// `stderr` is `None` when the command runs with a tty (output is merged into stdout).
pub struct ExecSession {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Option<Pin<Box<dyn AsyncRead + Send>>>,
    closer: Option<BoxFuture<'static, ()>>,
}

impl ExecSession {
    pub fn new(
        stdin: Pin<Box<dyn AsyncWrite + Send>>,
        stdout: Pin<Box<dyn AsyncRead + Send>>,
        stderr: Option<Pin<Box<dyn AsyncRead + Send>>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            closer: None,
        }
    }

    /// Run `closer` once the streams are dropped, to release the transport.
    pub fn with_closer(mut self, closer: BoxFuture<'static, ()>) -> Self {
        self.closer = Some(closer);
        self
    }

    pub async fn close(self) {
        let Self {
            mut stdin,
            stdout,
            stderr,
            closer,
        } = self;
        if let Err(err) = stdin.shutdown().await {
            debug!(?err, "shutdown stdin of exec session");
        }
        drop(stdin);
        drop(stdout);
        drop(stderr);
        if let Some(closer) = closer {
            closer.await;
        }
    }
}

/// How the relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// remote side closed its output
    RemoteClosed,
    /// operator typed the exit sentinel
    Sentinel,
    /// operator input reached its end
    EndOfInput,
}

fn is_exit_sentinel(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(EXIT_SENTINEL)
}

async fn forward<O>(chunk: &[u8], output: &mut O) -> Result<(), Error>
where
    O: AsyncWrite + Unpin + ?Sized,
{
    output.write_all(chunk).await.map_err(|source| Error::IoError {
        context: "write exec output".to_string(),
        source,
    })?;
    output.flush().await.map_err(|source| Error::IoError {
        context: "flush exec output".to_string(),
        source,
    })
}

async fn read_optional(
    reader: &mut Option<Pin<Box<dyn AsyncRead + Send>>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn relay_loop<I, O>(
    session: &mut ExecSession,
    input: &mut I,
    output: &mut O,
) -> Result<RelayEnd, Error>
where
    I: AsyncBufRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
{
    let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut err_buf = vec![0u8; READ_BUFFER_SIZE];
    // next_line is cancel safe, a line typed across several polls is kept whole
    let mut lines = (&mut *input).lines();
    loop {
        // output first: whatever the remote already produced is shown before the next line goes out
        tokio::select! {
            biased;
            n = session.stdout.read(&mut out_buf) => {
                let n = n.map_err(|source| Error::IoError {
                    context: "read exec stdout".to_string(),
                    source,
                })?;
                if n == 0 {
                    return Ok(RelayEnd::RemoteClosed);
                }
                forward(&out_buf[..n], output).await?;
            }
            n = read_optional(&mut session.stderr, &mut err_buf) => {
                match n {
                    Ok(0) => session.stderr = None,
                    Ok(n) => forward(&err_buf[..n], output).await?,
                    Err(err) => {
                        debug!(?err, "stderr of exec session failed, ignoring it");
                        session.stderr = None;
                    }
                }
            }
            line = lines.next_line() => {
                let line = line.map_err(|source| Error::IoError {
                    context: "read operator input".to_string(),
                    source,
                })?;
                let Some(line) = line else {
                    return Ok(RelayEnd::EndOfInput);
                };
                if is_exit_sentinel(&line) {
                    return Ok(RelayEnd::Sentinel);
                }
                let command = format!("{}\n", line.trim_end_matches('\r'));
                session
                    .stdin
                    .write_all(command.as_bytes())
                    .await
                    .map_err(|source| Error::IoError {
                        context: "write exec stdin".to_string(),
                        source,
                    })?;
                session.stdin.flush().await.map_err(|source| Error::IoError {
                    context: "flush exec stdin".to_string(),
                    source,
                })?;
            }
        }
    }
}

/// Relay `session` to the operator until the remote closes, the operator
/// types `exit` or its input ends. The session is closed on every path.
#[instrument(skip_all)]
pub async fn relay<I, O>(
    mut session: ExecSession,
    input: &mut I,
    output: &mut O,
) -> Result<RelayEnd, Error>
where
    I: AsyncBufRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
{
    let end = relay_loop(&mut session, input, output).await;
    session.close().await;
    debug!(?end, "exec relay done");
    end
}
