//! Shell sessions over plain pipes. The child's stdout and stderr share one
//! pipe whose read end is non-blocking and poll-registrable; stdin gets a
//! non-blocking write end. Pty allocation is deliberately not attempted.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::{Child, ChildStdin, Command, Stdio};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use adbnet::services::shell::{ShellSession, ShellSpawner};

/// Spawns `/bin/sh` sessions with piped stdio.
pub struct PipedShell {
    shell: String,
}

impl PipedShell {
    pub fn new() -> PipedShell {
        PipedShell {
            shell: "/bin/sh".to_string(),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd this process owns; no memory is touched.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A pipe whose write end the child uses for both stdout and stderr.
fn output_pipe() -> io::Result<(File, File)> {
    let mut fds = [0; 2];
    // SAFETY: pipe fills the array with two fresh fds on success.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both fds were just created and are owned from here on.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok((read, write))
}

impl ShellSpawner for PipedShell {
    fn spawn(&mut self, command: Option<&str>) -> io::Result<Box<dyn ShellSession>> {
        let (out_read, out_write) = output_pipe()?;

        let mut cmd = Command::new(&self.shell);
        if let Some(line) = command {
            cmd.arg("-c").arg(line);
        } else {
            cmd.arg("-i");
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(out_write.try_clone()?);
        cmd.stderr(out_write);

        let mut child = cmd.spawn()?;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                return Err(io::ErrorKind::BrokenPipe.into());
            }
        };

        set_nonblocking(out_read.as_raw_fd())?;
        set_nonblocking(stdin.as_raw_fd())?;

        Ok(Box::new(PipeSession {
            child,
            output: out_read,
            input: Some(stdin),
        }))
    }
}

struct PipeSession {
    child: Child,
    output: File,
    input: Option<ChildStdin>,
}

impl ShellSession for PipeSession {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.output.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let fd = self.output.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    fn read_output(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf)
    }

    fn write_input(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.input.as_mut() {
            Some(input) => input.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        // Close stdin first so a well-behaved child exits on its own.
        self.input.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
