use std::{
    borrow::Cow,
    collections::BTreeMap,
    ffi::CString,
    io::{Seek, SeekFrom, Write},
    os::fd::RawFd,
    rc::Weak,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    endpoint::{connect, InputEndpoint, InputKind, OutputEndpoint},
    error::{Error, Result},
    launch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Fresh,
    Running(Pid),
    Done,
}

/// An executable with its argument vector and the descriptor wiring its
/// child will be launched with.
///
/// A command owns the endpoints in its two descriptor maps; the edges
/// between commands are non-owning, so both commands on an edge must stay
/// alive until both have launched. Dropping a command whose child is still
/// running kills the child with `SIGKILL` and reaps it.
pub struct Command {
    pub(crate) argv: Vec<CString>,
    pub(crate) inputs: BTreeMap<RawFd, InputEndpoint>,
    pub(crate) outputs: BTreeMap<RawFd, OutputEndpoint>,
    pub(crate) state: RunState,
    pub(crate) launched: bool,
}

impl Command {
    /// Builds a command from its argument vector. The first element is the
    /// path handed to `execv`; no `PATH` lookup is performed.
    pub fn new<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let argv = args
            .into_iter()
            .map(|arg| CString::new(arg.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if argv.is_empty() {
            return Err(Error::EmptyArgv);
        }
        Ok(Self {
            argv,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            state: RunState::Fresh,
            launched: false,
        })
    }

    /// The endpoint feeding child descriptor `fd`, created unbound on first
    /// use.
    pub fn input(&mut self, fd: RawFd) -> InputEndpoint {
        self.inputs
            .entry(fd)
            .or_insert_with(InputEndpoint::pipe)
            .clone()
    }

    /// The endpoint carrying child descriptor `fd` outward, created unbound
    /// on first use.
    pub fn output(&mut self, fd: RawFd) -> OutputEndpoint {
        self.outputs
            .entry(fd)
            .or_insert_with(OutputEndpoint::pipe)
            .clone()
    }

    /// Connects child descriptor `fd` to read from `src`. Fails with
    /// [`Error::PipeSetTwice`] if either side already carries an edge.
    pub fn bind_input(&mut self, fd: RawFd, src: &OutputEndpoint) -> Result<InputEndpoint> {
        let endpoint = self.input(fd);
        connect(src, &endpoint, fd)?;
        Ok(endpoint)
    }

    /// Connects child descriptor `fd` to write into `dst`. The mirror of
    /// [`Command::bind_input`]; either call alone establishes the edge.
    pub fn bind_output(&mut self, fd: RawFd, dst: &InputEndpoint) -> Result<OutputEndpoint> {
        let endpoint = self.output(fd);
        connect(&endpoint, dst, fd)?;
        Ok(endpoint)
    }

    /// Materializes the descriptor graph for this command and starts the
    /// child.
    ///
    /// On failure the command's endpoints and every peer stash are left
    /// exactly as they were before the call, but the command cannot be
    /// launched a second time.
    pub fn run(&mut self) -> Result<()> {
        launch::launch(self)
    }

    /// Blocks until the child terminates, copies captured output into its
    /// destination streams and returns the raw status for the caller to
    /// interpret.
    ///
    /// A stopped child is treated as terminal even though it could later be
    /// resumed; continuing a stopped child is not supported.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        let RunState::Running(pid) = self.state else {
            return Err(Error::CommandNotRunning);
        };
        let status = loop {
            match waitpid(pid, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Sys("waitpid", errno)),
            }
        };
        if matches!(
            status,
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) | WaitStatus::Stopped(..)
        ) {
            self.state = RunState::Done;
            self.drain()?;
        }
        tracing::debug!(program = %self.program(), ?status, "command reaped");
        Ok(status)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running(_))
    }

    /// Child process id, available while the command is running.
    pub fn pid(&self) -> Option<Pid> {
        match self.state {
            RunState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    pub(crate) fn program(&self) -> Cow<'_, str> {
        self.argv[0].to_string_lossy()
    }

    /// Copies memory-backed sinks into their destination streams.
    fn drain(&mut self) -> Result<()> {
        for out in self.outputs.values() {
            let inner = out.0.borrow();
            let Some(peer) = inner.dest.as_ref().and_then(Weak::upgrade) else {
                continue;
            };
            let mut peer_inner = peer.borrow_mut();
            if let InputKind::Sink { file, dest } = &mut peer_inner.kind {
                file.seek(SeekFrom::Start(0))?;
                std::io::copy(file, dest)?;
                dest.flush()?;
            }
        }
        Ok(())
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let RunState::Running(pid) = self.state {
            tracing::debug!(program = %self.program(), %pid, "killing still-running command");
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                tracing::debug!(%errno, "failed to signal child during teardown");
            }
            while self.is_running() {
                if self.wait().is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        cell::RefCell,
        fs::File,
        io::{Read, Write},
        os::fd::AsRawFd,
        rc::Rc,
        time::{Duration, Instant},
    };

    use nix::{fcntl::OFlag, unistd::pipe2};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{InputEndpoint, OutputEndpoint};

    /// Cloneable byte sink so tests can hand one end to `to_stream` and keep
    /// the other for assertions.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sh(script: &str) -> Command {
        Command::new(["/bin/sh", "-c", script]).unwrap()
    }

    #[test]
    fn captures_child_output() -> anyhow::Result<()> {
        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let mut cmd = sh("echo hello");
        cmd.bind_output(1, &sink)?;

        cmd.run()?;
        let status = cmd.wait()?;

        assert!(matches!(status, WaitStatus::Exited(_, 0)));
        assert_eq!(buf.contents(), "hello\n");
        Ok(())
    }

    #[test]
    fn pipeline_consumer_first() -> anyhow::Result<()> {
        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let mut producer = sh("printf 'abc\\nworld\\nthis\\nworks\\nhello world\\nasdf\\n'");
        let mut consumer = sh("grep hello");

        producer.bind_output(1, &consumer.input(0))?;
        consumer.bind_output(1, &sink)?;

        consumer.run()?;
        producer.run()?;
        producer.wait()?;
        consumer.wait()?;

        assert_eq!(buf.contents(), "hello world\n");
        Ok(())
    }

    #[test]
    fn pipeline_producer_first() -> anyhow::Result<()> {
        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let mut producer = sh("printf 'abc\\nworld\\nthis\\nworks\\nhello world\\nasdf\\n'");
        let mut consumer = sh("grep hello");

        consumer.bind_input(0, &producer.output(1))?;
        consumer.bind_output(1, &sink)?;

        producer.run()?;
        consumer.run()?;
        producer.wait()?;
        consumer.wait()?;

        assert_eq!(buf.contents(), "hello world\n");
        Ok(())
    }

    #[test]
    fn missing_program_is_reported() -> anyhow::Result<()> {
        let mut cmd = Command::new(["/does/not/exist"])?;
        match cmd.run() {
            Err(Error::CommandNotFound(path)) => assert_eq!(path, "/does/not/exist"),
            other => panic!("expected CommandNotFound, got {other:?}"),
        }
        assert!(matches!(cmd.run(), Err(Error::CommandAlreadyRun)));
        Ok(())
    }

    #[test]
    fn binding_twice_is_refused_without_side_effects() -> anyhow::Result<()> {
        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let other = InputEndpoint::to_stream(Vec::new())?;
        let mut cmd = sh("echo once");
        cmd.bind_output(1, &sink)?;
        assert!(matches!(
            cmd.bind_output(1, &other),
            Err(Error::PipeSetTwice(1))
        ));

        // The first edge is intact and the command still launches.
        cmd.run()?;
        cmd.wait()?;
        assert_eq!(buf.contents(), "once\n");
        Ok(())
    }

    #[test]
    fn running_twice_is_refused() -> anyhow::Result<()> {
        let mut cmd = sh("exit 0");
        cmd.run()?;
        assert!(matches!(cmd.run(), Err(Error::CommandAlreadyRun)));
        cmd.wait()?;
        Ok(())
    }

    #[test]
    fn waiting_before_running_is_refused() -> anyhow::Result<()> {
        let mut cmd = sh("exit 0");
        assert!(matches!(cmd.wait(), Err(Error::CommandNotRunning)));
        Ok(())
    }

    #[test]
    fn unbound_endpoint_blocks_the_launch() -> anyhow::Result<()> {
        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let mut cmd = sh("echo recovered");
        cmd.output(1);
        assert!(matches!(cmd.run(), Err(Error::PipeNotSet(1))));

        // A logic error leaves the command launchable once the graph is
        // completed.
        cmd.bind_output(1, &sink)?;
        cmd.run()?;
        cmd.wait()?;
        assert_eq!(buf.contents(), "recovered\n");
        Ok(())
    }

    #[test]
    fn borrowed_descriptor_receives_output() -> anyhow::Result<()> {
        let (read_end, write_end) = pipe2(OFlag::empty())?;
        let target = InputEndpoint::real_fd(write_end.as_raw_fd());
        let mut cmd = sh("echo hi");
        cmd.bind_output(1, &target)?;
        cmd.run()?;

        // Our copy of the write end must go away before the read can hit
        // end-of-file; the child's inherited copies vanish when it exits.
        drop(write_end);
        let mut collected = String::new();
        File::from(read_end).read_to_string(&mut collected)?;
        cmd.wait()?;

        assert_eq!(collected, "hi\n");
        Ok(())
    }

    #[test]
    fn borrowed_descriptor_feeds_input() -> anyhow::Result<()> {
        let (read_end, write_end) = pipe2(OFlag::empty())?;
        File::from(write_end).write_all(b"meow\n")?;

        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let source = OutputEndpoint::real_fd(read_end.as_raw_fd());
        let mut cmd = sh("cat");
        cmd.bind_input(0, &source)?;
        cmd.bind_output(1, &sink)?;
        cmd.run()?;
        cmd.wait()?;

        assert_eq!(buf.contents(), "meow\n");
        drop(read_end);
        Ok(())
    }

    #[test]
    fn inherited_descriptors_are_closed_in_the_child() -> anyhow::Result<()> {
        // An unrelated descriptor that must not survive into the child.
        let unrelated = File::open("/")?;
        let unrelated_fd = unrelated.as_raw_fd();

        let buf = SharedBuf::default();
        let sink = InputEndpoint::to_stream(buf.clone())?;
        let mut cmd = sh("ls /proc/self/fd");
        cmd.bind_output(1, &sink)?;
        cmd.run()?;
        cmd.wait()?;

        let listing: Vec<String> = buf.contents().lines().map(str::to_owned).collect();
        assert!(listing.contains(&"1".to_string()));
        assert!(!listing.contains(&"2".to_string()));
        assert!(!listing.contains(&unrelated_fd.to_string()));
        drop(unrelated);
        Ok(())
    }

    #[test]
    fn no_endpoints_still_launches() -> anyhow::Result<()> {
        let mut cmd = sh("exit 7");
        cmd.run()?;
        assert!(matches!(cmd.wait()?, WaitStatus::Exited(_, 7)));
        Ok(())
    }

    #[test]
    fn dropped_peer_endpoint_blocks_the_launch() -> anyhow::Result<()> {
        let mut cmd = sh("echo hello");
        let sink = InputEndpoint::to_stream(Vec::new())?;
        cmd.bind_output(1, &sink)?;
        drop(sink);

        assert!(matches!(cmd.run(), Err(Error::EndpointDropped)));
        Ok(())
    }

    #[test]
    fn signalled_child_is_classified() -> anyhow::Result<()> {
        let mut cmd = sh("sleep 30");
        cmd.run()?;
        kill(cmd.pid().unwrap(), Signal::SIGTERM)?;

        let status = cmd.wait()?;
        assert!(matches!(
            status,
            WaitStatus::Signaled(_, Signal::SIGTERM, _)
        ));
        assert!(!cmd.is_running());
        Ok(())
    }

    #[test]
    fn drop_kills_a_running_child() -> anyhow::Result<()> {
        let start = Instant::now();
        {
            let mut cmd = sh("sleep 30");
            cmd.run()?;
            assert!(cmd.is_running());
        }
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn rejects_an_empty_argument_vector() {
        let args: [&str; 0] = [];
        assert!(matches!(Command::new(args), Err(Error::EmptyArgv)));
    }

    #[test]
    fn rejects_interior_nul_bytes() {
        assert!(matches!(
            Command::new(["/bin/echo", "a\0b"]),
            Err(Error::NulArgument(_))
        ));
    }
}
