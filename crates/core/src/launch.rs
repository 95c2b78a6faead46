use std::{
    cell::RefCell,
    collections::HashSet,
    ffi::CString,
    fs::File,
    io::Read,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    rc::Rc,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc,
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::{execv, fork, pipe2, ForkResult},
};

use crate::{
    command::{Command, RunState},
    endpoint::{InputInner, InputKind, OutputInner, OutputKind},
    error::{Error, Result},
};

/// Upper bound on one error-channel message.
const ERR_MSG_MAX: usize = 512;

/// Everything `run` decides before forking: which parent descriptor lands on
/// which child descriptor, which descriptors survive the purge, and which
/// parent-side pipe ends change hands depending on the launch outcome.
#[derive(Default)]
pub(crate) struct Plan {
    /// (target child fd, current parent fd), outputs first, then inputs.
    set_fds: Vec<(RawFd, RawFd)>,
    dont_close: HashSet<RawFd>,
    transfers: Vec<Transfer>,
}

enum Transfer {
    /// A pipe end stashed by an earlier launch of the peer. Returned to the
    /// stash if this launch fails.
    Taken { end: OwnedFd, origin: Stash },
    /// A pipe created for this launch. The child inherits `child_end`; the
    /// opposite end is stashed for the peer once the launch is known to have
    /// succeeded.
    Fresh {
        child_end: OwnedFd,
        peer_end: OwnedFd,
        into: Stash,
    },
}

/// The endpoint slot a pipe end is parked in between the two launches.
enum Stash {
    Input(Rc<RefCell<InputInner>>),
    Output(Rc<RefCell<OutputInner>>),
}

impl Stash {
    fn store(&self, end: OwnedFd) {
        match self {
            Stash::Input(cell) => {
                if let InputKind::Pipe { write_end } = &mut cell.borrow_mut().kind {
                    *write_end = Some(end);
                }
            }
            Stash::Output(cell) => {
                if let OutputKind::Pipe { read_end } = &mut cell.borrow_mut().kind {
                    *read_end = Some(end);
                }
            }
        }
    }
}

impl Plan {
    fn push(&mut self, target: RawFd, current: RawFd) {
        self.set_fds.push((target, current));
        self.dont_close.insert(current);
    }

    /// The launch succeeded: child-side ends are released in the parent and
    /// freshly created opposite ends become visible to the peers.
    fn commit(self) {
        for transfer in self.transfers {
            match transfer {
                Transfer::Taken { end, .. } => drop(end),
                Transfer::Fresh {
                    child_end,
                    peer_end,
                    into,
                } => {
                    drop(child_end);
                    into.store(peer_end);
                }
            }
        }
    }

    /// The launch failed: taken ends go back to their stashes and fresh
    /// pipes are closed, leaving every endpoint as it was before `run`.
    fn rollback(self) {
        for transfer in self.transfers {
            match transfer {
                Transfer::Taken { end, origin } => origin.store(end),
                Transfer::Fresh {
                    child_end,
                    peer_end,
                    ..
                } => {
                    drop(child_end);
                    drop(peer_end);
                }
            }
        }
    }
}

pub(crate) fn build_plan(cmd: &Command) -> Result<Plan> {
    let mut plan = Plan::default();
    match fill_plan(cmd, &mut plan) {
        Ok(()) => Ok(plan),
        Err(err) => {
            plan.rollback();
            Err(err)
        }
    }
}

fn fill_plan(cmd: &Command, plan: &mut Plan) -> Result<()> {
    for (&fd, out) in &cmd.outputs {
        let inner = out.0.borrow();
        let peer = inner
            .dest
            .as_ref()
            .ok_or(Error::PipeNotSet(fd))?
            .upgrade()
            .ok_or(Error::EndpointDropped)?;
        let mut peer_inner = peer.borrow_mut();
        match &mut peer_inner.kind {
            InputKind::Borrowed(raw) => plan.push(fd, *raw),
            InputKind::Sink { file, .. } => plan.push(fd, file.as_raw_fd()),
            InputKind::Pipe { write_end } => {
                if let Some(end) = write_end.take() {
                    // The peer launched first and left us the write end.
                    plan.push(fd, end.as_raw_fd());
                    plan.transfers.push(Transfer::Taken {
                        end,
                        origin: Stash::Input(Rc::clone(&peer)),
                    });
                } else {
                    // We launch first: keep the write end for the child and
                    // park the read end for the peer.
                    let (read_end, write_end) =
                        pipe2(OFlag::empty()).map_err(|errno| Error::Sys("pipe2", errno))?;
                    plan.push(fd, write_end.as_raw_fd());
                    plan.transfers.push(Transfer::Fresh {
                        child_end: write_end,
                        peer_end: read_end,
                        into: Stash::Output(Rc::clone(&out.0)),
                    });
                }
            }
        }
    }

    for (&fd, inp) in &cmd.inputs {
        let inner = inp.0.borrow();
        let peer = inner
            .source
            .as_ref()
            .ok_or(Error::PipeNotSet(fd))?
            .upgrade()
            .ok_or(Error::EndpointDropped)?;
        let mut peer_inner = peer.borrow_mut();
        match &mut peer_inner.kind {
            OutputKind::Borrowed(raw) => plan.push(fd, *raw),
            OutputKind::Pipe { read_end } => {
                if let Some(end) = read_end.take() {
                    plan.push(fd, end.as_raw_fd());
                    plan.transfers.push(Transfer::Taken {
                        end,
                        origin: Stash::Output(Rc::clone(&peer)),
                    });
                } else {
                    let (read_end, write_end) =
                        pipe2(OFlag::empty()).map_err(|errno| Error::Sys("pipe2", errno))?;
                    plan.push(fd, read_end.as_raw_fd());
                    plan.transfers.push(Transfer::Fresh {
                        child_end: read_end,
                        peer_end: write_end,
                        into: Stash::Input(Rc::clone(&inp.0)),
                    });
                }
            }
        }
    }

    Ok(())
}

pub(crate) fn launch(cmd: &mut Command) -> Result<()> {
    if cmd.launched {
        return Err(Error::CommandAlreadyRun);
    }

    let plan = build_plan(cmd)?;
    tracing::trace!(
        program = %cmd.program(),
        mappings = plan.set_fds.len(),
        "launching command"
    );

    let (err_read, err_write) = match pipe2(OFlag::O_CLOEXEC) {
        Ok(ends) => ends,
        Err(errno) => {
            plan.rollback();
            return Err(Error::Sys("pipe2", errno));
        }
    };

    // The child's copies, cloned ahead of the fork.
    let child_sets = plan.set_fds.clone();
    let mut child_keep = plan.dont_close.clone();
    child_keep.insert(err_write.as_raw_fd());
    let err_read_raw = err_read.as_raw_fd();
    let err_write_raw = err_write.as_raw_fd();

    cmd.launched = true;
    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => child_boot(child_sets, child_keep, err_read_raw, err_write_raw, &cmd.argv),
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            plan.rollback();
            return Err(Error::Sys("fork", errno));
        }
    };

    drop(err_write);
    match read_error_channel(err_read) {
        Ok(None) => {
            plan.commit();
            cmd.state = RunState::Running(child);
            tracing::debug!(program = %cmd.program(), pid = %child, "command launched");
            Ok(())
        }
        Ok(Some((errno, step))) => {
            // The child wrote its report and exited; reap it before raising.
            let _ = waitpid(child, None);
            plan.rollback();
            if errno == Errno::ENOENT as i32 && step == "execve" {
                Err(Error::CommandNotFound(cmd.program().into_owned()))
            } else {
                Err(Error::ChildSetup {
                    errno: Errno::from_raw(errno),
                    step,
                })
            }
        }
        Err(err) => {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            plan.rollback();
            Err(err)
        }
    }
}

/// One bounded read from the error channel. Zero bytes means the child's
/// exec succeeded and the close-on-exec write end vanished.
fn read_error_channel(end: OwnedFd) -> Result<Option<(i32, String)>> {
    let mut channel = File::from(end);
    let mut buf = [0u8; ERR_MSG_MAX];
    let count = loop {
        match channel.read(&mut buf) {
            Ok(count) => break count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::Io(err)),
        }
    };
    if count == 0 {
        return Ok(None);
    }

    let msg = String::from_utf8_lossy(&buf[..count]);
    let (number, step) = msg.split_once(' ').unwrap_or((msg.as_ref(), ""));
    Ok(Some((
        number.parse::<i32>().unwrap_or_default(),
        step.to_string(),
    )))
}

/// Runs between `fork` and `execv`. Reports failures through the error
/// channel and never returns to the caller.
fn child_boot(
    mut set_fds: Vec<(RawFd, RawFd)>,
    dont_close: HashSet<RawFd>,
    err_read: RawFd,
    mut err_write: RawFd,
    argv: &[CString],
) -> ! {
    unsafe { libc::close(err_read) };

    // Census of open descriptors. Closes are deferred so the directory
    // cursor's own descriptor is not pulled out from under the iteration.
    let mut max_fd: RawFd = -1;
    let mut close_soon: Vec<RawFd> = Vec::new();
    let entries = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(_) => child_fail(err_write, "fdlist"),
    };
    for entry in entries.flatten() {
        let Some(fd) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<RawFd>().ok())
        else {
            continue;
        };
        max_fd = max_fd.max(fd);
        if !dont_close.contains(&fd) {
            close_soon.push(fd);
        }
    }
    for &(target, current) in &set_fds {
        max_fd = max_fd.max(target).max(current);
    }
    // The cursor descriptor is already gone; closing it again is harmless.
    for fd in close_soon.drain(..) {
        unsafe { libc::close(fd) };
    }

    // Relocate currents that collide with some target, and the error channel
    // itself if a target wants its slot. Frees are deferred: one descriptor
    // may be the source of several mappings.
    let mut keep_in_place: HashSet<RawFd> = HashSet::new();
    let mut freed: Vec<RawFd> = Vec::new();
    for entry in set_fds.iter_mut() {
        let (target, current) = *entry;
        if current == target {
            keep_in_place.insert(current);
            continue;
        }
        if target == err_write {
            max_fd += 1;
            if unsafe { libc::dup3(err_write, max_fd, libc::O_CLOEXEC) } == -1 {
                child_fail(err_write, "dup3");
            }
            err_write = max_fd;
        }
        max_fd += 1;
        if unsafe { libc::dup2(current, max_fd) } == -1 {
            child_fail(err_write, "dup2");
        }
        freed.push(current);
        entry.1 = max_fd;
    }
    for fd in freed {
        if !keep_in_place.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }

    // Install every mapping on its final descriptor.
    for &(target, current) in &set_fds {
        if unsafe { libc::dup2(current, target) } == -1 {
            child_fail(err_write, "dup2");
        }
        if !keep_in_place.contains(&current) {
            unsafe { libc::close(current) };
        }
    }

    let _ = execv(&argv[0], argv);
    child_fail(err_write, "execve")
}

fn child_fail(err_fd: RawFd, step: &str) -> ! {
    let msg = format!("{} {}", Errno::last_raw(), step);
    unsafe {
        libc::write(err_fd, msg.as_ptr().cast(), msg.len());
        libc::_exit(1);
    }
}
