use std::{
    cell::RefCell,
    fs::File,
    io::Write,
    os::fd::{OwnedFd, RawFd},
    rc::{Rc, Weak},
};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::error::{Error, Result};

/// Where a command's data at some descriptor comes from.
pub(crate) enum InputKind {
    /// A descriptor the caller owns. Installed in the child, never closed in
    /// the parent.
    Borrowed(RawFd),
    /// An anonymous memory file capturing child output, copied into `dest`
    /// when the producing command is reaped.
    Sink {
        file: File,
        dest: Box<dyn Write>,
    },
    /// One side of an edge to another command. `write_end` holds the
    /// parent-side write end once the owning command has created the kernel
    /// pipe, waiting for the peer to take it.
    Pipe { write_end: Option<OwnedFd> },
}

pub(crate) struct InputInner {
    pub(crate) kind: InputKind,
    pub(crate) source: Option<Weak<RefCell<OutputInner>>>,
}

pub(crate) enum OutputKind {
    Borrowed(RawFd),
    Pipe { read_end: Option<OwnedFd> },
}

pub(crate) struct OutputInner {
    pub(crate) kind: OutputKind,
    pub(crate) dest: Option<Weak<RefCell<InputInner>>>,
}

/// Attachment point for data flowing into a command at one child descriptor.
///
/// Standalone input endpoints built with [`InputEndpoint::real_fd`] or
/// [`InputEndpoint::to_stream`] describe where another command's output goes;
/// they stay alive as long as the caller holds a handle.
#[derive(Clone)]
pub struct InputEndpoint(pub(crate) Rc<RefCell<InputInner>>);

/// Attachment point for data flowing out of a command at one child
/// descriptor.
#[derive(Clone)]
pub struct OutputEndpoint(pub(crate) Rc<RefCell<OutputInner>>);

impl InputEndpoint {
    /// An existing descriptor that receives whatever the connected command
    /// writes. Borrowed: the parent-side descriptor is never closed by the
    /// library.
    pub fn real_fd(fd: RawFd) -> Self {
        Self::new(InputKind::Borrowed(fd))
    }

    /// Captures everything the connected command writes into an anonymous
    /// memory file. The bytes are copied into `dest` when the producing
    /// command is waited on.
    pub fn to_stream(dest: impl Write + 'static) -> Result<Self> {
        let fd = memfd_create(c"pipework-sink", MemFdCreateFlag::empty())
            .map_err(|errno| Error::Sys("memfd_create", errno))?;
        Ok(Self::new(InputKind::Sink {
            file: File::from(fd),
            dest: Box::new(dest),
        }))
    }

    pub(crate) fn pipe() -> Self {
        Self::new(InputKind::Pipe { write_end: None })
    }

    fn new(kind: InputKind) -> Self {
        Self(Rc::new(RefCell::new(InputInner { kind, source: None })))
    }
}

impl OutputEndpoint {
    /// An existing descriptor the connected command reads from. Borrowed:
    /// the parent-side descriptor is never closed by the library.
    pub fn real_fd(fd: RawFd) -> Self {
        Self::new(OutputKind::Borrowed(fd))
    }

    pub(crate) fn pipe() -> Self {
        Self::new(OutputKind::Pipe { read_end: None })
    }

    fn new(kind: OutputKind) -> Self {
        Self(Rc::new(RefCell::new(OutputInner { kind, dest: None })))
    }
}

/// Cross-links one output endpoint with one input endpoint. Both sides must
/// be unbound. The links are weak in both directions: an edge never extends
/// the lifetime of either endpoint.
pub(crate) fn connect(src: &OutputEndpoint, dst: &InputEndpoint, fd: RawFd) -> Result<()> {
    let mut src_inner = src.0.borrow_mut();
    let mut dst_inner = dst.0.borrow_mut();
    if src_inner.dest.is_some() || dst_inner.source.is_some() {
        return Err(Error::PipeSetTwice(fd));
    }
    src_inner.dest = Some(Rc::downgrade(&dst.0));
    dst_inner.source = Some(Rc::downgrade(&src.0));
    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn connecting_twice_is_refused() {
        let out = OutputEndpoint::pipe();
        let first = InputEndpoint::pipe();
        let second = InputEndpoint::pipe();

        connect(&out, &first, 0).unwrap();
        assert!(matches!(
            connect(&out, &second, 0),
            Err(Error::PipeSetTwice(0))
        ));
        assert!(matches!(
            connect(&OutputEndpoint::pipe(), &first, 1),
            Err(Error::PipeSetTwice(1))
        ));
    }

    #[test]
    fn edges_are_symmetric() {
        let out = OutputEndpoint::pipe();
        let inp = InputEndpoint::pipe();
        connect(&out, &inp, 3).unwrap();

        let back = inp.0.borrow().source.as_ref().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&back, &out.0));
        let fwd = out.0.borrow().dest.as_ref().unwrap().upgrade().unwrap();
        assert!(Rc::ptr_eq(&fwd, &inp.0));
    }

    #[test]
    fn edge_does_not_keep_peer_alive() {
        let out = OutputEndpoint::pipe();
        let inp = InputEndpoint::pipe();
        connect(&out, &inp, 0).unwrap();

        drop(inp);
        assert!(out.0.borrow().dest.as_ref().unwrap().upgrade().is_none());
    }

    #[test]
    fn sink_is_backed_by_a_memory_file() -> anyhow::Result<()> {
        let sink = InputEndpoint::to_stream(Vec::new())?;
        match &sink.0.borrow().kind {
            InputKind::Sink { file, .. } => assert!(file.as_raw_fd() >= 0),
            _ => panic!("expected a sink endpoint"),
        }
        Ok(())
    }
}
