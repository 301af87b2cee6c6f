// Copyright (c) 2025 Daniel Bergløv
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

/**
 * Stackable privilege transitions.
 *
 * The engine runs setuid-root and flips between several identities while
 * handling one request: the identity it entered with, full root for
 * credential database access, the policy-file owner for reading rule
 * sources, the invoking user for searching user-controlled directories,
 * and the target identity. Every transition is pushed onto a stack and
 * popped in reverse; after the final pop the process is back to the
 * credentials it entered with.
 *
 * A failed push leaves both the stack and the process credentials
 * unchanged. Popping an empty stack is an invariant violation reported
 * as an error, never a panic.
 */

use std::io;

use nix::unistd::{Gid, Uid};

use crate::modules::error::{Error, PrivilegeError};

pub const ROOT_UID: u32 = 0;

/**
 * Which identity a stack level represents.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermState {
    Initial,
    Root,
    Sudoers,
    User,
    Runas,
}

impl PermState {
    pub fn as_str(self) -> &'static str {
        match self {
            PermState::Initial => "initial",
            PermState::Root => "root",
            PermState::Sudoers => "sudoers",
            PermState::User => "user",
            PermState::Runas => "runas",
        }
    }
}

/**
 * A full credential set. The saved ids stay root for the lifetime of the
 * request so that every transition remains reversible.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creds {
    pub ruid: Uid,
    pub euid: Uid,
    pub suid: Uid,
    pub rgid: Gid,
    pub egid: Gid,
    pub sgid: Gid,
    pub groups: Vec<Gid>,
}

impl Creds {
    pub fn new(ruid: Uid, euid: Uid, rgid: Gid, egid: Gid, groups: Vec<Gid>) -> Creds {
        Creds {
            ruid,
            euid,
            suid: Uid::from_raw(ROOT_UID),
            rgid,
            egid,
            sgid: egid,
            groups,
        }
    }
}

/**
 * Credential syscall backend, swappable for tests.
 */
pub trait CredOps {
    fn current(&mut self) -> io::Result<Creds>;
    fn apply(&mut self, creds: &Creds) -> io::Result<()>;
}

/**
 * `CredOps` talking to the kernel through `nix`/`libc`.
 */
pub struct SystemCreds;

impl CredOps for SystemCreds {
    fn current(&mut self) -> io::Result<Creds> {
        let uids = nix::unistd::getresuid().map_err(io::Error::from)?;
        let gids = nix::unistd::getresgid().map_err(io::Error::from)?;
        let groups = nix::unistd::getgroups().map_err(io::Error::from)?;

        Ok(Creds {
            ruid: uids.real,
            euid: uids.effective,
            suid: uids.saved,
            rgid: gids.real,
            egid: gids.effective,
            sgid: gids.saved,
            groups,
        })
    }

    fn apply(&mut self, creds: &Creds) -> io::Result<()> {
        // Group changes must happen while we still hold euid 0.
        nix::unistd::setgroups(&creds.groups).map_err(io::Error::from)?;
        nix::unistd::setresgid(creds.rgid, creds.egid, creds.sgid).map_err(io::Error::from)?;
        nix::unistd::setresuid(creds.ruid, creds.euid, creds.suid).map_err(io::Error::from)?;
        Ok(())
    }
}

/**
 * The privilege stack itself.
 */
pub struct PermStack {
    ops: Box<dyn CredOps>,
    stack: Vec<(PermState, Creds)>,
    entry: Creds,
    #[cfg(target_os = "linux")]
    nproc: Option<(u64, u64)>,
}

impl PermStack {
    pub fn new(mut ops: Box<dyn CredOps>) -> Result<PermStack, Error> {
        let entry = ops
            .current()
            .map_err(PrivilegeError::PopFailed)?;

        Ok(PermStack {
            ops,
            stack: Vec::new(),
            entry,
            #[cfg(target_os = "linux")]
            nproc: None,
        })
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn state(&self) -> Option<PermState> {
        self.stack.last().map(|(state, _)| *state)
    }

    /**
     * The credentials the process entered with.
     */
    pub fn entry_creds(&self) -> &Creds {
        &self.entry
    }

    /**
     * Switch to `target`, remembering the credentials in effect so `pop`
     * can restore them. If the switch fails the previous credentials are
     * re-applied and the stack is left untouched.
     */
    pub fn push(&mut self, state: PermState, target: Creds) -> Result<(), Error> {
        let saved = self
            .ops
            .current()
            .map_err(|err| PrivilegeError::PushFailed { state: state.as_str(), err })?;

        if let Err(err) = self.ops.apply(&target) {
            // Partial application is possible; put things back.
            let _ = self.ops.apply(&saved);
            return Err(PrivilegeError::PushFailed { state: state.as_str(), err }.into());
        }

        self.stack.push((state, saved));
        Ok(())
    }

    /**
     * Restore the credentials saved by the matching `push`.
     */
    pub fn pop(&mut self) -> Result<(), Error> {
        let (_, saved) = self
            .stack
            .pop()
            .ok_or(PrivilegeError::StackUnderflow)?;

        self.ops.apply(&saved).map_err(PrivilegeError::PopFailed)?;
        Ok(())
    }

    /**
     * Pop every remaining level. Used on teardown so an aborted pipeline
     * still returns the process to its entry identity.
     */
    pub fn rewind(&mut self) -> Result<(), Error> {
        while !self.stack.is_empty() {
            self.pop()?;
        }
        Ok(())
    }

    /**
     * Run `body` under `state`, restoring the previous identity on every
     * exit path. The closure result is returned untouched.
     */
    pub fn with<R>(
        &mut self,
        state: PermState,
        target: Creds,
        body: impl FnOnce() -> R,
    ) -> Result<R, Error> {
        self.push(state, target)?;
        let result = body();
        self.pop()?;
        Ok(result)
    }

    /**
     * Lift RLIMIT_NPROC before identity switches. The kernel applies
     * per-uid process limits when the uid changes and fails the switch
     * with EAGAIN if the target uid is at its limit.
     */
    #[cfg(target_os = "linux")]
    pub fn unlimit_nproc(&mut self) -> Result<(), Error> {
        use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};

        let (soft, hard) = getrlimit(Resource::RLIMIT_NPROC)
            .map_err(|e| PrivilegeError::Rlimit(io::Error::from(e)))?;
        self.nproc = Some((soft, hard));

        if setrlimit(Resource::RLIMIT_NPROC, RLIM_INFINITY, RLIM_INFINITY).is_err() {
            setrlimit(Resource::RLIMIT_NPROC, hard, hard)
                .map_err(|e| PrivilegeError::Rlimit(io::Error::from(e)))?;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    pub fn restore_nproc(&mut self) -> Result<(), Error> {
        use nix::sys::resource::{setrlimit, Resource};

        if let Some((soft, hard)) = self.nproc.take() {
            setrlimit(Resource::RLIMIT_NPROC, soft, hard)
                .map_err(|e| PrivilegeError::Rlimit(io::Error::from(e)))?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn unlimit_nproc(&mut self) -> Result<(), Error> {
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn restore_nproc(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/**
 * Recording credential backend for rigs that must not touch real
 * process credentials.
 */
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /**
     * Recording backend. `fail_next` makes the following apply fail so
     * rollback behavior can be exercised.
     */
    pub struct MockCreds {
        pub current: Creds,
        pub log: Rc<RefCell<Vec<Creds>>>,
        pub fail_next: bool,
    }

    impl MockCreds {
        pub fn new(current: Creds) -> MockCreds {
            MockCreds {
                current,
                log: Rc::new(RefCell::new(Vec::new())),
                fail_next: false,
            }
        }
    }

    impl CredOps for MockCreds {
        fn current(&mut self) -> io::Result<Creds> {
            Ok(self.current.clone())
        }

        fn apply(&mut self, creds: &Creds) -> io::Result<()> {
            if self.fail_next {
                self.fail_next = false;
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.current = creds.clone();
            self.log.borrow_mut().push(creds.clone());
            Ok(())
        }
    }

    pub fn creds(ruid: u32, euid: u32) -> Creds {
        Creds::new(
            Uid::from_raw(ruid),
            Uid::from_raw(euid),
            Gid::from_raw(ruid),
            Gid::from_raw(euid),
            vec![Gid::from_raw(euid)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{creds, MockCreds};
    use super::*;

    #[test]
    fn push_pop_restores_entry_identity() {
        let entry = creds(1000, 0);
        let mut stack = PermStack::new(Box::new(MockCreds::new(entry.clone()))).unwrap();

        stack.push(PermState::Root, creds(0, 0)).unwrap();
        stack.push(PermState::User, creds(1000, 1000)).unwrap();
        assert_eq!(stack.depth(), 2);

        stack.pop().unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.ops.current().unwrap(), entry);
    }

    #[test]
    fn failed_push_leaves_stack_unchanged() {
        let entry = creds(1000, 0);
        let mut ops = MockCreds::new(entry.clone());
        ops.fail_next = true;
        let mut stack = PermStack::new(Box::new(ops)).unwrap();

        let err = stack.push(PermState::Runas, creds(42, 42)).unwrap_err();
        assert!(matches!(err, Error::Privilege(PrivilegeError::PushFailed { .. })));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn pop_on_empty_stack_is_an_error() {
        let mut stack = PermStack::new(Box::new(MockCreds::new(creds(0, 0)))).unwrap();
        let err = stack.pop().unwrap_err();
        assert!(matches!(err, Error::Privilege(PrivilegeError::StackUnderflow)));
    }

    #[test]
    fn rewind_unwinds_everything() {
        let entry = creds(1000, 0);
        let mut stack = PermStack::new(Box::new(MockCreds::new(entry.clone()))).unwrap();

        stack.push(PermState::Root, creds(0, 0)).unwrap();
        stack.push(PermState::Sudoers, creds(0, 1)).unwrap();
        stack.push(PermState::User, creds(1000, 1000)).unwrap();
        stack.rewind().unwrap();

        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.ops.current().unwrap(), entry);
    }

    #[test]
    fn with_restores_on_exit() {
        let entry = creds(1000, 0);
        let mut stack = PermStack::new(Box::new(MockCreds::new(entry.clone()))).unwrap();

        let out = stack
            .with(PermState::Root, creds(0, 0), || 7)
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.ops.current().unwrap(), entry);
    }
}
