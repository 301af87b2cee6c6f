// Copyright (c) 2024 Daniel Bergløv
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
 * Command search and canonicalization.
 *
 * The requested command is located along the effective search path,
 * which is the user's PATH unless a secure path is enforced. The search
 * runs under root first; when that finds nothing it is repeated as the
 * invoking user so binaries under user-only directories still resolve.
 * A command that only resolves through `.` or an empty path element is
 * reported as such so the caller can refuse it with a useful hint.
 *
 * When a change of root is requested the search pivots into it first,
 * keeping descriptors to the old root and working directory so the
 * pivot can be reversed on every exit path.
 */

use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::{stat, FileStat, Mode};
use tracing::debug;

use crate::modules::error::{Error, ResolutionError};
use crate::modules::perms::{Creds, PermStack, PermState};
use crate::modules::shared::basename;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Found,
    FoundInDot,
    NotFound,
}

/**
 * The outcome of a successful search pass.
 */
pub struct ResolvedCommand {
    pub status: CommandStatus,
    pub path: Option<String>,
    pub dir: Option<String>,
    pub stat: Option<FileStat>,
}

impl ResolvedCommand {
    fn not_found() -> ResolvedCommand {
        ResolvedCommand {
            status: CommandStatus::NotFound,
            path: None,
            dir: None,
            stat: None,
        }
    }
}

/**
 * A reversible change of root. Descriptors to the old root and old
 * working directory are captured before `chroot` so `leave` (or drop)
 * can undo the pivot.
 */
pub struct PivotRoot {
    saved: Option<(OwnedFd, OwnedFd)>,
}

impl PivotRoot {
    pub fn enter(newroot: &str) -> Result<PivotRoot, Error> {
        let old_root = open("/", OFlag::O_RDONLY, Mode::empty())
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .map_err(|e| pivot_err(newroot, e))?;
        let old_cwd = open(".", OFlag::O_RDONLY, Mode::empty())
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .map_err(|e| pivot_err(newroot, e))?;

        nix::unistd::chroot(newroot).map_err(|e| pivot_err(newroot, e))?;
        nix::unistd::chdir("/").map_err(|e| pivot_err(newroot, e))?;

        Ok(PivotRoot {
            saved: Some((old_root, old_cwd)),
        })
    }

    pub fn leave(mut self) -> Result<(), Error> {
        self.unpivot().map_err(|e| pivot_err("/", e))
    }

    fn unpivot(&mut self) -> Result<(), nix::errno::Errno> {
        if let Some((old_root, old_cwd)) = self.saved.take() {
            nix::unistd::fchdir(old_root.as_raw_fd())?;
            nix::unistd::chroot(".")?;
            nix::unistd::fchdir(old_cwd.as_raw_fd())?;
        }
        Ok(())
    }
}

impl Drop for PivotRoot {
    fn drop(&mut self) {
        // Error paths must not leave the process inside the chroot.
        let _ = self.unpivot();
    }
}

fn pivot_err(dir: &str, errno: nix::errno::Errno) -> Error {
    ResolutionError::ChrootFailed {
        dir: dir.to_string(),
        err: std::io::Error::from(errno),
    }
    .into()
}

fn is_executable(path: &Path) -> bool {
    path.is_file()
        && fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

/**
 * Walk `path_list` looking for `cmd`. A command containing a slash is
 * checked directly. Resolution through `.` or an empty path element is
 * only accepted when `ignore_dot` is off; otherwise it is remembered
 * and reported as `FoundInDot` if nothing better turns up.
 */
pub fn find_path(
    cmd: &str,
    path_list: &str,
    ignore_dot: bool,
) -> Result<(CommandStatus, Option<PathBuf>), Error> {
    if cmd.len() >= libc::PATH_MAX as usize {
        return Err(ResolutionError::NameTooLong(cmd.to_string()).into());
    }

    if cmd.contains('/') {
        let path = Path::new(cmd);
        if is_executable(path) {
            let full = if path.is_absolute() {
                path.to_path_buf()
            } else {
                match fs::canonicalize(path) {
                    Ok(p) => p,
                    Err(_) => return Ok((CommandStatus::NotFound, None)),
                }
            };
            return Ok((CommandStatus::Found, Some(full)));
        }
        return Ok((CommandStatus::NotFound, None));
    }

    let mut in_dot: Option<PathBuf> = None;

    for dir in path_list.split(':') {
        let is_dot = dir.is_empty() || dir == ".";
        let candidate = if is_dot {
            Path::new(".").join(cmd)
        } else {
            Path::new(dir).join(cmd)
        };

        if candidate.as_os_str().len() >= libc::PATH_MAX as usize {
            continue;
        }

        if is_executable(&candidate) {
            if is_dot {
                if !ignore_dot {
                    return Ok((CommandStatus::Found, Some(candidate)));
                }
                if in_dot.is_none() {
                    in_dot = Some(candidate);
                }
                continue;
            }
            return Ok((CommandStatus::Found, Some(candidate)));
        }
    }

    match in_dot {
        Some(candidate) => Ok((CommandStatus::FoundInDot, Some(candidate))),
        None => Ok((CommandStatus::NotFound, None)),
    }
}

/**
 * Locate the requested command, pivoting into `chroot` for the search
 * if one was requested. The search runs under root credentials first
 * and is retried as the invoking user when nothing was found. The
 * containing directory is canonicalized and a stat of the resolved
 * binary is captured for the rule matcher.
 */
pub fn resolve_command(
    cmd: &str,
    path_list: &str,
    ignore_dot: bool,
    chroot: Option<&str>,
    perms: &mut PermStack,
    root_creds: Creds,
    user_creds: Creds,
) -> Result<ResolvedCommand, Error> {
    let pivot = match chroot {
        Some(dir) => Some(PivotRoot::enter(dir)?),
        None => None,
    };

    let result = search_both(cmd, path_list, ignore_dot, perms, root_creds, user_creds);

    if let Some(pivot) = pivot {
        pivot.leave()?;
    }

    result
}

fn search_both(
    cmd: &str,
    path_list: &str,
    ignore_dot: bool,
    perms: &mut PermStack,
    root_creds: Creds,
    user_creds: Creds,
) -> Result<ResolvedCommand, Error> {
    let mut outcome = perms.with(PermState::Root, root_creds, || {
        find_path(cmd, path_list, ignore_dot)
    })??;

    if outcome.0 == CommandStatus::NotFound {
        // Failed as root, retry as the invoking user.
        outcome = perms.with(PermState::User, user_creds, || {
            find_path(cmd, path_list, ignore_dot)
        })??;
    }

    let (status, path) = outcome;
    let Some(path) = path else {
        return Ok(ResolvedCommand::not_found());
    };

    debug!(command = %path.display(), ?status, "command resolved");

    let dir = path
        .parent()
        .and_then(|p| fs::canonicalize(p).ok())
        .map(|p| p.to_string_lossy().into_owned());

    let stat = stat(&path).ok();

    Ok(ResolvedCommand {
        status,
        path: Some(path.to_string_lossy().into_owned()),
        dir,
        stat,
    })
}

/**
 * Rewrite argv[0] so the target shell starts as a login shell.
 */
pub fn login_shell_argv0(shell: &str) -> String {
    format!("-{}", basename(shell))
}

/**
 * Recent bash needs `--login` alongside `-c` even when argv[0] carries
 * the login-shell dash. The argv buffer always has a spare slot for it.
 */
pub fn reshape_login_shell(argv: &mut Vec<String>) {
    if argv.len() > 1 && argv[0] == "-bash" && argv[1] == "-c" {
        argv.insert(1, "--login".to_string());
    }
}

/**
 * Resolve the editor for an edit-mode request.
 *
 * When the policy allows user-chosen editors the SUDO_EDITOR, VISUAL
 * and EDITOR variables are consulted in that order; otherwise only the
 * colon-separated policy editor list is. A user-supplied editor must be
 * an absolute path to an executable; anything else is rejected so the
 * request can be audited.
 */
pub fn find_editor(
    files: &[String],
    env_candidates: &[String],
    policy_editors: &str,
    env_editor_allowed: bool,
) -> Result<(String, Vec<String>), Error> {
    if env_editor_allowed {
        for candidate in env_candidates {
            if candidate.is_empty() {
                continue;
            }
            match editor_argv(candidate, files) {
                Some(resolved) => return Ok(resolved),
                None => {
                    return Err(ResolutionError::NotFound(candidate.clone()).into());
                }
            }
        }
    }

    for candidate in policy_editors.split(':') {
        if candidate.is_empty() {
            continue;
        }
        if let Some(resolved) = editor_argv(candidate, files) {
            return Ok(resolved);
        }
    }

    Err(ResolutionError::NotFound(policy_editors.to_string()).into())
}

fn editor_argv(candidate: &str, files: &[String]) -> Option<(String, Vec<String>)> {
    let mut words = candidate.split_whitespace();
    let cmd = words.next()?;

    if !cmd.starts_with('/') || !is_executable(Path::new(cmd)) {
        return None;
    }

    let mut argv: Vec<String> = vec![cmd.to_string()];
    argv.extend(words.map(str::to_string));
    argv.push("--".to_string());
    argv.extend(files.iter().cloned());

    Some((cmd.to_string(), argv))
}
