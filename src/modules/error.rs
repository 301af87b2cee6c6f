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
 * Error types for the policy engine.
 *
 * Each enum covers one failure family; the umbrella `Error` is what the
 * public entry points return. The message on a variant is the user-visible
 * text, produced by the component closest to the cause — callers wrap or
 * forward, they never paraphrase.
 */

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    /**
     * Usage errors map to a distinct front-end exit status.
     */
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("no command specified")]
    NoCommand,

    #[error("invalid numeric id {0:?}")]
    BadNumericId(String),

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("conflicting request options: {0}")]
    ConflictingOptions(&'static str),

    #[error("malformed front-end entry {0:?}")]
    BadBundleEntry(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("timed out reading password")]
    Timeout,

    #[error("no password was provided")]
    EmptyPassword,

    #[error("error reading password")]
    ReadError,

    #[error("a terminal is required to read the password; either use the -S option to read from standard input or configure an askpass helper")]
    NoTtyNoAskpass,

    #[error("a password is required")]
    PasswordRequired,

    #[error("authentication backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no valid policy sources found, quitting")]
    NoSources,

    #[error("unable to open {path}: {err}")]
    SourceOpen { path: String, err: io::Error },

    #[error("unable to parse {path}: {reason}")]
    SourceParse { path: String, reason: String },

    #[error("{0} is not a regular file")]
    SourceBadType(String),

    #[error("{path} is owned by uid {actual}, should be {wanted}")]
    SourceWrongOwner { path: String, actual: u32, wanted: u32 },

    #[error("{0} is world writable")]
    SourceWorldWritable(String),

    #[error("{path} is owned by gid {actual}, should be {wanted}")]
    SourceGroupWritable { path: String, actual: u32, wanted: u32 },

    #[error("unknown user {0}")]
    UnknownRunasUser(String),

    #[error("unknown group {0}")]
    UnknownRunasGroup(String),

    #[error("rule evaluation failed: {0}")]
    LookupFailed(String),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{0}: command not found")]
    NotFound(String),

    #[error("ignoring {cmnd:?} found in '.'\nUse \"{hint}\" if this is the {cmnd:?} you wish to run.")]
    FoundInDot { cmnd: String, hint: String },

    #[error("{0}: command too long")]
    NameTooLong(String),

    #[error("unable to change root directory to {dir}: {err}")]
    ChrootFailed { dir: String, err: io::Error },

    #[error("{path}: {err}")]
    Io { path: String, err: io::Error },
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("unable to change to {state} privileges: {err}")]
    PushFailed { state: &'static str, err: io::Error },

    #[error("privilege restore with empty state stack")]
    StackUnderflow,

    #[error("unable to restore privileges: {0}")]
    PopFailed(io::Error),

    #[error("unable to adjust process resource limits: {0}")]
    Rlimit(io::Error),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unable to allocate memory")]
    Alloc,

    #[error("unable to rebuild the environment: {0}")]
    EnvBuild(String),

    #[error("unable to read {path}: {err}")]
    Io { path: String, err: io::Error },
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("a command must be supplied when running a shell is not permitted")]
    ImpliedShellNotAllowed,

    #[error("the list user option may only be combined with a list request")]
    ListUserWithoutList,

    #[error("{0}")]
    Other(String),
}
